//! Issue JSON requests to a node's HTTP RPC endpoint.
//!
//! Requests are never retried: many commands (transfers, asset issuance) are not idempotent, so
//! any failure is surfaced to the caller as-is.

use crate::{signal::Signal, supervisor::Credentials, Error};
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    net::IpAddr,
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::{debug, warn};

/// User agent attached to every request.
pub const USER_AGENT: &str = "lockstep-harness";

/// Body of a request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    pub params: Vec<Value>,
    pub id: u64,
}

/// Body of a successful response.
///
/// `result` is `None` only when the field is missing. An explicit `null` decodes to
/// `Some(Value::Null)`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Response {
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default)]
    pub id: Option<u64>,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Decode a 2xx body into its envelope, rejecting anything that is not a JSON object.
fn decode(node: usize, body: &str) -> Result<Response, Error> {
    let invalid = |reason: String| Error::Protocol { node, reason };
    let value: Value = serde_json::from_str(body)
        .map_err(|err| invalid(format!("invalid envelope ({err}): {body}")))?;
    if !value.is_object() {
        return Err(invalid(format!("envelope is not an object: {body}")));
    }
    serde_json::from_value(value)
        .map_err(|err| invalid(format!("invalid envelope ({err}): {body}")))
}

/// Client for a single node.
///
/// Request ids start at 1 and increase by one with every call for the lifetime of the client.
pub struct Client {
    node: usize,
    host: IpAddr,
    credentials: Credentials,
    ready: Signal,
    next_id: AtomicU64,
    http: reqwest::Client,
}

impl Client {
    /// Create a client that sends to `host` on the port `ready` resolves with.
    pub fn new(
        node: usize,
        host: IpAddr,
        credentials: Credentials,
        ready: Signal,
    ) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|source| Error::Unreachable { node, source })?;
        Ok(Self {
            node,
            host,
            credentials,
            ready,
            next_id: AtomicU64::new(1),
            http,
        })
    }

    /// Reserve the next request id.
    pub fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send `method` with `params`, waiting for the HTTP server to be ready first.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, Error> {
        let node = self.node;
        let request = Request {
            method: method.to_string(),
            params,
            id: self.allocate_id(),
        };
        let body = serde_json::to_string(&request)?;

        // Block until the node announces its RPC server
        let port = self.ready.wait().await.ok_or(Error::NotReady {
            node,
            signal: "http",
        })?;
        let url = format!("http://{}:{}/rpc", self.host, port);
        debug!(node, id = request.id, body = body.as_str(), "sending request");

        let response = self
            .http
            .post(&url)
            .basic_auth(&self.credentials.user, Some(&self.credentials.password))
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|source| Error::Unreachable { node, source })?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| Error::Unreachable { node, source })?;
        if !status.is_success() {
            return Err(Error::Transport {
                node,
                status: status.as_u16(),
                body,
            });
        }
        debug!(node, id = request.id, body = body.as_str(), "received response");

        // Decode the envelope
        let envelope = decode(node, &body)?;
        if let Some(error) = envelope.error.filter(|error| !error.is_null()) {
            return Err(Error::Protocol {
                node,
                reason: format!("error in response: {error}"),
            });
        }
        if envelope.id != Some(request.id) {
            warn!(
                node,
                sent = request.id,
                received = ?envelope.id,
                "response id mismatch"
            );
        }
        envelope.result.ok_or_else(|| Error::Protocol {
            node,
            reason: format!("missing result: {body}"),
        })
    }
}
