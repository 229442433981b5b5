//! Access to the shared [Ledger], either in-process or through a peer's P2P port.

use super::ledger::{Ledger, Request};
use axum::{extract::State, routing::post, Json, Router};
use serde_json::Value;
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

/// Route chain requests are served on.
pub const ROUTE: &str = "/p2p";

#[derive(Clone)]
pub enum Chain {
    /// This node holds the ledger.
    Local(Arc<Mutex<Ledger>>),
    /// Forward to the node at `peer`.
    Remote {
        http: reqwest::Client,
        peer: SocketAddr,
    },
}

impl Chain {
    pub fn local(ledger: Ledger) -> Self {
        Self::Local(Arc::new(Mutex::new(ledger)))
    }

    pub fn remote(peer: SocketAddr) -> Self {
        Self::Remote {
            http: reqwest::Client::new(),
            peer,
        }
    }

    /// Serve `request`, returning the ledger's answer or a reason for rejecting it.
    pub async fn request(&self, request: Request) -> Result<Value, String> {
        match self {
            Self::Local(ledger) => ledger
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .handle(request),
            Self::Remote { http, peer } => {
                let response = http
                    .post(format!("http://{peer}{ROUTE}"))
                    .json(&request)
                    .send()
                    .await
                    .map_err(|err| format!("peer {peer} unreachable: {err}"))?;
                response
                    .json::<Result<Value, String>>()
                    .await
                    .map_err(|err| format!("peer {peer} sent an invalid reply: {err}"))?
            }
        }
    }

    /// Router answering chain requests from other nodes.
    pub fn router(self) -> Router {
        Router::new().route(ROUTE, post(serve)).with_state(self)
    }
}

async fn serve(State(chain): State<Chain>, Json(request): Json<Request>) -> Json<Result<Value, String>> {
    Json(chain.request(request).await)
}
