//! In-process RPC endpoint that records every request it receives.

use crate::{rpc::Request, Error};
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    serve, Router,
};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex},
};
use tokio::{net::TcpListener, sync::oneshot};

/// How the endpoint answers a method.
#[derive(Clone, Debug)]
enum Reply {
    Result(Value),
    Error(Value),
    Status(u16, String),
    Raw(String),
    Stall,
}

#[derive(Default)]
struct Log {
    requests: Vec<Request>,
    authorized: Vec<bool>,
    replies: HashMap<String, Reply>,
}

type Shared = Arc<Mutex<Log>>;

/// Records requests and answers with canned replies (`null` unless configured).
pub struct Recorder {
    port: u16,
    log: Shared,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Recorder {
    /// Bind to an ephemeral loopback port and start serving.
    pub async fn start() -> Result<Self, Error> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await?;
        let port = listener.local_addr()?.port();
        let log = Shared::default();
        let app = Router::new()
            .route("/rpc", post(handle))
            .with_state(log.clone());

        let (shutdown, stopped) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stopped.await;
                })
                .await;
        });
        Ok(Self {
            port,
            log,
            shutdown: Some(shutdown),
        })
    }

    /// Port the endpoint listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    fn set(&self, method: &str, reply: Reply) {
        lock(&self.log).replies.insert(method.to_string(), reply);
    }

    /// Answer `method` with `result`.
    pub fn respond(&self, method: &str, result: Value) {
        self.set(method, Reply::Result(result));
    }

    /// Answer `method` with a 200 envelope carrying `error`.
    pub fn respond_error(&self, method: &str, error: Value) {
        self.set(method, Reply::Error(error));
    }

    /// Answer `method` with a non-2xx `status`.
    pub fn reject(&self, method: &str, status: u16, body: &str) {
        self.set(method, Reply::Status(status, body.to_string()));
    }

    /// Answer `method` with a verbatim 200 body.
    pub fn raw(&self, method: &str, body: &str) {
        self.set(method, Reply::Raw(body.to_string()));
    }

    /// Never answer `method`.
    pub fn stall(&self, method: &str) {
        self.set(method, Reply::Stall);
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<Request> {
        lock(&self.log).requests.clone()
    }

    /// Methods received so far, in arrival order.
    pub fn methods(&self) -> Vec<String> {
        lock(&self.log)
            .requests
            .iter()
            .map(|request| request.method.clone())
            .collect()
    }

    /// Whether each request carried basic auth credentials.
    pub fn authorized(&self) -> Vec<bool> {
        lock(&self.log).authorized.clone()
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

fn lock(log: &Shared) -> std::sync::MutexGuard<'_, Log> {
    log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn handle(State(log): State<Shared>, headers: HeaderMap, body: String) -> Response {
    let request: Request = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("Basic "));
    let reply = {
        let mut log = lock(&log);
        log.authorized.push(authorized);
        log.requests.push(request.clone());
        log.replies.get(&request.method).cloned()
    };

    let envelope = match reply {
        None => json!({"result": null, "id": request.id}),
        Some(Reply::Result(result)) => json!({"result": result, "id": request.id}),
        Some(Reply::Error(error)) => json!({"error": error, "id": request.id}),
        Some(Reply::Status(status, body)) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            return (status, body).into_response();
        }
        Some(Reply::Raw(body)) => return (StatusCode::OK, body).into_response(),
        Some(Reply::Stall) => return futures::future::pending::<Response>().await,
    };
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        envelope.to_string(),
    )
        .into_response()
}
