//! A running node addressable by index.

use crate::{
    rpc::Client,
    selector,
    signal::Signal,
    supervisor::{Credentials, Launch, Process},
    Error,
};
use serde_json::Value;
use std::{
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};
use tracing::{debug, info};

/// Command that asks a node to shut down.
pub const QUIT_COMMAND: &str = "quit";

/// Loopback address every local node is reached on.
pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// A node process (or an externally managed endpoint) and the client used to reach it.
pub struct Node {
    index: usize,
    process: Option<Process>,
    http: Signal,
    p2p: Signal,
    client: Client,
}

impl Node {
    /// Spawn a node process.
    pub fn start(index: usize, launch: &Launch) -> Result<Self, Error> {
        let process = Process::spawn(index, launch)?;
        let http = process.http_ready().clone();
        let p2p = process.p2p_ready().clone();
        let client = Client::new(index, LOCALHOST, launch.credentials.clone(), http.clone())?;
        Ok(Self {
            index,
            process: Some(process),
            http,
            p2p,
            client,
        })
    }

    /// Reach a node that is already serving RPC on `port` (and P2P on `p2p_port`).
    pub fn attach(
        index: usize,
        host: IpAddr,
        port: u16,
        p2p_port: u16,
        credentials: Credentials,
    ) -> Result<Self, Error> {
        let http = Signal::resolved(port);
        let client = Client::new(index, host, credentials, http.clone())?;
        Ok(Self {
            index,
            process: None,
            http,
            p2p: Signal::resolved(p2p_port),
            client,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Resolved with the advertised HTTP JSON RPC port.
    pub fn http_ready(&self) -> &Signal {
        &self.http
    }

    /// Resolved with the advertised P2P port.
    pub fn p2p_ready(&self) -> &Signal {
        &self.p2p
    }

    /// Whether this handle owns the node process.
    pub fn is_supervised(&self) -> bool {
        self.process.is_some()
    }

    /// Call `method` with already typed `params`.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, Error> {
        self.client.call(method, params).await
    }

    /// Run a whitespace separated command (`method param...`) as `account`.
    ///
    /// Failures are wrapped with this node's index and the command text.
    pub async fn run_as(&self, command: &str, account: &str) -> Result<Value, Error> {
        let wrap = |source: Error| Error::Command {
            node: self.index,
            command: command.to_string(),
            source: Box::new(source),
        };
        let (method, params) = selector::prepare(command, account).map_err(wrap)?;
        self.call(&method, params).await.map_err(wrap)
    }

    /// Run a whitespace separated command.
    pub async fn run(&self, command: &str) -> Result<Value, Error> {
        self.run_as(command, "").await
    }

    /// Ask the node to quit and wait (up to `grace`) for its process to exit.
    pub async fn finish(mut self, grace: Duration) -> Result<(), Error> {
        match self.call(QUIT_COMMAND, Vec::new()).await {
            Ok(_) => {}
            // The node may drop the connection while shutting down
            Err(Error::Unreachable { source, .. }) => {
                debug!(node = self.index, ?source, "connection closed during quit");
            }
            Err(err) => return Err(err),
        }
        if let Some(process) = self.process.as_mut() {
            process.wait_exit(grace).await?;
        }
        info!(node = self.index, "node finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::recorder::Recorder;
    use serde_json::json;

    fn credentials() -> Credentials {
        Credentials {
            user: "user".to_string(),
            password: "pass".to_string(),
        }
    }

    #[tokio::test]
    async fn test_run_splits_command() {
        let recorder = Recorder::start().await.unwrap();
        let node = Node::attach(1, LOCALHOST, recorder.port(), 0, credentials()).unwrap();
        assert!(!node.is_supervised());

        node.run_as("wallet_account_balance $acct", "alice")
            .await
            .unwrap();
        node.run("debug_advance_time 1 blocks").await.unwrap();

        let requests = recorder.requests();
        assert_eq!(requests[0].method, "wallet_account_balance");
        assert_eq!(requests[0].params, vec![json!("alice")]);
        assert_eq!(requests[1].method, "debug_advance_time");
        assert_eq!(requests[1].params, vec![json!("1"), json!("blocks")]);
        assert_eq!(requests[1].id, 2);
    }

    #[tokio::test]
    async fn test_run_reports_node_and_command() {
        let recorder = Recorder::start().await.unwrap();
        recorder.reject("wallet_transfer", 500, "nope");
        let node = Node::attach(2, LOCALHOST, recorder.port(), 0, credentials()).unwrap();

        match node.run("wallet_transfer 1 XTS a b").await {
            Err(Error::Command {
                node,
                command,
                source,
            }) => {
                assert_eq!(node, 2);
                assert_eq!(command, "wallet_transfer 1 XTS a b");
                assert!(matches!(*source, Error::Transport { status: 500, .. }));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_finish_sends_quit() {
        let recorder = Recorder::start().await.unwrap();
        let node = Node::attach(0, LOCALHOST, recorder.port(), 0, credentials()).unwrap();
        node.finish(Duration::from_secs(1)).await.unwrap();
        assert_eq!(recorder.methods(), vec![QUIT_COMMAND.to_string()]);
    }
}
