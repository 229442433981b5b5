//! Interactive prompt for driving a cluster by hand.
//!
//! Each line is either `>selector` (switch the active selector), `quit` (shut the cluster down
//! and leave), or a command template broadcast to the active selector.

use crate::{cluster::Cluster, Error};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

/// Selector active when a session starts.
pub const INITIAL_SELECTOR: &str = "none";

/// Line that ends a session.
const QUIT: &str = "quit";

/// How a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exit {
    /// `quit` was entered and the cluster was shut down.
    Quit,
    /// Input ended; the cluster is still running.
    Closed,
}

/// A prompt session and its active selector.
pub struct Repl {
    selector: String,
}

impl Default for Repl {
    fn default() -> Self {
        Self {
            selector: INITIAL_SELECTOR.to_string(),
        }
    }
}

impl Repl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn selector(&self) -> &str {
        &self.selector
    }

    /// Read lines from `input` until `quit` or end of input, writing prompts and results to `output`.
    ///
    /// Failed commands are reported on `output` and do not end the session.
    pub async fn run<R, W>(
        &mut self,
        cluster: &mut Cluster,
        input: R,
        mut output: W,
    ) -> Result<Exit, Error>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        loop {
            output
                .write_all(format!("{}> ", self.selector).as_bytes())
                .await?;
            output.flush().await?;
            let Some(line) = lines.next_line().await? else {
                info!("input closed");
                return Ok(Exit::Closed);
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(selector) = line.strip_prefix('>') {
                self.selector = selector.trim().to_string();
                continue;
            }
            if line == QUIT {
                cluster.shutdown().await?;
                output.write_all(b"bye\n").await?;
                output.flush().await?;
                return Ok(Exit::Quit);
            }

            match cluster.broadcast(&self.selector, line).await {
                Ok(reply) => {
                    let rendered = serde_json::to_string_pretty(&reply.into_value())?;
                    output.write_all(rendered.as_bytes()).await?;
                    output.write_all(b"\n").await?;
                }
                Err(err) => {
                    warn!(selector = self.selector.as_str(), line, ?err, "command failed");
                    output.write_all(format!("error: {err}\n").as_bytes()).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        mock::recorder::Recorder,
        node::{Node, LOCALHOST},
    };
    use serde_json::json;

    async fn cluster(count: usize) -> (Cluster, Vec<Recorder>) {
        let config = Config {
            delegates: 2,
            ..Config::default()
        };
        let mut recorders = Vec::new();
        let mut nodes = Vec::new();
        for index in 0..count {
            let recorder = Recorder::start().await.unwrap();
            nodes.push(
                Node::attach(index, LOCALHOST, recorder.port(), 0, config.credentials()).unwrap(),
            );
            recorders.push(recorder);
        }
        (Cluster::with_nodes(config, nodes), recorders)
    }

    #[tokio::test]
    async fn test_session() {
        let (mut cluster, recorders) = cluster(3).await;
        recorders[1].respond("wallet_account_balance", json!([["alice", []]]));
        let input: &[u8] = b"blockchain_get_info\n\n>alice\nwallet_account_balance $acct\n>0,2\n  get_info  \nquit\n";
        let mut output = Vec::new();

        let mut repl = Repl::new();
        let exit = repl.run(&mut cluster, input, &mut output).await.unwrap();
        assert_eq!(exit, Exit::Quit);
        assert_eq!(repl.selector(), "0,2");
        assert!(cluster.nodes().is_empty());

        // Nothing is sent while no selector is active
        assert_eq!(recorders[0].methods(), vec!["get_info", "quit"]);
        assert_eq!(
            recorders[1].requests()[0].params,
            vec![json!("alice")]
        );
        assert_eq!(recorders[1].methods(), vec!["wallet_account_balance", "quit"]);
        assert_eq!(recorders[2].methods(), vec!["get_info", "quit"]);

        let output = String::from_utf8(output).unwrap();
        assert!(output.starts_with("none> "));
        assert!(output.contains("alice> "));
        assert!(output.contains("\"alice\""));
        assert!(output.ends_with("bye\n"));
    }

    #[tokio::test]
    async fn test_errors_do_not_end_session() {
        let (mut cluster, recorders) = cluster(2).await;
        recorders[1].reject("wallet_fly", 500, "unknown method");
        let input: &[u8] = b">1\nwallet_fly\nget_info\n";
        let mut output = Vec::new();

        let exit = Repl::new()
            .run(&mut cluster, input, &mut output)
            .await
            .unwrap();
        assert_eq!(exit, Exit::Closed);
        assert_eq!(cluster.nodes().len(), 2);
        assert_eq!(recorders[1].methods(), vec!["wallet_fly", "get_info"]);

        let output = String::from_utf8(output).unwrap();
        assert!(output.contains("error: node 1 failed `wallet_fly`"));
    }
}
