//! Launch a set of nodes, broadcast commands to them, and advance blocks in lock-step.

use crate::{
    config::Config,
    node::{Node, LOCALHOST},
    selector::Resolver,
    supervisor::Launch,
    Error,
};
use serde_json::Value;
use std::net::SocketAddr;
use tracing::{error, info};

/// Advances every node's simulated clock by one block interval.
pub const ADVANCE_COMMAND: &str = "debug_advance_time 1 blocks";

/// Blocks until the node has applied the given block.
pub const WAIT_FOR_BLOCK_METHOD: &str = "debug_wait_for_block_by_number";

/// Results of a broadcast, in resolution order.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    /// Exactly one target was resolved.
    One(Value),
    /// Zero or several targets were resolved.
    Many(Vec<Value>),
}

impl Reply {
    fn from_results(mut results: Vec<Value>) -> Self {
        if results.len() == 1 {
            Reply::One(results.remove(0))
        } else {
            Reply::Many(results)
        }
    }

    /// The single result, or all results as a JSON array.
    pub fn into_value(self) -> Value {
        match self {
            Reply::One(value) => value,
            Reply::Many(values) => Value::Array(values),
        }
    }
}

/// Outcome of [Cluster::launch].
#[derive(Debug, Default)]
pub struct Launched {
    /// Indices of nodes whose process started.
    pub started: Vec<usize>,
    /// Followers that failed to start (the rest of the cluster still runs).
    pub failed: Vec<(usize, Error)>,
}

/// The nodes of a test run and the height the next block step waits for.
pub struct Cluster {
    config: Config,
    nodes: Vec<Node>,
    resolver: Resolver,
    next_block: u64,
}

impl Cluster {
    /// Create an empty cluster.
    pub fn new(config: Config) -> Self {
        let resolver = Resolver::new(config.delegate_table());
        Self {
            config,
            nodes: Vec::new(),
            resolver,
            next_block: 1,
        }
    }

    /// Create a cluster from nodes that are already running.
    pub fn with_nodes(config: Config, mut nodes: Vec<Node>) -> Self {
        let mut cluster = Self::new(config);
        nodes.sort_by_key(Node::index);
        cluster.nodes = nodes;
        cluster
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Height the next [Cluster::advance_blocks] step will wait for.
    pub fn next_block(&self) -> u64 {
        self.next_block
    }

    pub fn node(&self, index: usize) -> Result<&Node, Error> {
        self.nodes
            .binary_search_by_key(&index, Node::index)
            .map(|position| &self.nodes[position])
            .map_err(|_| Error::UnknownNode(index))
    }

    /// Process arguments for node `index`.
    fn launch_params(&self, index: usize, peer: Option<SocketAddr>) -> Launch {
        let offset = |base: u16| {
            u16::try_from(index)
                .ok()
                .and_then(|index| base.checked_add(index))
        };
        Launch {
            binary: self.config.binary.clone(),
            data_dir: self.config.data_dir(index),
            genesis: self.config.genesis_path(),
            credentials: self.config.credentials(),
            http_port: offset(self.config.ports.http),
            p2p_port: offset(self.config.ports.p2p),
            rpc_port: offset(self.config.ports.rpc),
            peer,
        }
    }

    fn start(&self, index: usize, peer: Option<SocketAddr>) -> Result<Node, Error> {
        let launch = self.launch_params(index, peer);
        std::fs::create_dir_all(&launch.data_dir)
            .map_err(|source| Error::Spawn { node: index, source })?;
        Node::start(index, &launch)
    }

    /// Start `count` more nodes.
    ///
    /// Node 0 is started first and must be accepting P2P connections before any follower is
    /// started (followers connect to it on startup). Followers are then started without waiting
    /// on each other. A follower that fails to spawn is reported in [Launched::failed] and does
    /// not stop the others.
    pub async fn launch(&mut self, count: usize) -> Result<Launched, Error> {
        let mut launched = Launched::default();
        let first = self.nodes.last().map_or(0, |node| node.index() + 1);
        let mut indices = first..first + count;

        if first == 0 {
            let Some(index) = indices.next() else {
                return Ok(launched);
            };
            let node = self.start(index, None)?;
            self.nodes.push(node);
            launched.started.push(index);
        }

        // Wait for node 0 to listen for peers
        let seed = self.node(0)?;
        let p2p_port = seed.p2p_ready().wait().await.ok_or(Error::NotReady {
            node: 0,
            signal: "p2p",
        })?;
        let peer = SocketAddr::new(LOCALHOST, p2p_port);
        info!(%peer, "seed node listening");

        for index in indices {
            match self.start(index, Some(peer)) {
                Ok(node) => {
                    self.nodes.push(node);
                    launched.started.push(index);
                }
                Err(err) => {
                    error!(node = index, ?err, "failed to start node");
                    launched.failed.push((index, err));
                }
            }
        }
        info!(started = ?launched.started, failed = launched.failed.len(), "launched nodes");
        Ok(launched)
    }

    /// Run `command` on every node, one after another, in index order.
    pub async fn clients(&self, command: &str) -> Result<Vec<Value>, Error> {
        let mut results = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            results.push(node.run(command).await?);
        }
        Ok(results)
    }

    /// Run `template` on every target `selector` resolves to, substituting each target's account.
    ///
    /// Calls are issued sequentially in resolution order. A selector that resolves to nothing
    /// issues no calls.
    pub async fn broadcast(&self, selector: &str, template: &str) -> Result<Reply, Error> {
        let targets = self.resolver.resolve(selector);
        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            let node = self.node(target.node)?;
            results.push(node.run_as(template, &target.account).await?);
        }
        Ok(Reply::from_results(results))
    }

    /// Produce `steps` blocks.
    ///
    /// Each step advances every node's clock by one block interval and then waits until every
    /// node reports the next expected block. The local height is only incremented after all
    /// nodes have passed the barrier.
    pub async fn advance_blocks(&mut self, steps: u64) -> Result<(), Error> {
        for _ in 0..steps {
            self.clients(ADVANCE_COMMAND).await?;

            let height = self.next_block;
            let command = format!("{WAIT_FOR_BLOCK_METHOD} {height}");
            for node in &self.nodes {
                let wait = node.run(&command);
                match self.config.barrier_timeout() {
                    Some(timeout) => tokio::time::timeout(timeout, wait).await.map_err(|_| {
                        Error::BarrierTimeout {
                            node: node.index(),
                            height,
                        }
                    })??,
                    None => wait.await?,
                };
            }
            self.next_block += 1;
            info!(height, "all nodes reached block");
        }
        Ok(())
    }

    /// Ask every node to quit and release their handles.
    ///
    /// Processes are never killed. Every node is asked even if an earlier one fails; the first
    /// failure is returned.
    pub async fn shutdown(&mut self) -> Result<(), Error> {
        let grace = self.config.shutdown_grace();
        let mut result = Ok(());
        for node in self.nodes.drain(..) {
            let index = node.index();
            if let Err(err) = node.finish(grace).await {
                error!(node = index, ?err, "failed to shut down node");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }
}
