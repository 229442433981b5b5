//! Configuration of a test run, loaded from YAML.

use crate::{selector::DELEGATE_COUNT, supervisor::Credentials, Error};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    path::{Path, PathBuf},
    time::Duration,
};

/// Base ports; node `i` listens on `base + i`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Ports {
    pub http: u16,
    pub p2p: u16,
    pub rpc: u16,
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            http: 9100,
            p2p: 9200,
            rpc: 9300,
        }
    }
}

/// Credentials passed to every node's RPC server.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Rpc {
    pub user: String,
    pub password: String,
}

impl Default for Rpc {
    fn default() -> Self {
        Self {
            user: "user".to_string(),
            password: "pass".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Node executable.
    pub binary: PathBuf,
    /// Key generation executable.
    pub key_tool: PathBuf,
    /// Working directory; node `i` stores its data in `base_dir/i`.
    pub base_dir: PathBuf,
    /// Genesis file name (inside `base_dir`).
    pub genesis: String,
    pub genesis_timestamp: String,
    /// Number of nodes to launch.
    pub nodes: usize,
    /// Number of delegates in genesis.
    pub delegates: usize,
    /// Number of keys to request from the key tool.
    pub keys: usize,
    pub key_seed: String,
    pub ports: Ports,
    pub rpc: Rpc,
    /// Node hosting each delegate (defaults to node 0 for all).
    pub delegate_nodes: Option<Vec<usize>>,
    /// Wallet backup used to skip delegate registration on later runs.
    pub delegate_backup: Option<PathBuf>,
    /// Seconds to wait for every node to reach a block (unbounded if unset).
    pub barrier_timeout: Option<u64>,
    /// Seconds to wait for a node to exit after `quit`.
    pub shutdown_grace: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("programs/client/bitshares_client"),
            key_tool: PathBuf::from("programs/utils/bts_create_key"),
            base_dir: PathBuf::from("tmp"),
            genesis: "genesis.json".to_string(),
            genesis_timestamp: "2014-11-13T15:00:00".to_string(),
            nodes: 3,
            delegates: DELEGATE_COUNT,
            keys: 200,
            key_seed: "testkey-".to_string(),
            ports: Ports::default(),
            rpc: Rpc::default(),
            delegate_nodes: None,
            delegate_backup: None,
            barrier_timeout: None,
            shutdown_grace: 5,
        }
    }
}

impl Config {
    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }

    /// Path of the genesis file.
    pub fn genesis_path(&self) -> PathBuf {
        self.base_dir.join(&self.genesis)
    }

    /// Data directory of node `index`.
    pub fn data_dir(&self, index: usize) -> PathBuf {
        self.base_dir.join(index.to_string())
    }

    /// Node hosting each delegate ordinal.
    pub fn delegate_table(&self) -> Vec<usize> {
        self.delegate_nodes
            .clone()
            .unwrap_or_else(|| vec![0; self.delegates])
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            user: self.rpc.user.clone(),
            password: self.rpc.password.clone(),
        }
    }

    pub fn barrier_timeout(&self) -> Option<Duration> {
        self.barrier_timeout.map(Duration::from_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace)
    }
}
