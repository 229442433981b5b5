//! Launch a local cluster of nodes and drive them block by block.
//!
//! # Overview
//!
//! A test run starts several instances of an external node binary, waits for each of them to
//! announce (on stdout) that its HTTP JSON RPC server and P2P listener are up, and then issues
//! commands to arbitrary subsets of those nodes. Simulated time is advanced in lock-step with
//! block production so that scenarios can make deterministic assertions about chain state.
//!
//! The building blocks, leaves first:
//!
//! - [signal]: a one-shot readiness value that many tasks can await.
//! - [supervisor]: spawns a node process and scans its output for readiness lines.
//! - [rpc]: sends `{method, params, id}` requests to a node and decodes the reply.
//! - [node]: couples a process, its readiness signals, and an RPC client.
//! - [selector]: resolves selectors like `alice` or `0,2` into concrete targets.
//! - [cluster]: launches nodes, broadcasts commands, and advances blocks behind a barrier.
//!
//! [scenario] and [repl] script the cluster (automatically or interactively) and [mock]
//! provides a simulated node used to exercise everything above without the real binary.

use std::io::Error as IoError;
use thiserror::Error;

pub mod cluster;
pub mod config;
pub mod genesis;
pub mod keys;
pub mod mock;
pub mod node;
pub mod repl;
pub mod rpc;
pub mod scenario;
pub mod selector;
pub mod signal;
pub mod supervisor;

/// Errors that can occur while driving a cluster.
#[derive(Error, Debug)]
pub enum Error {
    #[error("node {node} failed to spawn: {source}")]
    Spawn { node: usize, source: IoError },
    #[error("node {node} closed stdout before announcing {signal}")]
    NotReady { node: usize, signal: &'static str },
    #[error("node {node} returned status {status}: {body}")]
    Transport {
        node: usize,
        status: u16,
        body: String,
    },
    #[error("node {node} unreachable: {source}")]
    Unreachable {
        node: usize,
        source: reqwest::Error,
    },
    #[error("node {node} sent an invalid response: {reason}")]
    Protocol { node: usize, reason: String },
    #[error("node {node} did not reach block {height} in time")]
    BarrierTimeout { node: usize, height: u64 },
    #[error("node {node} failed `{command}`: {source}")]
    Command {
        node: usize,
        command: String,
        source: Box<Error>,
    },
    #[error("unknown node: {0}")]
    UnknownNode(usize),
    #[error("empty command")]
    EmptyCommand,
    #[error("key tool failed: {0}")]
    KeyTool(String),
    #[error("assertion failed: expected {expected}, got {actual}")]
    Assertion {
        expected: serde_json::Value,
        actual: serde_json::Value,
    },
    #[error("unknown scenario: {0}")]
    UnknownScenario(String),
    #[error("io error: {0}")]
    Io(#[from] IoError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Index of the node that produced the error, if any.
    pub fn node(&self) -> Option<usize> {
        match self {
            Error::Spawn { node, .. }
            | Error::NotReady { node, .. }
            | Error::Transport { node, .. }
            | Error::Unreachable { node, .. }
            | Error::Protocol { node, .. }
            | Error::BarrierTimeout { node, .. }
            | Error::Command { node, .. } => Some(*node),
            Error::UnknownNode(node) => Some(*node),
            _ => None,
        }
    }
}
