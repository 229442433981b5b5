//! Simulated stand-ins for the node binary and key tool.
//!
//! [node] serves the RPC methods scenarios use and prints the same readiness lines as the
//! real binary, so a [crate::cluster::Cluster] can supervise it as a child process.
//! [recorder] is an in-process endpoint for asserting on the exact requests a client sends.

pub mod chain;
pub mod keygen;
pub mod ledger;
pub mod node;
pub mod recorder;
