use lockstep_harness::config::{Config, Ports};
use std::path::PathBuf;

/// Route harness logs through the test writer (once per test binary).
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Scratch directory unique to this test and process.
pub fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("lockstep-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

/// A configuration launching simulated nodes.
///
/// Every test passes its own `slot` so concurrently running tests never share ports.
pub fn config(name: &str, slot: u16) -> Config {
    let base = 21_000 + slot * 30;
    Config {
        binary: PathBuf::from(env!("CARGO_BIN_EXE_mock-node")),
        key_tool: PathBuf::from(env!("CARGO_BIN_EXE_mock-keygen")),
        base_dir: scratch(name),
        ports: Ports {
            http: base,
            p2p: base + 10,
            rpc: base + 20,
        },
        barrier_timeout: Some(30),
        shutdown_grace: 10,
        ..Config::default()
    }
}
