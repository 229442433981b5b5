//! Generate key material with the external key tool.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::process::Command;
use tracing::info;

/// One key as printed by the key tool.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct KeyRecord {
    pub pts_address: String,
    pub public_key: String,
    pub wif_private_key: String,
}

/// Parse the key tool's stdout, requiring exactly `count` records.
pub fn parse(output: &[u8], count: usize) -> Result<Vec<KeyRecord>, Error> {
    let keys: Vec<KeyRecord> = serde_json::from_slice(output)?;
    if keys.len() != count {
        return Err(Error::KeyTool(format!(
            "expected {count} keys, got {}",
            keys.len()
        )));
    }
    Ok(keys)
}

/// Run `<tool> --count=<count> --seed=<seed>` and parse its output.
pub async fn generate(tool: &Path, count: usize, seed: &str) -> Result<Vec<KeyRecord>, Error> {
    let output = Command::new(tool)
        .arg(format!("--count={count}"))
        .arg(format!("--seed={seed}"))
        .output()
        .await
        .map_err(|err| Error::KeyTool(format!("{}: {err}", tool.display())))?;
    if !output.status.success() {
        return Err(Error::KeyTool(format!(
            "{} exited with {}: {}",
            tool.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    let keys = parse(&output.stdout, count)?;
    info!(count, seed, "generated keys");
    Ok(keys)
}
