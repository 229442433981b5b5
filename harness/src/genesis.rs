//! Genesis file consumed by every node.

use crate::{keys::KeyRecord, selector::delegate_name, Error};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Balance of the angel account (key 0).
pub const ANGEL_BALANCE: u64 = 10_000 * 2 * 100_000_000;

/// Balance of every other delegate.
pub const DELEGATE_BALANCE: u64 = 100_000_000_000;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MarketAsset {
    pub symbol: String,
    pub name: String,
    pub description: String,
    pub precision: u64,
    pub min_price: f64,
    pub max_price: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Name {
    pub name: String,
    pub owner: String,
    pub delegate_pay_rate: u8,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Genesis {
    pub timestamp: String,
    pub market_assets: Vec<MarketAsset>,
    pub names: Vec<Name>,
    /// `(address, amount)` pairs.
    pub balances: Vec<(String, u64)>,
}

impl Genesis {
    /// Register `delegates` names owned by the first keys and fund their addresses.
    ///
    /// Key 0 (the angel) receives [ANGEL_BALANCE]; keys `1..delegates` receive [DELEGATE_BALANCE].
    pub fn build(keys: &[KeyRecord], timestamp: &str, delegates: usize) -> Result<Self, Error> {
        if keys.len() < delegates || keys.is_empty() {
            return Err(Error::KeyTool(format!(
                "need {} keys for {delegates} delegates, got {}",
                delegates.max(1),
                keys.len()
            )));
        }
        let market_assets = vec![MarketAsset {
            symbol: "USD".to_string(),
            name: "United States Dollar".to_string(),
            description: "Federally Reserved, Inflation Guaranteed".to_string(),
            precision: 10_000,
            min_price: 0.000001,
            max_price: 1_000_000.0,
        }];
        let names = keys[..delegates]
            .iter()
            .enumerate()
            .map(|(ordinal, key)| Name {
                name: delegate_name(ordinal),
                owner: key.public_key.clone(),
                delegate_pay_rate: 1,
            })
            .collect();
        let mut balances = vec![(keys[0].pts_address.clone(), ANGEL_BALANCE)];
        balances.extend(
            keys[1..delegates.max(1)]
                .iter()
                .map(|key| (key.pts_address.clone(), DELEGATE_BALANCE)),
        );
        Ok(Self {
            timestamp: timestamp.to_string(),
            market_assets,
            names,
            balances,
        })
    }

    /// Write as pretty JSON, creating parent directories.
    pub fn write(&self, path: &Path) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        info!(path = ?path, names = self.names.len(), "wrote genesis");
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self, Error> {
        Ok(serde_json::from_slice(&std::fs::read(path)?)?)
    }
}
