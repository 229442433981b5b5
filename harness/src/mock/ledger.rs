//! Chain state shared by every simulated node.

use crate::genesis::Genesis;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Identifier of the core asset.
pub const CORE_ASSET: u64 = 0;

/// Symbol of the core asset.
pub const CORE_SYMBOL: &str = "XTS";

/// Base units per whole unit of the core asset.
pub const CORE_PRECISION: u64 = 100_000;

/// Fee charged to the paying account of every transaction.
pub const TRANSACTION_FEE: u64 = 50_000;

/// Fee charged (on top of [TRANSACTION_FEE]) for registering an asset.
pub const ASSET_REGISTRATION_FEE: u64 = 500 * CORE_PRECISION;

/// Simulated seconds between blocks.
pub const BLOCK_INTERVAL: u64 = 10;

/// Precision of assets created without an explicit precision.
const DEFAULT_PRECISION: u64 = 1;

/// Supply cap (whole units) of assets created without an explicit one.
const DEFAULT_MAX_SUPPLY: f64 = 1_000_000_000.0;

/// A state change applied when the next block is produced.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Register {
        name: String,
        key: String,
        payer: String,
    },
    Transfer {
        from: String,
        to: String,
        symbol: String,
        amount: f64,
    },
    CreateAsset {
        symbol: String,
        name: String,
        description: String,
        issuer: String,
        precision: Option<u64>,
        max_supply: Option<f64>,
    },
    Issue {
        symbol: String,
        to: String,
        amount: f64,
    },
    PriceFeed {
        delegate: String,
        symbol: String,
        price: f64,
    },
    Order {
        kind: String,
        owner: String,
        quantity: f64,
        quantity_symbol: String,
        price: f64,
        price_symbol: String,
    },
}

/// Requests a node makes against the chain.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Move the genesis balance of `address` to `account`.
    Claim { address: String, account: String },
    /// Queue an operation for the next block.
    Submit { operation: Operation },
    /// Move `node`'s simulated clock forward.
    Advance { node: u16, seconds: u64 },
    Head,
    Info,
    Balances { accounts: Vec<String> },
    Asset { symbol: String },
    Orders { quote: String, base: String },
}

#[derive(Clone, Debug)]
struct Asset {
    symbol: String,
    name: String,
    description: String,
    issuer: Option<String>,
    precision: u64,
    max_supply: u64,
    supply: u64,
}

impl Asset {
    fn to_json(&self, id: u64) -> Value {
        json!({
            "id": id,
            "symbol": self.symbol,
            "name": self.name,
            "description": self.description,
            "issuer_account_name": self.issuer,
            "precision": self.precision,
            "maximum_share_supply": self.max_supply,
            "current_share_supply": self.supply,
        })
    }
}

#[derive(Clone, Debug, Default)]
struct Account {
    balances: BTreeMap<u64, u64>,
}

/// Accounts, assets, and pending operations of the simulated chain.
pub struct Ledger {
    head: u64,
    clocks: HashMap<u16, u64>,
    unclaimed: HashMap<String, u64>,
    accounts: BTreeMap<String, Account>,
    keys: BTreeMap<String, String>,
    assets: Vec<Asset>,
    pending: Vec<Operation>,
    feeds: BTreeMap<(String, String), f64>,
    orders: Vec<Operation>,
}

impl Ledger {
    /// Initialize from a genesis file: delegate names are registered and balances are claimable.
    pub fn new(genesis: &Genesis) -> Self {
        let mut assets = vec![Asset {
            symbol: CORE_SYMBOL.to_string(),
            name: "BitShares XTS".to_string(),
            description: "core asset".to_string(),
            issuer: None,
            precision: CORE_PRECISION,
            max_supply: u64::MAX,
            supply: genesis.balances.iter().map(|(_, amount)| amount).sum(),
        }];
        assets.extend(genesis.market_assets.iter().map(|asset| Asset {
            symbol: asset.symbol.clone(),
            name: asset.name.clone(),
            description: asset.description.clone(),
            issuer: None,
            precision: asset.precision,
            max_supply: u64::MAX,
            supply: 0,
        }));
        let mut unclaimed = HashMap::new();
        for (address, amount) in &genesis.balances {
            *unclaimed.entry(address.clone()).or_insert(0) += amount;
        }
        let mut ledger = Self {
            head: 0,
            clocks: HashMap::new(),
            unclaimed,
            accounts: BTreeMap::new(),
            keys: BTreeMap::new(),
            assets,
            pending: Vec::new(),
            feeds: BTreeMap::new(),
            orders: Vec::new(),
        };
        for name in &genesis.names {
            ledger.accounts.insert(name.name.clone(), Account::default());
            ledger.keys.insert(name.name.clone(), name.owner.clone());
        }
        ledger
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    fn asset_id(&self, symbol: &str) -> Result<u64, String> {
        self.assets
            .iter()
            .position(|asset| asset.symbol == symbol)
            .map(|id| id as u64)
            .ok_or_else(|| format!("unknown asset: {symbol}"))
    }

    fn units(&self, symbol: &str, amount: f64) -> Result<(u64, u64), String> {
        let id = self.asset_id(symbol)?;
        if !amount.is_finite() || amount < 0.0 {
            return Err(format!("invalid amount: {amount}"));
        }
        let precision = self.assets[id as usize].precision;
        Ok((id, (amount * precision as f64).round() as u64))
    }

    /// Balance of `account` in asset `id`.
    pub fn balance(&self, account: &str, id: u64) -> u64 {
        self.accounts
            .get(account)
            .and_then(|account| account.balances.get(&id))
            .copied()
            .unwrap_or(0)
    }

    fn credit(&mut self, account: &str, id: u64, amount: u64) -> Result<(), String> {
        let account = self
            .accounts
            .get_mut(account)
            .ok_or_else(|| format!("unknown account: {account}"))?;
        *account.balances.entry(id).or_insert(0) += amount;
        Ok(())
    }

    fn debit(&mut self, account: &str, id: u64, amount: u64) -> Result<(), String> {
        let name = account;
        let account = self
            .accounts
            .get_mut(name)
            .ok_or_else(|| format!("unknown account: {name}"))?;
        let balance = account.balances.entry(id).or_insert(0);
        *balance = balance
            .checked_sub(amount)
            .ok_or_else(|| format!("insufficient funds: {name}"))?;
        if *balance == 0 {
            account.balances.remove(&id);
        }
        Ok(())
    }

    /// Move the genesis balance of `address` into `account`, registering it if needed.
    pub fn claim(&mut self, address: &str, account: &str) -> u64 {
        self.accounts.entry(account.to_string()).or_default();
        let amount = self.unclaimed.remove(address).unwrap_or(0);
        if amount > 0 {
            *self
                .accounts
                .entry(account.to_string())
                .or_default()
                .balances
                .entry(CORE_ASSET)
                .or_insert(0) += amount;
        }
        amount
    }

    /// Check an operation against confirmed state and queue it.
    pub fn submit(&mut self, operation: Operation) -> Result<Value, String> {
        match &operation {
            Operation::Register { name, payer, .. } => {
                if self.keys.contains_key(name) {
                    return Err(format!("account already registered: {name}"));
                }
                self.require_funds(payer, CORE_ASSET, TRANSACTION_FEE)?;
            }
            Operation::Transfer {
                from,
                to,
                symbol,
                amount,
            } => {
                let (id, units) = self.units(symbol, *amount)?;
                if !self.accounts.contains_key(to) {
                    return Err(format!("unknown account: {to}"));
                }
                if id == CORE_ASSET {
                    self.require_funds(from, id, units + TRANSACTION_FEE)?;
                } else {
                    self.require_funds(from, id, units)?;
                    self.require_funds(from, CORE_ASSET, TRANSACTION_FEE)?;
                }
            }
            Operation::CreateAsset { symbol, issuer, .. } => {
                if self.asset_id(symbol).is_ok() {
                    return Err(format!("asset already exists: {symbol}"));
                }
                self.require_funds(
                    issuer,
                    CORE_ASSET,
                    ASSET_REGISTRATION_FEE + TRANSACTION_FEE,
                )?;
            }
            Operation::Issue { symbol, to, amount } => {
                let (id, _) = self.units(symbol, *amount)?;
                let issuer = self.assets[id as usize]
                    .issuer
                    .clone()
                    .ok_or_else(|| format!("asset has no issuer: {symbol}"))?;
                if !self.accounts.contains_key(to) {
                    return Err(format!("unknown account: {to}"));
                }
                self.require_funds(&issuer, CORE_ASSET, TRANSACTION_FEE)?;
            }
            Operation::PriceFeed { symbol, .. } => {
                self.asset_id(symbol)?;
            }
            Operation::Order {
                owner,
                quantity_symbol,
                price_symbol,
                ..
            } => {
                self.asset_id(quantity_symbol)?;
                self.asset_id(price_symbol)?;
                if !self.accounts.contains_key(owner) {
                    return Err(format!("unknown account: {owner}"));
                }
            }
        }
        let record = json!({
            "block_num": self.head + 1,
            "operation": serde_json::to_value(&operation).unwrap_or(Value::Null),
        });
        self.pending.push(operation);
        Ok(record)
    }

    fn require_funds(&self, account: &str, id: u64, amount: u64) -> Result<(), String> {
        if !self.accounts.contains_key(account) {
            return Err(format!("unknown account: {account}"));
        }
        if self.balance(account, id) < amount {
            return Err(format!("insufficient funds: {account}"));
        }
        Ok(())
    }

    fn apply(&mut self, operation: Operation) -> Result<(), String> {
        match operation {
            Operation::Register { name, key, payer } => {
                self.debit(&payer, CORE_ASSET, TRANSACTION_FEE)?;
                self.accounts.entry(name.clone()).or_default();
                self.keys.insert(name, key);
            }
            Operation::Transfer {
                from,
                to,
                symbol,
                amount,
            } => {
                let (id, units) = self.units(&symbol, amount)?;
                self.debit(&from, CORE_ASSET, TRANSACTION_FEE)?;
                self.debit(&from, id, units)?;
                self.credit(&to, id, units)?;
            }
            Operation::CreateAsset {
                symbol,
                name,
                description,
                issuer,
                precision,
                max_supply,
            } => {
                self.debit(
                    &issuer,
                    CORE_ASSET,
                    ASSET_REGISTRATION_FEE + TRANSACTION_FEE,
                )?;
                let precision = precision.unwrap_or(DEFAULT_PRECISION);
                let max_supply = max_supply.unwrap_or(DEFAULT_MAX_SUPPLY);
                self.assets.push(Asset {
                    symbol,
                    name,
                    description,
                    issuer: Some(issuer),
                    precision,
                    max_supply: (max_supply * precision as f64).round() as u64,
                    supply: 0,
                });
            }
            Operation::Issue { symbol, to, amount } => {
                let (id, units) = self.units(&symbol, amount)?;
                let asset = &self.assets[id as usize];
                let issuer = asset
                    .issuer
                    .clone()
                    .ok_or_else(|| format!("asset has no issuer: {symbol}"))?;
                let supply = asset
                    .supply
                    .checked_add(units)
                    .filter(|supply| *supply <= asset.max_supply)
                    .ok_or_else(|| format!("max supply exceeded: {symbol}"))?;
                self.debit(&issuer, CORE_ASSET, TRANSACTION_FEE)?;
                self.credit(&to, id, units)?;
                self.assets[id as usize].supply = supply;
            }
            Operation::PriceFeed {
                delegate,
                symbol,
                price,
            } => {
                self.feeds.insert((symbol, delegate), price);
            }
            order @ Operation::Order { .. } => self.orders.push(order),
        }
        Ok(())
    }

    fn produce(&mut self) {
        self.head += 1;
        for operation in std::mem::take(&mut self.pending) {
            if let Err(reason) = self.apply(operation) {
                warn!(block = self.head, %reason, "dropped operation");
            }
        }
        debug!(block = self.head, "produced block");
    }

    /// Advance `node`'s clock and produce every block the furthest clock has reached.
    pub fn advance(&mut self, node: u16, seconds: u64) -> u64 {
        let clock = self.clocks.entry(node).or_insert(0);
        *clock += seconds;
        let target = self.clocks.values().max().copied().unwrap_or(0) / BLOCK_INTERVAL;
        while self.head < target {
            self.produce();
        }
        self.head
    }

    /// `[[name, [[asset, amount], ...]], ...]` for every listed account holding a balance.
    pub fn balances(&self, accounts: &[String]) -> Value {
        let entries: Vec<Value> = accounts
            .iter()
            .filter_map(|name| {
                let account = self.accounts.get(name)?;
                if account.balances.is_empty() {
                    return None;
                }
                let balances: Vec<Value> = account
                    .balances
                    .iter()
                    .map(|(id, amount)| json!([id, amount]))
                    .collect();
                Some(json!([name, balances]))
            })
            .collect();
        Value::Array(entries)
    }

    pub fn info(&self) -> Value {
        json!({
            "head_block_num": self.head,
            "symbol": CORE_SYMBOL,
            "precision": CORE_PRECISION,
            "block_interval": BLOCK_INTERVAL,
            "transaction_fee": TRANSACTION_FEE,
            "short_symbol_asset_reg_fee": ASSET_REGISTRATION_FEE,
            "long_symbol_asset_reg_fee": ASSET_REGISTRATION_FEE / 5,
            "price_feeds": self.feeds.len(),
        })
    }

    /// Orders whose symbols match the `quote`/`base` market (in either direction).
    pub fn orders(&self, quote: &str, base: &str) -> Value {
        let orders: Vec<Value> = self
            .orders
            .iter()
            .filter(|order| match order {
                Operation::Order {
                    quantity_symbol,
                    price_symbol,
                    ..
                } => {
                    (quantity_symbol == quote && price_symbol == base)
                        || (quantity_symbol == base && price_symbol == quote)
                }
                _ => false,
            })
            .map(|order| serde_json::to_value(order).unwrap_or(Value::Null))
            .collect();
        Value::Array(orders)
    }

    /// Serve a [Request].
    pub fn handle(&mut self, request: Request) -> Result<Value, String> {
        match request {
            Request::Claim { address, account } => Ok(json!(self.claim(&address, &account))),
            Request::Submit { operation } => self.submit(operation),
            Request::Advance { node, seconds } => Ok(json!(self.advance(node, seconds))),
            Request::Head => Ok(json!(self.head)),
            Request::Info => Ok(self.info()),
            Request::Balances { accounts } => Ok(self.balances(&accounts)),
            Request::Asset { symbol } => {
                let id = self.asset_id(&symbol)?;
                Ok(self.assets[id as usize].to_json(id))
            }
            Request::Orders { quote, base } => Ok(self.orders(&quote, &base)),
        }
    }
}
