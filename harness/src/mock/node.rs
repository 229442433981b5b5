//! A simulated node speaking the same RPC and stdout protocol as the real binary.
//!
//! The node started without a peer holds the [Ledger]; every other node forwards chain
//! requests to the P2P port of its peer. Wallets are kept per node.

use super::{
    chain::Chain,
    keygen,
    ledger::{Ledger, Operation, Request as ChainRequest, BLOCK_INTERVAL},
};
use crate::{
    genesis::Genesis,
    rpc::Request,
    supervisor::{HTTP_READY_PREFIX, P2P_READY_PREFIX},
    Error,
};
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    serve, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    collections::{BTreeMap, BTreeSet},
    future::IntoFuture,
    io::Write,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{net::TcpListener, sync::watch};
use tracing::{debug, info, warn};

/// Interval between head checks while waiting for a block.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Launch options, mirroring the real binary's flags.
#[derive(Clone, Debug)]
pub struct Options {
    pub data_dir: PathBuf,
    pub genesis: PathBuf,
    pub http_port: u16,
    pub p2p_port: u16,
    pub connect_to: Option<SocketAddr>,
}

/// Keys and accounts held by a node's wallet.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
struct Wallet {
    open: bool,
    unlocked: bool,
    /// Account name to public key.
    accounts: BTreeMap<String, String>,
    /// Account name to imported private key.
    imported: BTreeMap<String, String>,
    contacts: BTreeMap<String, String>,
    producing: BTreeSet<String>,
}

struct Shared {
    clock: u16,
    chain: Chain,
    wallet: Mutex<Wallet>,
    stop: watch::Sender<bool>,
}

impl Shared {
    fn wallet(&self) -> std::sync::MutexGuard<'_, Wallet> {
        self.wallet
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open_wallet(&self) -> Result<std::sync::MutexGuard<'_, Wallet>, String> {
        let wallet = self.wallet();
        if !wallet.open {
            return Err("no wallet is open".to_string());
        }
        Ok(wallet)
    }

    fn require_open(&self) -> Result<(), String> {
        self.open_wallet().map(drop)
    }
}

/// Positional parameter `index` rendered as text.
fn text(params: &[Value], index: usize) -> Result<String, String> {
    match params.get(index) {
        Some(Value::String(value)) => Ok(value.clone()),
        Some(Value::Null) | None => Err(format!("missing parameter {index}")),
        Some(value) => Ok(value.to_string()),
    }
}

fn optional_text(params: &[Value], index: usize) -> Option<String> {
    text(params, index).ok()
}

/// Positional parameter `index` as a number (numbers may arrive as strings).
fn number(params: &[Value], index: usize) -> Result<f64, String> {
    match params.get(index) {
        Some(Value::Number(value)) => value
            .as_f64()
            .ok_or_else(|| format!("invalid number at {index}")),
        Some(Value::String(value)) => value
            .parse()
            .map_err(|_| format!("invalid number at {index}: {value}")),
        _ => Err(format!("missing parameter {index}")),
    }
}

fn optional_number(params: &[Value], index: usize) -> Result<Option<f64>, String> {
    match params.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => number(params, index).map(Some),
    }
}

impl Shared {
    async fn chain(&self, request: ChainRequest) -> Result<Value, String> {
        self.chain.request(request).await
    }

    async fn submit(&self, operation: Operation) -> Result<Value, String> {
        self.chain(ChainRequest::Submit { operation }).await
    }

    async fn head(&self) -> Result<u64, String> {
        let head = self.chain(ChainRequest::Head).await?;
        head.as_u64()
            .ok_or_else(|| format!("invalid head: {head}"))
    }

    async fn claim(&self, wif: &str, account: &str) -> Result<u64, String> {
        let address =
            keygen::address_of(wif).ok_or_else(|| format!("invalid private key: {wif}"))?;
        let claimed = self
            .chain(ChainRequest::Claim {
                address,
                account: account.to_string(),
            })
            .await?;
        Ok(claimed.as_u64().unwrap_or(0))
    }

    async fn dispatch(&self, method: &str, params: &[Value]) -> Result<Value, String> {
        match method {
            "quit" | "stop" => {
                let _ = self.stop.send(true);
                Ok(Value::Null)
            }
            "about" | "get_info" => Ok(json!({
                "client_version": env!("CARGO_PKG_VERSION"),
                "clock": self.clock,
            })),
            "debug_start_simulated_time" => Ok(Value::Null),
            "debug_advance_time" => {
                let amount = number(params, 0)?;
                let unit = optional_text(params, 1).unwrap_or_else(|| "seconds".to_string());
                let scale = match unit.trim_end_matches('s') {
                    "second" => 1,
                    "minute" => 60,
                    "hour" => 3600,
                    "block" => BLOCK_INTERVAL,
                    _ => return Err(format!("unknown time unit: {unit}")),
                };
                if amount < 0.0 {
                    return Err(format!("cannot go back in time: {amount}"));
                }
                let seconds = (amount * scale as f64).round() as u64;
                self.chain(ChainRequest::Advance {
                    node: self.clock,
                    seconds,
                })
                .await
            }
            "debug_wait_for_block_by_number" => {
                let target = number(params, 0)? as u64;
                loop {
                    let head = self.head().await?;
                    if head >= target {
                        return Ok(json!(head));
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
            "blockchain_get_info" => self.chain(ChainRequest::Info).await,
            "blockchain_get_asset" => {
                self.chain(ChainRequest::Asset {
                    symbol: text(params, 0)?,
                })
                .await
            }
            "wallet_create" => {
                let mut wallet = self.wallet();
                if wallet.open {
                    return Err("wallet already exists".to_string());
                }
                wallet.open = true;
                Ok(Value::Null)
            }
            "wallet_unlock" => {
                self.open_wallet()?.unlocked = true;
                Ok(Value::Null)
            }
            "wallet_lock" => {
                self.open_wallet()?.unlocked = false;
                Ok(Value::Null)
            }
            "wallet_import_private_key" => {
                let wif = text(params, 0)?;
                let name = text(params, 1)?;
                self.require_open()?;
                let claimed = self.claim(&wif, &name).await?;
                let mut wallet = self.wallet();
                wallet
                    .accounts
                    .insert(name.clone(), keygen::account_key(&name));
                wallet.imported.insert(name.clone(), wif);
                debug!(%name, claimed, "imported key");
                Ok(json!(name))
            }
            "wallet_delegate_set_block_production" => {
                let name = text(params, 0)?;
                let enabled = optional_text(params, 1).map_or(true, |flag| flag == "true");
                let mut wallet = self.open_wallet()?;
                if enabled {
                    wallet.producing.insert(name);
                } else {
                    wallet.producing.remove(&name);
                }
                Ok(Value::Null)
            }
            "wallet_account_create" => {
                let name = text(params, 0)?;
                let key = keygen::account_key(&name);
                let mut wallet = self.open_wallet()?;
                if wallet.accounts.contains_key(&name) {
                    return Err(format!("account already exists: {name}"));
                }
                wallet.accounts.insert(name, key.clone());
                Ok(json!(key))
            }
            "wallet_add_contact_account" => {
                let name = text(params, 0)?;
                let key = text(params, 1)?;
                self.open_wallet()?.contacts.insert(name, key);
                Ok(Value::Null)
            }
            "wallet_account_register" => {
                let name = text(params, 0)?;
                let payer = text(params, 1)?;
                let key = {
                    let wallet = self.open_wallet()?;
                    wallet
                        .accounts
                        .get(&name)
                        .or_else(|| wallet.contacts.get(&name))
                        .cloned()
                        .ok_or_else(|| format!("unknown account: {name}"))?
                };
                self.submit(Operation::Register { name, key, payer }).await
            }
            "wallet_account_balance" => {
                let accounts = match optional_text(params, 0) {
                    Some(name) => vec![name],
                    None => self.open_wallet()?.accounts.keys().cloned().collect(),
                };
                self.chain(ChainRequest::Balances { accounts }).await
            }
            "wallet_transfer" => {
                let amount = number(params, 0)?;
                let symbol = text(params, 1)?;
                let from = text(params, 2)?;
                let to = text(params, 3)?;
                self.require_open()?;
                self.submit(Operation::Transfer {
                    from,
                    to,
                    symbol,
                    amount,
                })
                .await
            }
            "wallet_asset_create" => {
                let symbol = text(params, 0)?;
                let name = text(params, 1)?;
                let issuer = text(params, 2)?;
                let description = optional_text(params, 3).unwrap_or_default();
                let max_supply = optional_number(params, 5)?;
                let precision = optional_number(params, 6)?.map(|precision| precision as u64);
                self.require_open()?;
                self.submit(Operation::CreateAsset {
                    symbol,
                    name,
                    description,
                    issuer,
                    precision,
                    max_supply,
                })
                .await
            }
            "wallet_asset_issue" => {
                let amount = number(params, 0)?;
                let symbol = text(params, 1)?;
                let to = text(params, 2)?;
                self.require_open()?;
                self.submit(Operation::Issue { symbol, to, amount }).await
            }
            "wallet_publish_price_feed" => {
                let delegate = text(params, 0)?;
                let price = number(params, 1)?;
                let symbol = text(params, 2)?;
                self.require_open()?;
                self.submit(Operation::PriceFeed {
                    delegate,
                    symbol,
                    price,
                })
                .await
            }
            "wallet_market_submit_short" | "wallet_market_submit_bid"
            | "wallet_market_submit_ask" => {
                let kind = method.trim_start_matches("wallet_market_submit_").to_string();
                let owner = text(params, 0)?;
                let quantity = number(params, 1)?;
                let quantity_symbol = text(params, 2)?;
                let price = number(params, 3)?;
                let price_symbol = text(params, 4)?;
                self.require_open()?;
                self.submit(Operation::Order {
                    kind,
                    owner,
                    quantity,
                    quantity_symbol,
                    price,
                    price_symbol,
                })
                .await
            }
            "wallet_market_order_list" => {
                self.chain(ChainRequest::Orders {
                    quote: text(params, 0)?,
                    base: text(params, 1)?,
                })
                .await
            }
            "wallet_backup_create" => {
                let path = PathBuf::from(text(params, 0)?);
                let wallet = self.open_wallet()?.clone();
                let encoded = serde_json::to_vec_pretty(&wallet).map_err(|err| err.to_string())?;
                std::fs::write(&path, encoded).map_err(|err| format!("{}: {err}", path.display()))?;
                Ok(Value::Null)
            }
            "wallet_backup_restore" => {
                let path = PathBuf::from(text(params, 0)?);
                let encoded =
                    std::fs::read(&path).map_err(|err| format!("{}: {err}", path.display()))?;
                let restored: Wallet =
                    serde_json::from_slice(&encoded).map_err(|err| err.to_string())?;
                for (name, wif) in &restored.imported {
                    self.claim(wif, name).await?;
                }
                *self.wallet() = Wallet {
                    open: true,
                    unlocked: true,
                    ..restored
                };
                Ok(Value::Null)
            }
            _ => Err(format!("unknown method: {method}")),
        }
    }
}

async fn handle(State(shared): State<Arc<Shared>>, headers: HeaderMap, body: String) -> Response {
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("Basic "));
    if !authorized {
        return (StatusCode::UNAUTHORIZED, "missing credentials").into_response();
    }
    let request: Request = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };
    match shared.dispatch(&request.method, &request.params).await {
        Ok(result) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            json!({"result": result, "id": request.id}).to_string(),
        )
            .into_response(),
        Err(reason) => {
            warn!(method = %request.method, %reason, "call failed");
            (StatusCode::INTERNAL_SERVER_ERROR, reason).into_response()
        }
    }
}

/// Announce a listener the way the real node does.
fn announce(prefix: &str, port: u16) -> Result<(), Error> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{prefix}{port}")?;
    stdout.flush()?;
    Ok(())
}

/// Serve until a `quit` call arrives.
pub async fn run(options: Options) -> Result<(), Error> {
    std::fs::create_dir_all(&options.data_dir)?;
    let chain = match options.connect_to {
        Some(peer) => Chain::remote(peer),
        None => Chain::local(Ledger::new(&Genesis::read(&options.genesis)?)),
    };

    let p2p = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, options.p2p_port))).await?;
    let p2p_port = p2p.local_addr()?.port();
    let http = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, options.http_port))).await?;
    let http_port = http.local_addr()?.port();

    let (stop, stopped) = watch::channel(false);
    let shared = Arc::new(Shared {
        clock: http_port,
        chain: chain.clone(),
        wallet: Mutex::new(Wallet::default()),
        stop,
    });
    let rpc = Router::new().route("/rpc", post(handle)).with_state(shared);

    let shutdown = |mut stopped: watch::Receiver<bool>| async move {
        let _ = stopped.wait_for(|stop| *stop).await;
    };
    let p2p_server = tokio::spawn(
        serve(p2p, chain.router())
            .with_graceful_shutdown(shutdown(stopped.clone()))
            .into_future(),
    );
    announce(P2P_READY_PREFIX, p2p_port)?;
    let http_server = tokio::spawn(
        serve(http, rpc)
            .with_graceful_shutdown(shutdown(stopped))
            .into_future(),
    );
    announce(HTTP_READY_PREFIX, http_port)?;
    info!(http_port, p2p_port, peer = ?options.connect_to, "node started");

    let (p2p_result, http_result) = tokio::join!(p2p_server, http_server);
    for result in [p2p_result, http_result] {
        match result {
            Ok(served) => served?,
            Err(err) => warn!(?err, "server task failed"),
        }
    }
    info!("node stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> Shared {
        let keys = keygen::generate(3, "testkey-");
        let genesis = Genesis::build(&keys, "t", 3).unwrap();
        let (stop, _) = watch::channel(false);
        Shared {
            clock: 1,
            chain: Chain::local(Ledger::new(&genesis)),
            wallet: Mutex::new(Wallet::default()),
            stop,
        }
    }

    fn params(values: &[&str]) -> Vec<Value> {
        values.iter().map(|value| json!(value)).collect()
    }

    #[test]
    fn test_parameters() {
        let values = vec![json!("100"), json!(2.5), json!(true), Value::Null];
        assert_eq!(number(&values, 0), Ok(100.0));
        assert_eq!(number(&values, 1), Ok(2.5));
        assert_eq!(text(&values, 2), Ok("true".to_string()));
        assert!(text(&values, 3).is_err());
        assert!(number(&values, 4).is_err());
        assert_eq!(optional_number(&values, 3), Ok(None));
    }

    #[tokio::test]
    async fn test_wallet_required() {
        let shared = shared();
        assert!(shared
            .dispatch("wallet_account_create", &params(&["alice"]))
            .await
            .is_err());
        shared
            .dispatch("wallet_create", &params(&["default", "pw"]))
            .await
            .unwrap();
        assert!(shared
            .dispatch("wallet_account_create", &params(&["alice"]))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_require_open_releases_wallet() {
        let shared = shared();
        let transfer = params(&["1", "XTS", "init0", "alice"]);
        assert_eq!(
            shared.dispatch("wallet_transfer", &transfer).await,
            Err("no wallet is open".to_string())
        );
        assert_eq!(shared.require_open(), Err("no wallet is open".to_string()));

        shared
            .dispatch("wallet_create", &params(&["default", "pw"]))
            .await
            .unwrap();
        assert_eq!(shared.require_open(), Ok(()));
        // The check leaves the wallet unlocked for the handler
        assert!(shared.wallet.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_advance_units() {
        let shared = shared();
        shared
            .dispatch("debug_advance_time", &params(&["1", "seconds"]))
            .await
            .unwrap();
        let head = shared
            .dispatch("debug_advance_time", &params(&["1", "blocks"]))
            .await
            .unwrap();
        assert_eq!(head, json!(1));
        assert!(shared
            .dispatch("debug_advance_time", &params(&["1", "fortnights"]))
            .await
            .is_err());
        let reached = shared
            .dispatch("debug_wait_for_block_by_number", &params(&["1"]))
            .await
            .unwrap();
        assert_eq!(reached, json!(1));
    }

    #[tokio::test]
    async fn test_import_claims_genesis_balance() {
        let shared = shared();
        let angel = keygen::key("testkey-", 0);
        shared
            .dispatch("wallet_create", &params(&["default", "pw"]))
            .await
            .unwrap();
        shared
            .dispatch(
                "wallet_import_private_key",
                &params(&[angel.wif_private_key.as_str(), "init0", "true", "true"]),
            )
            .await
            .unwrap();
        let balance = shared
            .dispatch("wallet_account_balance", &params(&["init0"]))
            .await
            .unwrap();
        assert_eq!(
            balance,
            json!([["init0", [[0, crate::genesis::ANGEL_BALANCE]]]])
        );
    }

    #[tokio::test]
    async fn test_backup_restore() {
        let path = std::env::temp_dir().join(format!("lockstep-backup-{}.json", std::process::id()));
        let source = shared();
        let delegate = keygen::key("testkey-", 1);
        source
            .dispatch("wallet_create", &params(&["default", "pw"]))
            .await
            .unwrap();
        source
            .dispatch(
                "wallet_import_private_key",
                &params(&[delegate.wif_private_key.as_str(), "init1"]),
            )
            .await
            .unwrap();
        source
            .dispatch("wallet_backup_create", &params(&[path.to_str().unwrap()]))
            .await
            .unwrap();

        let target = shared();
        target
            .dispatch(
                "wallet_backup_restore",
                &params(&[path.to_str().unwrap(), "default", "pw"]),
            )
            .await
            .unwrap();
        let balance = target
            .dispatch("wallet_account_balance", &[])
            .await
            .unwrap();
        assert_eq!(
            balance,
            json!([["init1", [[0, crate::genesis::DELEGATE_BALANCE]]]])
        );
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_unknown_method() {
        assert_eq!(
            shared().dispatch("wallet_fly", &[]).await,
            Err("unknown method: wallet_fly".to_string())
        );
    }

    #[tokio::test]
    async fn test_quit_signals_stop() {
        let shared = shared();
        let mut stopped = shared.stop.subscribe();
        shared.dispatch("quit", &[]).await.unwrap();
        assert!(*stopped.borrow_and_update());
    }
}
