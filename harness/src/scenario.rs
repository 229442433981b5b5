//! Fixture steps shared by every scenario and the scripted scenarios themselves.
//!
//! A run prepares the cluster in a fixed order ([Fixture::prepare]): generate keys and
//! genesis, launch the nodes, create wallets, register the delegates on their hosting nodes,
//! and create the `alice` and `bob` accounts. A [Scenario] then scripts calls against that
//! cluster, stepping one block at a time, and compares balances against exact figures.

use crate::{
    cluster::{Cluster, Launched},
    config::Config,
    genesis::Genesis,
    keys,
    selector::delegate_name,
    Error,
};
use serde_json::{json, Value};
use std::{fmt, str::FromStr};
use tracing::{error, info};

/// Name of the wallet every node creates.
pub const WALLET_NAME: &str = "default";

/// Passphrase of every wallet.
pub const WALLET_PASSWORD: &str = "walletpassword";

/// Seconds a wallet stays unlocked.
const UNLOCK_SECONDS: u64 = 9_999_999;

/// Base units per whole XTS.
pub const XTS_PRECISION: u64 = 100_000;

/// Fee charged for every transaction.
pub const TRANSACTION_FEE: u64 = 50_000;

/// Precision of the asset created by the issuance scenarios.
pub const DOGS_PRECISION: u64 = 10_000;

/// Fail with [Error::Assertion] unless `actual == expected`.
pub fn assert_equal(actual: &Value, expected: &Value) -> Result<(), Error> {
    if actual == expected {
        return Ok(());
    }
    error!(%actual, %expected, "assertion failed");
    Err(Error::Assertion {
        expected: expected.clone(),
        actual: actual.clone(),
    })
}

/// A cluster plus the state accumulated while preparing it.
pub struct Fixture {
    cluster: Cluster,
    /// Private key of each delegate ordinal.
    delegate_keys: Vec<String>,
    blockchain_info: Value,
}

impl Fixture {
    pub fn new(config: Config) -> Self {
        Self::with_cluster(Cluster::new(config), Vec::new())
    }

    /// Wrap a cluster whose genesis was created elsewhere.
    pub fn with_cluster(cluster: Cluster, delegate_keys: Vec<String>) -> Self {
        Self {
            cluster,
            delegate_keys,
            blockchain_info: Value::Null,
        }
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn cluster_mut(&mut self) -> &mut Cluster {
        &mut self.cluster
    }

    /// `blockchain_get_info` as recorded by [Fixture::setup_accounts].
    pub fn blockchain_info(&self) -> &Value {
        &self.blockchain_info
    }

    /// Generate keys and write the genesis file.
    pub async fn create_genesis(&mut self) -> Result<(), Error> {
        let config = self.cluster.config();
        let keys = keys::generate(&config.key_tool, config.keys, &config.key_seed).await?;
        let genesis = Genesis::build(&keys, &config.genesis_timestamp, config.delegates)?;
        genesis.write(&config.genesis_path())?;
        self.delegate_keys = keys[..config.delegates]
            .iter()
            .map(|key| key.wif_private_key.clone())
            .collect();
        Ok(())
    }

    /// Start the configured number of nodes.
    pub async fn launch(&mut self) -> Result<Launched, Error> {
        let count = self.cluster.config().nodes;
        self.cluster.launch(count).await
    }

    /// Start simulated time everywhere and open a wallet on every node but the first.
    pub async fn create_wallets(&mut self) -> Result<(), Error> {
        let timestamp = self.cluster.config().genesis_timestamp.clone();
        self.cluster
            .clients(&format!("debug_start_simulated_time {timestamp}"))
            .await?;
        self.cluster.clients("debug_advance_time 1 seconds").await?;
        for node in self.cluster.nodes().iter().filter(|node| node.index() != 0) {
            node.run(&format!("wallet_create {WALLET_NAME} {WALLET_PASSWORD}"))
                .await?;
            node.run(&format!("wallet_unlock {UNLOCK_SECONDS} {WALLET_PASSWORD}"))
                .await?;
        }
        Ok(())
    }

    /// Import every delegate's key on its hosting node and enable block production.
    ///
    /// When the configured wallet backup exists it is restored on node 0 instead.
    pub async fn register_delegates(&mut self) -> Result<(), Error> {
        let backup = self.cluster.config().delegate_backup.clone();
        if let Some(path) = backup.as_ref().filter(|path| path.exists()) {
            info!(?path, "restoring delegate wallet");
            self.cluster
                .node(0)?
                .call(
                    "wallet_backup_restore",
                    vec![
                        json!(path.display().to_string()),
                        json!(WALLET_NAME),
                        json!(WALLET_PASSWORD),
                    ],
                )
                .await?;
            return Ok(());
        }

        let seed = self.cluster.node(0)?;
        seed.run(&format!("wallet_create {WALLET_NAME} {WALLET_PASSWORD}"))
            .await?;
        seed.run(&format!("wallet_unlock {UNLOCK_SECONDS} {WALLET_PASSWORD}"))
            .await?;
        for (ordinal, index) in self.cluster.resolver().delegates().iter().enumerate() {
            let wif = self.delegate_keys.get(ordinal).ok_or_else(|| {
                Error::KeyTool(format!("no key for delegate {ordinal}"))
            })?;
            let name = delegate_name(ordinal);
            let node = self.cluster.node(*index)?;
            node.run(&format!("wallet_import_private_key {wif} {name} true true"))
                .await?;
            node.run(&format!("wallet_delegate_set_block_production {name} true"))
                .await?;
        }
        info!(
            delegates = self.delegate_keys.len(),
            "registered delegates"
        );

        if let Some(path) = backup {
            seed.call(
                "wallet_backup_create",
                vec![json!(path.display().to_string())],
            )
            .await?;
            info!(?path, "saved delegate wallet");
        }
        Ok(())
    }

    /// Create `alice` (node 1) and `bob` (node 2) and register both, paid for by `init0`.
    pub async fn setup_accounts(&mut self) -> Result<(), Error> {
        let alice = self
            .cluster
            .node(1)?
            .run("wallet_account_create alice")
            .await?;
        let bob = self.cluster.node(2)?.run("wallet_account_create bob").await?;

        let registrar = self
            .cluster
            .resolver()
            .delegate_node(0)
            .ok_or(Error::UnknownNode(0))?;
        let registrar = self.cluster.node(registrar)?;
        for (name, key) in [("alice", alice), ("bob", bob)] {
            registrar
                .call("wallet_add_contact_account", vec![json!(name), key])
                .await?;
        }
        let payer = delegate_name(0);
        for name in ["alice", "bob"] {
            registrar
                .run(&format!("wallet_account_register {name} {payer}"))
                .await?;
        }
        self.blockchain_info = registrar.run("blockchain_get_info").await?;
        self.step().await
    }

    /// Run every preparation step in order.
    pub async fn prepare(&mut self) -> Result<(), Error> {
        self.create_genesis().await?;
        let launched = self.launch().await?;
        if let Some((_, err)) = launched.failed.into_iter().next() {
            return Err(err);
        }
        self.create_wallets().await?;
        self.register_delegates().await?;
        self.setup_accounts().await?;
        info!("cluster prepared");
        Ok(())
    }

    /// Produce one block.
    pub async fn step(&mut self) -> Result<(), Error> {
        self.cluster.advance_blocks(1).await
    }

    /// Run `command` as `init0` on node 0.
    pub async fn angel(&self, command: &str) -> Result<Value, Error> {
        Ok(self.cluster.broadcast("angel", command).await?.into_value())
    }

    pub async fn alice(&self, command: &str) -> Result<Value, Error> {
        Ok(self.cluster.broadcast("alice", command).await?.into_value())
    }

    pub async fn bob(&self, command: &str) -> Result<Value, Error> {
        Ok(self.cluster.broadcast("bob", command).await?.into_value())
    }

    /// Run `command` once per delegate, as that delegate.
    pub async fn delegates(&self, command: &str) -> Result<Value, Error> {
        Ok(self
            .cluster
            .broadcast("delegates", command)
            .await?
            .into_value())
    }

    /// Ask every node to quit.
    pub async fn shutdown(&mut self) -> Result<(), Error> {
        self.cluster.shutdown().await
    }
}

/// A scripted test run against a prepared [Fixture].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scenario {
    /// Transfer 100 XTS from the angel to `alice`.
    SimpleTransfer,
    /// Create and issue a user asset, checking fees.
    UiaCreate,
    /// Trade a user asset against published price feeds.
    UiaMarket,
}

impl Scenario {
    pub const ALL: [Scenario; 3] = [
        Scenario::SimpleTransfer,
        Scenario::UiaCreate,
        Scenario::UiaMarket,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Scenario::SimpleTransfer => "simple-transfer",
            Scenario::UiaCreate => "uia-create",
            Scenario::UiaMarket => "uia-market",
        }
    }

    pub async fn run(self, fixture: &mut Fixture) -> Result<(), Error> {
        info!(scenario = self.name(), "running scenario");
        let result = match self {
            Scenario::SimpleTransfer => simple_transfer(fixture).await,
            Scenario::UiaCreate => uia_create(fixture).await,
            Scenario::UiaMarket => uia_market(fixture).await,
        };
        result?;
        info!(scenario = self.name(), "scenario passed");
        Ok(())
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scenario {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|scenario| scenario.name() == name)
            .ok_or_else(|| Error::UnknownScenario(name.to_string()))
    }
}

async fn simple_transfer(fixture: &mut Fixture) -> Result<(), Error> {
    fixture
        .angel("wallet_transfer 100 XTS $acct alice hello_world vote_none")
        .await?;
    fixture.step().await?;
    let balance = fixture.alice("wallet_account_balance").await?;
    assert_equal(&balance, &json!([["alice", [[0, 100 * XTS_PRECISION]]]]))
}

/// Fund `alice` and have her create DOGS. Returns the asset id.
async fn create_dogs(fixture: &mut Fixture) -> Result<Value, Error> {
    fixture
        .alice(&format!(
            "wallet_asset_create DOGS WhoLetTheDogesOut alice some_kind_of_canine_animal {{}} 10000000 {DOGS_PRECISION}"
        ))
        .await?;
    fixture.step().await?;
    let dogs = fixture.alice("blockchain_get_asset DOGS").await?;
    dogs.get("id")
        .cloned()
        .ok_or_else(|| Error::Assertion {
            expected: json!({"id": "<asset id>"}),
            actual: dogs.clone(),
        })
}

async fn uia_create(fixture: &mut Fixture) -> Result<(), Error> {
    let registration_fee = fixture
        .blockchain_info()
        .get("short_symbol_asset_reg_fee")
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::Assertion {
            expected: json!({"short_symbol_asset_reg_fee": "<fee>"}),
            actual: fixture.blockchain_info().clone(),
        })?;
    let starting = 5_000_000 * XTS_PRECISION;

    fixture
        .angel("wallet_transfer 5000000 XTS $acct alice hello_world vote_none")
        .await?;
    fixture.step().await?;
    let dogs = create_dogs(fixture).await?;
    fixture.alice("wallet_asset_issue 1000 DOGS bob").await?;
    fixture.step().await?;

    let bob = fixture.bob("wallet_account_balance").await?;
    assert_equal(&bob, &json!([["bob", [[dogs, 1000 * DOGS_PRECISION]]]]))?;
    let alice = fixture.alice("wallet_account_balance").await?;
    assert_equal(
        &alice,
        &json!([["alice", [[0, starting - 2 * TRANSACTION_FEE - registration_fee]]]]),
    )
}

async fn uia_market(fixture: &mut Fixture) -> Result<(), Error> {
    fixture
        .angel("wallet_transfer 5000000 XTS $acct alice hello_world vote_none")
        .await?;
    fixture
        .angel("wallet_transfer 5000000 XTS $acct bob hello_world vote_none")
        .await?;
    fixture.step().await?;
    create_dogs(fixture).await?;
    fixture.alice("wallet_asset_issue 1000 DOGS alice").await?;
    fixture.step().await?;

    fixture
        .delegates("wallet_publish_price_feed $acct 0.02 USD")
        .await?;
    fixture.step().await?;
    fixture
        .alice("wallet_market_submit_short alice 100000 XTS 0 USD")
        .await?;
    fixture.step().await?;
    let orders = fixture.alice("wallet_market_order_list USD XTS").await?;
    info!(%orders, "orders after short");
    fixture
        .bob("wallet_market_submit_bid bob 2000 USD 0.02 XTS")
        .await?;
    fixture.step().await?;
    let orders = fixture.alice("wallet_market_order_list USD XTS").await?;
    info!(%orders, "orders after bid");

    let alice = fixture.alice("wallet_account_balance").await?;
    let bob = fixture.bob("wallet_account_balance").await?;
    info!(%alice, %bob, "balances after trading");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mock::recorder::Recorder,
        node::{Node, LOCALHOST},
        rpc::Request,
    };
    use test_case::test_case;

    async fn fixture(count: usize, delegates: usize) -> (Fixture, Vec<Recorder>) {
        let config = Config {
            delegates,
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
        let keys = (0..delegates).map(|i| format!("5Kkey{i}")).collect();
        let cluster = Cluster::with_nodes(config, nodes);
        (Fixture::with_cluster(cluster, keys), recorders)
    }

    fn commands(recorder: &Recorder) -> Vec<String> {
        recorder
            .requests()
            .into_iter()
            .map(|Request { method, params, .. }| {
                let mut line = method;
                for param in params {
                    line.push(' ');
                    match param {
                        Value::String(param) => line.push_str(&param),
                        param => line.push_str(&param.to_string()),
                    }
                }
                line
            })
            .collect()
    }

    #[test_case("simple-transfer", Scenario::SimpleTransfer; "simple transfer")]
    #[test_case("uia-create", Scenario::UiaCreate; "uia create")]
    #[test_case("uia-market", Scenario::UiaMarket; "uia market")]
    fn test_parse_scenario(name: &str, expected: Scenario) {
        assert_eq!(name.parse::<Scenario>().unwrap(), expected);
        assert_eq!(expected.to_string(), name);
    }

    #[test]
    fn test_parse_unknown_scenario() {
        assert!(matches!(
            "uia-default".parse::<Scenario>(),
            Err(Error::UnknownScenario(name)) if name == "uia-default"
        ));
    }

    #[test]
    fn test_assert_equal() {
        assert!(assert_equal(&json!([1]), &json!([1])).is_ok());
        match assert_equal(&json!([1]), &json!([2])) {
            Err(Error::Assertion { expected, actual }) => {
                assert_eq!(expected, json!([2]));
                assert_eq!(actual, json!([1]));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_wallets() {
        let (mut fixture, recorders) = fixture(3, 1).await;
        fixture.create_wallets().await.unwrap();

        let timestamp = Config::default().genesis_timestamp;
        assert_eq!(
            commands(&recorders[0]),
            vec![
                format!("debug_start_simulated_time {timestamp}"),
                "debug_advance_time 1 seconds".to_string(),
            ]
        );
        for recorder in &recorders[1..] {
            assert_eq!(
                commands(recorder)[2..],
                [
                    "wallet_create default walletpassword".to_string(),
                    "wallet_unlock 9999999 walletpassword".to_string(),
                ]
            );
        }
    }

    #[tokio::test]
    async fn test_register_delegates() {
        let (mut fixture, recorders) = fixture(1, 2).await;
        fixture.register_delegates().await.unwrap();
        assert_eq!(
            commands(&recorders[0]),
            vec![
                "wallet_create default walletpassword",
                "wallet_unlock 9999999 walletpassword",
                "wallet_import_private_key 5Kkey0 init0 true true",
                "wallet_delegate_set_block_production init0 true",
                "wallet_import_private_key 5Kkey1 init1 true true",
                "wallet_delegate_set_block_production init1 true",
            ]
        );
    }

    #[tokio::test]
    async fn test_register_delegates_missing_key() {
        let (prepared, recorders) = fixture(1, 2).await;
        let mut fixture = Fixture::with_cluster(prepared.cluster, vec!["5Kkey0".to_string()]);
        assert!(matches!(
            fixture.register_delegates().await,
            Err(Error::KeyTool(_))
        ));
        assert_eq!(
            commands(&recorders[0]).last().unwrap(),
            "wallet_delegate_set_block_production init0 true"
        );
    }

    #[tokio::test]
    async fn test_register_delegates_without_nodes() {
        let mut fixture = Fixture::new(Config::default());
        assert!(matches!(
            fixture.register_delegates().await,
            Err(Error::UnknownNode(0))
        ));
    }

    #[tokio::test]
    async fn test_register_delegates_from_backup() {
        let backup = std::env::temp_dir().join(format!("lockstep-wallet-{}.json", std::process::id()));
        std::fs::write(&backup, b"{}").unwrap();
        let (_, recorders) = fixture(1, 2).await;
        let config = Config {
            delegates: 2,
            delegate_backup: Some(backup.clone()),
            ..Config::default()
        };
        let nodes = vec![Node::attach(
            0,
            LOCALHOST,
            recorders[0].port(),
            0,
            config.credentials(),
        )
        .unwrap()];
        let mut fixture = Fixture::with_cluster(Cluster::with_nodes(config, nodes), Vec::new());

        fixture.register_delegates().await.unwrap();
        assert_eq!(
            commands(&recorders[0]),
            vec![format!(
                "wallet_backup_restore {} default walletpassword",
                backup.display()
            )]
        );
        std::fs::remove_file(&backup).ok();
    }

    #[tokio::test]
    async fn test_setup_accounts() {
        let (mut fixture, recorders) = fixture(3, 1).await;
        recorders[1].respond("wallet_account_create", json!("XTSalice"));
        recorders[2].respond("wallet_account_create", json!("XTSbob"));
        recorders[0].respond(
            "blockchain_get_info",
            json!({"short_symbol_asset_reg_fee": 500}),
        );
        fixture.setup_accounts().await.unwrap();

        assert_eq!(
            commands(&recorders[0])[..5],
            [
                "wallet_add_contact_account alice XTSalice".to_string(),
                "wallet_add_contact_account bob XTSbob".to_string(),
                "wallet_account_register alice init0".to_string(),
                "wallet_account_register bob init0".to_string(),
                "blockchain_get_info".to_string(),
            ]
        );
        assert_eq!(
            fixture.blockchain_info()["short_symbol_asset_reg_fee"],
            json!(500)
        );
        assert_eq!(fixture.cluster().next_block(), 2);
    }

    #[tokio::test]
    async fn test_simple_transfer() {
        let (mut fixture, recorders) = fixture(3, 1).await;
        recorders[1].respond(
            "wallet_account_balance",
            json!([["alice", [[0, 10_000_000]]]]),
        );
        Scenario::SimpleTransfer.run(&mut fixture).await.unwrap();
        assert_eq!(
            commands(&recorders[0])[0],
            "wallet_transfer 100 XTS init0 alice hello_world vote_none"
        );
        assert_eq!(commands(&recorders[1]).last().unwrap(), "wallet_account_balance");
    }

    #[tokio::test]
    async fn test_simple_transfer_wrong_balance() {
        let (mut fixture, recorders) = fixture(3, 1).await;
        recorders[1].respond("wallet_account_balance", json!([["alice", [[0, 1]]]]));
        assert!(matches!(
            Scenario::SimpleTransfer.run(&mut fixture).await,
            Err(Error::Assertion { .. })
        ));
    }

    #[tokio::test]
    async fn test_uia_create() {
        let (mut fixture, recorders) = fixture(3, 1).await;
        fixture.blockchain_info = json!({"short_symbol_asset_reg_fee": 500});
        recorders[1].respond("blockchain_get_asset", json!({"id": 7}));
        recorders[1].respond(
            "wallet_account_balance",
            json!([["alice", [[0, 5_000_000 * XTS_PRECISION - 2 * TRANSACTION_FEE - 500]]]]),
        );
        recorders[2].respond(
            "wallet_account_balance",
            json!([["bob", [[7, 1000 * DOGS_PRECISION]]]]),
        );
        Scenario::UiaCreate.run(&mut fixture).await.unwrap();
        assert!(commands(&recorders[1]).contains(
            &"wallet_asset_create DOGS WhoLetTheDogesOut alice some_kind_of_canine_animal {} 10000000 10000"
                .to_string()
        ));
    }

    #[tokio::test]
    async fn test_uia_market_feeds_from_every_delegate() {
        let (mut fixture, recorders) = fixture(3, 3).await;
        recorders[1].respond("blockchain_get_asset", json!({"id": 2}));
        Scenario::UiaMarket.run(&mut fixture).await.unwrap();
        let feeds: Vec<_> = commands(&recorders[0])
            .into_iter()
            .filter(|command| command.starts_with("wallet_publish_price_feed"))
            .collect();
        assert_eq!(
            feeds,
            vec![
                "wallet_publish_price_feed init0 0.02 USD",
                "wallet_publish_price_feed init1 0.02 USD",
                "wallet_publish_price_feed init2 0.02 USD",
            ]
        );
        assert!(commands(&recorders[2])
            .contains(&"wallet_market_submit_bid bob 2000 USD 0.02 XTS".to_string()));
    }
}
