//! Cosmos-SDK chains: every node is a `<bin> start` container over a volume
//! prepared by one-shot CLI jobs.

mod node;
mod tx;

use std::{
    collections::BTreeMap,
    sync::{
        OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use futures::future::try_join_all;
use interchaintest_core::{
    chain::{
        BlockTx, Chain, ChainConfig, ChainEnvironment, ChainError, PacketAcknowledgement,
        PacketTimeout, TransferOptions, Tx,
    },
    substrate::ExecOutput,
    wallet::{Wallet, WalletAmount, cosmos_wallet},
};
use num_bigint::BigUint;
use sha2::{Digest as _, Sha256};
use tracing::{debug, info};

pub use self::node::ChainNode;
use self::tx::{SEND_PACKET, packet_from_event};

const VALIDATOR_KEY: &str = "validator";
const GENESIS_TOKENS: u64 = 10_000_000;
const SELF_DELEGATION_TOKENS: u64 = 5_000_000;
const GENESIS_FILE: &str = "config/genesis.json";

struct Nodes {
    validators: Vec<ChainNode>,
    full_nodes: Vec<ChainNode>,
}

impl Nodes {
    fn all(&self) -> impl Iterator<Item = &ChainNode> {
        self.validators.iter().chain(&self.full_nodes)
    }
}

pub struct CosmosChain {
    config: ChainConfig,
    num_validators: usize,
    num_full_nodes: usize,
    provider: Option<String>,
    consumers: Vec<String>,
    nodes: OnceLock<Nodes>,
    started: AtomicBool,
}

impl CosmosChain {
    #[must_use]
    pub fn new(config: ChainConfig, num_validators: usize, num_full_nodes: usize) -> Self {
        Self {
            config,
            num_validators,
            num_full_nodes,
            provider: None,
            consumers: Vec::new(),
            nodes: OnceLock::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Marks this chain as an interchain-security consumer of `chain_id`.
    #[must_use]
    pub fn with_provider(mut self, chain_id: impl Into<String>) -> Self {
        self.provider = Some(chain_id.into());
        self
    }

    #[must_use]
    pub fn with_consumers<I, S>(mut self, chain_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.consumers = chain_ids.into_iter().map(Into::into).collect();
        self
    }

    fn nodes(&self) -> Result<&Nodes, ChainError> {
        self.nodes.get().ok_or_else(|| ChainError::NotInitialized {
            chain: self.config.chain_id.clone(),
        })
    }

    /// The node queries and transactions go through.
    pub fn query_node(&self) -> Result<&ChainNode, ChainError> {
        let nodes = self.nodes()?;
        nodes
            .validators
            .first()
            .or_else(|| nodes.full_nodes.first())
            .ok_or_else(|| ChainError::NotInitialized {
                chain: self.config.chain_id.clone(),
            })
    }

    pub fn validators(&self) -> Result<&[ChainNode], ChainError> {
        Ok(&self.nodes()?.validators)
    }

    pub fn full_nodes(&self) -> Result<&[ChainNode], ChainError> {
        Ok(&self.nodes()?.full_nodes)
    }

    fn node_address<F: Fn(&ChainNode) -> String>(&self, f: F) -> String {
        self.query_node().map(f).unwrap_or_default()
    }

    fn genesis_amounts(&self, index: usize) -> (BigUint, BigUint) {
        match &self.config.modify_genesis_amounts {
            Some(hook) => hook.call(index),
            None => (
                self.config.whole_tokens(GENESIS_TOKENS),
                self.config.whole_tokens(SELF_DELEGATION_TOKENS),
            ),
        }
    }

    async fn prepare_validator(&self, index: usize, node: &ChainNode) -> Result<(), ChainError> {
        node.init_home().await?;
        node.set_test_config().await?;
        if self.config.skip_gen_tx {
            return Ok(());
        }
        node.create_key(VALIDATOR_KEY).await?;
        let address = node.key_bech32(VALIDATOR_KEY).await?;
        let (genesis_amount, self_delegation) = self.genesis_amounts(index);
        node.add_genesis_account(&address, &[(genesis_amount, self.config.denom.as_str())])
            .await?;
        node.gentx(VALIDATOR_KEY, &self_delegation).await?;
        debug!(node = node.name(), %address, "validator gentx created");
        Ok(())
    }

    async fn prepare_full_node(node: &ChainNode) -> Result<(), ChainError> {
        node.init_home().await?;
        node.set_test_config().await
    }

    /// Moves every other validator's account and gentx into the first
    /// validator's home, then collects them.
    async fn gather_gentxs(
        &self,
        first: &ChainNode,
        others: &[ChainNode],
        additional_genesis_wallets: &[WalletAmount],
    ) -> Result<(), ChainError> {
        if !self.config.skip_gen_tx {
            for (offset, validator) in others.iter().enumerate() {
                let address = validator.key_bech32(VALIDATOR_KEY).await?;
                let (genesis_amount, _) = self.genesis_amounts(offset + 1);
                first
                    .add_genesis_account(&address, &[(genesis_amount, self.config.denom.as_str())])
                    .await?;

                let gentx = format!("config/gentx/gentx-{}.json", validator.node_id().await?);
                let content = validator.read_file(&gentx).await?;
                first.write_file(&gentx, &content).await?;
            }
        }

        for wallet in additional_genesis_wallets {
            first
                .add_genesis_account(
                    &wallet.address,
                    &[(wallet.amount.clone(), wallet.denom.as_str())],
                )
                .await?;
        }

        if self.config.skip_gen_tx {
            return Ok(());
        }
        first.collect_gentxs().await
    }

    fn finalize_genesis(&self, genesis: &[u8]) -> Result<Vec<u8>, ChainError> {
        let text = String::from_utf8_lossy(genesis);
        let genesis = text
            .replace("\"stake\"", &format!("\"{}\"", self.config.denom))
            .into_bytes();
        match &self.config.modify_genesis {
            Some(hook) => hook
                .call(&self.config, genesis)
                .map_err(|source| ChainError::Genesis {
                    chain: self.config.chain_id.clone(),
                    source,
                }),
            None => Ok(genesis),
        }
    }

    async fn peer_string(nodes: &Nodes) -> Result<Vec<(String, String)>, ChainError> {
        let ids = try_join_all(nodes.all().map(ChainNode::node_id)).await?;
        Ok(nodes
            .all()
            .zip(ids)
            .map(|(node, id)| (node.name().to_owned(), format!("{id}@{}:26656", node.hostname())))
            .collect())
    }
}

#[async_trait]
impl Chain for CosmosChain {
    fn config(&self) -> &ChainConfig {
        &self.config
    }

    async fn initialize(&self, env: &ChainEnvironment) -> Result<(), ChainError> {
        let chain_id = &self.config.chain_id;
        try_join_all(self.config.images.iter().map(|image| async move {
            env.engine
                .pull_image(&image.image_ref())
                .await
                .map_err(|err| ChainError::engine(chain_id, err))
        }))
        .await?;

        let validators = try_join_all(
            (0..self.num_validators).map(|i| ChainNode::create(env, &self.config, i, true)),
        );
        let full_nodes = try_join_all(
            (0..self.num_full_nodes).map(|i| ChainNode::create(env, &self.config, i, false)),
        );
        let (validators, full_nodes) = futures::try_join!(validators, full_nodes)?;

        self.nodes
            .set(Nodes {
                validators,
                full_nodes,
            })
            .map_err(|_| ChainError::start(chain_id, "chain was already initialized"))?;
        info!(
            chain = %chain_id,
            validators = self.num_validators,
            full_nodes = self.num_full_nodes,
            "initialized cosmos chain"
        );
        Ok(())
    }

    async fn start(
        &self,
        test_name: &str,
        additional_genesis_wallets: &[WalletAmount],
    ) -> Result<(), ChainError> {
        let chain_id = &self.config.chain_id;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ChainError::AlreadyStarted {
                chain: chain_id.clone(),
            });
        }
        let nodes = self.nodes()?;
        let Some((first, others)) = nodes.validators.split_first() else {
            return Err(ChainError::start(chain_id, "at least one validator is required"));
        };
        info!(chain = %chain_id, test = test_name, "building genesis");

        try_join_all(
            nodes
                .validators
                .iter()
                .enumerate()
                .map(|(i, node)| self.prepare_validator(i, node)),
        )
        .await?;
        try_join_all(nodes.full_nodes.iter().map(Self::prepare_full_node)).await?;

        if let Some(hook) = &self.config.pre_genesis {
            hook.call(&self.config)
                .map_err(|source| ChainError::Genesis {
                    chain: chain_id.clone(),
                    source,
                })?;
        }

        self.gather_gentxs(first, others, additional_genesis_wallets)
            .await?;

        let genesis = self.finalize_genesis(&first.read_file(GENESIS_FILE).await?)?;
        try_join_all(nodes.all().map(|node| node.write_file(GENESIS_FILE, &genesis))).await?;
        info!(
            chain = %chain_id,
            genesis_sha256 = %hex::encode(Sha256::digest(&genesis)),
            "genesis written to all nodes"
        );

        let no_overrides = BTreeMap::new();
        try_join_all(nodes.all().map(|node| {
            let overrides = if node.is_validator() && node.index() == 0 {
                &self.config.host_port_override
            } else {
                &no_overrides
            };
            node.create_node_container(overrides)
        }))
        .await?;

        let peers = Self::peer_string(nodes).await?;
        try_join_all(nodes.all().map(|node| {
            let list = peers
                .iter()
                .filter(|(name, _)| name != node.name())
                .map(|(_, peer)| peer.as_str())
                .collect::<Vec<_>>()
                .join(",");
            async move { node.set_peers(&list).await }
        }))
        .await?;

        try_join_all(nodes.all().map(ChainNode::start_container)).await?;
        try_join_all(nodes.all().map(ChainNode::wait_until_synced)).await?;
        first.wait_for_blocks(2).await?;
        let height = first.height().await?;
        info!(chain = %chain_id, height, "cosmos chain started");
        Ok(())
    }

    async fn exec(&self, cmd: &[String], env: &[String]) -> Result<ExecOutput, ChainError> {
        self.query_node()?.exec(cmd, env).await
    }

    async fn export_state(&self, height: u64) -> Result<String, ChainError> {
        self.query_node()?.export_state(height).await
    }

    fn rpc_address(&self) -> String {
        self.node_address(ChainNode::rpc_address)
    }

    fn grpc_address(&self) -> String {
        self.node_address(ChainNode::grpc_address)
    }

    fn host_rpc_address(&self) -> String {
        self.node_address(ChainNode::host_rpc_address)
    }

    fn host_grpc_address(&self) -> String {
        self.node_address(ChainNode::host_grpc_address)
    }

    fn home_dir(&self) -> String {
        self.node_address(ChainNode::home_dir)
    }

    async fn create_key(&self, key_name: &str) -> Result<(), ChainError> {
        self.query_node()?.create_key(key_name).await
    }

    async fn recover_key(&self, key_name: &str, mnemonic: &str) -> Result<(), ChainError> {
        self.query_node()?.recover_key(key_name, mnemonic).await
    }

    async fn get_address(&self, key_name: &str) -> Result<Vec<u8>, ChainError> {
        self.query_node()?.account_key_bytes(key_name).await
    }

    async fn build_wallet(
        &self,
        key_name: &str,
        mnemonic: Option<&str>,
    ) -> Result<Wallet, ChainError> {
        let node = self.query_node()?;
        let mnemonic = mnemonic.filter(|m| !m.trim().is_empty());
        match mnemonic {
            Some(mnemonic) => node.recover_key(key_name, mnemonic).await?,
            None => node.create_key(key_name).await?,
        }
        let address = node.key_bech32(key_name).await?;
        let address_bytes = node.account_key_bytes(key_name).await?;
        Ok(Wallet::new(
            key_name.to_owned(),
            address,
            address_bytes,
            mnemonic.map(str::to_owned),
            self.config.clone(),
        ))
    }

    async fn build_relayer_wallet(&self, key_name: &str) -> Result<Wallet, ChainError> {
        cosmos_wallet(key_name, None, &self.config)
            .map_err(|err| ChainError::key(&self.config.chain_id, err))
    }

    async fn send_funds(&self, key_name: &str, amount: &WalletAmount) -> Result<(), ChainError> {
        self.query_node()?.bank_send(key_name, amount).await
    }

    async fn send_ibc_transfer(
        &self,
        channel_id: &str,
        key_name: &str,
        amount: &WalletAmount,
        options: &TransferOptions,
    ) -> Result<Tx, ChainError> {
        let node = self.query_node()?;
        let args = transfer_args(channel_id, amount, options);
        let response = node.broadcast_tx(key_name, &args).await?;

        let events = response.events();
        let packet = events
            .iter()
            .find(|event| event.kind == SEND_PACKET)
            .ok_or_else(|| {
                ChainError::parse(
                    &self.config.chain_id,
                    "ibc transfer",
                    format!("tx {} has no send_packet event", response.txhash),
                )
            })
            .and_then(|event| {
                packet_from_event(event)
                    .map_err(|err| ChainError::parse(&self.config.chain_id, "send_packet", err))
            })?;
        Ok(Tx {
            height: response.height,
            tx_hash: response.txhash,
            gas_spent: response.gas_used,
            packet,
        })
    }

    async fn height(&self) -> Result<u64, ChainError> {
        self.query_node()?.height().await
    }

    async fn get_balance(&self, address: &str, denom: &str) -> Result<BigUint, ChainError> {
        self.query_node()?.get_balance(address, denom).await
    }

    async fn acknowledgements(
        &self,
        height: u64,
    ) -> Result<Vec<PacketAcknowledgement>, ChainError> {
        let events = self.query_node()?.block_events(height).await?;
        tx::acknowledgements(&events)
            .map_err(|err| ChainError::parse(&self.config.chain_id, "acknowledge_packet", err))
    }

    async fn timeouts(&self, height: u64) -> Result<Vec<PacketTimeout>, ChainError> {
        let events = self.query_node()?.block_events(height).await?;
        tx::timeouts(&events)
            .map_err(|err| ChainError::parse(&self.config.chain_id, "timeout_packet", err))
    }

    async fn find_txs(&self, height: u64) -> Result<Vec<BlockTx>, ChainError> {
        self.query_node()?.find_txs(height).await
    }

    fn provider(&self) -> Option<String> {
        self.provider.clone()
    }

    fn consumers(&self) -> Vec<String> {
        self.consumers.clone()
    }
}

fn transfer_args(
    channel_id: &str,
    amount: &WalletAmount,
    options: &TransferOptions,
) -> Vec<String> {
    let mut args = vec![
        "ibc-transfer".to_owned(),
        "transfer".to_owned(),
        "transfer".to_owned(),
        channel_id.to_owned(),
        amount.address.clone(),
        format!("{}{}", amount.amount, amount.denom),
        "--gas".to_owned(),
        "auto".to_owned(),
    ];
    if let Some(timeout) = &options.timeout {
        if timeout.nanoseconds > 0 {
            args.push("--packet-timeout-timestamp".to_owned());
            args.push(timeout.nanoseconds.to_string());
        } else if timeout.height > 0 {
            args.push("--packet-timeout-height".to_owned());
            args.push(format!("0-{}", timeout.height));
        }
    }
    if !options.memo.is_empty() {
        args.push("--memo".to_owned());
        args.push(options.memo.clone());
    }
    args
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use interchaintest_core::{
        chain::{
            Chain as _, ChainConfig, ChainEnvironment, DockerImage, IbcTimeout, TransferOptions,
        },
        testing::FakeEngine,
        wallet::WalletAmount,
    };

    use super::{ChainNode, CosmosChain, transfer_args};

    fn config() -> ChainConfig {
        ChainConfig {
            chain_type: "cosmos".to_owned(),
            name: "gaia".to_owned(),
            chain_id: "gaia-1".to_owned(),
            images: vec![DockerImage::new(
                "ghcr.io/strangelove-ventures/heighliner/gaia",
                "v7.0.1",
                "1025:1025",
            )],
            bin: "gaiad".to_owned(),
            bech32_prefix: "cosmos".to_owned(),
            denom: "uatom".to_owned(),
            coin_type: "118".to_owned(),
            gas_prices: "0.01uatom".to_owned(),
            gas_adjustment: 1.3,
            trusting_period: "504h".to_owned(),
            ..ChainConfig::default()
        }
    }

    fn environment(engine: &Arc<FakeEngine>) -> ChainEnvironment {
        ChainEnvironment {
            test_name: "TestCosmos".to_owned(),
            engine: Arc::clone(engine) as _,
            network_id: "net-1".to_owned(),
        }
    }

    #[tokio::test]
    async fn initialize_pulls_images_and_creates_node_volumes() {
        let engine = Arc::new(FakeEngine::new());
        let chain = CosmosChain::new(config(), 2, 1);
        assert!(chain.query_node().is_err());
        assert!(chain.rpc_address().is_empty());

        chain.initialize(&environment(&engine)).await.expect("initialize");

        assert_eq!(
            engine.pulled_images(),
            ["ghcr.io/strangelove-ventures/heighliner/gaia:v7.0.1"]
        );
        assert_eq!(engine.volume_count(), 3);
        assert_eq!(chain.validators().expect("validators").len(), 2);
        assert_eq!(chain.full_nodes().expect("full nodes").len(), 1);

        let node = chain.query_node().expect("query node");
        assert_eq!(node.name(), "gaia-1-val-0-TestCosmos");
        assert_eq!(chain.rpc_address(), "http://gaia-1-val-0-TestCosmos:26657");
        assert_eq!(chain.grpc_address(), "gaia-1-val-0-TestCosmos:9090");
        assert_eq!(chain.home_dir(), "/var/cosmos-chain/gaia");
        assert!(chain.host_rpc_address().is_empty());

        assert!(chain.initialize(&environment(&engine)).await.is_err());
    }

    #[tokio::test]
    async fn tx_command_respects_caller_fee_flags() {
        let engine = Arc::new(FakeEngine::new());
        let node = ChainNode::create(&environment(&engine), &config(), 0, true)
            .await
            .expect("node");

        let cmd = node.tx_command("alice", &["bank", "send", "alice", "cosmos1xyz", "5uatom"]);
        let line = cmd.join(" ");
        assert!(line.starts_with("gaiad tx bank send alice cosmos1xyz 5uatom"));
        assert!(line.contains("--gas-prices 0.01uatom"));
        assert!(line.contains("--gas-adjustment 1.3"));
        assert!(line.contains("--from alice --keyring-backend test --output json -y"));
        assert!(line.contains("--chain-id gaia-1"));
        assert!(line.contains("--home /var/cosmos-chain/gaia"));
        assert!(line.ends_with("--node tcp://gaia-1-val-0-TestCosmos:26657"));

        let cmd = node.tx_command("alice", &["bank", "send", "--fees", "10uatom"]);
        assert!(!cmd.iter().any(|arg| arg == "--gas-prices"));
    }

    #[tokio::test]
    async fn test_config_patches_node_toml_files() {
        let engine = Arc::new(FakeEngine::new());
        let mut config = config();
        config.config_file_overrides.insert(
            "config/config.toml".to_owned(),
            toml::from_str("[consensus]\ntimeout_commit = \"1s\"").expect("override"),
        );
        let node = ChainNode::create(&environment(&engine), &config, 0, true)
            .await
            .expect("node");
        engine.put_volume_file(node.volume(), "config/config.toml", b"moniker = \"val\"\n");
        engine.put_volume_file(node.volume(), "config/app.toml", b"[api]\nenable = false\n");

        node.set_test_config().await.expect("config");

        let config_toml: toml::Table = toml::from_str(&String::from_utf8_lossy(
            &engine.volume_file(node.volume(), "config/config.toml").expect("config.toml"),
        ))
        .expect("parse");
        assert_eq!(config_toml["moniker"].as_str(), Some("val"));
        assert_eq!(config_toml["consensus"]["timeout_commit"].as_str(), Some("1s"));
        assert_eq!(config_toml["consensus"]["timeout_propose"].as_str(), Some("2s"));
        assert_eq!(config_toml["rpc"]["laddr"].as_str(), Some("tcp://0.0.0.0:26657"));

        let app_toml: toml::Table = toml::from_str(&String::from_utf8_lossy(
            &engine.volume_file(node.volume(), "config/app.toml").expect("app.toml"),
        ))
        .expect("parse");
        assert_eq!(app_toml["api"]["enable"].as_bool(), Some(true));
        assert_eq!(app_toml["minimum-gas-prices"].as_str(), Some("0.01uatom"));
        assert_eq!(app_toml["grpc"]["address"].as_str(), Some("0.0.0.0:9090"));
    }

    #[tokio::test]
    async fn failed_jobs_surface_as_command_errors() {
        let engine = Arc::new(FakeEngine::new());
        engine.script_job("keys add", 1, b"", b"key already exists");
        let chain = CosmosChain::new(config(), 1, 0);
        chain.initialize(&environment(&engine)).await.expect("initialize");

        let err = chain.create_key("faucet").await.expect_err("scripted failure");
        assert!(err.to_string().contains("key already exists"), "{err}");
    }

    #[test]
    fn transfer_timeouts_prefer_timestamps() {
        let amount = WalletAmount::new("osmo1dest", "uatom", 1_000u32);
        let with = |timeout| TransferOptions {
            timeout,
            memo: String::new(),
        };

        let args = transfer_args("channel-0", &amount, &with(None));
        assert_eq!(
            args.join(" "),
            "ibc-transfer transfer transfer channel-0 osmo1dest 1000uatom --gas auto"
        );

        let args = transfer_args(
            "channel-0",
            &amount,
            &with(Some(IbcTimeout {
                nanoseconds: 10,
                height: 5,
            })),
        );
        assert!(args.join(" ").ends_with("--packet-timeout-timestamp 10"));

        let args = transfer_args(
            "channel-0",
            &amount,
            &TransferOptions {
                timeout: Some(IbcTimeout {
                    nanoseconds: 0,
                    height: 5,
                }),
                memo: "hello".to_owned(),
            },
        );
        assert!(args.join(" ").ends_with("--packet-timeout-height 0-5 --memo hello"));
    }
}
