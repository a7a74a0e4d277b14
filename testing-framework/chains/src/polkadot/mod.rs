//! Polkadot relay chains with optional parachains. Validators are the
//! Substrate dev accounts and user keys are sr25519 keypairs held by the
//! harness.

mod chain_spec;
mod extrinsic;
#[cfg(test)]
mod fake_rpc;
mod node;
mod parachain;
mod tx;

use std::{
    collections::BTreeMap,
    sync::{
        OnceLock, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use futures::future::try_join_all;
use interchaintest_core::{
    chain::{
        Chain, ChainConfig, ChainEnvironment, ChainError, PacketAcknowledgement, PacketTimeout,
        TransferOptions, Tx,
    },
    interchain::FAUCET_KEY,
    substrate::ExecOutput,
    wallet::{
        Wallet, WalletAmount,
        cosmos::generate_mnemonic,
        substrate::{
            DEFAULT_SS58_FORMAT, name_case, sr25519_from_suri, ss58_decode, ss58_encode,
        },
    },
};
use num_bigint::BigUint;
use schnorrkel::Keypair;
use sha2::{Digest as _, Sha256};
use tracing::info;

use self::{
    chain_spec::{Authority, ParachainRegistration, RelayGenesis, patch_chain_spec},
    extrinsic::{IbcTransfer, RELAY_BALANCES_TRANSFER, balances_transfer, ibc_transfer},
    tx::Included,
};
pub use self::{
    extrinsic::CallIndex,
    node::RelayChainNode,
    parachain::{ParachainConfig, ParachainNode},
};
use crate::node_rpc::NodeRpc;

/// Balance of every validator account and stash.
const VALIDATOR_BALANCE: u64 = 1_100_000_000_000_000_000;
/// Relay chain balances carry three more decimals than the amounts tests ask for.
const GENESIS_SCALING: u64 = 1_000;
/// Timeout height of ICS-20 transfers sent without an explicit timeout.
const DEFAULT_TIMEOUT_HEIGHT: u64 = 3_000;

/// An sr25519 key known to the harness.
#[derive(Clone)]
struct SubstrateKey {
    secret: String,
    public: [u8; 32],
}

pub struct PolkadotChain {
    config: ChainConfig,
    num_nodes: usize,
    parachains: Vec<ParachainConfig>,
    nodes: OnceLock<Vec<RelayChainNode>>,
    parachain_nodes: OnceLock<Vec<Vec<ParachainNode>>>,
    keys: RwLock<BTreeMap<String, SubstrateKey>>,
    started: AtomicBool,
}

impl PolkadotChain {
    #[must_use]
    pub fn new(config: ChainConfig, num_nodes: usize) -> Self {
        Self {
            config,
            num_nodes,
            parachains: Vec::new(),
            nodes: OnceLock::new(),
            parachain_nodes: OnceLock::new(),
            keys: RwLock::new(BTreeMap::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Parachains registered at relay genesis and collated once the relay
    /// chain produces blocks.
    #[must_use]
    pub fn with_parachains(mut self, parachains: Vec<ParachainConfig>) -> Self {
        self.parachains = parachains;
        self
    }

    fn chain(&self) -> &str {
        &self.config.chain_id
    }

    fn ss58_format(&self) -> u16 {
        self.config.ss58_format.unwrap_or(DEFAULT_SS58_FORMAT)
    }

    pub fn nodes(&self) -> Result<&[RelayChainNode], ChainError> {
        self.nodes
            .get()
            .map(Vec::as_slice)
            .ok_or_else(|| ChainError::NotInitialized {
                chain: self.chain().to_owned(),
            })
    }

    /// Collators grouped by parachain, in configuration order. Empty until
    /// initialized.
    #[must_use]
    pub fn parachain_nodes(&self) -> &[Vec<ParachainNode>] {
        self.parachain_nodes.get().map_or(&[], Vec::as_slice)
    }

    fn first_node(&self) -> Result<&RelayChainNode, ChainError> {
        self.nodes()?.first().ok_or_else(|| ChainError::NotInitialized {
            chain: self.chain().to_owned(),
        })
    }

    /// The collator user traffic goes through, when there is a parachain.
    fn first_collator(&self) -> Option<&ParachainNode> {
        self.parachain_nodes().first().and_then(|nodes| nodes.first())
    }

    fn node_address<F: Fn(&RelayChainNode) -> String>(&self, f: F) -> String {
        self.first_node().map(f).unwrap_or_default()
    }

    /// Prefers the first collator over the first relay chain node.
    fn user_address<P, R>(&self, para: P, relay: R) -> String
    where
        P: Fn(&ParachainNode) -> String,
        R: Fn(&RelayChainNode) -> String,
    {
        self.first_collator()
            .map_or_else(|| self.node_address(relay), para)
    }

    /// Stores the keypair of `secret` under `key_name`.
    fn insert_key(&self, key_name: &str, secret: &str) -> Result<(), ChainError> {
        let keypair =
            sr25519_from_suri(secret).map_err(|err| ChainError::key(self.chain(), err))?;
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        if keys.contains_key(key_name) {
            return Err(ChainError::KeyExists {
                chain: self.chain().to_owned(),
                key: key_name.to_owned(),
            });
        }
        keys.insert(
            key_name.to_owned(),
            SubstrateKey {
                secret: secret.to_owned(),
                public: keypair.public.to_bytes(),
            },
        );
        Ok(())
    }

    fn key(&self, key_name: &str) -> Result<SubstrateKey, ChainError> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key_name)
            .cloned()
            .ok_or_else(|| ChainError::KeyNotFound {
                chain: self.chain().to_owned(),
                key: key_name.to_owned(),
            })
    }

    fn keypair(&self, key_name: &str) -> Result<Keypair, ChainError> {
        sr25519_from_suri(&self.key(key_name)?.secret)
            .map_err(|err| ChainError::key(self.chain(), err))
    }

    fn address(&self, key_name: &str) -> Result<String, ChainError> {
        Ok(ss58_encode(&self.key(key_name)?.public, self.ss58_format()))
    }

    /// The 32 byte account behind an SS58 address of any network format.
    fn account_id(&self, address: &str) -> Result<[u8; 32], ChainError> {
        let (_, key) = ss58_decode(address).map_err(|err| ChainError::key(self.chain(), err))?;
        key.try_into().map_err(|_| {
            ChainError::parse(self.chain(), "address", format!("{address} is not an account id"))
        })
    }

    fn amount(&self, amount: &WalletAmount) -> Result<u128, ChainError> {
        u128::try_from(&amount.amount).map_err(|_| {
            ChainError::parse(self.chain(), "amount", format!("{} exceeds u128", amount.amount))
        })
    }

    /// Registers the account and stash keys of a validator and returns its
    /// session keys.
    fn validator_authority(&self, node: &RelayChainNode) -> Result<Authority, ChainError> {
        let account = node.dev_account();
        let uri = format!("//{}", name_case(account));
        let stash = format!("{account}stash");
        self.insert_key(account, &uri)?;
        self.insert_key(&stash, &format!("{uri}//stash"))?;
        Ok(Authority {
            stash: self.address(&stash)?,
            account: self.address(account)?,
            grandpa: node.grandpa_address(self.ss58_format()),
            beefy: node.beefy_address(self.ss58_format())?,
        })
    }

    /// Genesis balances of the additional wallets, in chain units.
    fn scaled_balances(
        &self,
        wallets: &[WalletAmount],
    ) -> Result<Vec<(String, u64)>, ChainError> {
        wallets
            .iter()
            .map(|wallet| {
                u64::try_from(&(&wallet.amount * GENESIS_SCALING))
                    .map(|amount| (wallet.address.clone(), amount))
                    .map_err(|_| {
                        ChainError::start(
                            self.chain(),
                            format!("genesis amount for {} exceeds u64", wallet.address),
                        )
                    })
            })
            .collect()
    }

    fn relay_genesis(
        &self,
        nodes: &[RelayChainNode],
        balances: &[(String, u64)],
        parachains: Vec<ParachainRegistration>,
    ) -> Result<RelayGenesis, ChainError> {
        let mut genesis = RelayGenesis {
            parachains,
            ..RelayGenesis::default()
        };
        for node in nodes {
            let authority = self.validator_authority(node)?;
            genesis.boot_nodes.push(node.multi_address());
            genesis.balances.push((authority.stash.clone(), VALIDATOR_BALANCE));
            genesis.balances.push((authority.account.clone(), VALIDATOR_BALANCE));
            if genesis.sudo.is_empty() {
                genesis.sudo.clone_from(&authority.account);
            }
            genesis.authorities.push(authority);
        }
        genesis.balances.extend_from_slice(balances);
        Ok(genesis)
    }

    /// Generates every parachain's spec on its first collator, copies the
    /// raw form to the other collators and returns the registrations the
    /// relay genesis needs.
    async fn prepare_parachains(
        &self,
        balances: &[(String, u64)],
    ) -> Result<Vec<ParachainRegistration>, ChainError> {
        let mut registrations = Vec::new();
        for collators in self.parachain_nodes() {
            let Some(first) = collators.first() else {
                continue;
            };
            let raw = first.generate_chain_spec(balances).await?;
            try_join_all(
                collators
                    .iter()
                    .skip(1)
                    .map(|node| node.install_chain_spec(&raw)),
            )
            .await?;
            let registration = first.registration().await?;
            info!(
                chain = %self.chain(),
                parachain = %first.config().chain_id,
                para_id = registration.id,
                "parachain spec generated"
            );
            registrations.push(registration);
        }
        Ok(registrations)
    }

    /// Builds the chain spec on the first node, patches it and returns the
    /// raw form every node boots from.
    async fn raw_chain_spec(
        &self,
        first: &RelayChainNode,
        genesis: &RelayGenesis,
    ) -> Result<Vec<u8>, ChainError> {
        let spec_file = format!("{}.json", self.chain());
        let spec = first
            .build_spec(&[
                format!("--chain={}", self.chain()),
                "--disable-default-bootnode".to_owned(),
            ])
            .await?;
        let mut spec = patch_chain_spec(&spec, genesis).map_err(|err| ChainError::Genesis {
            chain: self.chain().to_owned(),
            source: Box::new(err),
        })?;
        if let Some(hook) = &self.config.modify_genesis {
            spec = hook
                .call(&self.config, spec)
                .map_err(|source| ChainError::Genesis {
                    chain: self.chain().to_owned(),
                    source,
                })?;
        }
        first.write_file(&spec_file, &spec).await?;
        first
            .build_spec(&[
                format!("--chain={}/{spec_file}", first.home_dir()),
                "--raw".to_owned(),
            ])
            .await
    }

    /// Starts every collator against the relay chain's raw spec.
    async fn start_parachains(&self, relay_raw: &[u8]) -> Result<(), ChainError> {
        let collators: Vec<&ParachainNode> = self.parachain_nodes().iter().flatten().collect();
        if collators.is_empty() {
            return Ok(());
        }
        try_join_all(collators.iter().map(|node| async move {
            node.write_file(node.relay_raw_spec_file(), relay_raw).await?;
            node.create_container(&self.config.env).await?;
            node.start().await
        }))
        .await?;
        try_join_all(collators.iter().map(|node| node.wait_until_ready())).await?;
        info!(
            chain = %self.chain(),
            parachains = self.parachains.len(),
            collators = collators.len(),
            "parachains started"
        );
        Ok(())
    }

    async fn transfer(
        &self,
        rpc: &NodeRpc<'_>,
        index: CallIndex,
        key_name: &str,
        amount: &WalletAmount,
    ) -> Result<Included, ChainError> {
        let call = balances_transfer(
            index,
            &self.account_id(&amount.address)?,
            self.amount(amount)?,
        );
        tx::submit(rpc, self.chain(), &self.keypair(key_name)?, &call).await
    }
}

#[async_trait]
impl Chain for PolkadotChain {
    fn config(&self) -> &ChainConfig {
        &self.config
    }

    async fn initialize(&self, env: &ChainEnvironment) -> Result<(), ChainError> {
        let chain_id = self.chain();
        let images = self
            .config
            .images
            .iter()
            .chain(self.parachains.iter().map(|parachain| &parachain.image));
        try_join_all(images.map(|image| async move {
            env.engine
                .pull_image(&image.image_ref())
                .await
                .map_err(|err| ChainError::engine(chain_id, err))
        }))
        .await?;

        let nodes = try_join_all(
            (0..self.num_nodes).map(|index| RelayChainNode::create(env, &self.config, index)),
        )
        .await?;
        let parachain_nodes = try_join_all(self.parachains.iter().map(|parachain| {
            try_join_all(
                (0..parachain.num_nodes)
                    .map(|index| ParachainNode::create(env, &self.config, parachain, index)),
            )
        }))
        .await?;
        self.nodes
            .set(nodes)
            .map_err(|_| ChainError::start(chain_id, "chain was already initialized"))?;
        self.parachain_nodes
            .set(parachain_nodes)
            .map_err(|_| ChainError::start(chain_id, "chain was already initialized"))?;
        info!(
            chain = %chain_id,
            nodes = self.num_nodes,
            parachains = self.parachains.len(),
            "initialized relay chain"
        );
        Ok(())
    }

    async fn start(
        &self,
        test_name: &str,
        additional_genesis_wallets: &[WalletAmount],
    ) -> Result<(), ChainError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ChainError::AlreadyStarted {
                chain: self.chain().to_owned(),
            });
        }
        let nodes = self.nodes()?;
        let first = self.first_node()?;
        info!(chain = %self.chain(), test = test_name, "building relay chain spec");

        if let Some(hook) = &self.config.pre_genesis {
            hook.call(&self.config).map_err(|source| ChainError::Genesis {
                chain: self.chain().to_owned(),
                source,
            })?;
        }
        let balances = self.scaled_balances(additional_genesis_wallets)?;
        let parachains = self.prepare_parachains(&balances).await?;
        let genesis = self.relay_genesis(nodes, &balances, parachains)?;
        let raw = self.raw_chain_spec(first, &genesis).await?;
        info!(
            chain = %self.chain(),
            spec_sha256 = %hex::encode(Sha256::digest(&raw)),
            "raw chain spec generated"
        );

        let raw_file = format!("{}-raw.json", self.chain());
        try_join_all(nodes.iter().map(|node| {
            let (raw, raw_file) = (&raw, &raw_file);
            async move {
                node.write_file(raw_file, raw).await?;
                node.create_container(&self.config).await?;
                node.start().await
            }
        }))
        .await?;
        try_join_all(nodes.iter().map(RelayChainNode::wait_until_ready)).await?;
        first.wait_for_blocks(2).await?;
        info!(chain = %self.chain(), "relay chain started");
        self.start_parachains(&raw).await
    }

    async fn exec(&self, cmd: &[String], env: &[String]) -> Result<ExecOutput, ChainError> {
        self.first_node()?.exec(cmd, env).await
    }

    async fn export_state(&self, _height: u64) -> Result<String, ChainError> {
        Err(ChainError::unsupported(self.chain(), "export_state"))
    }

    /// `parachain,relay` when a parachain runs, which is the form the
    /// hyperspace relayer expects.
    fn rpc_address(&self) -> String {
        let relay = self.node_address(RelayChainNode::rpc_address);
        match self.first_collator() {
            Some(collator) => format!("{},{relay}", collator.rpc_address()),
            None => relay,
        }
    }

    fn grpc_address(&self) -> String {
        self.user_address(ParachainNode::ws_address, RelayChainNode::ws_address)
    }

    fn host_rpc_address(&self) -> String {
        self.user_address(ParachainNode::host_rpc_address, RelayChainNode::host_rpc_address)
    }

    fn host_grpc_address(&self) -> String {
        self.user_address(ParachainNode::host_ws_address, RelayChainNode::host_ws_address)
    }

    fn home_dir(&self) -> String {
        self.node_address(|node| node.home_dir().to_owned())
    }

    async fn create_key(&self, key_name: &str) -> Result<(), ChainError> {
        self.insert_key(key_name, &generate_mnemonic())
    }

    async fn recover_key(&self, key_name: &str, mnemonic: &str) -> Result<(), ChainError> {
        self.insert_key(key_name, mnemonic.trim())
    }

    /// The SS58 address text.
    async fn get_address(&self, key_name: &str) -> Result<Vec<u8>, ChainError> {
        self.address(key_name).map(String::into_bytes)
    }

    async fn build_wallet(
        &self,
        key_name: &str,
        mnemonic: Option<&str>,
    ) -> Result<Wallet, ChainError> {
        match mnemonic.filter(|m| !m.trim().is_empty()) {
            Some(mnemonic) => self.recover_key(key_name, mnemonic).await?,
            None => self.create_key(key_name).await?,
        }
        let key = self.key(key_name)?;
        Ok(Wallet::new(
            key_name.to_owned(),
            self.address(key_name)?,
            key.public.to_vec(),
            Some(key.secret),
            self.config.clone(),
        ))
    }

    async fn build_relayer_wallet(&self, key_name: &str) -> Result<Wallet, ChainError> {
        self.build_wallet(key_name, Some(&generate_mnemonic())).await
    }

    /// The relay denom moves on the relay chain, every other denom on the
    /// parachain. The faucet funds the receiver on both when a parachain
    /// runs.
    async fn send_funds(&self, key_name: &str, amount: &WalletAmount) -> Result<(), ChainError> {
        let collator = self.first_collator();
        let included = if amount.denom == self.config.denom {
            if let (Some(collator), FAUCET_KEY) = (collator, key_name) {
                let index = collator.config().balances_transfer;
                self.transfer(&collator.rpc()?, index, key_name, amount)
                    .await?;
            }
            let relay = self.first_node()?.rpc()?;
            self.transfer(&relay, RELAY_BALANCES_TRANSFER, key_name, amount)
                .await?
        } else {
            let collator = collator.ok_or_else(|| {
                ChainError::unsupported(self.chain(), "send_funds on a parachain")
            })?;
            let index = collator.config().balances_transfer;
            self.transfer(&collator.rpc()?, index, key_name, amount)
                .await?
        };
        info!(
            chain = %self.chain(),
            from = key_name,
            to = %amount.address,
            amount = %amount.amount,
            denom = %amount.denom,
            tx = %included.hash,
            "sent funds"
        );
        Ok(())
    }

    /// Sends through the parachain's IBC pallet. The denom is the numeric
    /// asset id and `channel_id` must be `channel-N`.
    async fn send_ibc_transfer(
        &self,
        channel_id: &str,
        key_name: &str,
        amount: &WalletAmount,
        options: &TransferOptions,
    ) -> Result<Tx, ChainError> {
        let collator = self
            .first_collator()
            .ok_or_else(|| ChainError::unsupported(self.chain(), "send_ibc_transfer"))?;
        let channel = channel_id
            .strip_prefix("channel-")
            .and_then(|number| number.parse::<u64>().ok())
            .ok_or_else(|| ChainError::parse(self.chain(), "channel id", channel_id))?;
        let asset_id = amount.denom.parse::<u128>().map_err(|err| {
            ChainError::parse(self.chain(), "asset id", format!("{}: {err}", amount.denom))
        })?;
        let (timeout_timestamp, timeout_height) = match options.timeout {
            Some(timeout) if timeout.nanoseconds > 0 || timeout.height > 0 => {
                (timeout.nanoseconds, timeout.height)
            }
            _ => (0, DEFAULT_TIMEOUT_HEIGHT),
        };
        let call = ibc_transfer(
            collator.config().ibc_transfer,
            &IbcTransfer {
                to: &amount.address,
                channel,
                timeout_timestamp,
                timeout_height,
                asset_id,
                amount: self.amount(amount)?,
                memo: Some(options.memo.as_str()).filter(|memo| !memo.is_empty()),
            },
        );
        let included = tx::submit(
            &collator.rpc()?,
            self.chain(),
            &self.keypair(key_name)?,
            &call,
        )
        .await?;
        info!(
            chain = %self.chain(),
            channel = channel_id,
            tx = %included.hash,
            height = included.height,
            "sent ibc transfer"
        );
        Ok(Tx {
            height: included.height,
            tx_hash: included.hash,
            ..Tx::default()
        })
    }

    async fn height(&self) -> Result<u64, ChainError> {
        match self.first_collator() {
            Some(collator) => collator.height().await,
            None => self.first_node()?.height().await,
        }
    }

    /// Free balance from `System.Account`. On a parachain a numeric denom is
    /// an asset id read from `Assets.Account`.
    async fn get_balance(&self, address: &str, denom: &str) -> Result<BigUint, ChainError> {
        let account = self.account_id(address)?;
        let chain = self.chain();
        let balance = match self.first_collator() {
            Some(collator) if denom != self.config.denom => {
                let rpc = collator.rpc()?;
                match denom.parse::<u128>() {
                    Ok(asset_id) => tx::asset_balance(&rpc, chain, asset_id, &account).await?,
                    Err(_) => tx::account_info(&rpc, chain, &account).await?.free,
                }
            }
            // A relay chain alone holds nothing but its own denom.
            None if denom != self.config.denom => 0,
            _ => {
                let rpc = self.first_node()?.rpc()?;
                tx::account_info(&rpc, chain, &account).await?.free
            }
        };
        Ok(BigUint::from(balance))
    }

    async fn acknowledgements(
        &self,
        _height: u64,
    ) -> Result<Vec<PacketAcknowledgement>, ChainError> {
        Err(ChainError::unsupported(self.chain(), "acknowledgements"))
    }

    async fn timeouts(&self, _height: u64) -> Result<Vec<PacketTimeout>, ChainError> {
        Err(ChainError::unsupported(self.chain(), "timeouts"))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use interchaintest_core::{
        ChainError,
        chain::{
            Chain as _, ChainConfig, ChainEnvironment, DockerImage, IbcTimeout, TransferOptions,
        },
        testing::FakeEngine,
        wallet::WalletAmount,
    };
    use num_bigint::BigUint;

    use super::{
        ParachainConfig, PolkadotChain,
        extrinsic::{IbcTransfer, RELAY_BALANCES_TRANSFER, ibc_transfer},
        fake_rpc::FakeSubstrate,
    };

    fn config() -> ChainConfig {
        ChainConfig {
            chain_type: "polkadot".to_owned(),
            name: "polkadot".to_owned(),
            chain_id: "rococo-local".to_owned(),
            images: vec![DockerImage::new("parity/polkadot", "v0.9.36", "1025:1025")],
            bin: "polkadot".to_owned(),
            denom: "DOT".to_owned(),
            ss58_format: Some(42),
            ..ChainConfig::default()
        }
    }

    fn parachain() -> ParachainConfig {
        ParachainConfig::new(
            "dali-dev",
            "parachain-node",
            DockerImage::new("composablefi/parachain-node", "v2.1.9", "1025:1025"),
        )
        .with_flags(
            vec!["--execution=native".to_owned()],
            vec!["--execution=wasm".to_owned()],
        )
    }

    fn environment(engine: &Arc<FakeEngine>) -> ChainEnvironment {
        ChainEnvironment {
            test_name: "TestPolkadot".to_owned(),
            engine: Arc::clone(engine) as _,
            network_id: "net-1".to_owned(),
        }
    }

    async fn initialized(chain: PolkadotChain) -> (Arc<FakeEngine>, PolkadotChain) {
        let engine = Arc::new(FakeEngine::new());
        chain.initialize(&environment(&engine)).await.expect("initialize");
        (engine, chain)
    }

    /// Builds a wallet from a dev URI and returns its address and account.
    async fn account(chain: &PolkadotChain, key_name: &str, suri: &str) -> (String, [u8; 32]) {
        let wallet = chain.build_wallet(key_name, Some(suri)).await.expect("wallet");
        let public = wallet.address_bytes().try_into().expect("32 byte account");
        (wallet.formatted_address().to_owned(), public)
    }

    async fn relay_rpc(chain: &PolkadotChain) -> FakeSubstrate {
        let relay =
            FakeSubstrate::start(RELAY_BALANCES_TRANSFER, ParachainConfig::DEFAULT_IBC_TRANSFER)
                .await;
        chain.nodes().expect("nodes")[0].set_host(relay.address());
        relay
    }

    async fn parachain_rpc(chain: &PolkadotChain) -> FakeSubstrate {
        let para = FakeSubstrate::start(
            ParachainConfig::DEFAULT_BALANCES_TRANSFER,
            ParachainConfig::DEFAULT_IBC_TRANSFER,
        )
        .await;
        chain.parachain_nodes()[0][0].set_host(para.address());
        para
    }

    #[tokio::test]
    async fn initialize_creates_one_volume_per_validator() {
        let (engine, chain) = initialized(PolkadotChain::new(config(), 2)).await;

        assert_eq!(engine.volume_count(), 2);
        let nodes = chain.nodes().expect("nodes");
        assert_eq!(nodes[0].name(), "relaychain-0-rococo-local-TestPolkadot");
        assert_eq!(nodes[1].dev_account(), "bob");
        assert_eq!(chain.home_dir(), "/home/.polkadot");
        assert!(nodes[0]
            .multi_address()
            .starts_with("/dns4/relaychain-0-rococo-local-TestPolkadot/tcp/27452/p2p/12D3KooW"));
        assert_ne!(nodes[0].peer_id(), nodes[1].peer_id());
        assert!(chain.parachain_nodes().is_empty());
    }

    #[tokio::test]
    async fn more_validators_than_dev_accounts_is_an_error() {
        let engine = Arc::new(FakeEngine::new());
        let chain = PolkadotChain::new(config(), 6);
        assert!(chain.initialize(&environment(&engine)).await.is_err());
    }

    #[tokio::test]
    async fn dev_uris_recover_well_known_accounts() {
        let chain = PolkadotChain::new(config(), 1);
        let wallet = chain.build_wallet("alice", Some("//Alice")).await.expect("wallet");
        assert_eq!(
            wallet.formatted_address(),
            "5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY"
        );
        assert_eq!(wallet.address_bytes().len(), 32);

        let err = chain.create_key("alice").await.expect_err("duplicate");
        assert!(matches!(err, ChainError::KeyExists { .. }));
        assert!(matches!(
            chain.get_address("nobody").await.expect_err("missing"),
            ChainError::KeyNotFound { .. }
        ));

        let relayer = chain.build_relayer_wallet("relayer").await.expect("relayer");
        assert_eq!(relayer.mnemonic().map(|m| m.split_whitespace().count()), Some(24));
    }

    #[tokio::test]
    async fn relay_transfers_move_balances_between_accounts() {
        let (_engine, chain) = initialized(PolkadotChain::new(config(), 1)).await;
        let relay = relay_rpc(&chain).await;
        let (alice_address, alice) = account(&chain, "alice", "//Alice").await;
        let (user, user_account) = account(&chain, "user", "//Bob").await;
        relay.fund(alice, 1_000_000);

        chain
            .send_funds("alice", &WalletAmount::new(user.clone(), "DOT", 10_000u32))
            .await
            .expect("send funds");

        assert_eq!(
            chain.get_balance(&user, "DOT").await.expect("balance"),
            BigUint::from(10_000u32)
        );
        assert_eq!(relay.free_balance(user_account), 10_000);
        assert_eq!(relay.free_balance(alice), 990_000);
        assert_eq!(relay.nonce(alice), 1);
        assert_eq!(
            chain.get_balance(&user, "PICA").await.expect("balance"),
            BigUint::default()
        );

        let err = chain
            .send_funds("user", &WalletAmount::new(alice_address, "DOT", 20_000u32))
            .await
            .expect_err("overdraft");
        assert!(matches!(err, ChainError::Rpc { .. }), "{err}");
        assert_eq!(relay.free_balance(user_account), 10_000);
    }

    #[tokio::test]
    async fn relay_chains_alone_keep_the_remaining_operations_unsupported() {
        let (_engine, chain) = initialized(PolkadotChain::new(config(), 1)).await;
        let amount = WalletAmount::new("5Grw", "1", 1u32);
        let err = chain
            .send_ibc_transfer("channel-0", "alice", &amount, &TransferOptions::default())
            .await
            .expect_err("no parachain");
        assert!(err.is_unsupported());
        assert!(chain.export_state(1).await.expect_err("export").is_unsupported());
        assert!(chain.acknowledgements(1).await.expect_err("acks").is_unsupported());
        assert!(chain.find_txs(1).await.expect_err("find_txs").is_unsupported());
    }

    #[tokio::test]
    async fn faucet_funds_both_the_parachain_and_the_relay_chain() {
        let chain = PolkadotChain::new(config(), 1).with_parachains(vec![parachain()]);
        let (engine, chain) = initialized(chain).await;
        assert_eq!(engine.volume_count(), 2);
        assert!(engine
            .pulled_images()
            .contains(&"composablefi/parachain-node:v2.1.9".to_owned()));

        let relay = relay_rpc(&chain).await;
        let para = parachain_rpc(&chain).await;
        let (_, faucet) = account(&chain, "faucet", "//Ferdie").await;
        let (user, user_account) = account(&chain, "user", "//Charlie").await;
        relay.fund(faucet, 1_000_000);
        para.fund(faucet, 1_000_000);

        chain
            .send_funds("faucet", &WalletAmount::new(user.clone(), "DOT", 10_000u32))
            .await
            .expect("native funds");
        assert_eq!(relay.free_balance(user_account), 10_000);
        assert_eq!(para.free_balance(user_account), 10_000);

        chain
            .send_funds("faucet", &WalletAmount::new(user.clone(), "PICA", 5_000u32))
            .await
            .expect("parachain funds");
        assert_eq!(relay.free_balance(user_account), 10_000);
        assert_eq!(para.free_balance(user_account), 15_000);

        para.set_asset_balance(1, user_account, 42);
        for (denom, expected) in [("DOT", 10_000u32), ("PICA", 15_000), ("1", 42), ("2", 0)] {
            let balance = chain.get_balance(&user, denom).await.expect("balance");
            assert_eq!(balance, BigUint::from(expected), "{denom}");
        }

        let rpc = chain.rpc_address();
        assert!(rpc.starts_with("http://parachain-node-0-dali-dev-TestPolkadot:27451,"), "{rpc}");
        assert!(rpc.ends_with(",http://relaychain-0-rococo-local-TestPolkadot:27451"), "{rpc}");
        assert_eq!(chain.host_rpc_address(), format!("http://{}", para.address()));
    }

    #[tokio::test]
    async fn ibc_transfers_go_through_the_parachain_pallet() {
        let chain = PolkadotChain::new(config(), 1).with_parachains(vec![parachain()]);
        let (_engine, chain) = initialized(chain).await;
        let para = parachain_rpc(&chain).await;
        let (_, faucet) = account(&chain, "faucet", "//Ferdie").await;
        para.fund(faucet, 1_000_000);
        let amount = WalletAmount::new("cosmos1receiver", "1", 10_000u32);

        let tx = chain
            .send_ibc_transfer("channel-3", "faucet", &amount, &TransferOptions::default())
            .await
            .expect("transfer");
        assert!(tx.tx_hash.starts_with("0x"));
        assert_eq!(tx.height, 2);

        let options = TransferOptions {
            timeout: Some(IbcTimeout {
                nanoseconds: 0,
                height: 50,
            }),
            memo: "hello".to_owned(),
        };
        chain
            .send_ibc_transfer("channel-3", "faucet", &amount, &options)
            .await
            .expect("transfer with timeout");

        let expected = |timeout_height, memo| {
            ibc_transfer(
                ParachainConfig::DEFAULT_IBC_TRANSFER,
                &IbcTransfer {
                    to: "cosmos1receiver",
                    channel: 3,
                    timeout_timestamp: 0,
                    timeout_height,
                    asset_id: 1,
                    amount: 10_000,
                    memo,
                },
            )
        };
        assert_eq!(
            para.ibc_calls(),
            vec![expected(3_000, None), expected(50, Some("hello"))]
        );

        let err = chain
            .send_ibc_transfer("transfer/3", "faucet", &amount, &options)
            .await
            .expect_err("bad channel");
        assert!(matches!(err, ChainError::Parse { .. }));
        let native = WalletAmount::new("cosmos1receiver", "PICA", 1u32);
        let err = chain
            .send_ibc_transfer("channel-3", "faucet", &native, &options)
            .await
            .expect_err("denom is not an asset id");
        assert!(matches!(err, ChainError::Parse { .. }));
    }

    #[tokio::test]
    async fn parachains_are_registered_from_their_collator_specs() {
        let engine = Arc::new(FakeEngine::new());
        engine.script_job(
            "build-spec --chain=dali-dev",
            0,
            br#"{"para_id": 2087, "genesis": {"runtime": {"balances": {"balances": []}}}}"#,
            b"",
        );
        engine.script_job("dali-dev.json --raw", 0, br#"{"raw": true}"#, b"");
        engine.script_job("export-genesis-state", 0, b"0x00aa\n", b"");
        engine.script_job("export-genesis-wasm", 0, b"0x0061736d\n", b"");
        let chain = PolkadotChain::new(config(), 1)
            .with_parachains(vec![parachain().with_num_nodes(2)]);
        chain.initialize(&environment(&engine)).await.expect("initialize");
        assert_eq!(engine.volume_count(), 3);

        let registrations = chain
            .prepare_parachains(&[("5Grw".to_owned(), 10_000)])
            .await
            .expect("parachain specs");
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].id, 2087);
        assert_eq!(registrations[0].genesis_head, "0x00aa");
        assert_eq!(registrations[0].validation_code, "0x0061736d");

        let collators = &chain.parachain_nodes()[0];
        assert_eq!(collators[1].name(), "parachain-node-1-dali-dev-TestPolkadot");
        assert_eq!(collators[1].dev_account(), "bob");
        collators[1].create_container(&[]).await.expect("container");
        let spec = engine.created_specs().pop().expect("collator container");
        let cmd = spec.cmd;
        let separator = cmd.iter().position(|arg| arg == "--").expect("separator");
        assert!(cmd[..separator].contains(&"--collator".to_owned()));
        assert!(cmd[..separator].contains(&"--bob".to_owned()));
        assert!(cmd[..separator].contains(&"--chain=/home/.polkadot/dali-dev-raw.json".to_owned()));
        assert_eq!(cmd[separator - 1], "--execution=native");
        assert_eq!(
            &cmd[separator + 1..],
            ["--chain=/home/.polkadot/rococo-local-raw.json", "--execution=wasm"]
        );
    }
}
