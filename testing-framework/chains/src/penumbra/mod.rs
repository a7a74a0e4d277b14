//! Penumbra chains: each node is a tendermint container driving a `pd`
//! application over ABCI. User keys live in per-user `pcli` wallets.

mod genesis;
mod node;

use std::{
    collections::BTreeMap,
    sync::{
        Arc, OnceLock,
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
    substrate::{ExecOutput, sanitize_name},
    wallet::{Wallet, WalletAmount, cosmos_wallet},
};
use num_bigint::BigUint;
use sha2::{Digest as _, Sha256};
use tokio::sync::Mutex;
use tracing::info;

use self::genesis::{Allocation, allocations_csv};
pub use self::node::PenumbraNode;
use self::node::Pcli;
use crate::node_home::NodeHome;

const VALIDATOR_KEY: &str = "validator";
const GENESIS_TOKENS: u64 = 1_000_000;
const TESTNET_DIR: &str = "testnet";

pub struct PenumbraChain {
    config: ChainConfig,
    num_validators: usize,
    num_full_nodes: usize,
    env: OnceLock<ChainEnvironment>,
    nodes: OnceLock<Vec<PenumbraNode>>,
    /// One `pcli` wallet volume per user key.
    clients: Mutex<BTreeMap<String, Arc<NodeHome>>>,
    started: AtomicBool,
}

impl PenumbraChain {
    #[must_use]
    pub fn new(config: ChainConfig, num_validators: usize, num_full_nodes: usize) -> Self {
        Self {
            config,
            num_validators,
            num_full_nodes,
            env: OnceLock::new(),
            nodes: OnceLock::new(),
            clients: Mutex::new(BTreeMap::new()),
            started: AtomicBool::new(false),
        }
    }

    fn chain(&self) -> &str {
        &self.config.chain_id
    }

    fn nodes(&self) -> Result<&[PenumbraNode], ChainError> {
        self.nodes
            .get()
            .map(Vec::as_slice)
            .ok_or_else(|| ChainError::NotInitialized {
                chain: self.chain().to_owned(),
            })
    }

    fn first_node(&self) -> Result<&PenumbraNode, ChainError> {
        self.nodes()?.first().ok_or_else(|| ChainError::NotInitialized {
            chain: self.chain().to_owned(),
        })
    }

    fn node_address<F: Fn(&PenumbraNode) -> String>(&self, f: F) -> String {
        self.first_node().map(f).unwrap_or_default()
    }

    fn pd_endpoint(&self) -> Result<String, ChainError> {
        Ok(format!("http://{}", self.first_node()?.grpc_address()))
    }

    async fn client(&self, key_name: &str) -> Result<Arc<NodeHome>, ChainError> {
        self.clients
            .lock()
            .await
            .get(key_name)
            .cloned()
            .ok_or_else(|| ChainError::KeyNotFound {
                chain: self.chain().to_owned(),
                key: key_name.to_owned(),
            })
    }

    /// Creates the wallet volume for `key_name`. Holding the map lock for the
    /// whole creation keeps two callers from racing on one key.
    async fn new_client(&self, key_name: &str) -> Result<Arc<NodeHome>, ChainError> {
        let env = self.env.get().ok_or_else(|| ChainError::NotInitialized {
            chain: self.chain().to_owned(),
        })?;
        let mut clients = self.clients.lock().await;
        if clients.contains_key(key_name) {
            return Err(ChainError::KeyExists {
                chain: self.chain().to_owned(),
                key: key_name.to_owned(),
            });
        }
        let image = self
            .config
            .images
            .get(1)
            .ok_or_else(|| ChainError::start(self.chain(), "missing penumbra image"))?;
        let name = format!(
            "{}-pcli-{}-{}",
            self.chain(),
            sanitize_name(key_name),
            sanitize_name(&env.test_name)
        );
        let home = format!("/var/pcli/{name}");
        let client = Arc::new(NodeHome::create(env, self.chain(), name, home, image).await?);
        clients.insert(key_name.to_owned(), Arc::clone(&client));
        Ok(client)
    }

    async fn prepare_validator(
        &self,
        node: &PenumbraNode,
    ) -> Result<(serde_json::Value, String), ChainError> {
        let pcli = node.pcli();
        pcli.create_key(VALIDATOR_KEY).await?;
        let definition = pcli.validator_definition(node.name()).await?;
        let address = pcli.address(VALIDATOR_KEY).await?;
        Ok((definition, address))
    }

    fn genesis_amount(&self, index: usize) -> BigUint {
        match &self.config.modify_genesis_amounts {
            Some(hook) => hook.call(index).0,
            None => self.config.whole_tokens(GENESIS_TOKENS),
        }
    }

    /// Runs `pd testnet generate` in the first validator's application
    /// volume, leaving per-node configs under `testnet/node{i}`.
    async fn generate_testnet(
        &self,
        first: &PenumbraNode,
        validators: &[serde_json::Value],
        allocations: &[Allocation],
    ) -> Result<(), ChainError> {
        let app = first.app();
        let home = app.home_dir();
        let validators_json = serde_json::to_vec(validators)
            .map_err(|err| ChainError::parse(self.chain(), "validators.json", err))?;
        app.write_file("validators.json", &validators_json).await?;
        app.write_file("allocations.csv", allocations_csv(allocations).as_bytes())
            .await?;

        let cmd = vec![
            "pd".to_owned(),
            "testnet".to_owned(),
            "--testnet-dir".to_owned(),
            format!("{home}/{TESTNET_DIR}"),
            "generate".to_owned(),
            "--preserve-chain-id".to_owned(),
            "--chain-id".to_owned(),
            self.chain().to_owned(),
            "--validators-input-file".to_owned(),
            format!("{home}/validators.json"),
            "--allocations-input-file".to_owned(),
            format!("{home}/allocations.csv"),
        ];
        app.exec(&cmd, Vec::new(), None).await.map(|_| ())
    }
}

#[async_trait]
impl Chain for PenumbraChain {
    fn config(&self) -> &ChainConfig {
        &self.config
    }

    async fn initialize(&self, env: &ChainEnvironment) -> Result<(), ChainError> {
        let chain_id = self.chain();
        try_join_all(self.config.images.iter().map(|image| async move {
            env.engine
                .pull_image(&image.image_ref())
                .await
                .map_err(|err| ChainError::engine(chain_id, err))
        }))
        .await?;

        let nodes = try_join_all(
            (0..self.num_validators)
                .map(|i| (i, true))
                .chain((0..self.num_full_nodes).map(|i| (i, false)))
                .map(|(i, validator)| PenumbraNode::create(env, &self.config, i, validator)),
        )
        .await?;
        self.nodes
            .set(nodes)
            .map_err(|_| ChainError::start(chain_id, "chain was already initialized"))?;
        let _ = self.env.set(env.clone());
        info!(chain = %chain_id, validators = self.num_validators, "initialized penumbra chain");
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
        let validators: Vec<&PenumbraNode> = nodes.iter().filter(|n| n.is_validator()).collect();
        let Some(first) = validators.first().copied() else {
            return Err(ChainError::start(self.chain(), "at least one validator is required"));
        };
        info!(chain = %self.chain(), test = test_name, "generating penumbra testnet");

        let prepared =
            try_join_all(validators.iter().map(|node| self.prepare_validator(node))).await?;
        let mut definitions = Vec::with_capacity(prepared.len());
        let mut allocations =
            Vec::with_capacity(prepared.len() + additional_genesis_wallets.len());
        for (index, (definition, address)) in prepared.into_iter().enumerate() {
            definitions.push(definition);
            allocations.push(Allocation {
                amount: self.genesis_amount(index),
                denom: self.config.denom.clone(),
                address,
            });
        }
        allocations.extend(additional_genesis_wallets.iter().map(|wallet| Allocation {
            amount: wallet.amount.clone(),
            denom: wallet.denom.clone(),
            address: wallet.address.clone(),
        }));

        if let Some(hook) = &self.config.pre_genesis {
            hook.call(&self.config).map_err(|source| ChainError::Genesis {
                chain: self.chain().to_owned(),
                source,
            })?;
        }
        self.generate_testnet(first, &definitions, &allocations)
            .await?;

        try_join_all(nodes.iter().map(PenumbraNode::init_tendermint)).await?;

        let mut genesis = first
            .app()
            .read_file(&format!("{TESTNET_DIR}/node0/tendermint/config/genesis.json"))
            .await?;
        if let Some(hook) = &self.config.modify_genesis {
            genesis = hook
                .call(&self.config, genesis)
                .map_err(|source| ChainError::Genesis {
                    chain: self.chain().to_owned(),
                    source,
                })?;
        }

        // Validators take the consensus and node keys pd generated for them.
        for (index, validator) in validators.iter().enumerate() {
            for file in ["priv_validator_key.json", "node_key.json"] {
                let content = first
                    .app()
                    .read_file(&format!("{TESTNET_DIR}/node{index}/tendermint/config/{file}"))
                    .await?;
                validator
                    .write_tendermint_file(&format!("config/{file}"), &content)
                    .await?;
            }
        }
        try_join_all(
            nodes
                .iter()
                .map(|node| node.write_tendermint_file("config/genesis.json", &genesis)),
        )
        .await?;
        info!(
            chain = %self.chain(),
            genesis_sha256 = %hex::encode(Sha256::digest(&genesis)),
            "genesis written to all nodes"
        );

        try_join_all(nodes.iter().map(PenumbraNode::create_containers)).await?;
        let ids = try_join_all(nodes.iter().map(PenumbraNode::node_id)).await?;
        let peers: Vec<String> = nodes
            .iter()
            .zip(&ids)
            .map(|(node, id)| node.peer_address(id))
            .collect();
        try_join_all(nodes.iter().zip(&peers).map(|(node, own)| {
            let list = peers
                .iter()
                .filter(|peer| *peer != own)
                .cloned()
                .collect::<Vec<_>>()
                .join(",");
            async move { node.set_peers(&list).await }
        }))
        .await?;

        try_join_all(nodes.iter().map(PenumbraNode::start)).await?;
        try_join_all(nodes.iter().map(PenumbraNode::wait_until_ready)).await?;
        first.wait_for_blocks(2).await?;
        info!(chain = %self.chain(), "penumbra chain started");
        Ok(())
    }

    async fn exec(&self, cmd: &[String], env: &[String]) -> Result<ExecOutput, ChainError> {
        self.first_node()?.exec(cmd, env).await
    }

    async fn export_state(&self, _height: u64) -> Result<String, ChainError> {
        Err(ChainError::unsupported(self.chain(), "export_state"))
    }

    fn rpc_address(&self) -> String {
        self.node_address(PenumbraNode::rpc_address)
    }

    fn grpc_address(&self) -> String {
        self.node_address(PenumbraNode::grpc_address)
    }

    fn host_rpc_address(&self) -> String {
        self.node_address(PenumbraNode::host_rpc_address)
    }

    fn host_grpc_address(&self) -> String {
        self.node_address(PenumbraNode::host_grpc_address)
    }

    fn home_dir(&self) -> String {
        self.node_address(PenumbraNode::home_dir)
    }

    async fn create_key(&self, key_name: &str) -> Result<(), ChainError> {
        let client = self.new_client(key_name).await?;
        Pcli::new(&client, self.pd_endpoint()?)
            .create_key(key_name)
            .await
    }

    async fn recover_key(&self, key_name: &str, mnemonic: &str) -> Result<(), ChainError> {
        let client = self.new_client(key_name).await?;
        Pcli::new(&client, self.pd_endpoint()?)
            .recover_key(key_name, mnemonic)
            .await
    }

    /// The address text as bytes; penumbra addresses have no bech32 payload
    /// the harness decodes.
    async fn get_address(&self, key_name: &str) -> Result<Vec<u8>, ChainError> {
        let client = self.client(key_name).await?;
        Pcli::new(&client, self.pd_endpoint()?)
            .address(key_name)
            .await
            .map(String::into_bytes)
    }

    async fn build_wallet(
        &self,
        key_name: &str,
        mnemonic: Option<&str>,
    ) -> Result<Wallet, ChainError> {
        let mnemonic = mnemonic.filter(|m| !m.trim().is_empty());
        match mnemonic {
            Some(mnemonic) => self.recover_key(key_name, mnemonic).await?,
            None => self.create_key(key_name).await?,
        }
        let address = String::from_utf8_lossy(&self.get_address(key_name).await?).into_owned();
        Ok(Wallet::new(
            key_name.to_owned(),
            address.clone(),
            address.into_bytes(),
            mnemonic.map(str::to_owned),
            self.config.clone(),
        ))
    }

    async fn build_relayer_wallet(&self, key_name: &str) -> Result<Wallet, ChainError> {
        cosmos_wallet(key_name, None, &self.config)
            .map_err(|err| ChainError::key(self.chain(), err))
    }

    async fn send_funds(&self, key_name: &str, amount: &WalletAmount) -> Result<(), ChainError> {
        let client = self.client(key_name).await?;
        Pcli::new(&client, self.pd_endpoint()?)
            .send(&amount.amount, &amount.denom, &amount.address)
            .await?;
        self.first_node()?.wait_for_blocks(2).await
    }

    async fn send_ibc_transfer(
        &self,
        _channel_id: &str,
        _key_name: &str,
        _amount: &WalletAmount,
        _options: &TransferOptions,
    ) -> Result<Tx, ChainError> {
        Err(ChainError::unsupported(self.chain(), "send_ibc_transfer"))
    }

    async fn height(&self) -> Result<u64, ChainError> {
        self.first_node()?.height().await
    }

    /// Balances are only visible to the wallet that owns `address`.
    async fn get_balance(&self, address: &str, denom: &str) -> Result<BigUint, ChainError> {
        let endpoint = self.pd_endpoint()?;
        let clients: Vec<(String, Arc<NodeHome>)> = self
            .clients
            .lock()
            .await
            .iter()
            .map(|(key, home)| (key.clone(), Arc::clone(home)))
            .collect();
        for (key, home) in clients {
            let pcli = Pcli::new(&home, endpoint.clone());
            if pcli.address(&key).await? == address {
                return pcli.balance(denom).await;
            }
        }
        Err(ChainError::KeyNotFound {
            chain: self.chain().to_owned(),
            key: address.to_owned(),
        })
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
