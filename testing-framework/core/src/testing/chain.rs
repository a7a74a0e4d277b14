use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use num_bigint::BigUint;

use crate::{
    chain::{
        BlockTx, Chain, ChainConfig, ChainEnvironment, ChainError, DockerImage, Packet,
        PacketAcknowledgement, PacketTimeout, TransferOptions, Tx,
    },
    substrate::{ExecOutput, cleanup_labels},
    wallet::{Wallet, WalletAmount, cosmos_wallet},
};

/// Ordered record of calls shared between fakes, e.g. `start gaia-1`.
pub type Journal = Arc<Mutex<Vec<String>>>;

pub(super) fn note(journal: &Journal, entry: String) {
    journal
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(entry);
}

#[derive(Default)]
struct State {
    initialized: bool,
    started: bool,
    height: u64,
    volume: Option<String>,
    genesis: Vec<WalletAmount>,
    balances: BTreeMap<(String, String), BigUint>,
    keys: BTreeMap<String, Wallet>,
    txs: BTreeMap<u64, Vec<BlockTx>>,
    fail_start: Option<String>,
}

/// In-memory [`Chain`]. Initialize creates one labelled volume on the engine
/// so teardown can be observed; everything else is bookkeeping.
pub struct FakeChain {
    config: ChainConfig,
    provider: Option<String>,
    consumers: Vec<String>,
    journal: Journal,
    state: Mutex<State>,
}

impl FakeChain {
    #[must_use]
    pub fn new(chain_id: &str) -> Self {
        Self {
            config: ChainConfig {
                chain_type: "cosmos".to_owned(),
                name: chain_id.to_owned(),
                chain_id: chain_id.to_owned(),
                images: vec![DockerImage::new("fake/chain", "v1", "1025:1025")],
                bin: "faked".to_owned(),
                bech32_prefix: "cosmos".to_owned(),
                denom: "ufake".to_owned(),
                gas_prices: "0ufake".to_owned(),
                trusting_period: "1h".to_owned(),
                ..ChainConfig::default()
            },
            provider: None,
            consumers: Vec::new(),
            journal: Journal::default(),
            state: Mutex::new(State::default()),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: &str) -> Self {
        name.clone_into(&mut self.config.name);
        self
    }

    #[must_use]
    pub fn with_provider(mut self, provider_chain_id: &str) -> Self {
        self.provider = Some(provider_chain_id.to_owned());
        self
    }

    #[must_use]
    pub fn with_consumers(mut self, consumers: &[&str]) -> Self {
        self.consumers = consumers.iter().map(|c| (*c).to_owned()).collect();
        self
    }

    #[must_use]
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    /// Makes `start` fail with `message`.
    #[must_use]
    pub fn failing_start(self, message: &str) -> Self {
        self.lock().fail_start = Some(message.to_owned());
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_height(&self, height: u64) {
        self.lock().height = height;
    }

    pub fn push_tx(&self, height: u64, data: &[u8]) {
        self.lock().txs.entry(height).or_default().push(BlockTx {
            data: data.to_vec(),
            events: Vec::new(),
        });
    }

    #[must_use]
    pub fn genesis_wallets(&self) -> Vec<WalletAmount> {
        self.lock().genesis.clone()
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.lock().started
    }

    fn record(&self, entry: String) {
        note(&self.journal, entry);
    }

    fn wallet(&self, key_name: &str, mnemonic: Option<&str>) -> Result<Wallet, ChainError> {
        cosmos_wallet(key_name, mnemonic, &self.config)
            .map_err(|err| ChainError::key(&self.config.chain_id, err))
    }
}

#[async_trait]
impl Chain for FakeChain {
    fn config(&self) -> &ChainConfig {
        &self.config
    }

    async fn initialize(&self, env: &ChainEnvironment) -> Result<(), ChainError> {
        let chain_id = &self.config.chain_id;
        for image in &self.config.images {
            env.engine
                .pull_image(&image.image_ref())
                .await
                .map_err(|err| ChainError::engine(chain_id, err))?;
        }
        let volume = env
            .engine
            .create_volume(&cleanup_labels(&env.test_name))
            .await
            .map_err(|err| ChainError::engine(chain_id, err))?;

        let mut state = self.lock();
        state.initialized = true;
        state.volume = Some(volume);
        drop(state);
        self.record(format!("initialize {chain_id}"));
        Ok(())
    }

    async fn start(
        &self,
        _test_name: &str,
        additional_genesis_wallets: &[WalletAmount],
    ) -> Result<(), ChainError> {
        let chain_id = self.config.chain_id.clone();
        let mut state = self.lock();
        if !state.initialized {
            return Err(ChainError::NotInitialized { chain: chain_id });
        }
        if state.started {
            return Err(ChainError::AlreadyStarted { chain: chain_id });
        }
        if let Some(message) = state.fail_start.clone() {
            return Err(ChainError::start(chain_id, message));
        }
        for wallet in additional_genesis_wallets {
            *state
                .balances
                .entry((wallet.address.clone(), wallet.denom.clone()))
                .or_default() += &wallet.amount;
        }
        state.genesis = additional_genesis_wallets.to_vec();
        state.started = true;
        state.height = state.height.max(1);
        drop(state);
        self.record(format!("start {chain_id}"));
        Ok(())
    }

    async fn exec(&self, cmd: &[String], _env: &[String]) -> Result<ExecOutput, ChainError> {
        self.record(format!("exec {} {}", self.config.chain_id, cmd.join(" ")));
        Ok(ExecOutput::default())
    }

    async fn export_state(&self, height: u64) -> Result<String, ChainError> {
        Ok(format!(r#"{{"chain_id":"{}","height":"{height}"}}"#, self.config.chain_id))
    }

    fn rpc_address(&self) -> String {
        format!("http://{}:26657", self.config.chain_id)
    }

    fn grpc_address(&self) -> String {
        format!("{}:9090", self.config.chain_id)
    }

    fn host_rpc_address(&self) -> String {
        if self.is_started() {
            "http://127.0.0.1:26657".to_owned()
        } else {
            String::new()
        }
    }

    fn host_grpc_address(&self) -> String {
        if self.is_started() {
            "127.0.0.1:9090".to_owned()
        } else {
            String::new()
        }
    }

    fn home_dir(&self) -> String {
        format!("/var/fake/{}", self.config.name)
    }

    async fn create_key(&self, key_name: &str) -> Result<(), ChainError> {
        if self.lock().keys.contains_key(key_name) {
            return Err(ChainError::KeyExists {
                chain: self.config.chain_id.clone(),
                key: key_name.to_owned(),
            });
        }
        let wallet = self.wallet(key_name, None)?;
        self.lock().keys.insert(key_name.to_owned(), wallet);
        Ok(())
    }

    async fn recover_key(&self, key_name: &str, mnemonic: &str) -> Result<(), ChainError> {
        let wallet = self.wallet(key_name, Some(mnemonic))?;
        self.lock().keys.insert(key_name.to_owned(), wallet);
        Ok(())
    }

    async fn get_address(&self, key_name: &str) -> Result<Vec<u8>, ChainError> {
        self.lock()
            .keys
            .get(key_name)
            .map(|w| w.address_bytes().to_vec())
            .ok_or_else(|| ChainError::KeyNotFound {
                chain: self.config.chain_id.clone(),
                key: key_name.to_owned(),
            })
    }

    async fn build_wallet(
        &self,
        key_name: &str,
        mnemonic: Option<&str>,
    ) -> Result<Wallet, ChainError> {
        match mnemonic {
            Some(mnemonic) if !mnemonic.is_empty() => self.recover_key(key_name, mnemonic).await?,
            _ => self.create_key(key_name).await?,
        }
        self.lock()
            .keys
            .get(key_name)
            .cloned()
            .ok_or_else(|| ChainError::KeyNotFound {
                chain: self.config.chain_id.clone(),
                key: key_name.to_owned(),
            })
    }

    async fn build_relayer_wallet(&self, key_name: &str) -> Result<Wallet, ChainError> {
        self.wallet(key_name, None)
    }

    async fn send_funds(&self, key_name: &str, amount: &WalletAmount) -> Result<(), ChainError> {
        let mut state = self.lock();
        *state
            .balances
            .entry((amount.address.clone(), amount.denom.clone()))
            .or_default() += &amount.amount;
        state.height += 1;
        drop(state);
        self.record(format!(
            "send_funds {} {key_name} {}",
            self.config.chain_id, amount.address
        ));
        Ok(())
    }

    async fn send_ibc_transfer(
        &self,
        channel_id: &str,
        _key_name: &str,
        amount: &WalletAmount,
        options: &TransferOptions,
    ) -> Result<Tx, ChainError> {
        let height = self.lock().height;
        let timeout = options.timeout.unwrap_or_default();
        Ok(Tx {
            height,
            tx_hash: format!("{:064X}", height),
            gas_spent: 0,
            packet: Packet {
                sequence: 1,
                source_port: "transfer".to_owned(),
                source_channel: channel_id.to_owned(),
                dest_port: "transfer".to_owned(),
                dest_channel: channel_id.to_owned(),
                data: serde_json::to_vec(amount).unwrap_or_default(),
                timeout_height: if timeout.height > 0 {
                    format!("0-{}", timeout.height)
                } else {
                    String::new()
                },
                timeout_timestamp: timeout.nanoseconds,
            },
        })
    }

    async fn height(&self) -> Result<u64, ChainError> {
        Ok(self.lock().height)
    }

    async fn get_balance(&self, address: &str, denom: &str) -> Result<BigUint, ChainError> {
        Ok(self
            .lock()
            .balances
            .get(&(address.to_owned(), denom.to_owned()))
            .cloned()
            .unwrap_or_default())
    }

    async fn acknowledgements(
        &self,
        _height: u64,
    ) -> Result<Vec<PacketAcknowledgement>, ChainError> {
        Ok(Vec::new())
    }

    async fn timeouts(&self, _height: u64) -> Result<Vec<PacketTimeout>, ChainError> {
        Ok(Vec::new())
    }

    async fn find_txs(&self, height: u64) -> Result<Vec<BlockTx>, ChainError> {
        Ok(self.lock().txs.get(&height).cloned().unwrap_or_default())
    }

    fn provider(&self) -> Option<String> {
        self.provider.clone()
    }

    fn consumers(&self) -> Vec<String> {
        self.consumers.clone()
    }
}
