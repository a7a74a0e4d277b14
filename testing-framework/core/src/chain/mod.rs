mod config;
mod genesis;
mod toml_config;
mod types;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use num_bigint::BigUint;

pub use config::{
    COSMOS, ChainConfig, DockerImage, GenesisAmountsHook, GenesisHook, PENUMBRA, POLKADOT,
    PreGenesisHook,
};
pub use genesis::{GenesisError, GenesisKV, apply_genesis_patches, modify_genesis};
pub use toml_config::{TomlConfigError, merge_toml, modify_toml_file};
pub use types::{
    BlockTx, EventAttribute, IbcTimeout, Packet, PacketAcknowledgement, PacketTimeout,
    TransferOptions, Tx, TxEvent,
};

use crate::{
    DynError,
    node::NodeError,
    substrate::{ContainerEngine, EngineError, ExecOutput},
    wallet::{KeyError, Wallet, WalletAmount},
};

/// Shared resources a chain is initialized against.
#[derive(Clone)]
pub struct ChainEnvironment {
    pub test_name: String,
    pub engine: Arc<dyn ContainerEngine>,
    pub network_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("{chain} does not support {operation}")]
    Unsupported {
        chain: String,
        operation: &'static str,
    },
    #[error("{chain}: container engine error: {source}")]
    Engine {
        chain: String,
        #[source]
        source: EngineError,
    },
    #[error("{chain}: node error: {source}")]
    Node {
        chain: String,
        #[source]
        source: NodeError,
    },
    #[error("{chain}: key error: {source}")]
    Key {
        chain: String,
        #[source]
        source: KeyError,
    },
    #[error("{chain}: genesis error: {source}")]
    Genesis {
        chain: String,
        #[source]
        source: DynError,
    },
    #[error("{chain}: config error: {source}")]
    Config {
        chain: String,
        #[source]
        source: TomlConfigError,
    },
    #[error("{chain}: rpc request to {url} failed: {source}")]
    Rpc {
        chain: String,
        url: String,
        #[source]
        source: DynError,
    },
    #[error("{chain}: failed to parse {context}: {message}")]
    Parse {
        chain: String,
        context: String,
        message: String,
    },
    #[error("{chain}: failed to start: {message}")]
    Start { chain: String, message: String },
    #[error("{chain}: not ready after {attempts} attempts: {message}")]
    NotReady {
        chain: String,
        attempts: usize,
        message: String,
    },
    #[error("{chain}: {operation} timed out after {timeout:?}")]
    Timeout {
        chain: String,
        operation: &'static str,
        timeout: Duration,
    },
    #[error("{chain}: key {key} not found")]
    KeyNotFound { chain: String, key: String },
    #[error("{chain}: key {key} already exists")]
    KeyExists { chain: String, key: String },
    #[error("{chain}: not initialized")]
    NotInitialized { chain: String },
    #[error("{chain}: already started")]
    AlreadyStarted { chain: String },
    #[error("{chain}: command {command:?} failed with exit code {exit_code}: {stderr}")]
    Command {
        chain: String,
        command: Vec<String>,
        exit_code: i64,
        stderr: String,
    },
}

impl ChainError {
    #[must_use]
    pub fn unsupported(chain: impl Into<String>, operation: &'static str) -> Self {
        Self::Unsupported {
            chain: chain.into(),
            operation,
        }
    }

    #[must_use]
    pub fn engine(chain: impl Into<String>, source: EngineError) -> Self {
        Self::Engine {
            chain: chain.into(),
            source,
        }
    }

    #[must_use]
    pub fn node(chain: impl Into<String>, source: NodeError) -> Self {
        Self::Node {
            chain: chain.into(),
            source,
        }
    }

    #[must_use]
    pub fn key(chain: impl Into<String>, source: KeyError) -> Self {
        Self::Key {
            chain: chain.into(),
            source,
        }
    }

    #[must_use]
    pub fn parse(
        chain: impl Into<String>,
        context: impl Into<String>,
        message: impl ToString,
    ) -> Self {
        Self::Parse {
            chain: chain.into(),
            context: context.into(),
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn start(chain: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Start {
            chain: chain.into(),
            message: message.into(),
        }
    }

    /// Converts a failed job into a [`ChainError::Command`].
    #[must_use]
    pub fn command(chain: impl Into<String>, command: &[String], output: &ExecOutput) -> Self {
        Self::Command {
            chain: chain.into(),
            command: command.to_vec(),
            exit_code: output.exit_code,
            stderr: output.stderr_string(),
        }
    }

    #[must_use]
    pub const fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }
}

/// A running blockchain under test. Operations a chain family cannot provide
/// return [`ChainError::Unsupported`].
#[async_trait]
pub trait Chain: Send + Sync {
    fn config(&self) -> &ChainConfig;

    fn chain_id(&self) -> &str {
        &self.config().chain_id
    }

    /// Family tag recorded by the block tracker.
    fn chain_type(&self) -> &str {
        &self.config().chain_type
    }

    /// Pulls images and creates node volumes. Starts nothing.
    async fn initialize(&self, env: &ChainEnvironment) -> Result<(), ChainError>;

    /// Builds genesis, starts every node and waits until blocks are produced.
    async fn start(
        &self,
        test_name: &str,
        additional_genesis_wallets: &[WalletAmount],
    ) -> Result<(), ChainError>;

    async fn exec(&self, cmd: &[String], env: &[String]) -> Result<ExecOutput, ChainError>;

    async fn export_state(&self, height: u64) -> Result<String, ChainError>;

    fn rpc_address(&self) -> String;

    fn grpc_address(&self) -> String;

    /// Empty before start.
    fn host_rpc_address(&self) -> String;

    /// Empty before start.
    fn host_grpc_address(&self) -> String;

    fn home_dir(&self) -> String;

    async fn create_key(&self, key_name: &str) -> Result<(), ChainError>;

    async fn recover_key(&self, key_name: &str, mnemonic: &str) -> Result<(), ChainError>;

    async fn get_address(&self, key_name: &str) -> Result<Vec<u8>, ChainError>;

    /// Creates `key_name` on the node, or recovers it from `mnemonic`.
    async fn build_wallet(
        &self,
        key_name: &str,
        mnemonic: Option<&str>,
    ) -> Result<Wallet, ChainError>;

    /// Off-node wallet that always carries its mnemonic.
    async fn build_relayer_wallet(&self, key_name: &str) -> Result<Wallet, ChainError>;

    async fn send_funds(&self, key_name: &str, amount: &WalletAmount) -> Result<(), ChainError>;

    async fn send_ibc_transfer(
        &self,
        channel_id: &str,
        key_name: &str,
        amount: &WalletAmount,
        options: &TransferOptions,
    ) -> Result<Tx, ChainError>;

    async fn height(&self) -> Result<u64, ChainError>;

    async fn get_balance(&self, address: &str, denom: &str) -> Result<BigUint, ChainError>;

    async fn acknowledgements(
        &self,
        height: u64,
    ) -> Result<Vec<PacketAcknowledgement>, ChainError>;

    async fn timeouts(&self, height: u64) -> Result<Vec<PacketTimeout>, ChainError>;

    async fn find_txs(&self, _height: u64) -> Result<Vec<BlockTx>, ChainError> {
        Err(ChainError::unsupported(self.chain_id(), "find_txs"))
    }

    /// Chain id of the provider when this chain is a consumer.
    fn provider(&self) -> Option<String> {
        None
    }

    fn consumers(&self) -> Vec<String> {
        Vec::new()
    }
}
