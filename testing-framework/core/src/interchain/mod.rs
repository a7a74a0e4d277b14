//! Declarative description of an IBC network and the one-shot build that
//! brings it up.
//!
//! Chains, relayers and links are added through a fluent builder that panics
//! on misuse, mirroring how a test author would misconfigure a fixture:
//! adding a chain twice, linking a chain to itself, or referencing a chain or
//! relayer that was never added. [`Interchain::build`] then runs the staged
//! bring-up and [`Interchain::close`] releases what build left running.

mod build;

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::Arc,
};

use tracing::{info, warn};

use crate::{
    blockdb::BlockDbError,
    chain::{Chain, ChainError},
    chain_set::ChainSet,
    fanout::TaskPanicked,
    relayer::{CreateChannelOptions, CreateClientOptions, Relayer, RelayerError},
    reporter::NopRelayerExecReporter,
    substrate::{ContainerEngine, EngineError},
    wallet::{Wallet, WalletAmount},
};

pub use build::{FAUCET_AMOUNT, FAUCET_KEY, RELAYER_WALLET_AMOUNT};

#[derive(Debug, thiserror::Error)]
pub enum InterchainError {
    #[error("invalid interchain: {0}")]
    Validation(String),
    #[error("chain {chain_id}: {stage} failed: {source}")]
    Chain {
        chain_id: String,
        stage: &'static str,
        #[source]
        source: ChainError,
    },
    #[error("relayer {relayer}: {stage} failed: {source}")]
    Relayer {
        relayer: String,
        stage: &'static str,
        #[source]
        source: RelayerError,
    },
    #[error("container engine: {0}")]
    Engine(#[from] EngineError),
    #[error("block database: {0}")]
    BlockDb(#[from] BlockDbError),
    #[error(transparent)]
    Panicked(#[from] TaskPanicked),
}

impl InterchainError {
    #[must_use]
    pub fn chain(chain_id: impl Into<String>, stage: &'static str, source: ChainError) -> Self {
        Self::Chain {
            chain_id: chain_id.into(),
            stage,
            source,
        }
    }

    #[must_use]
    pub fn relayer(relayer: impl Into<String>, stage: &'static str, source: RelayerError) -> Self {
        Self::Relayer {
            relayer: relayer.into(),
            stage,
            source,
        }
    }
}

/// A relayer path between two chains.
#[derive(Clone)]
pub struct InterchainLink {
    pub chain1: Arc<dyn Chain>,
    pub chain2: Arc<dyn Chain>,
    pub relayer: Arc<dyn Relayer>,
    pub path: String,
    /// Empty options mean the relayer defaults.
    pub create_client_opts: CreateClientOptions,
    /// Empty port names and version are replaced with the ICS-20 defaults.
    pub create_channel_opts: CreateChannelOptions,
}

impl InterchainLink {
    #[must_use]
    pub fn new(
        chain1: Arc<dyn Chain>,
        chain2: Arc<dyn Chain>,
        relayer: Arc<dyn Relayer>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            chain1,
            chain2,
            relayer,
            path: path.into(),
            create_client_opts: CreateClientOptions::default(),
            create_channel_opts: CreateChannelOptions::default(),
        }
    }

    #[must_use]
    pub fn with_channel_opts(mut self, opts: CreateChannelOptions) -> Self {
        self.create_channel_opts = opts;
        self
    }

    #[must_use]
    pub fn with_client_opts(mut self, opts: CreateClientOptions) -> Self {
        self.create_client_opts = opts;
        self
    }
}

#[derive(Clone)]
pub struct InterchainBuildOptions {
    pub test_name: String,
    pub engine: Arc<dyn ContainerEngine>,
    pub network_id: String,
    /// Configure relayer keys and chains but create no paths or links.
    pub skip_path_creation: bool,
    pub git_sha: String,
    /// Saves block history to this SQLite file when set.
    pub block_database_file: Option<PathBuf>,
}

impl InterchainBuildOptions {
    #[must_use]
    pub fn new(
        test_name: impl Into<String>,
        engine: Arc<dyn ContainerEngine>,
        network_id: impl Into<String>,
    ) -> Self {
        Self {
            test_name: test_name.into(),
            engine,
            network_id: network_id.into(),
            skip_path_creation: false,
            git_sha: String::new(),
            block_database_file: None,
        }
    }

    #[must_use]
    pub const fn skip_path_creation(mut self, skip: bool) -> Self {
        self.skip_path_creation = skip;
        self
    }

    #[must_use]
    pub fn with_block_database(
        mut self,
        path: impl Into<PathBuf>,
        git_sha: impl Into<String>,
    ) -> Self {
        self.block_database_file = Some(path.into());
        self.git_sha = git_sha.into();
        self
    }
}

struct NamedRelayer {
    relayer: Arc<dyn Relayer>,
    name: String,
}

/// A full IBC network: chains, relayers, links and the extra genesis
/// allocations of each chain.
#[derive(Default)]
pub struct Interchain {
    chains: Vec<Arc<dyn Chain>>,
    relayers: Vec<NamedRelayer>,
    links: Vec<InterchainLink>,
    additional_genesis: BTreeMap<String, Vec<WalletAmount>>,
    relayer_wallets: BTreeMap<(String, String), Wallet>,
    chain_set: Option<Arc<ChainSet>>,
    built: bool,
    closed: bool,
}

impl Interchain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a chain.
    ///
    /// # Panics
    ///
    /// When the chain, its chain id or its name was already added.
    #[must_use]
    pub fn add_chain(self, chain: Arc<dyn Chain>) -> Self {
        self.add_chain_with_allocations(chain, Vec::new())
    }

    /// Adds a chain together with extra genesis allocations for it.
    ///
    /// # Panics
    ///
    /// When the chain, its chain id or its name was already added.
    #[must_use]
    pub fn add_chain_with_allocations(
        mut self,
        chain: Arc<dyn Chain>,
        allocations: Vec<WalletAmount>,
    ) -> Self {
        let id = chain.chain_id().to_owned();
        let name = chain.config().name.clone();
        for existing in &self.chains {
            assert!(
                !same_chain(existing, &chain),
                "chain {id} was already added"
            );
            assert!(
                existing.chain_id() != id,
                "a chain with ID {id} already exists"
            );
            assert!(
                existing.config().name != name,
                "a chain with name {name} already exists"
            );
        }
        if !allocations.is_empty() {
            self.additional_genesis
                .entry(id)
                .or_default()
                .extend(allocations);
        }
        self.chains.push(chain);
        self
    }

    /// Adds a relayer under a unique name.
    ///
    /// # Panics
    ///
    /// When the relayer or the name was already added.
    #[must_use]
    pub fn add_relayer(mut self, relayer: Arc<dyn Relayer>, name: impl Into<String>) -> Self {
        let name = name.into();
        for existing in &self.relayers {
            assert!(
                !same_relayer(&existing.relayer, &relayer),
                "relayer {} was already added",
                existing.name
            );
            assert!(
                existing.name != name,
                "a relayer with name {name} already exists"
            );
        }
        self.relayers.push(NamedRelayer { relayer, name });
        self
    }

    /// Adds a link between two added chains over an added relayer.
    ///
    /// # Panics
    ///
    /// When a chain or the relayer was never added, both ends are the same
    /// chain, or the relayer already has a path with this name.
    #[must_use]
    pub fn add_link(mut self, link: InterchainLink) -> Self {
        if let Err(message) = self.check_link(&link) {
            panic!("{message}");
        }
        self.links.push(link);
        self
    }

    fn check_link(&self, link: &InterchainLink) -> Result<(), String> {
        for chain in [&link.chain1, &link.chain2] {
            if !self.chains.iter().any(|c| same_chain(c, chain)) {
                let config = chain.config();
                return Err(format!(
                    "chain with name={} and id={} was never added to Interchain",
                    config.name, config.chain_id
                ));
            }
        }
        let relayer_name = self
            .relayer_name(&link.relayer)
            .ok_or_else(|| "relayer was never added to Interchain".to_owned())?;
        if same_chain(&link.chain1, &link.chain2) {
            return Err(format!(
                "chains must be different (both were {})",
                link.chain1.chain_id()
            ));
        }
        let duplicate = self
            .links
            .iter()
            .any(|l| same_relayer(&l.relayer, &link.relayer) && l.path == link.path);
        if duplicate {
            return Err(format!(
                "relayer {relayer_name:?} already has a path named {:?}",
                link.path
            ));
        }
        Ok(())
    }

    /// Re-checks the whole description before build. Also rejects consumer
    /// chains whose provider is not part of the interchain.
    fn validate(&self) -> Result<(), InterchainError> {
        let mut ids = BTreeSet::new();
        let mut names = BTreeSet::new();
        for chain in &self.chains {
            if !ids.insert(chain.chain_id()) {
                return Err(InterchainError::Validation(format!(
                    "duplicate chain id {}",
                    chain.chain_id()
                )));
            }
            if !names.insert(chain.config().name.as_str()) {
                return Err(InterchainError::Validation(format!(
                    "duplicate chain name {}",
                    chain.config().name
                )));
            }
        }
        for chain in &self.chains {
            if let Some(provider) = chain.provider() {
                if !ids.contains(provider.as_str()) {
                    return Err(InterchainError::Validation(format!(
                        "consumer chain {} references unknown provider {provider}",
                        chain.chain_id()
                    )));
                }
            }
        }
        for chain_id in self.additional_genesis.keys() {
            if !ids.contains(chain_id.as_str()) {
                return Err(InterchainError::Validation(format!(
                    "genesis allocations for unknown chain {chain_id}"
                )));
            }
        }

        let mut relayer_names = BTreeSet::new();
        for relayer in &self.relayers {
            if !relayer_names.insert(relayer.name.as_str()) {
                return Err(InterchainError::Validation(format!(
                    "duplicate relayer name {}",
                    relayer.name
                )));
            }
        }

        let mut paths = BTreeSet::new();
        for link in &self.links {
            let Some(relayer) = self.relayer_name(&link.relayer) else {
                return Err(InterchainError::Validation(format!(
                    "path {} uses a relayer that was never added",
                    link.path
                )));
            };
            if same_chain(&link.chain1, &link.chain2) {
                return Err(InterchainError::Validation(format!(
                    "path {} links chain {} to itself",
                    link.path,
                    link.chain1.chain_id()
                )));
            }
            for chain in [&link.chain1, &link.chain2] {
                if !self.chains.iter().any(|c| same_chain(c, chain)) {
                    return Err(InterchainError::Validation(format!(
                        "path {} references unknown chain {}",
                        link.path,
                        chain.chain_id()
                    )));
                }
            }
            if !paths.insert((relayer, link.path.as_str())) {
                return Err(InterchainError::Validation(format!(
                    "relayer {relayer} already has a path named {}",
                    link.path
                )));
            }
        }
        Ok(())
    }

    fn relayer_name(&self, relayer: &Arc<dyn Relayer>) -> Option<&str> {
        self.relayers
            .iter()
            .find(|r| same_relayer(&r.relayer, relayer))
            .map(|r| r.name.as_str())
    }

    #[must_use]
    pub fn chains(&self) -> &[Arc<dyn Chain>] {
        &self.chains
    }

    #[must_use]
    pub fn links(&self) -> &[InterchainLink] {
        &self.links
    }

    /// Relayer by the name it was added under.
    #[must_use]
    pub fn relayer(&self, name: &str) -> Option<&Arc<dyn Relayer>> {
        self.relayers
            .iter()
            .find(|r| r.name == name)
            .map(|r| &r.relayer)
    }

    /// Wallet generated during build for a relayer on a chain.
    #[must_use]
    pub fn relayer_wallet(&self, relayer_name: &str, chain_id: &str) -> Option<&Wallet> {
        self.relayer_wallets
            .get(&(relayer_name.to_owned(), chain_id.to_owned()))
    }

    #[must_use]
    pub const fn is_built(&self) -> bool {
        self.built
    }

    /// Stops relayer daemons still running and the block tracker. Containers
    /// are reclaimed by the label sweep, not here. Calling it again is a
    /// no-op, and dropping a built interchain without calling it does the
    /// same cleanup in the background.
    pub async fn close(&mut self) -> Result<(), InterchainError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut first_error = None;
        for relayer in &self.relayers {
            if let Err(source) = relayer.relayer.stop_relayer(&NopRelayerExecReporter).await {
                warn!(relayer = %relayer.name, error = %source, "failed to stop relayer");
                first_error.get_or_insert(InterchainError::relayer(
                    relayer.name.clone(),
                    "stop",
                    source,
                ));
            }
        }
        if let Some(chain_set) = &self.chain_set {
            chain_set.close().await;
        }
        info!(chains = self.chains.len(), relayers = self.relayers.len(), "interchain closed");

        first_error.map_or(Ok(()), Err)
    }
}

/// A built interchain that was never closed aborts its block collectors and
/// asks its relayers to stop on the current runtime.
impl Drop for Interchain {
    fn drop(&mut self) {
        if !self.built || self.closed {
            return;
        }
        self.closed = true;
        if let Some(chain_set) = self.chain_set.take() {
            chain_set.abort_collectors();
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(relayers = self.relayers.len(), "interchain dropped outside a runtime");
            return;
        };
        for named in std::mem::take(&mut self.relayers) {
            runtime.spawn(async move {
                if let Err(err) = named.relayer.stop_relayer(&NopRelayerExecReporter).await {
                    warn!(relayer = %named.name, error = %err, "failed to stop relayer on drop");
                }
            });
        }
    }
}

fn same_chain(a: &Arc<dyn Chain>, b: &Arc<dyn Chain>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn same_relayer(a: &Arc<dyn Relayer>, b: &Arc<dyn Relayer>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
