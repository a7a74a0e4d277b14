use std::sync::{
    OnceLock,
    atomic::{AtomicU64, Ordering},
};

use interchaintest_core::chain::{COSMOS, ChainConfig, PENUMBRA, POLKADOT};

use crate::{catalog::ChainCatalog, polkadot::ParachainConfig};

pub const DEFAULT_NUM_VALIDATORS: usize = 2;
pub const DEFAULT_NUM_FULL_NODES: usize = 1;

#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("chain spec version must not be empty")]
    MissingVersion,
    #[error("chain spec name required when not all config fields are set")]
    NameRequired,
    #[error("no chain configuration for {name} (available chains are: {})", available.join(", "))]
    UnknownChain {
        name: String,
        available: Vec<String>,
    },
    #[error("penumbra version should be comma separated penumbra_version,tendermint_version")]
    PenumbraVersion,
    #[error("{chain_type} chain {name} has no image to set version {version} on")]
    MissingImage {
        chain_type: String,
        name: String,
        version: String,
    },
}

/// A catalog entry by name plus overrides, or a complete inline config.
///
/// Lowering is repeatable: the generated `-N` suffix is drawn once per spec.
#[derive(Clone, Debug, Default)]
pub struct ChainSpec {
    /// Catalog entry to start from. May be empty when `chain_config` is
    /// complete.
    pub name: String,
    /// Overrides the generated chain name.
    pub chain_name: String,
    /// Image version. For penumbra `penumbra_version,tendermint_version`.
    pub version: String,
    /// `Some` distinguishes an explicit zero from "not set".
    pub gas_adjustment: Option<f64>,
    pub no_host_mount: Option<bool>,
    pub chain_config: ChainConfig,
    pub num_validators: Option<usize>,
    pub num_full_nodes: Option<usize>,
    /// Parachains a polkadot relay chain registers at genesis.
    pub parachains: Vec<ParachainConfig>,
    suffix: OnceLock<String>,
}

impl ChainSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_chain_name(mut self, chain_name: impl Into<String>) -> Self {
        self.chain_name = chain_name.into();
        self
    }

    #[must_use]
    pub fn with_chain_id(mut self, chain_id: impl Into<String>) -> Self {
        self.chain_config.chain_id = chain_id.into();
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: ChainConfig) -> Self {
        self.chain_config = config;
        self
    }

    #[must_use]
    pub const fn with_nodes(mut self, validators: usize, full_nodes: usize) -> Self {
        self.num_validators = Some(validators);
        self.num_full_nodes = Some(full_nodes);
        self
    }

    #[must_use]
    pub fn with_parachain(mut self, parachain: ParachainConfig) -> Self {
        self.parachains.push(parachain);
        self
    }

    #[must_use]
    pub fn num_validators(&self) -> usize {
        self.num_validators.unwrap_or(DEFAULT_NUM_VALIDATORS)
    }

    #[must_use]
    pub fn num_full_nodes(&self) -> usize {
        self.num_full_nodes.unwrap_or(DEFAULT_NUM_FULL_NODES)
    }

    /// Resolves the spec against `catalog`. `counter` supplies the suffix the
    /// first time a name or chain id has to be generated.
    pub fn config(
        &self,
        catalog: &ChainCatalog,
        counter: &AtomicU64,
    ) -> Result<ChainConfig, SpecError> {
        let inline_version = self
            .chain_config
            .images
            .first()
            .is_some_and(|image| !image.version.is_empty());
        if self.version.is_empty() && !inline_version {
            return Err(SpecError::MissingVersion);
        }

        if self.name.is_empty() {
            let mut config = self.chain_config.clone();
            if config.name.is_empty() && !self.chain_name.is_empty() {
                config.name.clone_from(&self.chain_name);
            }
            if !config.is_fully_configured() {
                return Err(SpecError::NameRequired);
            }
            return self.apply_overrides(config, counter);
        }

        let mut config = catalog
            .get(&self.name)
            .cloned()
            .ok_or_else(|| SpecError::UnknownChain {
                name: self.name.clone(),
                available: catalog.names(),
            })?;
        config.merge_chain_config(&self.chain_config);
        self.apply_overrides(config, counter)
    }

    fn apply_overrides(
        &self,
        mut config: ChainConfig,
        counter: &AtomicU64,
    ) -> Result<ChainConfig, SpecError> {
        let base = if self.chain_name.is_empty() {
            if self.name.is_empty() {
                config.name.clone()
            } else {
                self.name.clone()
            }
        } else {
            self.chain_name.clone()
        };

        if !self.chain_name.is_empty() {
            config.name.clone_from(&self.chain_name);
        } else if !self.name.is_empty() {
            config.name = format!("{}{}", self.name, self.suffix(counter));
        }
        if config.chain_id.is_empty() {
            config.chain_id = format!("{base}{}", self.suffix(counter));
        }

        if let Some(gas_adjustment) = self.gas_adjustment {
            config.gas_adjustment = gas_adjustment;
        }
        if let Some(no_host_mount) = self.no_host_mount {
            config.no_host_mount = no_host_mount;
        }

        if self.version.is_empty() {
            return Ok(config);
        }
        match config.chain_type.as_str() {
            PENUMBRA => {
                let Some((penumbra, tendermint)) = self.version.split_once(',') else {
                    return Err(SpecError::PenumbraVersion);
                };
                if tendermint.contains(',') {
                    return Err(SpecError::PenumbraVersion);
                }
                if config.images.len() < 2 {
                    return Err(self.missing_image(&config));
                }
                tendermint.clone_into(&mut config.images[0].version);
                penumbra.clone_into(&mut config.images[1].version);
            }
            COSMOS | POLKADOT => {
                let Some(image) = config.images.first_mut() else {
                    return Err(self.missing_image(&config));
                };
                image.version.clone_from(&self.version);
            }
            _ => {}
        }
        Ok(config)
    }

    fn missing_image(&self, config: &ChainConfig) -> SpecError {
        SpecError::MissingImage {
            chain_type: config.chain_type.clone(),
            name: config.name.clone(),
            version: self.version.clone(),
        }
    }

    fn suffix(&self, counter: &AtomicU64) -> &str {
        self.suffix
            .get_or_init(|| format!("-{}", counter.fetch_add(1, Ordering::SeqCst) + 1))
    }
}
