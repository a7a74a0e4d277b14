use std::sync::{Arc, atomic::AtomicU64};

use interchaintest_core::{
    Chain,
    chain::{COSMOS, PENUMBRA, POLKADOT},
    env::HarnessEnv,
};
use tracing::info;

use crate::{
    catalog::{CatalogError, ChainCatalog},
    cosmos::CosmosChain,
    penumbra::PenumbraChain,
    polkadot::PolkadotChain,
    spec::{ChainSpec, SpecError},
};

#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error("unknown chain type {chain_type:?} for chain {name}")]
    UnknownType { chain_type: String, name: String },
}

/// Turns [`ChainSpec`]s into chain drivers. Owns the catalog and the counter
/// behind generated name suffixes.
pub struct ChainFactory {
    catalog: ChainCatalog,
    counter: AtomicU64,
    specs: Vec<ChainSpec>,
}

impl ChainFactory {
    /// Uses the catalog selected by the environment.
    pub fn new(env: &HarnessEnv, specs: Vec<ChainSpec>) -> Result<Self, FactoryError> {
        Ok(Self::with_catalog(ChainCatalog::load(env)?, specs))
    }

    #[must_use]
    pub fn with_catalog(catalog: ChainCatalog, specs: Vec<ChainSpec>) -> Self {
        info!(source = %catalog.source(), "loaded configured chains");
        Self {
            catalog,
            counter: AtomicU64::new(0),
            specs,
        }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.specs.len()
    }

    /// `name@version` of every spec joined with `+`.
    #[must_use]
    pub fn name(&self) -> String {
        self.specs
            .iter()
            .map(|spec| format!("{}@{}", spec.name, spec.version))
            .collect::<Vec<_>>()
            .join("+")
    }

    /// One fresh driver per spec, in order.
    pub fn chains(&self) -> Result<Vec<Arc<dyn Chain>>, FactoryError> {
        self.specs.iter().map(|spec| self.chain(spec)).collect()
    }

    fn chain(&self, spec: &ChainSpec) -> Result<Arc<dyn Chain>, FactoryError> {
        let config = spec.config(&self.catalog, &self.counter)?;
        let validators = spec.num_validators();
        let full_nodes = spec.num_full_nodes();
        let chain: Arc<dyn Chain> = match config.chain_type.as_str() {
            COSMOS => Arc::new(CosmosChain::new(config, validators, full_nodes)),
            PENUMBRA => Arc::new(PenumbraChain::new(config, validators, full_nodes)),
            POLKADOT => Arc::new(
                PolkadotChain::new(config, validators).with_parachains(spec.parachains.clone()),
            ),
            other => {
                return Err(FactoryError::UnknownType {
                    chain_type: other.to_owned(),
                    name: config.name,
                });
            }
        };
        Ok(chain)
    }
}
