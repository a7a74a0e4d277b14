//! Chain drivers for the Cosmos-SDK, Penumbra and Polkadot families, plus the
//! catalog and spec lowering that pick a driver for a test.

pub mod catalog;
pub mod cosmos;
pub mod factory;
mod node_home;
mod node_rpc;
pub mod penumbra;
pub mod polkadot;
pub mod rpc;
pub mod spec;

pub use catalog::{CatalogError, CatalogSource, ChainCatalog};
pub use cosmos::{ChainNode, CosmosChain};
pub use factory::{ChainFactory, FactoryError};
pub use penumbra::{PenumbraChain, PenumbraNode};
pub use polkadot::{CallIndex, ParachainConfig, ParachainNode, PolkadotChain, RelayChainNode};
pub use spec::{ChainSpec, SpecError};
