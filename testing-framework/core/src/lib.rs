//! Core building blocks of the interchain test harness: the container
//! substrate, node lifecycle, chain and relayer contracts, wallets, the
//! interchain orchestrator and its reporting and block tracking companions.

pub mod blockdb;
pub mod chain;
pub mod chain_set;
pub mod env;
pub mod fanout;
pub mod interchain;
pub mod logging;
pub mod node;
pub mod relayer;
pub mod reporter;
pub mod substrate;
pub mod tempdir;
pub mod testutil;
pub mod wallet;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::{ops::Mul as _, sync::LazyLock, time::Duration};

pub type DynError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub use chain::{Chain, ChainConfig, ChainError};
pub use interchain::{Interchain, InterchainBuildOptions, InterchainError, InterchainLink};
pub use relayer::{Relayer, RelayerError};
pub use reporter::Reporter;
pub use substrate::{ContainerEngine, EngineError};
pub use wallet::Wallet;

static IS_SLOW_TEST_ENV: LazyLock<bool> = LazyLock::new(|| env::HarnessEnv::load().slow_test_env);

/// In slow test environments like CI runners under load, use 2x timeout.
#[must_use]
pub fn adjust_timeout(d: Duration) -> Duration {
    if *IS_SLOW_TEST_ENV {
        d.mul(2)
    } else {
        d
    }
}
