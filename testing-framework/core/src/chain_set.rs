use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
};

use tracing::{debug, info};

use crate::{
    blockdb::{Collector, Database},
    chain::{Chain, ChainEnvironment},
    fanout::ErrGroup,
    interchain::InterchainError,
    wallet::WalletAmount,
};

/// Lookup view over the chains of one interchain, grouping the operations
/// that apply to all of them.
pub struct ChainSet {
    chains: Vec<Arc<dyn Chain>>,
    collectors: Mutex<Vec<Collector>>,
    database: Mutex<Option<Database>>,
}

impl ChainSet {
    #[must_use]
    pub fn new(chains: Vec<Arc<dyn Chain>>) -> Self {
        Self {
            chains,
            collectors: Mutex::new(Vec::new()),
            database: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn chains(&self) -> &[Arc<dyn Chain>] {
        &self.chains
    }

    #[must_use]
    pub fn get(&self, chain_id: &str) -> Option<&Arc<dyn Chain>> {
        self.chains.iter().find(|c| c.chain_id() == chain_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chains.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    /// Initializes every chain concurrently.
    pub async fn initialize(&self, env: &ChainEnvironment) -> Result<(), InterchainError> {
        let mut group = ErrGroup::<(), InterchainError>::new();
        for chain in &self.chains {
            let chain = Arc::clone(chain);
            let env = env.clone();
            group.spawn(async move {
                chain
                    .initialize(&env)
                    .await
                    .map_err(|source| {
                        InterchainError::chain(chain.chain_id(), "initialize", source)
                    })
            });
        }
        group.wait().await.map(drop)
    }

    /// Starts providers and standalone chains first, then consumer chains.
    /// Each chain receives its entry of `genesis_wallets`, keyed by chain id.
    pub async fn start(
        &self,
        test_name: &str,
        genesis_wallets: &BTreeMap<String, Vec<WalletAmount>>,
    ) -> Result<(), InterchainError> {
        let (consumers, others): (Vec<_>, Vec<_>) = self
            .chains
            .iter()
            .cloned()
            .partition(|chain| chain.provider().is_some());

        for (phase, chains) in [("providers", others), ("consumers", consumers)] {
            if chains.is_empty() {
                continue;
            }
            debug!(phase, count = chains.len(), "starting chains");
            start_all(chains, test_name, genesis_wallets).await?;
        }
        Ok(())
    }

    /// Creates the test case and chain rows and spawns one collector per
    /// chain. Collectors run until [`ChainSet::close`].
    pub fn track_blocks(
        &self,
        database: &Database,
        test_name: &str,
        git_sha: &str,
    ) -> Result<(), InterchainError> {
        let test_case = database.create_test_case(test_name, git_sha)?;
        let mut collectors = Vec::with_capacity(self.chains.len());
        for chain in &self.chains {
            let record = test_case.add_chain(chain.chain_id(), chain.chain_type())?;
            collectors.push(Collector::spawn(Arc::clone(chain), record));
        }
        info!(
            test = test_name,
            test_case_id = test_case.id(),
            chains = collectors.len(),
            "tracking blocks"
        );

        self.collectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(collectors);
        *self.database.lock().unwrap_or_else(PoisonError::into_inner) = Some(database.clone());
        Ok(())
    }

    #[must_use]
    pub fn is_tracking(&self) -> bool {
        !self
            .collectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Aborts the block collectors without waiting for them to wind down.
    pub fn abort_collectors(&self) {
        self.collectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Stops the block collectors and releases the database handle. Safe to
    /// call more than once.
    pub async fn close(&self) {
        let collectors = std::mem::take(
            &mut *self.collectors.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for collector in collectors {
            debug!(chain_id = %collector.chain_id(), "stopping block collector");
            collector.stop().await;
        }
        self.database
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

async fn start_all(
    chains: Vec<Arc<dyn Chain>>,
    test_name: &str,
    genesis_wallets: &BTreeMap<String, Vec<WalletAmount>>,
) -> Result<(), InterchainError> {
    let mut group = ErrGroup::<(), InterchainError>::new();
    for chain in chains {
        let wallets = genesis_wallets
            .get(chain.chain_id())
            .cloned()
            .unwrap_or_default();
        let test_name = test_name.to_owned();
        group.spawn(async move {
            chain
                .start(&test_name, &wallets)
                .await
                .map_err(|source| InterchainError::chain(chain.chain_id(), "start", source))
        });
    }
    group.wait().await.map(drop)
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc};

    use num_bigint::BigUint;

    use super::ChainSet;
    use crate::{
        blockdb::Database,
        chain::{Chain, ChainEnvironment},
        interchain::InterchainError,
        substrate::ContainerEngine,
        testing::{FakeChain, FakeEngine, Journal},
        wallet::WalletAmount,
    };

    fn env(engine: &Arc<FakeEngine>) -> ChainEnvironment {
        ChainEnvironment {
            test_name: "ChainSetTest".to_owned(),
            engine: Arc::clone(engine) as Arc<dyn ContainerEngine>,
            network_id: "net-1".to_owned(),
        }
    }

    #[tokio::test]
    async fn providers_start_before_consumers() {
        let journal = Journal::default();
        let consumer = Arc::new(
            FakeChain::new("consumer-1")
                .with_provider("provider-1")
                .with_journal(journal.clone()),
        );
        let provider = Arc::new(
            FakeChain::new("provider-1")
                .with_consumers(&["consumer-1"])
                .with_journal(journal.clone()),
        );
        let set = ChainSet::new(vec![
            consumer.clone() as Arc<dyn Chain>,
            provider.clone() as Arc<dyn Chain>,
        ]);

        let engine = Arc::new(FakeEngine::new());
        set.initialize(&env(&engine)).await.expect("initialize");

        let mut wallets = BTreeMap::new();
        wallets.insert(
            "consumer-1".to_owned(),
            vec![WalletAmount::new("cosmos1consumer", "ufake", BigUint::from(5u32))],
        );
        set.start("ChainSetTest", &wallets).await.expect("start");

        let starts: Vec<String> = journal
            .lock()
            .expect("journal")
            .iter()
            .filter(|entry| entry.starts_with("start"))
            .cloned()
            .collect();
        assert_eq!(starts, ["start provider-1", "start consumer-1"]);
        assert_eq!(consumer.genesis_wallets().len(), 1);
        assert!(provider.genesis_wallets().is_empty());
    }

    #[tokio::test]
    async fn start_failure_names_the_chain() {
        let set = ChainSet::new(vec![
            Arc::new(FakeChain::new("ok-1")) as Arc<dyn Chain>,
            Arc::new(FakeChain::new("bad-1").failing_start("genesis rejected")) as Arc<dyn Chain>,
        ]);
        let engine = Arc::new(FakeEngine::new());
        set.initialize(&env(&engine)).await.expect("initialize");

        let err = set
            .start("ChainSetTest", &BTreeMap::new())
            .await
            .expect_err("bad chain fails");
        match err {
            InterchainError::Chain {
                chain_id, stage, ..
            } => {
                assert_eq!(chain_id, "bad-1");
                assert_eq!(stage, "start");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn close_stops_tracking_and_is_idempotent() {
        let chain = Arc::new(FakeChain::new("tracked-1"));
        let set = ChainSet::new(vec![chain.clone() as Arc<dyn Chain>]);
        let db = Database::open_in_memory("abc123").expect("db");

        set.track_blocks(&db, "TrackTest", "abc123").expect("track");
        assert!(set.is_tracking());

        set.close().await;
        set.close().await;
        assert!(!set.is_tracking());

        let cases = db.recent_test_cases(5).expect("cases");
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].chain_id.as_deref(), Some("tracked-1"));
        assert_eq!(cases[0].chain_type.as_deref(), Some("cosmos"));
    }
}
