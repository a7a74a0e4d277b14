use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, warn};

use super::ChainRecord;
use crate::chain::Chain;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Tails one chain and saves every block from height 1 to the tip. Runs until
/// stopped.
pub struct Collector {
    chain_id: String,
    handle: JoinHandle<()>,
}

impl Collector {
    #[must_use]
    pub fn spawn(chain: Arc<dyn Chain>, record: ChainRecord) -> Self {
        let chain_id = chain.chain_id().to_owned();
        let handle = tokio::spawn(collect(chain, record));
        Self { chain_id, handle }
    }

    #[must_use]
    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    pub async fn stop(mut self) {
        self.handle.abort();
        if let Err(err) = (&mut self.handle).await {
            if err.is_panic() {
                warn!(chain_id = %self.chain_id, "block collector panicked");
            }
        }
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn collect(chain: Arc<dyn Chain>, record: ChainRecord) {
    let mut next_height = 1u64;
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let tip = match chain.height().await {
            Ok(tip) => tip,
            Err(err) => {
                debug!(
                    chain_id = %chain.chain_id(),
                    error = %err,
                    "block collector: height unavailable"
                );
                continue;
            }
        };

        while next_height <= tip {
            if let Err(err) = save_height(chain.as_ref(), &record, next_height).await {
                warn!(
                    chain_id = %chain.chain_id(),
                    height = next_height,
                    error = %err,
                    "block collector: failed to save block, retrying"
                );
                break;
            }
            next_height += 1;
        }
    }
}

async fn save_height(
    chain: &dyn Chain,
    record: &ChainRecord,
    height: u64,
) -> Result<(), crate::DynError> {
    let txs = match chain.find_txs(height).await {
        Ok(txs) => txs,
        // Families without transaction decoding still record block heights.
        Err(err) if err.is_unsupported() => Vec::new(),
        Err(err) => return Err(err.into()),
    };
    let record = record.clone();
    tokio::task::spawn_blocking(move || record.save_block(height, &txs)).await??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::Collector;
    use crate::{blockdb::Database, chain::Chain, testing::FakeChain};

    #[tokio::test]
    async fn collector_saves_every_height_up_to_the_tip() {
        let db = Database::open_in_memory("abc123").expect("db");
        let record = db
            .create_test_case("collect", "abc123")
            .and_then(|tc| tc.add_chain("fake-1", "cosmos"))
            .expect("chain");

        let chain = Arc::new(FakeChain::new("fake-1"));
        chain.set_height(3);
        chain.push_tx(2, br#"{"body":{"messages":[]}}"#);
        let collector = Collector::spawn(chain.clone() as Arc<dyn Chain>, record.clone());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let txs = db.txs(record.id()).expect("txs");
            let heights: i64 = db
                .recent_test_cases(1)
                .expect("cases")
                .first()
                .map_or(0, |c| c.chain_height);
            if heights == 3 && txs.len() == 1 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "collector did not catch up");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        collector.stop().await;
    }
}
