//! Helpers tests reach for after [`crate::Interchain::build`]: waiting for
//! blocks and creating funded users.

use std::{sync::Arc, time::Duration};

use futures::future::try_join_all;
use num_bigint::BigUint;
use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::{
    adjust_timeout,
    chain::{Chain, ChainError},
    interchain::FAUCET_KEY,
    substrate::random_suffix,
    wallet::{Wallet, WalletAmount},
};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const BLOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Waits until every chain advanced `delta` blocks past its current height.
pub async fn wait_for_blocks(delta: u64, chains: &[Arc<dyn Chain>]) -> Result<(), ChainError> {
    try_join_all(chains.iter().map(|chain| wait_for_chain_blocks(chain.as_ref(), delta))).await?;
    Ok(())
}

async fn wait_for_chain_blocks(chain: &dyn Chain, delta: u64) -> Result<(), ChainError> {
    let timeout = adjust_timeout(BLOCK_WAIT_TIMEOUT);
    let deadline = Instant::now() + timeout;
    let target = chain.height().await? + delta;
    loop {
        let height = chain.height().await?;
        if height >= target {
            debug!(chain_id = %chain.chain_id(), height, "reached target height");
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(ChainError::Timeout {
                chain: chain.chain_id().to_owned(),
                operation: "wait for blocks",
                timeout,
            });
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Creates one wallet per chain under `<key_prefix>-<random>`, funds it from
/// the faucet with `amount` of the chain denom and waits two blocks on every
/// chain so the transfers land.
pub async fn get_and_fund_test_users(
    key_prefix: &str,
    amount: impl Into<BigUint>,
    chains: &[Arc<dyn Chain>],
) -> Result<Vec<Wallet>, ChainError> {
    let amount = amount.into();
    let users = try_join_all(chains.iter().map(|chain| {
        let amount = amount.clone();
        async move {
            let key_name = format!("{key_prefix}-{}", random_suffix(3));
            let user = chain.build_wallet(&key_name, None).await?;
            chain
                .send_funds(
                    FAUCET_KEY,
                    &WalletAmount::new(
                        user.formatted_address(),
                        chain.config().denom.clone(),
                        amount,
                    ),
                )
                .await?;
            debug!(chain_id = %chain.chain_id(), key = %key_name, "funded test user");
            Ok::<_, ChainError>(user)
        }
    }))
    .await?;

    wait_for_blocks(2, chains).await?;
    Ok(users)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use num_bigint::BigUint;

    use super::get_and_fund_test_users;
    use crate::{
        chain::{Chain, ChainEnvironment},
        substrate::ContainerEngine,
        testing::{FakeChain, FakeEngine},
    };

    async fn started(chain_id: &str, engine: &Arc<FakeEngine>) -> Arc<FakeChain> {
        let chain = Arc::new(FakeChain::new(chain_id));
        chain
            .initialize(&ChainEnvironment {
                test_name: "FundUsers".to_owned(),
                engine: Arc::clone(engine) as Arc<dyn ContainerEngine>,
                network_id: "net-1".to_owned(),
            })
            .await
            .expect("initialize");
        chain.start("FundUsers", &[]).await.expect("start");
        chain
    }

    #[tokio::test]
    async fn users_are_funded_on_every_chain() {
        let engine = Arc::new(FakeEngine::new());
        let gaia = started("gaia-1", &engine).await;
        let osmo = started("osmosis-1", &engine).await;

        let producers = [Arc::clone(&gaia), Arc::clone(&osmo)];
        let ticker = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(20)).await;
                for chain in &producers {
                    let height = chain.height().await.expect("height");
                    chain.set_height(height + 1);
                }
            }
        });

        let chains: Vec<Arc<dyn Chain>> = vec![gaia.clone(), osmo.clone()];
        let users = get_and_fund_test_users("alice", 10_000u32, &chains)
            .await
            .expect("fund");
        ticker.abort();

        assert_eq!(users.len(), 2);
        for (user, chain) in users.iter().zip([&gaia, &osmo]) {
            assert!(user.key_name().starts_with("alice-"));
            let balance = chain
                .get_balance(user.formatted_address(), "ufake")
                .await
                .expect("balance");
            assert_eq!(balance, BigUint::from(10_000u32));
        }
    }
}
