use std::sync::Arc;

use interchaintest_core::{
    Interchain, reporter::NopRelayerExecReporter, testutil::get_and_fund_test_users,
};
use num_bigint::BigUint;
use tests::common::docker::{build_options, chains, docker_setup, gaia};

const TEST_NAME: &str = "funded_users_hold_the_requested_amount";
const AMOUNT: u64 = 10_000;

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a docker engine"]
async fn funded_users_hold_the_requested_amount() -> anyhow::Result<()> {
    let setup = docker_setup(TEST_NAME).await?;
    let chains = chains(vec![gaia("gaia-fund-1", 1, 0), gaia("gaia-fund-2", 1, 0)])?;

    let mut interchain = chains
        .iter()
        .fold(Interchain::new(), |ic, chain| ic.add_chain(Arc::clone(chain)));
    interchain
        .build(&NopRelayerExecReporter, build_options(&setup))
        .await?;

    let users = get_and_fund_test_users("alice", AMOUNT, &chains).await?;
    assert_eq!(users.len(), chains.len());
    for (chain, user) in chains.iter().zip(&users) {
        assert!(user.key_name().starts_with("alice-"));
        let balance = chain
            .get_balance(user.formatted_address(), &chain.config().denom)
            .await?;
        assert_eq!(balance, BigUint::from(AMOUNT));
    }

    interchain.close().await?;
    Ok(())
}
