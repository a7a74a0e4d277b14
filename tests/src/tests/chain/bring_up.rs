use std::sync::Arc;

use interchaintest_core::{
    Interchain,
    interchain::FAUCET_KEY,
    reporter::NopRelayerExecReporter,
    testutil::wait_for_blocks,
    wallet::cosmos::encode_bech32,
};
use num_bigint::BigUint;
use tests::common::docker::{build_options, chains, docker_setup, gaia, labelled_resources};

const TEST_NAME: &str = "single_gaia_chain_comes_up";

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a docker engine"]
async fn single_gaia_chain_comes_up() -> anyhow::Result<()> {
    let setup = docker_setup(TEST_NAME).await?;
    let chains = chains(vec![gaia("cosmoshub-0", 2, 1)])?;
    let gaia = Arc::clone(&chains[0]);

    let mut interchain = Interchain::new().add_chain(Arc::clone(&gaia));
    interchain
        .build(&NopRelayerExecReporter, build_options(&setup))
        .await?;

    assert!(gaia.height().await? >= 1);
    let (containers, volumes) = labelled_resources(setup.engine.as_ref(), TEST_NAME).await?;
    assert_eq!((containers, volumes), (3, 3));

    let faucet = encode_bech32(
        &gaia.config().bech32_prefix,
        &gaia.get_address(FAUCET_KEY).await?,
    )?;
    let balance = gaia.get_balance(&faucet, "uatom").await?;
    assert_eq!(balance, BigUint::from(100_000_000_000_000_u64));

    wait_for_blocks(2, &chains).await?;
    interchain.close().await?;
    Ok(())
}
