use std::sync::Arc;

use interchaintest_core::{
    Interchain, InterchainLink,
    chain::TransferOptions,
    relayer::get_transfer_channel,
    reporter::new_file_reporter,
    tempdir::TempDirPolicy,
    testutil::{get_and_fund_test_users, wait_for_blocks},
    wallet::WalletAmount,
};
use interchaintest_chains::ChainSpec;
use interchaintest_relayers::{RelayerFactory, RelayerKind};
use num_bigint::BigUint;
use tests::common::{
    docker::{build_options, chain_environment, chains, docker_setup, gaia},
    ibc::ibc_denom,
};
use tracing::info;

const PATH: &str = "gaia-gaia";
const FUNDS: u64 = 10_000_000;
const TRANSFER: u64 = 10_000;

/// Zero gas prices keep sender balances exact.
fn feeless_gaia(chain_id: &str) -> ChainSpec {
    let mut spec = gaia(chain_id, 1, 0);
    spec.chain_config.gas_prices = "0.0uatom".to_owned();
    spec
}

async fn transfer_between_gaia_chains(test_name: &str, kind: RelayerKind) -> anyhow::Result<()> {
    let setup = docker_setup(test_name).await?;
    let report_dir = TempDirPolicy::new().temp_dir(test_name)?;
    let reporter = new_file_reporter(report_dir.path().join("report.jsonl")).await?;
    let test = reporter.track_test(test_name);
    let rep = test.relayer_exec_reporter();

    let chains = chains(vec![
        feeless_gaia(&format!("{kind}-gaia-1")),
        feeless_gaia(&format!("{kind}-gaia-2")),
    ])?;
    let (src, dst) = (Arc::clone(&chains[0]), Arc::clone(&chains[1]));
    let relayer = RelayerFactory::new(kind)
        .build(&chain_environment(&setup))
        .await?;

    let mut interchain = Interchain::new()
        .add_chain(Arc::clone(&src))
        .add_chain(Arc::clone(&dst))
        .add_relayer(Arc::clone(&relayer), kind.as_str())
        .add_link(InterchainLink::new(
            Arc::clone(&src),
            Arc::clone(&dst),
            Arc::clone(&relayer),
            PATH,
        ));
    interchain.build(&rep, build_options(&setup)).await?;

    let channel =
        get_transfer_channel(relayer.as_ref(), &rep, src.chain_id(), dst.chain_id()).await?;
    assert_eq!(channel.channel_id, "channel-0");
    assert_eq!(channel.port_id, "transfer");
    let counterparty =
        get_transfer_channel(relayer.as_ref(), &rep, dst.chain_id(), src.chain_id()).await?;
    assert_eq!(counterparty.counterparty.channel_id, channel.channel_id);

    let users = get_and_fund_test_users("user", FUNDS, &chains).await?;
    let (sender, receiver) = (&users[0], &users[1]);
    let denom = src.config().denom.clone();
    let initial = src.get_balance(sender.formatted_address(), &denom).await?;
    assert_eq!(initial, BigUint::from(FUNDS));
    relayer.start_relayer(&rep, &[PATH.to_owned()]).await?;

    let tx = src
        .send_ibc_transfer(
            &channel.channel_id,
            sender.key_name(),
            &WalletAmount::new(receiver.formatted_address(), denom.as_str(), TRANSFER),
            &TransferOptions::default(),
        )
        .await?;
    info!(tx = %tx.tx_hash, height = tx.height, "sent ibc transfer");
    assert!(tx.packet.validate().is_ok());

    wait_for_blocks(10, &chains).await?;

    let received = ibc_denom(&counterparty.port_id, &counterparty.channel_id, &denom);
    let balance = dst
        .get_balance(receiver.formatted_address(), &received)
        .await?;
    assert_eq!(balance, BigUint::from(TRANSFER));
    let native = dst
        .get_balance(receiver.formatted_address(), &dst.config().denom)
        .await?;
    assert_eq!(native, BigUint::from(FUNDS));
    let remaining = src
        .get_balance(sender.formatted_address(), &denom)
        .await?;
    assert_eq!(remaining, BigUint::from(FUNDS - TRANSFER));

    relayer.stop_relayer(&rep).await?;
    relayer.stop_relayer(&rep).await?;
    interchain.close().await?;
    test.finish();
    reporter.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a docker engine"]
async fn rly_relays_a_transfer_between_gaia_chains() -> anyhow::Result<()> {
    transfer_between_gaia_chains("rly_transfer", RelayerKind::Rly).await
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a docker engine"]
async fn hermes_relays_a_transfer_between_gaia_chains() -> anyhow::Result<()> {
    transfer_between_gaia_chains("hermes_transfer", RelayerKind::Hermes).await
}
