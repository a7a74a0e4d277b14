use std::sync::Arc;

use interchaintest_core::{
    ContainerEngine, Interchain, env::set_keep_on_failure, reporter::NopRelayerExecReporter,
    substrate::sweep, tempdir::TempDirPolicy,
};
use interchaintest_runner_docker::DockerSetup;
use tests::common::docker::{build_options, chains, docker_setup, gaia, labelled_resources};

/// Brings up one single-validator chain and tears the test down through the
/// cleanup guard, optionally marking it failed first.
async fn run_and_drop(
    test_name: &str,
    chain_id: &str,
    failed: bool,
) -> anyhow::Result<(Arc<dyn ContainerEngine>, (usize, usize))> {
    set_keep_on_failure(true);
    let setup = docker_setup(test_name).await?;
    let chains = chains(vec![gaia(chain_id, 1, 0)])?;
    let mut interchain = Interchain::new().add_chain(Arc::clone(&chains[0]));
    interchain
        .build(&NopRelayerExecReporter, build_options(&setup))
        .await?;
    interchain.close().await?;

    let DockerSetup { engine, guard, .. } = setup;
    if failed {
        guard.mark_failed();
    }
    drop(guard);

    let resources = labelled_resources(engine.as_ref(), test_name).await?;
    Ok((engine, resources))
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a docker engine"]
async fn failed_test_keeps_its_volumes() -> anyhow::Result<()> {
    const TEST_NAME: &str = "failed_test_keeps_its_volumes";
    let (engine, (containers, volumes)) = run_and_drop(TEST_NAME, "retain-1", true).await?;
    assert_eq!(containers, 0);
    assert_eq!(volumes, 1);

    let report = sweep(engine.as_ref(), TEST_NAME, false).await;
    assert_eq!(report.volumes, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a docker engine"]
async fn passing_test_leaves_nothing_behind() -> anyhow::Result<()> {
    let (_, resources) =
        run_and_drop("passing_test_leaves_nothing_behind", "retain-2", false).await?;
    assert_eq!(resources, (0, 0));
    Ok(())
}

#[test]
fn failed_test_keeps_its_temp_dir() -> anyhow::Result<()> {
    set_keep_on_failure(true);
    let root = std::env::temp_dir().join("interchaintest-retain");
    std::fs::create_dir_all(&root)?;
    let mut dir = TempDirPolicy::in_dir(&root).temp_dir("failed_test_keeps_its_temp_dir")?;
    std::fs::write(dir.path().join("genesis.json"), b"{}")?;
    dir.mark_failed();

    let kept = dir.finish().expect("failed test dir is kept");
    assert!(kept.exists());
    assert!(kept.join("genesis.json").is_file());
    std::fs::remove_dir_all(&kept)?;

    let passing = TempDirPolicy::in_dir(&root).temp_dir("passing_test_temp_dir")?;
    let path = passing.path().to_path_buf();
    assert!(passing.finish().is_none());
    assert!(!path.exists());
    Ok(())
}
