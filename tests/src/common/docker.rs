use std::sync::Arc;

use interchaintest_chains::{ChainFactory, ChainSpec};
use interchaintest_core::{
    Chain, InterchainBuildOptions,
    chain::ChainEnvironment,
    env::HarnessEnv,
    logging::init_test_logging,
    substrate::{ContainerEngine, cleanup_filter},
};
use interchaintest_runner_docker::DockerSetup;

pub const GAIA_VERSION: &str = "v7.0.1";

/// Catalog gaia with an explicit chain id and node counts.
#[must_use]
pub fn gaia(chain_id: &str, validators: usize, full_nodes: usize) -> ChainSpec {
    ChainSpec::new("gaia", GAIA_VERSION)
        .with_chain_id(chain_id)
        .with_nodes(validators, full_nodes)
}

/// Logging, a swept engine and a fresh network for `test_name`.
pub async fn docker_setup(test_name: &str) -> anyhow::Result<DockerSetup> {
    init_test_logging();
    Ok(DockerSetup::new(test_name).await?)
}

pub fn chains(specs: Vec<ChainSpec>) -> anyhow::Result<Vec<Arc<dyn Chain>>> {
    Ok(ChainFactory::new(&HarnessEnv::load(), specs)?.chains()?)
}

#[must_use]
pub fn chain_environment(setup: &DockerSetup) -> ChainEnvironment {
    ChainEnvironment {
        test_name: setup.guard.test_name().to_owned(),
        engine: Arc::clone(&setup.engine),
        network_id: setup.network.id.clone(),
    }
}

#[must_use]
pub fn build_options(setup: &DockerSetup) -> InterchainBuildOptions {
    InterchainBuildOptions::new(
        setup.guard.test_name(),
        Arc::clone(&setup.engine),
        setup.network.id.clone(),
    )
}

/// Containers and volumes carrying the cleanup label of `test_name`.
pub async fn labelled_resources(
    engine: &dyn ContainerEngine,
    test_name: &str,
) -> anyhow::Result<(usize, usize)> {
    let filter = cleanup_filter(test_name);
    let containers = engine.list_containers(&filter).await?;
    let volumes = engine.list_volumes(&filter).await?;
    Ok((containers.len(), volumes.len()))
}
