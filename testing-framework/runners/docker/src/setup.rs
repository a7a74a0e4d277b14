use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use interchaintest_core::{
    env::{HarnessEnv, keep_on_failure},
    substrate::{ContainerEngine, EngineError, SweepReport, TestNetwork, create_network, sweep},
};
use tracing::{info, warn};

use crate::client::DockerEngine;

const SWEEP_TIMEOUT: Duration = Duration::from_secs(120);

/// Engine and network of one test, plus the guard that reclaims everything
/// labelled for it.
pub struct DockerSetup {
    pub engine: Arc<dyn ContainerEngine>,
    pub network: TestNetwork,
    pub guard: DockerCleanupGuard,
}

impl DockerSetup {
    /// Connects to the local Docker daemon.
    pub async fn new(test_name: &str) -> Result<Self, EngineError> {
        Self::with_engine(Arc::new(DockerEngine::connect()?), test_name).await
    }

    /// Sweeps leftovers of an earlier run with the same test name, then
    /// creates the test network.
    pub async fn with_engine(
        engine: Arc<dyn ContainerEngine>,
        test_name: &str,
    ) -> Result<Self, EngineError> {
        let leftovers = sweep(engine.as_ref(), test_name, false).await;
        if leftovers != SweepReport::default() {
            info!(
                test = test_name,
                containers = leftovers.containers,
                volumes = leftovers.volumes,
                networks = leftovers.networks,
                "removed leftovers of a previous run"
            );
        }

        let network = create_network(engine.as_ref(), test_name).await?;
        let guard = DockerCleanupGuard::new(Arc::clone(&engine), test_name);
        Ok(Self {
            engine,
            network,
            guard,
        })
    }
}

/// Runs the label sweep when dropped. Volumes of a failed test survive when
/// retention is on; the decision is made at drop time.
pub struct DockerCleanupGuard {
    engine: Arc<dyn ContainerEngine>,
    test_name: String,
    failed: AtomicBool,
}

impl DockerCleanupGuard {
    #[must_use]
    pub fn new(engine: Arc<dyn ContainerEngine>, test_name: &str) -> Self {
        Self {
            engine,
            test_name: test_name.to_owned(),
            failed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    /// Records a failure without panicking, e.g. after `TestReporter::error`.
    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst) || thread::panicking()
    }

    async fn cleanup_async(
        engine: Arc<dyn ContainerEngine>,
        test_name: String,
        keep_volumes: bool,
    ) {
        let swept = sweep(engine.as_ref(), &test_name, keep_volumes);
        match tokio::time::timeout(SWEEP_TIMEOUT, swept).await {
            Ok(report) => info!(
                test = %test_name,
                containers = report.containers,
                volumes = report.volumes,
                networks = report.networks,
                "test resources removed"
            ),
            Err(_) => warn!(test = %test_name, "label sweep timed out after {SWEEP_TIMEOUT:?}"),
        }
    }

    /// The sweep needs a runtime of its own: drop may run inside a runtime
    /// that cannot be blocked on, or outside any runtime.
    fn run_blocking(engine: Arc<dyn ContainerEngine>, test_name: String, keep_volumes: bool) {
        let sweep_on_new_runtime = move || match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt.block_on(Self::cleanup_async(engine, test_name, keep_volumes)),
            Err(err) => warn!(error = %err, "unable to create cleanup runtime"),
        };

        if tokio::runtime::Handle::try_current().is_err() {
            sweep_on_new_runtime();
            return;
        }
        match thread::Builder::new()
            .name("docker-cleanup".into())
            .spawn(sweep_on_new_runtime)
        {
            Ok(handle) => {
                if handle.join().is_err() {
                    warn!("cleanup thread panicked");
                }
            }
            Err(err) => warn!(error = %err, "failed to spawn cleanup thread"),
        }
    }
}

impl Drop for DockerCleanupGuard {
    fn drop(&mut self) {
        if HarnessEnv::load().keep_containers {
            warn!(test = %self.test_name, "KEEP_CONTAINERS set, skipping cleanup");
            return;
        }
        let keep_volumes = self.failed() && keep_on_failure();
        Self::run_blocking(Arc::clone(&self.engine), self.test_name.clone(), keep_volumes);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use interchaintest_core::{
        env::set_keep_on_failure,
        substrate::{ContainerEngine, ContainerSpec, cleanup_labels},
        testing::FakeEngine,
    };

    use super::DockerSetup;

    async fn create_labelled(engine: &FakeEngine, test_name: &str) {
        let labels = cleanup_labels(test_name);
        let id = engine
            .create_container(&ContainerSpec {
                name: format!("node-{test_name}"),
                image: "busybox:stable".to_owned(),
                labels: labels.clone(),
                ..ContainerSpec::default()
            })
            .await
            .expect("container");
        engine.start_container(&id).await.expect("start");
        engine.create_volume(&labels).await.expect("volume");
    }

    #[tokio::test]
    async fn setup_sweeps_leftovers_and_guard_removes_everything() {
        let engine = Arc::new(FakeEngine::new());
        create_labelled(&engine, "GuardTest").await;

        let setup = DockerSetup::with_engine(engine.clone(), "GuardTest")
            .await
            .expect("setup");
        // Only the fresh network is left after the pre-emptive sweep.
        assert_eq!(engine.labelled_resource_count("GuardTest"), 1);
        assert_eq!(setup.guard.test_name(), "GuardTest");

        create_labelled(&engine, "GuardTest").await;
        create_labelled(&engine, "OtherTest").await;
        drop(setup);

        assert_eq!(engine.labelled_resource_count("GuardTest"), 0);
        assert_eq!(engine.labelled_resource_count("OtherTest"), 2);
    }

    #[tokio::test]
    async fn failed_test_keeps_volumes_when_retention_is_on() {
        let engine = Arc::new(FakeEngine::new());
        let setup = DockerSetup::with_engine(engine.clone(), "RetainTest")
            .await
            .expect("setup");
        create_labelled(&engine, "RetainTest").await;

        set_keep_on_failure(true);
        setup.guard.mark_failed();
        drop(setup);
        set_keep_on_failure(false);

        assert_eq!(engine.container_count(), 0);
        assert_eq!(engine.volume_count(), 1);
        assert_eq!(engine.labelled_resource_count("RetainTest"), 1);
    }
}
