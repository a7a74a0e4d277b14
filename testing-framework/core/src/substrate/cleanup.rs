use std::time::Duration;

use tracing::{debug, info, warn};

use super::{
    engine::{ContainerEngine, EngineError},
    labels::{CLEANUP_LABEL, cleanup_filter},
};
use crate::adjust_timeout;

const STOP_TIMEOUT: Duration = Duration::from_secs(10);
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const NETWORK_REMOVE_ATTEMPTS: usize = 5;
const NETWORK_RETRY_DELAY: Duration = Duration::from_millis(500);

/// What one sweep removed; failures are logged, not returned.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub containers: usize,
    pub volumes: usize,
    pub networks: usize,
}

/// Removes every container, volume and network labelled `ibc-test=<test_name>`.
/// Best effort: each failure is logged and the sweep moves on.
pub async fn sweep(
    engine: &dyn ContainerEngine,
    test_name: &str,
    keep_volumes: bool,
) -> SweepReport {
    let filter = cleanup_filter(test_name);
    let mut report = SweepReport::default();

    match engine.list_containers(&filter).await {
        Ok(containers) => {
            for container in containers {
                if remove_container(engine, &container.id).await {
                    report.containers += 1;
                }
            }
        }
        Err(err) => warn!(test = test_name, error = %err, "failed to list labelled containers"),
    }

    if keep_volumes {
        info!(test = test_name, "keeping volumes of failed test");
    } else {
        match engine.list_volumes(&filter).await {
            Ok(volumes) => {
                for volume in volumes {
                    match engine.remove_volume(&volume).await {
                        Ok(()) => report.volumes += 1,
                        Err(err) if err.is_not_found() => {}
                        Err(err) => warn!(%volume, error = %err, "failed to remove volume"),
                    }
                }
            }
            Err(err) => warn!(test = test_name, error = %err, "failed to list labelled volumes"),
        }
    }

    match engine.list_networks().await {
        Ok(networks) => {
            for network in networks.into_iter().filter(|n| filter.matches(&n.labels)) {
                if remove_network(engine, &network.id).await {
                    report.networks += 1;
                }
            }
        }
        Err(err) => warn!(test = test_name, error = %err, "failed to list networks"),
    }

    debug!(
        test = test_name,
        label = CLEANUP_LABEL,
        containers = report.containers,
        volumes = report.volumes,
        networks = report.networks,
        "label sweep finished"
    );
    report
}

async fn remove_container(engine: &dyn ContainerEngine, id: &str) -> bool {
    match engine.stop_container(id, adjust_timeout(STOP_TIMEOUT)).await {
        Ok(()) => {}
        Err(err) if err.is_not_found() => return false,
        Err(err) => debug!(container = id, error = %err, "stop failed, forcing removal"),
    }

    if tokio::time::timeout(adjust_timeout(WAIT_TIMEOUT), engine.wait_container(id))
        .await
        .is_err()
    {
        debug!(container = id, "container did not exit in time");
    }

    match engine.remove_container(id, true).await {
        Ok(()) => true,
        Err(err) if err.is_not_found() => false,
        Err(err) => {
            warn!(container = id, error = %err, "failed to remove container");
            false
        }
    }
}

async fn remove_network(engine: &dyn ContainerEngine, id: &str) -> bool {
    for attempt in 1..=NETWORK_REMOVE_ATTEMPTS {
        match engine.remove_network(id).await {
            Ok(()) => return true,
            Err(err) if err.is_not_found() => return false,
            Err(EngineError::Conflict { message, .. }) if attempt < NETWORK_REMOVE_ATTEMPTS => {
                debug!(network = id, attempt, %message, "network still has endpoints, retrying");
                tokio::time::sleep(NETWORK_RETRY_DELAY).await;
            }
            Err(err) => {
                warn!(network = id, error = %err, "failed to remove network");
                return false;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::sweep;
    use crate::{
        substrate::{ContainerEngine as _, ContainerSpec, cleanup_labels},
        testing::FakeEngine,
    };

    async fn populate(engine: &FakeEngine, test_name: &str) {
        let labels = cleanup_labels(test_name);
        for i in 0..2 {
            let id = engine
                .create_container(&ContainerSpec {
                    name: format!("{test_name}-node-{i}"),
                    image: "busybox:stable".to_owned(),
                    labels: labels.clone(),
                    ..ContainerSpec::default()
                })
                .await
                .expect("container");
            engine.start_container(&id).await.expect("start");
        }
        engine.create_volume(&labels).await.expect("volume");
        engine
            .create_network(&format!("net-{test_name}"), "172.30.1.0/24", &labels)
            .await
            .expect("network");
    }

    #[tokio::test]
    async fn sweep_removes_only_the_tests_resources() {
        let engine = FakeEngine::new();
        populate(&engine, "TestA").await;
        populate(&engine, "TestB").await;

        let report = sweep(&engine, "TestA", false).await;

        assert_eq!(report.containers, 2);
        assert_eq!(report.volumes, 1);
        assert_eq!(report.networks, 1);
        assert_eq!(engine.labelled_resource_count("TestA"), 0);
        assert_eq!(engine.labelled_resource_count("TestB"), 4);
    }

    #[tokio::test]
    async fn kept_volumes_survive_the_sweep() {
        let engine = FakeEngine::new();
        populate(&engine, "TestKeep").await;

        let report = sweep(&engine, "TestKeep", true).await;

        assert_eq!(report.volumes, 0);
        assert_eq!(engine.labelled_resource_count("TestKeep"), 1);
    }

    #[tokio::test]
    async fn network_removal_retries_while_endpoints_linger() {
        let engine = FakeEngine::new();
        populate(&engine, "TestRetry").await;
        engine.fail_network_removals(2);

        let report = sweep(&engine, "TestRetry", false).await;

        assert_eq!(report.networks, 1);
    }
}
