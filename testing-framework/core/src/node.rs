//! Lifecycle of one long-running container (a chain node or a relayer
//! daemon): create with reserved host ports, start, pause, stop, remove.

use std::{collections::BTreeMap, io, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    adjust_timeout,
    substrate::{
        ContainerEngine, ContainerSpec, EngineError, ExecOutput, PortReservation, node_labels,
        reserve_ports, start_guard, tcp_port,
    },
};

const START_ATTEMPTS: u32 = 3;
const START_BACKOFF: Duration = Duration::from_secs(1);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);
const PANIC_CHECK_DELAY: Duration = Duration::from_secs(1);
const PANIC_MARKER: &str = "panic:";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Uncreated,
    Created,
    Running,
    Paused,
    Stopped,
    Removed,
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("failed to reserve host ports for {name}: {source}")]
    Ports {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot {operation} container {name} while it is {state:?}")]
    InvalidState {
        name: String,
        operation: &'static str,
        state: NodeState,
    },
    #[error("container {name} panicked after start: {line}")]
    Panicked { name: String, line: String },
}

#[derive(Clone, Debug, Default)]
pub struct CreateContainerOptions {
    pub test_name: String,
    pub network_id: String,
    pub image: String,
    pub user: Option<String>,
    /// Container ports to publish, e.g. `26657/tcp`.
    pub ports: Vec<String>,
    /// Fixed host ports keyed by container port.
    pub host_port_overrides: BTreeMap<String, u16>,
    pub binds: Vec<String>,
    pub hostname: String,
    pub cmd: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    pub env: Vec<String>,
}

struct Inner {
    id: Option<String>,
    state: NodeState,
    reservation: Option<PortReservation>,
    host_ports: BTreeMap<String, String>,
}

/// Owns at most one container at a time; all methods take `&self`.
pub struct ContainerLifecycle {
    engine: Arc<dyn ContainerEngine>,
    name: String,
    inner: Mutex<Inner>,
}

impl ContainerLifecycle {
    #[must_use]
    pub fn new(engine: Arc<dyn ContainerEngine>, name: impl Into<String>) -> Self {
        Self {
            engine,
            name: name.into(),
            inner: Mutex::new(Inner {
                id: None,
                state: NodeState::Uncreated,
                reservation: None,
                host_ports: BTreeMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    pub async fn state(&self) -> NodeState {
        self.inner.lock().await.state
    }

    pub async fn container_id(&self) -> Option<String> {
        self.inner.lock().await.id.clone()
    }

    pub async fn create_container(&self, opts: CreateContainerOptions) -> Result<(), NodeError> {
        let mut inner = self.inner.lock().await;
        self.expect_state(&inner, "create", &[NodeState::Uncreated, NodeState::Removed])?;

        let ports: Vec<String> = opts.ports.iter().map(|p| tcp_port(p)).collect();
        let (bindings, reservation) = reserve_ports(&ports, &opts.host_port_overrides)
            .await
            .map_err(|source| NodeError::Ports {
                name: self.name.clone(),
                source,
            })?;

        let spec = ContainerSpec {
            name: self.name.clone(),
            image: opts.image,
            cmd: opts.cmd,
            entrypoint: opts.entrypoint,
            env: opts.env,
            user: opts.user,
            hostname: Some(opts.hostname),
            network_id: Some(opts.network_id),
            binds: opts.binds,
            ports: bindings,
            labels: node_labels(&opts.test_name, &self.name),
            working_dir: None,
        };
        let id = self.engine.create_container(&spec).await?;
        info!(container = %self.name, %id, image = %spec.image, "created container");

        inner.id = Some(id);
        inner.reservation = Some(reservation);
        inner.state = NodeState::Created;
        inner.host_ports.clear();
        Ok(())
    }

    pub async fn start_container(&self) -> Result<(), NodeError> {
        let mut inner = self.inner.lock().await;
        self.expect_state(&inner, "start", &[NodeState::Created, NodeState::Stopped])?;
        let id = self.require_id(&inner, "start")?;

        {
            let _guard = start_guard().await;
            if let Some(reservation) = inner.reservation.take() {
                reservation.release();
            }
            self.start_with_retry(&id).await?;
        }

        let state = self.engine.inspect_container(&id).await?;
        inner.host_ports = state
            .ports
            .iter()
            .filter_map(|(port, bindings)| {
                bindings
                    .first()
                    .map(|b| (port.clone(), format!("127.0.0.1:{}", b.port)))
            })
            .collect();
        inner.state = NodeState::Running;
        drop(inner);

        tokio::time::sleep(PANIC_CHECK_DELAY).await;
        self.check_for_panic(&id).await
    }

    async fn start_with_retry(&self, id: &str) -> Result<(), EngineError> {
        let mut attempt = 1;
        loop {
            match self.engine.start_container(id).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_timeout() && attempt < START_ATTEMPTS => {
                    warn!(
                        container = %self.name,
                        attempt,
                        error = %err,
                        "container start timed out, retrying"
                    );
                    tokio::time::sleep(START_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn check_for_panic(&self, id: &str) -> Result<(), NodeError> {
        let (stdout, stderr) = self.engine.logs(id, Some(200)).await?;
        let logs = [stdout, stderr].concat();
        let text = String::from_utf8_lossy(&logs);
        if let Some(line) = text.lines().find(|line| line.contains(PANIC_MARKER)) {
            return Err(NodeError::Panicked {
                name: self.name.clone(),
                line: line.to_owned(),
            });
        }
        Ok(())
    }

    pub async fn pause_container(&self) -> Result<(), NodeError> {
        let mut inner = self.inner.lock().await;
        self.expect_state(&inner, "pause", &[NodeState::Running])?;
        let id = self.require_id(&inner, "pause")?;
        self.engine.pause_container(&id).await?;
        inner.state = NodeState::Paused;
        Ok(())
    }

    pub async fn unpause_container(&self) -> Result<(), NodeError> {
        let mut inner = self.inner.lock().await;
        self.expect_state(&inner, "unpause", &[NodeState::Paused])?;
        let id = self.require_id(&inner, "unpause")?;
        self.engine.unpause_container(&id).await?;
        inner.state = NodeState::Running;
        Ok(())
    }

    pub async fn stop_container(&self) -> Result<(), NodeError> {
        let mut inner = self.inner.lock().await;
        let Some(id) = inner.id.clone() else {
            return Ok(());
        };
        if matches!(inner.state, NodeState::Stopped | NodeState::Removed) {
            return Ok(());
        }
        match self
            .engine
            .stop_container(&id, adjust_timeout(STOP_TIMEOUT))
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
        debug!(container = %self.name, "stopped container");
        inner.state = NodeState::Stopped;
        Ok(())
    }

    /// Force-removes the container. Safe to call repeatedly.
    pub async fn remove_container(&self) -> Result<(), NodeError> {
        let mut inner = self.inner.lock().await;
        let Some(id) = inner.id.take() else {
            return Ok(());
        };
        match self.engine.remove_container(&id, true).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                inner.id = Some(id);
                return Err(err.into());
            }
        }
        inner.reservation = None;
        inner.host_ports.clear();
        inner.state = NodeState::Removed;
        Ok(())
    }

    /// Asks the engine, so a crashed container reports `false`.
    pub async fn running(&self) -> Result<bool, NodeError> {
        let Some(id) = self.container_id().await else {
            return Ok(false);
        };
        match self.engine.inspect_container(&id).await {
            Ok(state) => Ok(state.running && !state.paused),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Host addresses for the given container ports, in order. Ports that are
    /// not published map to empty strings.
    pub async fn host_ports(&self, ports: &[&str]) -> Vec<String> {
        let inner = self.inner.lock().await;
        ports
            .iter()
            .map(|port| {
                inner
                    .host_ports
                    .get(&tcp_port(port))
                    .cloned()
                    .unwrap_or_default()
            })
            .collect()
    }

    pub async fn exec(&self, cmd: &[String], env: &[String]) -> Result<ExecOutput, NodeError> {
        let inner = self.inner.lock().await;
        self.expect_state(&inner, "exec", &[NodeState::Running])?;
        let id = self.require_id(&inner, "exec")?;
        drop(inner);
        Ok(self.engine.exec(&id, cmd, env).await?)
    }

    pub async fn logs(&self, tail: Option<usize>) -> Result<(Vec<u8>, Vec<u8>), NodeError> {
        let Some(id) = self.container_id().await else {
            return Ok((Vec::new(), Vec::new()));
        };
        Ok(self.engine.logs(&id, tail).await?)
    }

    fn expect_state(
        &self,
        inner: &Inner,
        operation: &'static str,
        allowed: &[NodeState],
    ) -> Result<(), NodeError> {
        if allowed.contains(&inner.state) {
            Ok(())
        } else {
            Err(NodeError::InvalidState {
                name: self.name.clone(),
                operation,
                state: inner.state,
            })
        }
    }

    fn require_id(&self, inner: &Inner, operation: &'static str) -> Result<String, NodeError> {
        inner.id.clone().ok_or_else(|| NodeError::InvalidState {
            name: self.name.clone(),
            operation,
            state: inner.state,
        })
    }
}
