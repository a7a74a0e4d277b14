use std::{collections::BTreeMap, io, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub type Labels = BTreeMap<String, String>;

/// Everything needed to create one container.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    pub env: Vec<String>,
    pub user: Option<String>,
    pub hostname: Option<String>,
    pub network_id: Option<String>,
    /// `volume:/container/path` pairs.
    pub binds: Vec<String>,
    pub ports: Vec<PortBinding>,
    pub labels: Labels,
    pub working_dir: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortBinding {
    /// Engine notation, e.g. `26657/tcp`.
    pub container_port: String,
    pub host_ip: String,
    /// `None` lets the engine pick.
    pub host_port: Option<u16>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostBinding {
    pub ip: String,
    pub port: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerState {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub paused: bool,
    pub exit_code: Option<i64>,
    pub ports: BTreeMap<String, Vec<HostBinding>>,
    pub labels: Labels,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub labels: Labels,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkSummary {
    pub id: String,
    pub name: String,
    pub subnets: Vec<String>,
    pub labels: Labels,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i64,
}

impl ExecOutput {
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }

    #[must_use]
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    #[must_use]
    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Turns a non-zero exit into [`EngineError::Command`].
    pub fn ensure_success(self, command: &[String]) -> Result<Self, EngineError> {
        if self.success() {
            return Ok(self);
        }
        Err(EngineError::Command {
            command: command.join(" "),
            status: self.exit_code,
            stderr: self.stderr_string(),
        })
    }
}

/// Matches resources carrying `key=value`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelFilter {
    pub key: String,
    pub value: String,
}

impl LabelFilter {
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    #[must_use]
    pub fn matches(&self, labels: &Labels) -> bool {
        labels.get(&self.key) == Some(&self.value)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("`{command}` exited with status {status}: {stderr}")]
    Command {
        command: String,
        status: i64,
        stderr: String,
    },
    /// The daemon rejected a request; `status` is the HTTP status when the
    /// daemon answered at all.
    #[error("{context} failed: {message}")]
    Api {
        context: String,
        status: Option<u16>,
        message: String,
    },
    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("failed to parse engine output for {context}: {message}")]
    Parse { context: String, message: String },
    #[error("{kind} {id} is still in use: {message}")]
    Conflict {
        kind: &'static str,
        id: String,
        message: String,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl EngineError {
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// The slice of a container engine the harness needs. Implementations must be
/// usable from many tasks at once.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn pull_image(&self, image: &str) -> Result<(), EngineError>;

    async fn create_volume(&self, labels: &Labels) -> Result<String, EngineError>;
    async fn remove_volume(&self, name: &str) -> Result<(), EngineError>;
    async fn list_volumes(&self, filter: &LabelFilter) -> Result<Vec<String>, EngineError>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError>;
    async fn start_container(&self, id: &str) -> Result<(), EngineError>;
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), EngineError>;
    async fn pause_container(&self, id: &str) -> Result<(), EngineError>;
    async fn unpause_container(&self, id: &str) -> Result<(), EngineError>;
    /// Blocks until the container exits and returns its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64, EngineError>;
    async fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError>;
    async fn inspect_container(&self, id: &str) -> Result<ContainerState, EngineError>;
    async fn list_containers(
        &self,
        filter: &LabelFilter,
    ) -> Result<Vec<ContainerSummary>, EngineError>;

    async fn exec(&self, id: &str, cmd: &[String], env: &[String])
    -> Result<ExecOutput, EngineError>;
    /// Returns `(stdout, stderr)`; `tail` limits each stream to the last lines.
    async fn logs(&self, id: &str, tail: Option<usize>) -> Result<(Vec<u8>, Vec<u8>), EngineError>;

    /// Copies a single file into a (possibly stopped) container.
    async fn copy_to_container(
        &self,
        id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<(), EngineError>;
    async fn copy_from_container(&self, id: &str, path: &str) -> Result<Vec<u8>, EngineError>;

    async fn create_network(
        &self,
        name: &str,
        subnet: &str,
        labels: &Labels,
    ) -> Result<String, EngineError>;
    async fn remove_network(&self, id: &str) -> Result<(), EngineError>;
    async fn list_networks(&self) -> Result<Vec<NetworkSummary>, EngineError>;
}

/// Host address (`ip:port`) published for `container_port` (`26657/tcp`).
pub async fn host_port(
    engine: &dyn ContainerEngine,
    id: &str,
    container_port: &str,
) -> Result<Option<String>, EngineError> {
    let state = engine.inspect_container(id).await?;
    Ok(state
        .ports
        .get(container_port)
        .and_then(|bindings| bindings.first())
        .map(|binding| format!("{}:{}", host_ip(&binding.ip), binding.port)))
}

fn host_ip(ip: &str) -> &str {
    match ip {
        "" | "0.0.0.0" => "127.0.0.1",
        other => other,
    }
}
