use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;

use crate::substrate::{
    ContainerEngine, ContainerSpec, ContainerState, ContainerSummary, EngineError, ExecOutput,
    HostBinding, LabelFilter, Labels, NODE_OWNER_LABEL, NetworkSummary, cleanup_filter,
};

const STAGED_FILE: &str = "/tmp/.icfile";
const WAIT_POLL: Duration = Duration::from_millis(10);

struct Script {
    needle: String,
    exit_code: i64,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

struct FakeContainer {
    spec: ContainerSpec,
    running: bool,
    paused: bool,
    exit_code: Option<i64>,
    private_files: BTreeMap<String, Vec<u8>>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

struct FakeVolume {
    labels: Labels,
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    containers: BTreeMap<String, FakeContainer>,
    volumes: BTreeMap<String, FakeVolume>,
    networks: BTreeMap<String, NetworkSummary>,
    jobs: Vec<Script>,
    daemon_logs: Vec<(String, Vec<u8>)>,
    created: Vec<ContainerSpec>,
    pulled: Vec<String>,
    execs: Vec<Vec<String>>,
    network_conflicts: usize,
    start_timeouts: usize,
}

impl State {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn container(&mut self, id: &str) -> Result<&mut FakeContainer, EngineError> {
        self.containers.get_mut(id).ok_or_else(|| EngineError::NotFound {
            kind: "container",
            id: id.to_owned(),
        })
    }

    fn script_for(&self, command_line: &str) -> Option<&Script> {
        self.jobs
            .iter()
            .find(|script| command_line.contains(&script.needle))
    }
}

/// In-memory [`ContainerEngine`]. Containers labelled with a node owner keep
/// running until stopped; every other container is a job that completes as
/// soon as it starts, with output taken from the first matching script.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<State>,
}

impl FakeEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Jobs and execs whose command line contains `needle` produce this output.
    pub fn script_job(&self, needle: &str, exit_code: i64, stdout: &[u8], stderr: &[u8]) {
        self.lock().jobs.push(Script {
            needle: needle.to_owned(),
            exit_code,
            stdout: stdout.to_vec(),
            stderr: stderr.to_vec(),
        });
    }

    /// Long-running containers whose command line contains `needle` log this.
    pub fn script_logs(&self, needle: &str, stdout: &[u8]) {
        self.lock()
            .daemon_logs
            .push((needle.to_owned(), stdout.to_vec()));
    }

    /// The next `count` network removals fail as if endpoints were attached.
    pub fn fail_network_removals(&self, count: usize) {
        self.lock().network_conflicts = count;
    }

    /// The next `count` container starts time out.
    pub fn fail_starts_with_timeout(&self, count: usize) {
        self.lock().start_timeouts = count;
    }

    #[must_use]
    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.lock().created.clone()
    }

    #[must_use]
    pub fn pulled_images(&self) -> Vec<String> {
        self.lock().pulled.clone()
    }

    #[must_use]
    pub fn exec_commands(&self) -> Vec<Vec<String>> {
        self.lock().execs.clone()
    }

    #[must_use]
    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    #[must_use]
    pub fn volume_count(&self) -> usize {
        self.lock().volumes.len()
    }

    /// Containers, volumes and networks still labelled for `test_name`.
    #[must_use]
    pub fn labelled_resource_count(&self, test_name: &str) -> usize {
        let filter = cleanup_filter(test_name);
        let state = self.lock();
        state
            .containers
            .values()
            .filter(|c| filter.matches(&c.spec.labels))
            .count()
            + state
                .volumes
                .values()
                .filter(|v| filter.matches(&v.labels))
                .count()
            + state
                .networks
                .values()
                .filter(|n| filter.matches(&n.labels))
                .count()
    }

    #[must_use]
    pub fn volume_file(&self, volume: &str, rel_path: &str) -> Option<Vec<u8>> {
        self.lock()
            .volumes
            .get(volume)
            .and_then(|v| v.files.get(rel_path.trim_start_matches('/')).cloned())
    }

    pub fn put_volume_file(&self, volume: &str, rel_path: &str, content: &[u8]) {
        if let Some(v) = self.lock().volumes.get_mut(volume) {
            v.files
                .insert(rel_path.trim_start_matches('/').to_owned(), content.to_vec());
        }
    }
}

enum Location {
    Volume(String, String),
    Private(String),
}

fn locate(spec: &ContainerSpec, path: &str) -> Location {
    for bind in &spec.binds {
        let Some((volume, mount)) = bind.split_once(':') else {
            continue;
        };
        let mount = mount.split(':').next().unwrap_or(mount);
        if let Some(rest) = path.strip_prefix(mount) {
            if rest.is_empty() || rest.starts_with('/') {
                return Location::Volume(
                    volume.to_owned(),
                    rest.trim_start_matches('/').to_owned(),
                );
            }
        }
    }
    Location::Private(path.to_owned())
}

fn command_line(spec: &ContainerSpec) -> String {
    spec.entrypoint
        .iter()
        .flatten()
        .chain(spec.cmd.iter())
        .cloned()
        .collect::<Vec<_>>()
        .join(" ")
}

fn read_at(
    state: &State,
    spec: &ContainerSpec,
    private: &BTreeMap<String, Vec<u8>>,
    path: &str,
) -> Option<Vec<u8>> {
    match locate(spec, path) {
        Location::Volume(volume, rel) => state
            .volumes
            .get(&volume)
            .and_then(|v| v.files.get(&rel).cloned()),
        Location::Private(path) => private.get(&path).cloned(),
    }
}

fn tail_lines(bytes: &[u8], tail: Option<usize>) -> Vec<u8> {
    let Some(tail) = tail else {
        return bytes.to_vec();
    };
    let text = String::from_utf8_lossy(bytes);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(tail);
    let mut out = lines[start..].join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out.into_bytes()
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        self.lock().pulled.push(image.to_owned());
        Ok(())
    }

    async fn create_volume(&self, labels: &Labels) -> Result<String, EngineError> {
        let mut state = self.lock();
        let name = state.next("vol");
        state.volumes.insert(
            name.clone(),
            FakeVolume {
                labels: labels.clone(),
                files: BTreeMap::new(),
            },
        );
        Ok(name)
    }

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        self.lock()
            .volumes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound {
                kind: "volume",
                id: name.to_owned(),
            })
    }

    async fn list_volumes(&self, filter: &LabelFilter) -> Result<Vec<String>, EngineError> {
        Ok(self
            .lock()
            .volumes
            .iter()
            .filter(|(_, v)| filter.matches(&v.labels))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let mut state = self.lock();
        if state.containers.values().any(|c| c.spec.name == spec.name) {
            return Err(EngineError::Conflict {
                kind: "container",
                id: spec.name.clone(),
                message: "name already in use".to_owned(),
            });
        }
        let id = state.next("ctr");
        state.created.push(spec.clone());
        state.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                running: false,
                paused: false,
                exit_code: None,
                private_files: BTreeMap::new(),
                stdout: Vec::new(),
                stderr: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        if state.start_timeouts > 0 {
            state.start_timeouts -= 1;
            return Err(EngineError::Timeout {
                command: format!("start {id}"),
                timeout: Duration::from_secs(30),
            });
        }

        let spec = state.container(id)?.spec.clone();
        let line = command_line(&spec);

        if spec.labels.contains_key(NODE_OWNER_LABEL) {
            let logs = state
                .daemon_logs
                .iter()
                .find(|(needle, _)| line.contains(needle))
                .map(|(_, logs)| logs.clone())
                .unwrap_or_default();
            let container = state.container(id)?;
            container.running = true;
            container.exit_code = None;
            container.stdout = logs;
            return Ok(());
        }

        if line.contains(STAGED_FILE) {
            // Volume file writer: move the staged file onto its target.
            let staged = state.container(id)?.private_files.get(STAGED_FILE).cloned();
            let target = spec.cmd.first().cloned().unwrap_or_default();
            let exit_code = match (staged, locate(&spec, &target)) {
                (Some(content), Location::Volume(volume, rel)) => {
                    match state.volumes.get_mut(&volume) {
                        Some(v) => {
                            v.files.insert(rel, content);
                            0
                        }
                        None => 1,
                    }
                }
                _ => 1,
            };
            state.container(id)?.exit_code = Some(exit_code);
            return Ok(());
        }

        let (exit_code, stdout, stderr) = state
            .script_for(&line)
            .map(|s| (s.exit_code, s.stdout.clone(), s.stderr.clone()))
            .unwrap_or_default();
        let container = state.container(id)?;
        container.exit_code = Some(exit_code);
        container.stdout = stdout;
        container.stderr = stderr;
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> Result<(), EngineError> {
        let mut state = self.lock();
        let container = state.container(id)?;
        if container.running {
            container.running = false;
            container.paused = false;
            container.exit_code = Some(0);
        }
        Ok(())
    }

    async fn pause_container(&self, id: &str) -> Result<(), EngineError> {
        self.lock().container(id)?.paused = true;
        Ok(())
    }

    async fn unpause_container(&self, id: &str) -> Result<(), EngineError> {
        self.lock().container(id)?.paused = false;
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, EngineError> {
        loop {
            {
                let mut state = self.lock();
                let container = state.container(id)?;
                if !container.running {
                    return Ok(container.exit_code.unwrap_or(0));
                }
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError> {
        let mut state = self.lock();
        if state.container(id)?.running && !force {
            return Err(EngineError::Conflict {
                kind: "container",
                id: id.to_owned(),
                message: "container is running".to_owned(),
            });
        }
        state.containers.remove(id);
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerState, EngineError> {
        let mut state = self.lock();
        let container = state.container(id)?;
        let ports = container
            .spec
            .ports
            .iter()
            .map(|binding| {
                (
                    binding.container_port.clone(),
                    vec![HostBinding {
                        ip: binding.host_ip.clone(),
                        port: binding.host_port.unwrap_or_default(),
                    }],
                )
            })
            .collect();
        Ok(ContainerState {
            id: id.to_owned(),
            name: container.spec.name.clone(),
            running: container.running,
            paused: container.paused,
            exit_code: container.exit_code,
            ports,
            labels: container.spec.labels.clone(),
        })
    }

    async fn list_containers(
        &self,
        filter: &LabelFilter,
    ) -> Result<Vec<ContainerSummary>, EngineError> {
        Ok(self
            .lock()
            .containers
            .iter()
            .filter(|(_, c)| filter.matches(&c.spec.labels))
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                name: c.spec.name.clone(),
                labels: c.spec.labels.clone(),
            })
            .collect())
    }

    async fn exec(
        &self,
        id: &str,
        cmd: &[String],
        _env: &[String],
    ) -> Result<ExecOutput, EngineError> {
        let mut state = self.lock();
        if !state.container(id)?.running {
            return Err(EngineError::Conflict {
                kind: "container",
                id: id.to_owned(),
                message: "container is not running".to_owned(),
            });
        }
        state.execs.push(cmd.to_vec());
        let line = cmd.join(" ");
        Ok(state
            .script_for(&line)
            .map(|s| ExecOutput {
                stdout: s.stdout.clone(),
                stderr: s.stderr.clone(),
                exit_code: s.exit_code,
            })
            .unwrap_or_default())
    }

    async fn logs(&self, id: &str, tail: Option<usize>) -> Result<(Vec<u8>, Vec<u8>), EngineError> {
        let mut state = self.lock();
        let container = state.container(id)?;
        Ok((
            tail_lines(&container.stdout, tail),
            tail_lines(&container.stderr, tail),
        ))
    }

    async fn copy_to_container(
        &self,
        id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<(), EngineError> {
        let mut state = self.lock();
        let spec = state.container(id)?.spec.clone();
        match locate(&spec, path) {
            Location::Volume(volume, rel) => {
                let v = state.volumes.get_mut(&volume).ok_or_else(|| EngineError::NotFound {
                    kind: "volume",
                    id: volume.clone(),
                })?;
                v.files.insert(rel, content.to_vec());
            }
            Location::Private(path) => {
                state
                    .container(id)?
                    .private_files
                    .insert(path, content.to_vec());
            }
        }
        Ok(())
    }

    async fn copy_from_container(&self, id: &str, path: &str) -> Result<Vec<u8>, EngineError> {
        let mut state = self.lock();
        let container = state.container(id)?;
        let spec = container.spec.clone();
        let private = container.private_files.clone();
        read_at(&state, &spec, &private, path).ok_or_else(|| EngineError::NotFound {
            kind: "file",
            id: path.to_owned(),
        })
    }

    async fn create_network(
        &self,
        name: &str,
        subnet: &str,
        labels: &Labels,
    ) -> Result<String, EngineError> {
        let mut state = self.lock();
        let id = state.next("net");
        state.networks.insert(
            id.clone(),
            NetworkSummary {
                id: id.clone(),
                name: name.to_owned(),
                subnets: vec![subnet.to_owned()],
                labels: labels.clone(),
            },
        );
        Ok(id)
    }

    async fn remove_network(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        if !state.networks.contains_key(id) {
            return Err(EngineError::NotFound {
                kind: "network",
                id: id.to_owned(),
            });
        }
        if state.network_conflicts > 0 {
            state.network_conflicts -= 1;
            return Err(EngineError::Conflict {
                kind: "network",
                id: id.to_owned(),
                message: "network has active endpoints".to_owned(),
            });
        }
        state.networks.remove(id);
        Ok(())
    }

    async fn list_networks(&self) -> Result<Vec<NetworkSummary>, EngineError> {
        Ok(self.lock().networks.values().cloned().collect())
    }
}
