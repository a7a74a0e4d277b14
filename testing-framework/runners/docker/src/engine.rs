use std::{collections::HashMap, io::Read as _, time::Duration};

use async_trait::async_trait;
use bollard::{
    container::LogOutput,
    errors::Error as DockerError,
    exec::{CreateExecOptions, StartExecOptions, StartExecResults},
    models::{
        ContainerCreateBody, ContainerInspectResponse, ContainerStateStatusEnum, HostConfig, Ipam,
        IpamConfig, Network, NetworkCreateRequest, PortBinding as ApiPortBinding,
        VolumeCreateOptions,
    },
    query_parameters::{
        CreateContainerOptionsBuilder, CreateImageOptionsBuilder,
        DownloadFromContainerOptionsBuilder, InspectContainerOptions, ListContainersOptions,
        ListNetworksOptions, ListVolumesOptions, LogsOptionsBuilder,
        RemoveContainerOptionsBuilder, RemoveVolumeOptionsBuilder, StartContainerOptions,
        StopContainerOptionsBuilder, UploadToContainerOptionsBuilder, WaitContainerOptions,
    },
};
use bytes::Bytes;
use futures_util::{StreamExt as _, TryStreamExt as _};
use http_body_util::{Either, Full};
use interchaintest_core::{
    adjust_timeout,
    substrate::{
        ContainerEngine, ContainerSpec, ContainerState, ContainerSummary, EngineError,
        ExecOutput, HostBinding, LabelFilter, Labels, NetworkSummary,
    },
};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::client::{DockerEngine, Resource, api_error};

fn label_filters(filter: &LabelFilter) -> HashMap<String, Vec<String>> {
    HashMap::from([(
        "label".to_owned(),
        vec![format!("{}={}", filter.key, filter.value)],
    )])
}

fn labels_map(labels: &Labels) -> HashMap<String, String> {
    labels.clone().into_iter().collect()
}

fn labels_from(labels: Option<HashMap<String, String>>) -> Labels {
    labels.unwrap_or_default().into_iter().collect()
}

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    (!values.is_empty()).then(|| values.to_vec())
}

/// `repository:tag`, where a registry port is not a tag.
pub(crate) fn split_image_ref(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((repository, tag)) if !tag.contains('/') => (repository, tag),
        _ => (image, "latest"),
    }
}

/// Request body for a spec. An empty entrypoint clears the image's own.
pub(crate) fn container_body(spec: &ContainerSpec) -> ContainerCreateBody {
    let exposed_ports = spec
        .ports
        .iter()
        .map(|port| (port.container_port.clone(), HashMap::new()))
        .collect();
    let port_bindings = spec
        .ports
        .iter()
        .map(|port| {
            let binding = ApiPortBinding {
                host_ip: Some(port.host_ip.clone()),
                host_port: port.host_port.map(|p| p.to_string()),
            };
            (port.container_port.clone(), Some(vec![binding]))
        })
        .collect();
    let entrypoint = spec.entrypoint.as_ref().map(|words| {
        if words.is_empty() {
            vec![String::new()]
        } else {
            words.clone()
        }
    });

    ContainerCreateBody {
        image: Some(spec.image.clone()),
        cmd: non_empty(&spec.cmd),
        entrypoint,
        env: non_empty(&spec.env),
        user: spec.user.clone(),
        hostname: spec.hostname.clone(),
        working_dir: spec.working_dir.clone(),
        labels: Some(labels_map(&spec.labels)),
        exposed_ports: Some(exposed_ports),
        host_config: Some(HostConfig {
            binds: non_empty(&spec.binds),
            network_mode: spec.network_id.clone(),
            port_bindings: Some(port_bindings),
            ..HostConfig::default()
        }),
        ..ContainerCreateBody::default()
    }
}

pub(crate) fn container_state(inspected: ContainerInspectResponse) -> ContainerState {
    let state = inspected.state.unwrap_or_default();
    let ports = inspected
        .network_settings
        .and_then(|settings| settings.ports)
        .unwrap_or_default()
        .into_iter()
        .map(|(port, bindings)| {
            let bindings = bindings
                .unwrap_or_default()
                .into_iter()
                .filter_map(|binding| {
                    let port = binding.host_port?.parse().ok()?;
                    Some(HostBinding {
                        ip: binding.host_ip.unwrap_or_default(),
                        port,
                    })
                })
                .collect();
            (port, bindings)
        })
        .collect();
    let running = state.running.unwrap_or(false);
    let exited = !running && state.status == Some(ContainerStateStatusEnum::EXITED);
    ContainerState {
        id: inspected.id.unwrap_or_default(),
        name: inspected
            .name
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_owned(),
        running,
        paused: state.paused.unwrap_or(false),
        exit_code: if exited { state.exit_code } else { None },
        ports,
        labels: labels_from(inspected.config.and_then(|config| config.labels)),
    }
}

pub(crate) fn network_summary(network: Network) -> NetworkSummary {
    let subnets = network
        .ipam
        .and_then(|ipam| ipam.config)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|config| config.subnet)
        .filter(|subnet| !subnet.is_empty())
        .collect();
    NetworkSummary {
        id: network.id.unwrap_or_default(),
        name: network.name.unwrap_or_default(),
        subnets,
        labels: labels_from(network.labels),
    }
}

/// Sorts a log frame into `(stdout, stderr)`.
pub(crate) fn append_log(out: &mut (Vec<u8>, Vec<u8>), frame: LogOutput) {
    match frame {
        LogOutput::StdErr { message } => out.1.extend_from_slice(&message),
        LogOutput::StdOut { message } | LogOutput::Console { message } => {
            out.0.extend_from_slice(&message);
        }
        LogOutput::StdIn { .. } => {}
    }
}

/// A tar archive holding `path` as its only file, and the directory it
/// has to be extracted into.
pub(crate) fn tar_file(path: &str, content: &[u8]) -> Result<(String, Vec<u8>), EngineError> {
    let (dir, name) = match path.rsplit_once('/') {
        Some(("", name)) => ("/", name),
        Some((dir, name)) => (dir, name),
        None => ("/", path),
    };
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, name, content)?;
    Ok((dir.to_owned(), builder.into_inner()?))
}

/// Content of the first regular file of a tar archive.
pub(crate) fn untar_file(archive: &[u8], path: &str) -> Result<Vec<u8>, EngineError> {
    let mut archive = tar::Archive::new(archive);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_file() {
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            return Ok(content);
        }
    }
    Err(EngineError::Parse {
        context: format!("copy {path}"),
        message: "archive holds no regular file".to_owned(),
    })
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "image already present");
            return Ok(());
        }
        info!(image, "pulling image");
        let (repository, tag) = split_image_ref(image);
        let options = CreateImageOptionsBuilder::default()
            .from_image(repository)
            .tag(tag)
            .build();
        let pull = self
            .docker
            .create_image(Some(options), None, None)
            .try_for_each(|_| async { Ok(()) });
        let limit = adjust_timeout(self.pull_timeout);
        timeout(limit, pull)
            .await
            .map_err(|_| EngineError::Timeout {
                command: format!("pull {image}"),
                timeout: limit,
            })?
            .map_err(|err| api_error("pull image", Some(Resource::image(image)), err))
    }

    async fn create_volume(&self, labels: &Labels) -> Result<String, EngineError> {
        let volume = self
            .docker
            .create_volume(VolumeCreateOptions {
                labels: Some(labels_map(labels)),
                ..VolumeCreateOptions::default()
            })
            .await
            .map_err(|err| api_error("create volume", None, err))?;
        Ok(volume.name)
    }

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        let options = RemoveVolumeOptionsBuilder::default().force(true).build();
        self.docker
            .remove_volume(name, Some(options))
            .await
            .map_err(|err| api_error("remove volume", Some(Resource::volume(name)), err))
    }

    async fn list_volumes(&self, filter: &LabelFilter) -> Result<Vec<String>, EngineError> {
        let options = ListVolumesOptions {
            filters: Some(label_filters(filter)),
            ..ListVolumesOptions::default()
        };
        let listed = self
            .docker
            .list_volumes(Some(options))
            .await
            .map_err(|err| api_error("list volumes", None, err))?;
        Ok(listed
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|volume| volume.name)
            .collect())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let options = CreateContainerOptionsBuilder::default()
            .name(&spec.name)
            .build();
        let created = self
            .docker
            .create_container(Some(options), container_body(spec))
            .await
            .map_err(|err| {
                api_error("create container", Some(Resource::container(&spec.name)), err)
            })?;
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(|err| api_error("start container", Some(Resource::container(id)), err))
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), EngineError> {
        let seconds = i32::try_from(timeout.as_secs().max(1)).unwrap_or(i32::MAX);
        let options = StopContainerOptionsBuilder::default().t(seconds).build();
        self.docker
            .stop_container(id, Some(options))
            .await
            .map_err(|err| api_error("stop container", Some(Resource::container(id)), err))
    }

    async fn pause_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .pause_container(id)
            .await
            .map_err(|err| api_error("pause container", Some(Resource::container(id)), err))
    }

    async fn unpause_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .unpause_container(id)
            .await
            .map_err(|err| api_error("unpause container", Some(Resource::container(id)), err))
    }

    async fn wait_container(&self, id: &str) -> Result<i64, EngineError> {
        let mut waits = self.docker.wait_container(id, None::<WaitContainerOptions>);
        match waits.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Non-zero exits arrive as errors.
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(err)) => Err(api_error(
                "wait for container",
                Some(Resource::container(id)),
                err,
            )),
            None => Err(EngineError::Parse {
                context: format!("wait for container {id}"),
                message: "daemon closed the wait stream without a status".to_owned(),
            }),
        }
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError> {
        let options = RemoveContainerOptionsBuilder::default().force(force).build();
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|err| api_error("remove container", Some(Resource::container(id)), err))
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerState, EngineError> {
        self.docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map(container_state)
            .map_err(|err| api_error("inspect container", Some(Resource::container(id)), err))
    }

    async fn list_containers(
        &self,
        filter: &LabelFilter,
    ) -> Result<Vec<ContainerSummary>, EngineError> {
        let options = ListContainersOptions {
            all: true,
            filters: Some(label_filters(filter)),
            ..ListContainersOptions::default()
        };
        let listed = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|err| api_error("list containers", None, err))?;
        Ok(listed
            .into_iter()
            .map(|container| ContainerSummary {
                id: container.id.unwrap_or_default(),
                name: container
                    .names
                    .unwrap_or_default()
                    .first()
                    .map(|name| name.trim_start_matches('/').to_owned())
                    .unwrap_or_default(),
                labels: labels_from(container.labels),
            })
            .collect())
    }

    async fn exec(
        &self,
        id: &str,
        cmd: &[String],
        env: &[String],
    ) -> Result<ExecOutput, EngineError> {
        let container = Some(Resource::container(id));
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    env: non_empty(env),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..CreateExecOptions::default()
                },
            )
            .await
            .map_err(|err| api_error("create exec", container, err))?;

        let mut streams = (Vec::new(), Vec::new());
        let started = self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .map_err(|err| api_error("start exec", container, err))?;
        if let StartExecResults::Attached { mut output, .. } = started {
            while let Some(frame) = output.next().await {
                let frame = frame.map_err(|err| api_error("read exec output", container, err))?;
                append_log(&mut streams, frame);
            }
        }
        let inspected = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|err| api_error("inspect exec", container, err))?;
        Ok(ExecOutput {
            stdout: streams.0,
            stderr: streams.1,
            exit_code: inspected.exit_code.unwrap_or(-1),
        })
    }

    async fn logs(&self, id: &str, tail: Option<usize>) -> Result<(Vec<u8>, Vec<u8>), EngineError> {
        let tail = tail.map_or_else(|| "all".to_owned(), |lines| lines.to_string());
        let options = LogsOptionsBuilder::default()
            .stdout(true)
            .stderr(true)
            .tail(&tail)
            .build();
        let mut frames = self.docker.logs(id, Some(options));
        let mut streams = (Vec::new(), Vec::new());
        while let Some(frame) = frames.next().await {
            let frame =
                frame.map_err(|err| api_error("read logs", Some(Resource::container(id)), err))?;
            append_log(&mut streams, frame);
        }
        Ok(streams)
    }

    async fn copy_to_container(
        &self,
        id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<(), EngineError> {
        let (dir, archive) = tar_file(path, content)?;
        let options = UploadToContainerOptionsBuilder::default().path(&dir).build();
        self.docker
            .upload_to_container(
                id,
                Some(options),
                Either::Left(Full::new(Bytes::from(archive))),
            )
            .await
            .map_err(|err| api_error("copy to container", Some(Resource::container(id)), err))
    }

    async fn copy_from_container(&self, id: &str, path: &str) -> Result<Vec<u8>, EngineError> {
        let options = DownloadFromContainerOptionsBuilder::default().path(path).build();
        let archive: Vec<u8> = self
            .docker
            .download_from_container(id, Some(options))
            .map_ok(|chunk| chunk.to_vec())
            .try_concat()
            .await
            .map_err(|err| api_error("copy from container", Some(Resource::container(id)), err))?;
        untar_file(&archive, path)
    }

    async fn create_network(
        &self,
        name: &str,
        subnet: &str,
        labels: &Labels,
    ) -> Result<String, EngineError> {
        let request = NetworkCreateRequest {
            name: name.to_owned(),
            driver: Some("bridge".to_owned()),
            ipam: Some(Ipam {
                config: Some(vec![IpamConfig {
                    subnet: Some(subnet.to_owned()),
                    ..IpamConfig::default()
                }]),
                ..Ipam::default()
            }),
            labels: Some(labels_map(labels)),
            ..NetworkCreateRequest::default()
        };
        let created = self
            .docker
            .create_network(request)
            .await
            .map_err(|err| api_error("create network", Some(Resource::network(name)), err))?;
        Ok(created.id)
    }

    async fn remove_network(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .remove_network(id)
            .await
            .map_err(|err| api_error("remove network", Some(Resource::network(id)), err))
    }

    async fn list_networks(&self) -> Result<Vec<NetworkSummary>, EngineError> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions>)
            .await
            .map_err(|err| api_error("list networks", None, err))?;
        Ok(networks.into_iter().map(network_summary).collect())
    }
}
