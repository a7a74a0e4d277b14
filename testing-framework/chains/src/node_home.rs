use std::{collections::BTreeMap, sync::Arc};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use interchaintest_core::{
    chain::{ChainEnvironment, ChainError, DockerImage, modify_toml_file},
    node::{ContainerLifecycle, CreateContainerOptions},
    substrate::{
        ContainerEngine, ExecOutput, Image, JobOptions, VolumeFiles, VolumeOwnerOptions,
        condense_hostname, node_labels, set_volume_owner,
    },
};
use serde::Deserialize;
use sha2::{Digest as _, Sha256};
use toml::{Table, Value};
use tracing::debug;

/// The container plumbing every node shares: a labelled volume mounted at
/// `home_dir`, an image for one-shot jobs over that volume, and the
/// long-running container.
pub(crate) struct NodeHome {
    chain_id: String,
    name: String,
    hostname: String,
    home_dir: String,
    volume: String,
    image: Image,
    files: VolumeFiles,
    lifecycle: ContainerLifecycle,
    test_name: String,
    network_id: String,
}

/// Process settings of the long-running container.
#[derive(Default)]
pub(crate) struct ContainerOptions {
    pub cmd: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    pub ports: Vec<String>,
    pub host_port_overrides: BTreeMap<String, u16>,
    pub env: Vec<String>,
    pub user: Option<String>,
}

impl NodeHome {
    /// Creates the volume and hands it to the image user.
    pub(crate) async fn create(
        env: &ChainEnvironment,
        chain_id: &str,
        name: String,
        home_dir: String,
        image: &DockerImage,
    ) -> Result<Self, ChainError> {
        let volume = env
            .engine
            .create_volume(&node_labels(&env.test_name, &name))
            .await
            .map_err(|err| ChainError::engine(chain_id, err))?;
        set_volume_owner(
            Arc::clone(&env.engine),
            &env.network_id,
            &VolumeOwnerOptions {
                test_name: env.test_name.clone(),
                volume: volume.clone(),
                image_ref: image.image_ref(),
                uid_gid: image.uid_gid.clone(),
            },
        )
        .await
        .map_err(|err| ChainError::engine(chain_id, err))?;
        debug!(node = %name, %volume, "created node volume");

        Ok(Self {
            chain_id: chain_id.to_owned(),
            hostname: condense_hostname(&name),
            home_dir,
            volume,
            image: Image::new(
                Arc::clone(&env.engine),
                &env.test_name,
                &env.network_id,
                image.image_ref(),
                &image.uid_gid,
            ),
            files: VolumeFiles::new(Arc::clone(&env.engine), &env.test_name),
            lifecycle: ContainerLifecycle::new(Arc::clone(&env.engine), &name),
            test_name: env.test_name.clone(),
            network_id: env.network_id.clone(),
            name,
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn hostname(&self) -> &str {
        &self.hostname
    }

    pub(crate) fn home_dir(&self) -> &str {
        &self.home_dir
    }

    pub(crate) fn volume(&self) -> &str {
        &self.volume
    }

    pub(crate) fn chain_id(&self) -> &str {
        &self.chain_id
    }

    pub(crate) fn engine(&self) -> &Arc<dyn ContainerEngine> {
        self.lifecycle.engine()
    }

    pub(crate) fn binds(&self) -> Vec<String> {
        vec![format!("{}:{}", self.volume, self.home_dir)]
    }

    /// Runs `cmd` in a job container over the volume and returns its output
    /// whatever the exit code.
    pub(crate) async fn run_job(
        &self,
        cmd: &[String],
        env: Vec<String>,
        user: Option<String>,
    ) -> Result<ExecOutput, ChainError> {
        let job = format!(
            "{}-{}",
            self.name,
            cmd.get(1).map_or("exec", String::as_str)
        );
        self.image
            .run(
                &job,
                cmd,
                &JobOptions {
                    binds: self.binds(),
                    env,
                    user,
                    ..JobOptions::default()
                },
            )
            .await
            .map_err(|err| ChainError::engine(&self.chain_id, err))
    }

    /// Like [`Self::run_job`], with a non-zero exit turned into
    /// [`ChainError::Command`].
    pub(crate) async fn exec(
        &self,
        cmd: &[String],
        env: Vec<String>,
        user: Option<String>,
    ) -> Result<ExecOutput, ChainError> {
        let output = self.run_job(cmd, env, user).await?;
        if !output.success() {
            return Err(ChainError::command(&self.chain_id, cmd, &output));
        }
        Ok(output)
    }

    pub(crate) async fn read_file(&self, rel_path: &str) -> Result<Vec<u8>, ChainError> {
        self.files
            .read_file(&self.volume, rel_path)
            .await
            .map_err(|err| ChainError::engine(&self.chain_id, err))
    }

    pub(crate) async fn write_file(
        &self,
        rel_path: &str,
        content: &[u8],
    ) -> Result<(), ChainError> {
        self.files
            .write_file(&self.volume, rel_path, content)
            .await
            .map_err(|err| ChainError::engine(&self.chain_id, err))
    }

    pub(crate) async fn modify_toml(
        &self,
        rel_path: &str,
        overrides: &Table,
    ) -> Result<(), ChainError> {
        modify_toml_file(&self.files, &self.volume, rel_path, overrides)
            .await
            .map_err(|source| ChainError::Config {
                chain: self.chain_id.clone(),
                source,
            })
    }

    pub(crate) async fn create_container(
        &self,
        image: &DockerImage,
        opts: ContainerOptions,
    ) -> Result<(), ChainError> {
        self.lifecycle
            .create_container(CreateContainerOptions {
                test_name: self.test_name.clone(),
                network_id: self.network_id.clone(),
                image: image.image_ref(),
                user: opts.user,
                ports: opts.ports,
                host_port_overrides: opts.host_port_overrides,
                binds: self.binds(),
                hostname: self.hostname.clone(),
                cmd: opts.cmd,
                entrypoint: opts.entrypoint,
                env: opts.env,
            })
            .await
            .map_err(|err| ChainError::node(&self.chain_id, err))
    }

    /// Starts the container and returns the host addresses of `ports`.
    pub(crate) async fn start(&self, ports: &[&str]) -> Result<Vec<String>, ChainError> {
        self.lifecycle
            .start_container()
            .await
            .map_err(|err| ChainError::node(&self.chain_id, err))?;
        Ok(self.lifecycle.host_ports(ports).await)
    }

    pub(crate) async fn stop(&self) -> Result<(), ChainError> {
        self.lifecycle
            .stop_container()
            .await
            .map_err(|err| ChainError::node(&self.chain_id, err))
    }
}

pub(crate) fn table<const N: usize>(entries: [(&str, Value); N]) -> Table {
    entries
        .into_iter()
        .map(|(key, value)| (key.to_owned(), value))
        .collect()
}

/// `config.toml` settings for fast blocks and a public RPC listener.
pub(crate) fn tendermint_test_config() -> Table {
    table([
        ("log_level", Value::from("info")),
        (
            "p2p",
            Value::Table(table([
                ("allow_duplicate_ip", Value::from(true)),
                ("addr_book_strict", Value::from(false)),
            ])),
        ),
        (
            "consensus",
            Value::Table(table([
                ("timeout_commit", Value::from("2s")),
                ("timeout_propose", Value::from("2s")),
            ])),
        ),
        (
            "rpc",
            Value::Table(table([
                ("laddr", Value::from("tcp://0.0.0.0:26657")),
                ("allowed_origins", Value::Array(vec![Value::from("*")])),
            ])),
        ),
    ])
}

#[derive(Deserialize)]
struct NodeKeyFile {
    priv_key: NodeKey,
}

#[derive(Deserialize)]
struct NodeKey {
    value: String,
}

/// Tendermint node id: hex of the first 20 bytes of sha256 over the
/// ed25519 public key in `node_key.json`.
pub(crate) fn tendermint_node_id(raw: &[u8]) -> Result<String, String> {
    let file: NodeKeyFile = serde_json::from_slice(raw).map_err(|err| err.to_string())?;
    let key = STANDARD
        .decode(file.priv_key.value.trim())
        .map_err(|err| format!("private key is not base64: {err}"))?;
    // ed25519 private keys are the 32 byte seed followed by the public key.
    if key.len() != 64 {
        return Err(format!("expected a 64 byte ed25519 key, got {} bytes", key.len()));
    }
    let digest = Sha256::digest(&key[32..]);
    Ok(hex::encode(&digest[..20]))
}

#[cfg(test)]
mod tests {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use sha2::{Digest as _, Sha256};

    use super::tendermint_node_id;

    #[test]
    fn node_id_is_truncated_sha256_of_public_key() {
        let mut key = vec![1u8; 32];
        key.extend_from_slice(&[7u8; 32]);
        let file = format!(
            r#"{{"priv_key":{{"type":"tendermint/PrivKeyEd25519","value":"{}"}}}}"#,
            STANDARD.encode(&key)
        );
        let id = tendermint_node_id(file.as_bytes()).expect("node id");
        assert_eq!(id, hex::encode(&Sha256::digest([7u8; 32])[..20]));

        let err = tendermint_node_id(br#"{"priv_key":{"value":"AAAA"}}"#).expect_err("short key");
        assert!(err.contains("64 byte"));
    }
}
