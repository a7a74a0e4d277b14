//! Relayers that run their CLI as one-shot job containers and relay from one
//! long-running daemon, all over a single volume mounted at [`RELAYER_HOME`].

use std::{
    collections::BTreeMap,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use interchaintest_core::{
    adjust_timeout,
    chain::{ChainConfig, ChainEnvironment, DockerImage},
    node::{ContainerLifecycle, CreateContainerOptions, NodeError},
    relayer::{
        Capabilities, ChannelFilter, ChannelOutput, ClientOutput, ConnectionOutput,
        CreateChannelOptions, CreateClientOptions, Relayer, RelayerError, RelayerExec,
        RelayerExecReporter,
    },
    substrate::{
        EngineError, ExecOutput, Image, JobOptions, VolumeFiles, VolumeOwnerOptions,
        condense_hostname, node_labels, sanitize_name, set_volume_owner,
    },
    wallet::{Wallet, cosmos::decode_bech32},
};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Mount point of the relayer volume in every job and in the daemon.
pub const RELAYER_HOME: &str = "/home/relayer";

pub(crate) const CONFIG_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const QUERY_TIMEOUT: Duration = Duration::from_secs(3 * 60);
pub(crate) const TX_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const STOP_LOG_LINES: usize = 50;

/// A key imported or generated by the relayer CLI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayerKey {
    pub address: String,
    pub mnemonic: String,
}

/// Command vocabulary of one relayer family. [`DockerRelayer`] takes care of
/// jobs, reporting, locking, wallets and the daemon; the commander decides
/// what runs and how its output reads.
///
/// Operations a family lacks keep the default body and report
/// [`RelayerError::Unsupported`].
#[async_trait]
pub trait RelayerCommander: Send + Sync {
    fn name(&self) -> &'static str;

    fn default_image(&self) -> DockerImage;

    fn capabilities(&self) -> Capabilities;

    /// Prepares the home directory. Runs once, before the first chain is
    /// added.
    async fn init(&self, _jobs: &RelayerJobs<'_>) -> Result<(), RelayerError> {
        Ok(())
    }

    async fn add_chain_configuration(
        &self,
        jobs: &RelayerJobs<'_>,
        config: &ChainConfig,
        key_name: &str,
        rpc_addr: &str,
        grpc_addr: &str,
    ) -> Result<(), RelayerError>;

    /// Imports `mnemonic` as `key_name` and returns the signer address.
    async fn restore_key(
        &self,
        jobs: &RelayerJobs<'_>,
        config: &ChainConfig,
        key_name: &str,
        mnemonic: &str,
    ) -> Result<String, RelayerError>;

    async fn add_key(
        &self,
        _jobs: &RelayerJobs<'_>,
        _config: &ChainConfig,
        _key_name: &str,
        _coin_type: &str,
    ) -> Result<RelayerKey, RelayerError> {
        Err(RelayerError::unsupported(self.name(), "add_key"))
    }

    async fn generate_path(
        &self,
        jobs: &RelayerJobs<'_>,
        src_chain_id: &str,
        dst_chain_id: &str,
        path_name: &str,
    ) -> Result<(), RelayerError>;

    async fn update_path(
        &self,
        _jobs: &RelayerJobs<'_>,
        _path_name: &str,
        _filter: &ChannelFilter,
    ) -> Result<(), RelayerError> {
        Err(RelayerError::unsupported(self.name(), "update_path"))
    }

    /// Clients, connection and channel in one command. Without one the base
    /// runs the three steps in turn.
    async fn link_path(
        &self,
        _jobs: &RelayerJobs<'_>,
        _path_name: &str,
        _channel_opts: &CreateChannelOptions,
        _client_opts: &CreateClientOptions,
    ) -> Result<(), RelayerError> {
        Err(RelayerError::unsupported(self.name(), "link_path"))
    }

    async fn create_clients(
        &self,
        jobs: &RelayerJobs<'_>,
        path_name: &str,
        opts: &CreateClientOptions,
    ) -> Result<(), RelayerError>;

    async fn create_connections(
        &self,
        jobs: &RelayerJobs<'_>,
        path_name: &str,
    ) -> Result<(), RelayerError>;

    async fn create_channel(
        &self,
        jobs: &RelayerJobs<'_>,
        path_name: &str,
        opts: &CreateChannelOptions,
    ) -> Result<(), RelayerError>;

    async fn update_clients(
        &self,
        _jobs: &RelayerJobs<'_>,
        _path_name: &str,
    ) -> Result<(), RelayerError> {
        Err(RelayerError::unsupported(self.name(), "update_clients"))
    }

    async fn flush(
        &self,
        _jobs: &RelayerJobs<'_>,
        _path_name: &str,
        _channel_id: &str,
    ) -> Result<(), RelayerError> {
        Err(RelayerError::unsupported(self.name(), "flush"))
    }

    async fn get_channels(
        &self,
        jobs: &RelayerJobs<'_>,
        chain_id: &str,
    ) -> Result<Vec<ChannelOutput>, RelayerError>;

    async fn get_connections(
        &self,
        jobs: &RelayerJobs<'_>,
        chain_id: &str,
    ) -> Result<Vec<ConnectionOutput>, RelayerError>;

    async fn get_clients(
        &self,
        jobs: &RelayerJobs<'_>,
        chain_id: &str,
    ) -> Result<Vec<ClientOutput>, RelayerError>;

    /// Command line of the relaying daemon.
    fn start_command(&self, home_dir: &str, path_names: &[String])
    -> Result<Vec<String>, RelayerError>;
}

/// The relayer volume plus the image its jobs run in.
struct RelayerHome {
    relayer: &'static str,
    volume: String,
    image: Image,
    files: VolumeFiles,
}

impl RelayerHome {
    fn binds(&self) -> Vec<String> {
        vec![format!("{}:{RELAYER_HOME}", self.volume)]
    }

    fn engine_error(&self, source: EngineError) -> RelayerError {
        RelayerError::Engine {
            relayer: self.relayer.to_owned(),
            source,
        }
    }

    /// Runs `cmd` as a job over the volume and reports it whatever the
    /// outcome. A non-zero exit is an error.
    async fn run(
        &self,
        rep: &dyn RelayerExecReporter,
        cmd: &[String],
        env: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, RelayerError> {
        let job = format!(
            "{}-{}",
            self.relayer,
            cmd.get(1).map_or("exec", String::as_str)
        );
        let timeout = adjust_timeout(timeout);
        let options = JobOptions {
            binds: self.binds(),
            env: env.to_vec(),
            entrypoint: Some(Vec::new()),
            ..JobOptions::default()
        };

        let started_at = OffsetDateTime::now_utc();
        let outcome = tokio::time::timeout(timeout, self.image.run(&job, cmd, &options)).await;
        let mut exec = RelayerExec {
            container_name: job,
            command: cmd.to_vec(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: -1,
            started_at,
            finished_at: OffsetDateTime::now_utc(),
            error: None,
        };

        let result = match outcome {
            Err(_) => {
                exec.error = Some(format!("timed out after {timeout:?}"));
                Err(RelayerError::Timeout {
                    relayer: self.relayer.to_owned(),
                    command: cmd.to_vec(),
                    timeout,
                })
            }
            Ok(Err(source)) => {
                exec.error = Some(source.to_string());
                Err(self.engine_error(source))
            }
            Ok(Ok(output)) => {
                exec.stdout = output.stdout_string();
                exec.stderr = output.stderr_string();
                exec.exit_code = output.exit_code;
                if output.success() {
                    Ok(output)
                } else {
                    Err(RelayerError::command(self.relayer, cmd, &output))
                }
            }
        };

        debug!(
            relayer = self.relayer,
            job = %exec.container_name,
            command = %cmd.join(" "),
            exit_code = exec.exit_code,
            stdout = %exec.stdout,
            stderr = %exec.stderr,
            "relayer command finished"
        );
        rep.track_relayer_exec(exec);
        result
    }
}

/// What a commander may do against the relayer home within one operation.
pub struct RelayerJobs<'a> {
    home: &'a RelayerHome,
    rep: &'a dyn RelayerExecReporter,
}

impl RelayerJobs<'_> {
    #[must_use]
    pub const fn home_dir(&self) -> &'static str {
        RELAYER_HOME
    }

    #[must_use]
    pub const fn relayer(&self) -> &'static str {
        self.home.relayer
    }

    /// Runs one CLI invocation; see [`RelayerCommander`] for the timeouts
    /// each operation uses.
    pub async fn run(&self, cmd: &[String], timeout: Duration) -> Result<ExecOutput, RelayerError> {
        self.home.run(self.rep, cmd, &[], timeout).await
    }

    /// Reads a file relative to the home directory.
    pub async fn read_file(&self, rel_path: &str) -> Result<Vec<u8>, RelayerError> {
        self.home
            .files
            .read_file(&self.home.volume, rel_path)
            .await
            .map_err(|source| self.home.engine_error(source))
    }

    pub async fn write_file(&self, rel_path: &str, content: &[u8]) -> Result<(), RelayerError> {
        self.home
            .files
            .write_file(&self.home.volume, rel_path, content)
            .await
            .map_err(|source| self.home.engine_error(source))
    }
}

/// Construction settings shared by every family.
#[derive(Clone, Debug, Default)]
pub struct RelayerOptions {
    /// Replaces the commander's default image.
    pub image: Option<DockerImage>,
    /// Skips the pull for locally built images.
    pub skip_pull: bool,
    /// Appended to the daemon command line.
    pub extra_start_flags: Vec<String>,
}

struct Daemon {
    lifecycle: ContainerLifecycle,
    command: Vec<String>,
    started_at: OffsetDateTime,
}

/// A [`Relayer`] driven through a [`RelayerCommander`].
pub struct DockerRelayer<C> {
    commander: C,
    name: String,
    env: ChainEnvironment,
    image: DockerImage,
    home: RelayerHome,
    extra_start_flags: Vec<String>,
    /// Serializes config mutations; the flag records whether init ran.
    config_lock: Mutex<bool>,
    chains: RwLock<BTreeMap<String, ChainConfig>>,
    wallets: RwLock<BTreeMap<String, Wallet>>,
    daemon: Mutex<Option<Daemon>>,
}

impl<C: RelayerCommander> DockerRelayer<C> {
    /// Pulls the image and creates the relayer volume, owned by the image
    /// user.
    pub async fn new(
        env: &ChainEnvironment,
        commander: C,
        options: RelayerOptions,
    ) -> Result<Self, RelayerError> {
        let relayer = commander.name();
        let engine_error = |source| RelayerError::Engine {
            relayer: relayer.to_owned(),
            source,
        };
        let image = options.image.unwrap_or_else(|| commander.default_image());
        if !options.skip_pull {
            env.engine
                .pull_image(&image.image_ref())
                .await
                .map_err(engine_error)?;
        }

        let name = format!("{relayer}-{}", sanitize_name(&env.test_name));
        let volume = env
            .engine
            .create_volume(&node_labels(&env.test_name, &name))
            .await
            .map_err(engine_error)?;
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
        .map_err(engine_error)?;
        info!(relayer, image = %image.image_ref(), %volume, "created relayer home");

        Ok(Self {
            home: RelayerHome {
                relayer,
                volume,
                image: Image::new(
                    Arc::clone(&env.engine),
                    &env.test_name,
                    &env.network_id,
                    image.image_ref(),
                    &image.uid_gid,
                ),
                files: VolumeFiles::new(Arc::clone(&env.engine), &env.test_name),
            },
            commander,
            name,
            env: env.clone(),
            image,
            extra_start_flags: options.extra_start_flags,
            config_lock: Mutex::new(false),
            chains: RwLock::new(BTreeMap::new()),
            wallets: RwLock::new(BTreeMap::new()),
            daemon: Mutex::new(None),
        })
    }

    /// `<family>-<test name>`; prefixes the daemon container name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn commander(&self) -> &C {
        &self.commander
    }

    #[must_use]
    pub fn volume(&self) -> &str {
        &self.home.volume
    }

    #[must_use]
    pub const fn image(&self) -> &DockerImage {
        &self.image
    }

    pub(crate) const fn jobs<'a>(&'a self, rep: &'a dyn RelayerExecReporter) -> RelayerJobs<'a> {
        RelayerJobs {
            home: &self.home,
            rep,
        }
    }

    fn node_error(&self, source: NodeError) -> RelayerError {
        RelayerError::Node {
            relayer: self.commander.name().to_owned(),
            source,
        }
    }

    pub(crate) fn chain_config(&self, chain_id: &str) -> Result<ChainConfig, RelayerError> {
        self.chains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(chain_id)
            .cloned()
            .ok_or_else(|| RelayerError::UnknownChain {
                relayer: self.commander.name().to_owned(),
                chain_id: chain_id.to_owned(),
            })
    }

    fn store_wallet(&self, config: &ChainConfig, key_name: &str, key: RelayerKey) -> Wallet {
        let address_bytes = decode_bech32(&key.address)
            .map(|(_, bytes)| bytes)
            .unwrap_or_default();
        let wallet = Wallet::new(
            key_name.to_owned(),
            key.address,
            address_bytes,
            Some(key.mnemonic),
            config.clone(),
        );
        self.wallets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(config.chain_id.clone(), wallet.clone());
        wallet
    }

    fn daemon_name(&self, path_names: &[String]) -> String {
        if path_names.is_empty() {
            format!("{}-daemon", self.name)
        } else {
            format!("{}-{}", self.name, sanitize_name(&path_names.join("-")))
        }
    }
}

#[async_trait]
impl<C: RelayerCommander> Relayer for DockerRelayer<C> {
    fn capabilities(&self) -> Capabilities {
        self.commander.capabilities()
    }

    fn use_docker_network(&self) -> bool {
        true
    }

    async fn add_chain_configuration(
        &self,
        rep: &dyn RelayerExecReporter,
        config: &ChainConfig,
        key_name: &str,
        rpc_addr: &str,
        grpc_addr: &str,
    ) -> Result<(), RelayerError> {
        let mut initialized = self.config_lock.lock().await;
        let jobs = self.jobs(rep);
        if !*initialized {
            self.commander.init(&jobs).await?;
            *initialized = true;
        }
        self.commander
            .add_chain_configuration(&jobs, config, key_name, rpc_addr, grpc_addr)
            .await?;
        self.chains
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(config.chain_id.clone(), config.clone());
        debug!(
            relayer = %self.name,
            chain_id = %config.chain_id,
            rpc_addr,
            "added chain configuration"
        );
        Ok(())
    }

    async fn restore_key(
        &self,
        rep: &dyn RelayerExecReporter,
        config: &ChainConfig,
        key_name: &str,
        mnemonic: &str,
    ) -> Result<(), RelayerError> {
        let _config = self.config_lock.lock().await;
        let address = self
            .commander
            .restore_key(&self.jobs(rep), config, key_name, mnemonic)
            .await?;
        let key = RelayerKey {
            address,
            mnemonic: mnemonic.to_owned(),
        };
        let wallet = self.store_wallet(config, key_name, key);
        debug!(
            relayer = %self.name,
            chain_id = %config.chain_id,
            address = %wallet.formatted_address(),
            "restored relayer key"
        );
        Ok(())
    }

    async fn add_key(
        &self,
        rep: &dyn RelayerExecReporter,
        chain_id: &str,
        key_name: &str,
        coin_type: &str,
    ) -> Result<Wallet, RelayerError> {
        let config = self.chain_config(chain_id)?;
        let key = self
            .commander
            .add_key(&self.jobs(rep), &config, key_name, coin_type)
            .await?;
        Ok(self.store_wallet(&config, key_name, key))
    }

    async fn get_wallet(&self, chain_id: &str) -> Option<Wallet> {
        self.wallets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(chain_id)
            .cloned()
    }

    async fn generate_path(
        &self,
        rep: &dyn RelayerExecReporter,
        src_chain_id: &str,
        dst_chain_id: &str,
        path_name: &str,
    ) -> Result<(), RelayerError> {
        let _config = self.config_lock.lock().await;
        self.commander
            .generate_path(&self.jobs(rep), src_chain_id, dst_chain_id, path_name)
            .await
    }

    async fn update_path(
        &self,
        rep: &dyn RelayerExecReporter,
        path_name: &str,
        filter: &ChannelFilter,
    ) -> Result<(), RelayerError> {
        let _config = self.config_lock.lock().await;
        self.commander
            .update_path(&self.jobs(rep), path_name, filter)
            .await
    }

    async fn link_path(
        &self,
        rep: &dyn RelayerExecReporter,
        path_name: &str,
        channel_opts: &CreateChannelOptions,
        client_opts: &CreateClientOptions,
    ) -> Result<(), RelayerError> {
        let jobs = self.jobs(rep);
        match self
            .commander
            .link_path(&jobs, path_name, channel_opts, client_opts)
            .await
        {
            Err(err) if err.is_unsupported() => {
                debug!(relayer = %self.name, path = path_name, "linking path step by step");
                self.commander
                    .create_clients(&jobs, path_name, client_opts)
                    .await?;
                self.commander.create_connections(&jobs, path_name).await?;
                self.commander
                    .create_channel(&jobs, path_name, channel_opts)
                    .await
            }
            other => other,
        }
    }

    async fn create_clients(
        &self,
        rep: &dyn RelayerExecReporter,
        path_name: &str,
        opts: &CreateClientOptions,
    ) -> Result<(), RelayerError> {
        self.commander
            .create_clients(&self.jobs(rep), path_name, opts)
            .await
    }

    async fn create_connections(
        &self,
        rep: &dyn RelayerExecReporter,
        path_name: &str,
    ) -> Result<(), RelayerError> {
        self.commander
            .create_connections(&self.jobs(rep), path_name)
            .await
    }

    async fn create_channel(
        &self,
        rep: &dyn RelayerExecReporter,
        path_name: &str,
        opts: &CreateChannelOptions,
    ) -> Result<(), RelayerError> {
        self.commander
            .create_channel(&self.jobs(rep), path_name, opts)
            .await
    }

    async fn update_clients(
        &self,
        rep: &dyn RelayerExecReporter,
        path_name: &str,
    ) -> Result<(), RelayerError> {
        self.commander
            .update_clients(&self.jobs(rep), path_name)
            .await
    }

    async fn flush(
        &self,
        rep: &dyn RelayerExecReporter,
        path_name: &str,
        channel_id: &str,
    ) -> Result<(), RelayerError> {
        self.commander
            .flush(&self.jobs(rep), path_name, channel_id)
            .await
    }

    async fn get_channels(
        &self,
        rep: &dyn RelayerExecReporter,
        chain_id: &str,
    ) -> Result<Vec<ChannelOutput>, RelayerError> {
        self.commander.get_channels(&self.jobs(rep), chain_id).await
    }

    async fn get_connections(
        &self,
        rep: &dyn RelayerExecReporter,
        chain_id: &str,
    ) -> Result<Vec<ConnectionOutput>, RelayerError> {
        self.commander
            .get_connections(&self.jobs(rep), chain_id)
            .await
    }

    async fn get_clients(
        &self,
        rep: &dyn RelayerExecReporter,
        chain_id: &str,
    ) -> Result<Vec<ClientOutput>, RelayerError> {
        self.commander.get_clients(&self.jobs(rep), chain_id).await
    }

    async fn start_relayer(
        &self,
        _rep: &dyn RelayerExecReporter,
        path_names: &[String],
    ) -> Result<(), RelayerError> {
        let mut daemon = self.daemon.lock().await;
        if daemon.is_some() {
            return Err(RelayerError::Config {
                relayer: self.commander.name().to_owned(),
                message: "relayer is already running".to_owned(),
            });
        }

        let mut command = self.commander.start_command(RELAYER_HOME, path_names)?;
        command.extend(self.extra_start_flags.iter().cloned());
        let name = self.daemon_name(path_names);
        let lifecycle = ContainerLifecycle::new(Arc::clone(&self.env.engine), name.clone());
        info!(
            relayer = %self.name,
            container = %name,
            command = %command.join(" "),
            "starting relayer"
        );
        lifecycle
            .create_container(CreateContainerOptions {
                test_name: self.env.test_name.clone(),
                network_id: self.env.network_id.clone(),
                image: self.image.image_ref(),
                user: (!self.image.uid_gid.is_empty()).then(|| self.image.uid_gid.clone()),
                binds: self.home.binds(),
                hostname: condense_hostname(&name),
                cmd: command.clone(),
                entrypoint: Some(Vec::new()),
                ..CreateContainerOptions::default()
            })
            .await
            .map_err(|source| self.node_error(source))?;
        let started_at = OffsetDateTime::now_utc();
        if let Err(source) = lifecycle.start_container().await {
            let _ = lifecycle.remove_container().await;
            return Err(self.node_error(source));
        }

        *daemon = Some(Daemon {
            lifecycle,
            command,
            started_at,
        });
        Ok(())
    }

    async fn stop_relayer(&self, rep: &dyn RelayerExecReporter) -> Result<(), RelayerError> {
        let Some(daemon) = self.daemon.lock().await.take() else {
            return Ok(());
        };
        let lifecycle = &daemon.lifecycle;

        let (stdout, stderr) = lifecycle
            .logs(Some(STOP_LOG_LINES))
            .await
            .map_err(|source| self.node_error(source))?;
        lifecycle
            .stop_container()
            .await
            .map_err(|source| self.node_error(source))?;
        let exit_code = match lifecycle.container_id().await {
            Some(id) => self
                .env
                .engine
                .inspect_container(&id)
                .await
                .ok()
                .and_then(|state| state.exit_code)
                .unwrap_or_default(),
            None => 0,
        };

        let exec = RelayerExec {
            container_name: lifecycle.name().to_owned(),
            command: daemon.command.clone(),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
            started_at: daemon.started_at,
            finished_at: OffsetDateTime::now_utc(),
            error: None,
        };
        debug!(
            relayer = %self.name,
            container = %exec.container_name,
            stdout = %exec.stdout,
            stderr = %exec.stderr,
            "stopped relayer"
        );
        rep.track_relayer_exec(exec);

        lifecycle
            .remove_container()
            .await
            .map_err(|source| self.node_error(source))
    }

    async fn exec(
        &self,
        rep: &dyn RelayerExecReporter,
        cmd: &[String],
        env: &[String],
    ) -> Result<ExecOutput, RelayerError> {
        self.home.run(rep, cmd, env, TX_TIMEOUT).await
    }
}

/// `[flag, value]`, or nothing for an empty value.
pub(crate) fn optional_flag(flag: &str, value: &str) -> Vec<String> {
    if value.is_empty() {
        Vec::new()
    } else {
        vec![flag.to_owned(), value.to_owned()]
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex, PoisonError};

    use async_trait::async_trait;
    use interchaintest_core::{
        chain::{ChainConfig, ChainEnvironment, DockerImage},
        relayer::{
            Capabilities, ChannelOutput, ClientOutput, ConnectionOutput, CreateChannelOptions,
            CreateClientOptions, Relayer as _, RelayerError, RelayerExec, RelayerExecReporter,
            full_capabilities,
        },
        testing::FakeEngine,
    };

    use super::{
        CONFIG_TIMEOUT, DockerRelayer, QUERY_TIMEOUT, RelayerCommander, RelayerJobs,
        RelayerOptions,
    };

    /// Keeps every reported exec.
    #[derive(Default)]
    pub(crate) struct CapturingReporter {
        execs: Mutex<Vec<RelayerExec>>,
    }

    impl CapturingReporter {
        pub(crate) fn commands(&self) -> Vec<String> {
            self.execs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .map(|exec| exec.command.join(" "))
                .collect()
        }

        pub(crate) fn execs(&self) -> Vec<RelayerExec> {
            self.execs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    impl RelayerExecReporter for CapturingReporter {
        fn track_relayer_exec(&self, exec: RelayerExec) {
            self.execs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(exec);
        }
    }

    pub(crate) fn environment(engine: &Arc<FakeEngine>, test_name: &str) -> ChainEnvironment {
        ChainEnvironment {
            test_name: test_name.to_owned(),
            engine: engine.clone(),
            network_id: "net".to_owned(),
        }
    }

    pub(crate) fn gaia(chain_id: &str) -> ChainConfig {
        ChainConfig {
            chain_type: "cosmos".to_owned(),
            name: "gaia".to_owned(),
            chain_id: chain_id.to_owned(),
            bin: "gaiad".to_owned(),
            bech32_prefix: "cosmos".to_owned(),
            denom: "uatom".to_owned(),
            coin_type: "118".to_owned(),
            gas_prices: "0.01uatom".to_owned(),
            gas_adjustment: 1.3,
            ..ChainConfig::default()
        }
    }

    /// Runs `echo` for everything and has no link command.
    struct Echo;

    impl Echo {
        fn cmd(step: &str, arg: &str) -> Vec<String> {
            vec!["echo".to_owned(), step.to_owned(), arg.to_owned()]
        }
    }

    #[async_trait]
    impl RelayerCommander for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn default_image(&self) -> DockerImage {
            DockerImage::new("busybox", "stable", "")
        }

        fn capabilities(&self) -> Capabilities {
            full_capabilities()
        }

        async fn init(&self, jobs: &RelayerJobs<'_>) -> Result<(), RelayerError> {
            jobs.run(&Self::cmd("init", "-"), CONFIG_TIMEOUT).await.map(|_| ())
        }

        async fn add_chain_configuration(
            &self,
            jobs: &RelayerJobs<'_>,
            config: &ChainConfig,
            _key_name: &str,
            _rpc_addr: &str,
            _grpc_addr: &str,
        ) -> Result<(), RelayerError> {
            jobs.run(&Self::cmd("add-chain", &config.chain_id), CONFIG_TIMEOUT)
                .await
                .map(|_| ())
        }

        async fn restore_key(
            &self,
            jobs: &RelayerJobs<'_>,
            config: &ChainConfig,
            _key_name: &str,
            _mnemonic: &str,
        ) -> Result<String, RelayerError> {
            let output = jobs
                .run(&Self::cmd("restore-key", &config.chain_id), CONFIG_TIMEOUT)
                .await?;
            Ok(output.stdout_string().trim().to_owned())
        }

        async fn generate_path(
            &self,
            jobs: &RelayerJobs<'_>,
            _src_chain_id: &str,
            _dst_chain_id: &str,
            path_name: &str,
        ) -> Result<(), RelayerError> {
            jobs.run(&Self::cmd("new-path", path_name), CONFIG_TIMEOUT)
                .await
                .map(|_| ())
        }

        async fn create_clients(
            &self,
            jobs: &RelayerJobs<'_>,
            path_name: &str,
            _opts: &CreateClientOptions,
        ) -> Result<(), RelayerError> {
            jobs.run(&Self::cmd("clients", path_name), CONFIG_TIMEOUT)
                .await
                .map(|_| ())
        }

        async fn create_connections(
            &self,
            jobs: &RelayerJobs<'_>,
            path_name: &str,
        ) -> Result<(), RelayerError> {
            jobs.run(&Self::cmd("connection", path_name), CONFIG_TIMEOUT)
                .await
                .map(|_| ())
        }

        async fn create_channel(
            &self,
            jobs: &RelayerJobs<'_>,
            path_name: &str,
            _opts: &CreateChannelOptions,
        ) -> Result<(), RelayerError> {
            jobs.run(&Self::cmd("channel", path_name), CONFIG_TIMEOUT)
                .await
                .map(|_| ())
        }

        async fn get_channels(
            &self,
            _jobs: &RelayerJobs<'_>,
            _chain_id: &str,
        ) -> Result<Vec<ChannelOutput>, RelayerError> {
            Ok(Vec::new())
        }

        async fn get_connections(
            &self,
            _jobs: &RelayerJobs<'_>,
            _chain_id: &str,
        ) -> Result<Vec<ConnectionOutput>, RelayerError> {
            Ok(Vec::new())
        }

        async fn get_clients(
            &self,
            jobs: &RelayerJobs<'_>,
            chain_id: &str,
        ) -> Result<Vec<ClientOutput>, RelayerError> {
            jobs.run(&Self::cmd("clients-of", chain_id), QUERY_TIMEOUT)
                .await
                .map(|_| Vec::new())
        }

        fn start_command(
            &self,
            home_dir: &str,
            path_names: &[String],
        ) -> Result<Vec<String>, RelayerError> {
            let mut cmd = vec!["echo-relay".to_owned(), home_dir.to_owned()];
            cmd.extend_from_slice(path_names);
            Ok(cmd)
        }
    }

    async fn relayer(engine: &Arc<FakeEngine>) -> DockerRelayer<Echo> {
        let env = environment(engine, "TestDocker");
        DockerRelayer::new(&env, Echo, RelayerOptions::default())
            .await
            .expect("relayer")
    }

    #[tokio::test]
    async fn home_volume_and_image_are_prepared_up_front() {
        let engine = Arc::new(FakeEngine::new());
        let relayer = relayer(&engine).await;

        assert_eq!(relayer.name(), "echo-TestDocker");
        assert_eq!(engine.pulled_images(), ["busybox:stable"]);
        assert_eq!(engine.volume_count(), 1);
        assert!(relayer.use_docker_network());

        let engine = Arc::new(FakeEngine::new());
        let options = RelayerOptions {
            image: Some(DockerImage::new("registry/echo", "v2", "")),
            skip_pull: true,
            ..RelayerOptions::default()
        };
        let custom = DockerRelayer::new(&environment(&engine, "TestDocker"), Echo, options)
            .await
            .expect("relayer");
        assert_eq!(custom.image().image_ref(), "registry/echo:v2");
        assert!(engine.pulled_images().is_empty());
    }

    #[tokio::test]
    async fn init_runs_once_and_every_command_is_reported() {
        let engine = Arc::new(FakeEngine::new());
        engine.script_job("restore-key", 0, b"cosmos1xyz\n", b"");
        let relayer = relayer(&engine).await;
        let rep = CapturingReporter::default();

        for chain_id in ["gaia-1", "gaia-2"] {
            relayer
                .add_chain_configuration(&rep, &gaia(chain_id), "key", "http://rpc", "grpc")
                .await
                .expect("add chain");
        }
        relayer
            .restore_key(&rep, &gaia("gaia-1"), "echo-gaia-1", "abandon about")
            .await
            .expect("restore");

        assert_eq!(
            rep.commands(),
            [
                "echo init -",
                "echo add-chain gaia-1",
                "echo add-chain gaia-2",
                "echo restore-key gaia-1"
            ]
        );
        let execs = rep.execs();
        assert!(execs.iter().all(|exec| exec.exit_code == 0 && exec.error.is_none()));
        assert!(execs[0].container_name.starts_with("echo-init"));

        let wallet = relayer.get_wallet("gaia-1").await.expect("wallet");
        assert_eq!(wallet.formatted_address(), "cosmos1xyz");
        assert_eq!(wallet.key_name(), "echo-gaia-1");
        assert_eq!(wallet.mnemonic(), Some("abandon about"));
        assert!(relayer.get_wallet("gaia-2").await.is_none());
    }

    #[tokio::test]
    async fn non_zero_exits_become_command_errors() {
        let engine = Arc::new(FakeEngine::new());
        engine.script_job("clients-of", 1, b"partial", b"no such chain");
        let relayer = relayer(&engine).await;
        let rep = CapturingReporter::default();

        let err = relayer
            .get_clients(&rep, "gaia-9")
            .await
            .expect_err("query fails");
        match err {
            RelayerError::Command {
                exit_code,
                stdout,
                stderr,
                ..
            } => {
                assert_eq!(exit_code, 1);
                assert_eq!(stdout, "partial");
                assert_eq!(stderr, "no such chain");
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(rep.execs()[0].exit_code, 1);
    }

    #[tokio::test]
    async fn link_falls_back_to_individual_steps() {
        let engine = Arc::new(FakeEngine::new());
        let relayer = relayer(&engine).await;
        let rep = CapturingReporter::default();

        relayer
            .link_path(
                &rep,
                "gaia-osmo",
                &CreateChannelOptions::default(),
                &CreateClientOptions::default(),
            )
            .await
            .expect("link");

        assert_eq!(
            rep.commands(),
            [
                "echo clients gaia-osmo",
                "echo connection gaia-osmo",
                "echo channel gaia-osmo"
            ]
        );
    }

    #[tokio::test]
    async fn missing_operations_are_typed_unsupported() {
        let engine = Arc::new(FakeEngine::new());
        let relayer = relayer(&engine).await;
        let rep = CapturingReporter::default();

        let flush = relayer.flush(&rep, "path", "channel-0").await;
        assert!(flush.is_err_and(|err| err.is_unsupported()));
        let update = relayer.update_clients(&rep, "path").await;
        assert!(update.is_err_and(|err| err.is_unsupported()));

        relayer
            .add_chain_configuration(&rep, &gaia("gaia-1"), "key", "rpc", "grpc")
            .await
            .expect("add chain");
        let add_key = relayer.add_key(&rep, "gaia-1", "key", "118").await;
        assert!(add_key.is_err_and(|err| err.is_unsupported()));
        let unknown = relayer.add_key(&rep, "gaia-9", "key", "118").await;
        assert!(matches!(unknown, Err(RelayerError::UnknownChain { .. })));
    }

    #[tokio::test]
    async fn daemon_stop_reports_logs_and_is_idempotent() {
        let engine = Arc::new(FakeEngine::new());
        engine.script_logs("echo-relay", b"relaying packets\n");
        let options = RelayerOptions {
            extra_start_flags: vec!["--verbose".to_owned()],
            ..RelayerOptions::default()
        };
        let relayer = DockerRelayer::new(&environment(&engine, "TestDaemon"), Echo, options)
            .await
            .expect("relayer");
        let rep = CapturingReporter::default();

        relayer
            .start_relayer(&rep, &["gaia-osmo".to_owned()])
            .await
            .expect("start");
        assert_eq!(engine.container_count(), 1);
        let again = relayer.start_relayer(&rep, &["gaia-osmo".to_owned()]).await;
        assert!(matches!(again, Err(RelayerError::Config { .. })));

        relayer.stop_relayer(&rep).await.expect("stop");
        relayer.stop_relayer(&rep).await.expect("second stop");

        assert_eq!(engine.container_count(), 0);
        let execs = rep.execs();
        assert_eq!(execs.len(), 1);
        assert_eq!(execs[0].container_name, "echo-TestDaemon-gaia-osmo");
        assert_eq!(execs[0].command.last().map(String::as_str), Some("--verbose"));
        assert_eq!(execs[0].stdout, "relaying packets\n");
    }
}
