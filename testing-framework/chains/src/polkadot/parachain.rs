use std::sync::{PoisonError, RwLock};

use ed25519_dalek::SigningKey;
use interchaintest_core::{
    chain::{ChainConfig, ChainEnvironment, ChainError, DockerImage, GenesisError},
    substrate::{ExecOutput, sanitize_name},
    wallet::substrate::{DEV_ACCOUNTS, libp2p_peer_id},
};
use tracing::debug;

use super::{
    chain_spec::{ParachainRegistration, parachain_id, patch_parachain_spec},
    extrinsic::CallIndex,
    node::{P2P_PORT, PROMETHEUS_PORT, ROOT, RPC_PORT},
};
use crate::{
    node_home::{ContainerOptions, NodeHome},
    node_rpc::{Flavor, NodeRpc},
};

/// A parachain collated by its own nodes and registered on the relay chain
/// at genesis.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParachainConfig {
    pub chain_id: String,
    pub bin: String,
    pub image: DockerImage,
    pub num_nodes: usize,
    /// Collator flags placed before the `--` separator.
    pub flags: Vec<String>,
    /// Embedded relay chain node flags placed after `--`.
    pub relay_chain_flags: Vec<String>,
    pub balances_transfer: CallIndex,
    pub ibc_transfer: CallIndex,
}

impl ParachainConfig {
    /// `Balances.transfer` in the default parachain runtime.
    pub const DEFAULT_BALANCES_TRANSFER: CallIndex = CallIndex::new(10, 0);
    /// `Ibc.transfer` in the default parachain runtime.
    pub const DEFAULT_IBC_TRANSFER: CallIndex = CallIndex::new(190, 0);

    #[must_use]
    pub fn new(chain_id: impl Into<String>, bin: impl Into<String>, image: DockerImage) -> Self {
        Self {
            chain_id: chain_id.into(),
            bin: bin.into(),
            image,
            num_nodes: 1,
            flags: Vec::new(),
            relay_chain_flags: Vec::new(),
            balances_transfer: Self::DEFAULT_BALANCES_TRANSFER,
            ibc_transfer: Self::DEFAULT_IBC_TRANSFER,
        }
    }

    #[must_use]
    pub const fn with_num_nodes(mut self, num_nodes: usize) -> Self {
        self.num_nodes = num_nodes;
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: Vec<String>, relay_chain_flags: Vec<String>) -> Self {
        self.flags = flags;
        self.relay_chain_flags = relay_chain_flags;
        self
    }

    #[must_use]
    pub const fn with_call_indexes(mut self, balances: CallIndex, ibc: CallIndex) -> Self {
        self.balances_transfer = balances;
        self.ibc_transfer = ibc;
        self
    }
}

/// A collator of one parachain, running as one of the dev accounts and
/// embedding a relay chain node.
pub struct ParachainNode {
    index: usize,
    config: ParachainConfig,
    relay_raw_spec_file: String,
    home: NodeHome,
    node_key: SigningKey,
    host: RwLock<String>,
}

impl ParachainNode {
    pub(crate) async fn create(
        env: &ChainEnvironment,
        relay: &ChainConfig,
        config: &ParachainConfig,
        index: usize,
    ) -> Result<Self, ChainError> {
        if index >= DEV_ACCOUNTS.len() {
            return Err(ChainError::start(
                &relay.chain_id,
                format!("at most {} collators are supported", DEV_ACCOUNTS.len()),
            ));
        }
        let name = format!(
            "{}-{index}-{}-{}",
            config.bin,
            config.chain_id,
            sanitize_name(&env.test_name)
        );
        let home_dir = format!("/home/.{}", relay.name);
        let home = NodeHome::create(env, &relay.chain_id, name, home_dir, &config.image).await?;
        Ok(Self {
            index,
            config: config.clone(),
            relay_raw_spec_file: format!("{}-raw.json", relay.chain_id),
            home,
            node_key: SigningKey::from_bytes(&rand::random::<[u8; 32]>()),
            host: RwLock::new(String::new()),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.home.name()
    }

    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn dev_account(&self) -> &'static str {
        DEV_ACCOUNTS[self.index]
    }

    #[must_use]
    pub const fn config(&self) -> &ParachainConfig {
        &self.config
    }

    #[must_use]
    pub fn rpc_address(&self) -> String {
        format!("http://{}:27451", self.home.hostname())
    }

    #[must_use]
    pub fn ws_address(&self) -> String {
        format!("{}:27451", self.home.hostname())
    }

    #[must_use]
    pub fn host_rpc_address(&self) -> String {
        let host = self.host.read().unwrap_or_else(PoisonError::into_inner);
        if host.is_empty() {
            String::new()
        } else {
            format!("http://{host}")
        }
    }

    #[must_use]
    pub fn host_ws_address(&self) -> String {
        self.host.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn set_host(&self, host: String) {
        *self.host.write().unwrap_or_else(PoisonError::into_inner) = host;
    }

    #[must_use]
    pub fn home_dir(&self) -> &str {
        self.home.home_dir()
    }

    #[must_use]
    pub fn peer_id(&self) -> String {
        libp2p_peer_id(&self.node_key)
    }

    #[must_use]
    pub fn multi_address(&self) -> String {
        format!("/dns4/{}/tcp/27452/p2p/{}", self.home.hostname(), self.peer_id())
    }

    fn spec_file(&self) -> String {
        format!("{}.json", self.config.chain_id)
    }

    fn raw_spec_file(&self) -> String {
        format!("{}-raw.json", self.config.chain_id)
    }

    fn genesis_error(&self, source: GenesisError) -> ChainError {
        ChainError::Genesis {
            chain: self.home.chain_id().to_owned(),
            source: Box::new(source),
        }
    }

    async fn exec(&self, args: &[String]) -> Result<ExecOutput, ChainError> {
        let mut cmd = vec![self.config.bin.clone()];
        cmd.extend_from_slice(args);
        self.home.exec(&cmd, Vec::new(), Some(ROOT.to_owned())).await
    }

    /// Builds the parachain spec with `balances` added, writes its plain and
    /// raw forms to this node's volume and returns the raw form.
    pub(crate) async fn generate_chain_spec(
        &self,
        balances: &[(String, u64)],
    ) -> Result<Vec<u8>, ChainError> {
        let spec = self
            .exec(&[
                "build-spec".to_owned(),
                format!("--chain={}", self.config.chain_id),
                "--disable-default-bootnode".to_owned(),
            ])
            .await?
            .stdout;
        let spec =
            patch_parachain_spec(&spec, balances).map_err(|err| self.genesis_error(err))?;
        self.home.write_file(&self.spec_file(), &spec).await?;
        let raw = self
            .exec(&[
                "build-spec".to_owned(),
                format!("--chain={}/{}", self.home_dir(), self.spec_file()),
                "--raw".to_owned(),
            ])
            .await?
            .stdout;
        self.install_chain_spec(&raw).await?;
        Ok(raw)
    }

    /// Writes the raw parachain spec the collator boots from.
    pub(crate) async fn install_chain_spec(&self, raw: &[u8]) -> Result<(), ChainError> {
        self.home.write_file(&self.raw_spec_file(), raw).await
    }

    async fn export(&self, what: &str) -> Result<String, ChainError> {
        let output = self
            .exec(&[
                what.to_owned(),
                format!("--chain={}/{}", self.home_dir(), self.raw_spec_file()),
            ])
            .await?;
        Ok(output.stdout_string().trim().to_owned())
    }

    /// What the relay chain needs to register this parachain: its id from
    /// the plain spec plus the exported genesis head and runtime.
    pub(crate) async fn registration(&self) -> Result<ParachainRegistration, ChainError> {
        let spec = self.home.read_file(&self.spec_file()).await?;
        let id = parachain_id(&spec).map_err(|err| self.genesis_error(err))?;
        Ok(ParachainRegistration {
            id,
            genesis_head: self.export("export-genesis-state").await?,
            validation_code: self.export("export-genesis-wasm").await?,
        })
    }

    pub(crate) async fn write_file(
        &self,
        rel_path: &str,
        content: &[u8],
    ) -> Result<(), ChainError> {
        self.home.write_file(rel_path, content).await
    }

    pub(crate) fn relay_raw_spec_file(&self) -> &str {
        &self.relay_raw_spec_file
    }

    fn start_command(&self) -> Vec<String> {
        let home = self.home.home_dir();
        let mut cmd = vec![
            self.config.bin.clone(),
            "--rpc-port=27451".to_owned(),
            "--collator".to_owned(),
            format!("--node-key={}", hex::encode(self.node_key.to_bytes())),
            format!("--{}", self.dev_account()),
            "--unsafe-rpc-external".to_owned(),
            "--prometheus-external".to_owned(),
            "--rpc-cors=all".to_owned(),
            "--prometheus-port=27453".to_owned(),
            "--listen-addr=/ip4/0.0.0.0/tcp/27452".to_owned(),
            format!("--public-addr={}", self.multi_address()),
            "--base-path".to_owned(),
            home.to_owned(),
            format!("--chain={home}/{}", self.raw_spec_file()),
        ];
        cmd.extend(self.config.flags.iter().cloned());
        cmd.push("--".to_owned());
        cmd.push(format!("--chain={home}/{}", self.relay_raw_spec_file));
        cmd.extend(self.config.relay_chain_flags.iter().cloned());
        cmd
    }

    pub(crate) async fn create_container(&self, env: &[String]) -> Result<(), ChainError> {
        let cmd = self.start_command();
        debug!(node = %self.name(), command = %cmd.join(" "), "creating collator container");
        self.home
            .create_container(
                &self.config.image,
                ContainerOptions {
                    cmd,
                    entrypoint: Some(Vec::new()),
                    ports: [RPC_PORT, P2P_PORT, PROMETHEUS_PORT]
                        .map(str::to_owned)
                        .to_vec(),
                    env: env.to_vec(),
                    user: Some(ROOT.to_owned()),
                    ..ContainerOptions::default()
                },
            )
            .await
    }

    pub(crate) async fn start(&self) -> Result<(), ChainError> {
        let ports = self.home.start(&[RPC_PORT]).await?;
        self.set_host(ports.into_iter().next().unwrap_or_default());
        Ok(())
    }

    pub(crate) fn rpc(&self) -> Result<NodeRpc<'_>, ChainError> {
        NodeRpc::connect(
            self.home.chain_id(),
            self.name(),
            Flavor::Substrate,
            &self.host_rpc_address(),
        )
    }

    pub(crate) async fn height(&self) -> Result<u64, ChainError> {
        self.rpc()?.height().await
    }

    pub(crate) async fn wait_until_ready(&self) -> Result<(), ChainError> {
        self.rpc()?.wait_until_ready().await.map(|_| ())
    }
}
