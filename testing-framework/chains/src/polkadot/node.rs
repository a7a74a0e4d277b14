use std::sync::{PoisonError, RwLock};

use ed25519_dalek::SigningKey;
use interchaintest_core::{
    chain::{ChainConfig, ChainEnvironment, ChainError},
    substrate::{ExecOutput, sanitize_name},
    wallet::substrate::{
        DEV_ACCOUNTS, derive_ed25519_from_name, derive_secp256k1_from_name, libp2p_peer_id,
        secp256k1_public, ss58_encode,
    },
};
use tracing::debug;

use crate::{
    node_home::{ContainerOptions, NodeHome},
    node_rpc::{Flavor, NodeRpc},
};

pub(crate) const RPC_PORT: &str = "27451/tcp";
pub(crate) const P2P_PORT: &str = "27452/tcp";
pub(crate) const PROMETHEUS_PORT: &str = "27453/tcp";

/// Containers run as root; the image's default user cannot write the volume.
pub(crate) const ROOT: &str = "0";

/// A relay-chain validator running as one of the dev accounts.
pub struct RelayChainNode {
    index: usize,
    bin: String,
    raw_spec_file: String,
    home: NodeHome,
    node_key: SigningKey,
    host: RwLock<String>,
}

impl RelayChainNode {
    pub(crate) async fn create(
        env: &ChainEnvironment,
        config: &ChainConfig,
        index: usize,
    ) -> Result<Self, ChainError> {
        let chain_id = &config.chain_id;
        let Some(image) = config.images.first() else {
            return Err(ChainError::start(chain_id, "no relay chain image configured"));
        };
        if index >= DEV_ACCOUNTS.len() {
            return Err(ChainError::start(
                chain_id,
                format!("at most {} relay chain validators are supported", DEV_ACCOUNTS.len()),
            ));
        }
        let name = format!(
            "relaychain-{index}-{chain_id}-{}",
            sanitize_name(&env.test_name)
        );
        let home_dir = format!("/home/.{}", config.name);
        let home = NodeHome::create(env, chain_id, name, home_dir, image).await?;
        Ok(Self {
            index,
            bin: config.bin.clone(),
            raw_spec_file: format!("{chain_id}-raw.json"),
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

    /// Dev account this node validates as, e.g. `alice`.
    #[must_use]
    pub fn dev_account(&self) -> &'static str {
        DEV_ACCOUNTS[self.index]
    }

    #[must_use]
    pub fn rpc_address(&self) -> String {
        format!("http://{}:27451", self.home.hostname())
    }

    /// The websocket endpoint shares the RPC port.
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

    #[must_use]
    pub fn grandpa_address(&self, ss58_format: u16) -> String {
        let key = derive_ed25519_from_name(self.dev_account());
        ss58_encode(key.verifying_key().as_bytes(), ss58_format)
    }

    pub fn beefy_address(&self, ss58_format: u16) -> Result<String, ChainError> {
        let secret = derive_secp256k1_from_name(self.dev_account())
            .map_err(|err| ChainError::key(self.home.chain_id(), err))?;
        Ok(ss58_encode(&secp256k1_public(&secret), ss58_format))
    }

    pub(crate) async fn exec(
        &self,
        cmd: &[String],
        env: &[String],
    ) -> Result<ExecOutput, ChainError> {
        self.home.exec(cmd, env.to_vec(), Some(ROOT.to_owned())).await
    }

    /// Runs `build-spec` with `args` and returns the spec it prints.
    pub(crate) async fn build_spec(&self, args: &[String]) -> Result<Vec<u8>, ChainError> {
        let mut cmd = vec![self.bin.clone(), "build-spec".to_owned()];
        cmd.extend_from_slice(args);
        self.exec(&cmd, &[]).await.map(|output| output.stdout)
    }

    pub(crate) async fn write_file(
        &self,
        rel_path: &str,
        content: &[u8],
    ) -> Result<(), ChainError> {
        self.home.write_file(rel_path, content).await
    }

    fn start_command(&self) -> Vec<String> {
        let home = self.home.home_dir();
        vec![
            self.bin.clone(),
            format!("--chain={home}/{}", self.raw_spec_file),
            "--rpc-port=27451".to_owned(),
            format!("--{}", self.dev_account()),
            format!("--node-key={}", hex::encode(self.node_key.to_bytes())),
            "--rpc-cors=all".to_owned(),
            "--unsafe-rpc-external".to_owned(),
            "--prometheus-external".to_owned(),
            "--prometheus-port=27453".to_owned(),
            "--listen-addr=/ip4/0.0.0.0/tcp/27452".to_owned(),
            format!("--public-addr={}", self.multi_address()),
            "--base-path".to_owned(),
            home.to_owned(),
        ]
    }

    pub(crate) async fn create_container(&self, config: &ChainConfig) -> Result<(), ChainError> {
        let Some(image) = config.images.first() else {
            return Err(ChainError::start(
                self.home.chain_id(),
                "no relay chain image configured",
            ));
        };
        let cmd = self.start_command();
        debug!(node = %self.name(), command = %cmd.join(" "), "creating relay chain container");
        self.home
            .create_container(
                image,
                ContainerOptions {
                    cmd,
                    entrypoint: Some(Vec::new()),
                    ports: [RPC_PORT, P2P_PORT, PROMETHEUS_PORT]
                        .map(str::to_owned)
                        .to_vec(),
                    env: config.env.clone(),
                    user: Some(ROOT.to_owned()),
                    ..ContainerOptions::default()
                },
            )
            .await
    }

    pub(crate) fn set_host(&self, host: String) {
        *self.host.write().unwrap_or_else(PoisonError::into_inner) = host;
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

    pub(crate) async fn wait_for_blocks(&self, delta: u64) -> Result<(), ChainError> {
        self.rpc()?.wait_for_blocks(delta).await.map(|_| ())
    }
}
