use std::sync::{PoisonError, RwLock};

use interchaintest_core::{
    chain::{ChainConfig, ChainEnvironment, ChainError, DockerImage},
    substrate::{ExecOutput, sanitize_name},
};
use num_bigint::BigUint;
use serde_json::Value as JsonValue;
use toml::{Table, Value};
use tracing::debug;

use super::genesis::{address_for_label, balance_of, named_validator};
use crate::{
    node_home::{ContainerOptions, NodeHome, table, tendermint_node_id, tendermint_test_config},
    node_rpc::{Flavor, NodeRpc},
};

pub(crate) const RPC_PORT: &str = "26657/tcp";
pub(crate) const P2P_PORT: &str = "26656/tcp";
pub(crate) const ABCI_PORT: &str = "26658/tcp";
pub(crate) const GRPC_PORT: &str = "8080/tcp";

const ALREADY_EXISTS: &str = "already exists";

/// `pcli` invocations against a wallet stored in a node volume.
pub(crate) struct Pcli<'a> {
    home: &'a NodeHome,
    grpc: String,
}

impl<'a> Pcli<'a> {
    pub(crate) fn new(home: &'a NodeHome, grpc: impl Into<String>) -> Self {
        Self {
            home,
            grpc: grpc.into(),
        }
    }

    fn command<S: AsRef<str>>(&self, args: &[S]) -> Vec<String> {
        let mut cmd = vec![
            "pcli".to_owned(),
            "-w".to_owned(),
            format!("{}/wallet", self.home.home_dir()),
        ];
        if !self.grpc.is_empty() {
            cmd.push("--node".to_owned());
            cmd.push(self.grpc.clone());
        }
        cmd.extend(args.iter().map(|arg| arg.as_ref().to_owned()));
        cmd
    }

    async fn run<S: AsRef<str>>(&self, args: &[S]) -> Result<ExecOutput, ChainError> {
        self.home.exec(&self.command(args), Vec::new(), None).await
    }

    /// Generates the wallet unless one exists, then labels a new address.
    pub(crate) async fn create_key(&self, key_name: &str) -> Result<(), ChainError> {
        let cmd = self.command(&["wallet", "generate"]);
        let output = self.home.run_job(&cmd, Vec::new(), None).await?;
        if !output.success() && !output.stderr_string().contains(ALREADY_EXISTS) {
            return Err(ChainError::command(self.home.chain_id(), &cmd, &output));
        }
        self.run(&["addr", "new", key_name]).await.map(|_| ())
    }

    pub(crate) async fn recover_key(
        &self,
        key_name: &str,
        mnemonic: &str,
    ) -> Result<(), ChainError> {
        self.run(&["wallet", "import-from-phrase", mnemonic.trim()])
            .await?;
        self.run(&["addr", "new", key_name]).await.map(|_| ())
    }

    pub(crate) async fn address(&self, key_name: &str) -> Result<String, ChainError> {
        let output = self.run(&["addr", "list"]).await?;
        address_for_label(&output.stdout_string(), key_name).ok_or_else(|| ChainError::KeyNotFound {
            chain: self.home.chain_id().to_owned(),
            key: key_name.to_owned(),
        })
    }

    pub(crate) async fn send(
        &self,
        amount: &BigUint,
        denom: &str,
        to: &str,
    ) -> Result<(), ChainError> {
        let value = format!("{amount}{denom}");
        self.run(&["tx", "send", value.as_str(), "--to", to])
            .await
            .map(|_| ())
    }

    pub(crate) async fn balance(&self, denom: &str) -> Result<BigUint, ChainError> {
        let output = self.run(&["view", "balance"]).await?;
        Ok(balance_of(&output.stdout_string(), denom))
    }

    /// Validator definition template for this wallet, named `name`.
    pub(crate) async fn validator_definition(&self, name: &str) -> Result<JsonValue, ChainError> {
        let file = format!("{}/validator.json", self.home.home_dir());
        self.run(&["validator", "template-definition", "--file", file.as_str()])
            .await?;
        let raw = self.home.read_file("validator.json").await?;
        let chain_id = self.home.chain_id();
        let definition: JsonValue = serde_json::from_slice(&raw)
            .map_err(|err| ChainError::parse(chain_id, "validator.json", err))?;
        named_validator(definition, name)
            .map_err(|err| ChainError::parse(chain_id, "validator.json", err))
    }
}

/// A tendermint consensus node paired with its `pd` application.
pub struct PenumbraNode {
    index: usize,
    validator: bool,
    tendermint: NodeHome,
    app: NodeHome,
    images: (DockerImage, DockerImage),
    config_overrides: Vec<(String, Table)>,
    host: RwLock<(String, String)>,
}

impl PenumbraNode {
    pub(crate) async fn create(
        env: &ChainEnvironment,
        config: &ChainConfig,
        index: usize,
        validator: bool,
    ) -> Result<Self, ChainError> {
        let chain_id = &config.chain_id;
        let [tendermint_image, app_image] = config.images.as_slice() else {
            return Err(ChainError::start(
                chain_id,
                "penumbra needs a tendermint image and a penumbra image",
            ));
        };
        let kind = if validator { "val" } else { "fn" };
        let test = sanitize_name(&env.test_name);
        let tendermint_name = format!("{chain_id}-tm-{kind}-{index}-{test}");
        let app_name = format!("{chain_id}-pd-{kind}-{index}-{test}");

        let (tendermint, app) = tokio::try_join!(
            NodeHome::create(
                env,
                chain_id,
                tendermint_name.clone(),
                format!("/var/tendermint/{tendermint_name}"),
                tendermint_image,
            ),
            NodeHome::create(
                env,
                chain_id,
                app_name.clone(),
                format!("/var/penumbra/{app_name}"),
                app_image,
            ),
        )?;
        Ok(Self {
            index,
            validator,
            tendermint,
            app,
            images: (tendermint_image.clone(), app_image.clone()),
            config_overrides: config
                .config_file_overrides
                .iter()
                .map(|(path, table)| (path.clone(), table.clone()))
                .collect(),
            host: RwLock::new((String::new(), String::new())),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.tendermint.name()
    }

    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub const fn is_validator(&self) -> bool {
        self.validator
    }

    #[must_use]
    pub fn rpc_address(&self) -> String {
        format!("http://{}:26657", self.tendermint.hostname())
    }

    #[must_use]
    pub fn grpc_address(&self) -> String {
        format!("{}:8080", self.app.hostname())
    }

    #[must_use]
    pub fn host_rpc_address(&self) -> String {
        let host = self.host.read().unwrap_or_else(PoisonError::into_inner);
        if host.0.is_empty() {
            String::new()
        } else {
            format!("http://{}", host.0)
        }
    }

    #[must_use]
    pub fn host_grpc_address(&self) -> String {
        self.host.read().unwrap_or_else(PoisonError::into_inner).1.clone()
    }

    #[must_use]
    pub fn home_dir(&self) -> String {
        self.app.home_dir().to_owned()
    }

    pub(crate) fn app(&self) -> &NodeHome {
        &self.app
    }

    /// The wallet in the application volume.
    pub(crate) fn pcli(&self) -> Pcli<'_> {
        Pcli::new(&self.app, "")
    }

    pub(crate) async fn exec(
        &self,
        cmd: &[String],
        env: &[String],
    ) -> Result<ExecOutput, ChainError> {
        self.app.exec(cmd, env.to_vec(), None).await
    }

    pub(crate) async fn init_tendermint(&self) -> Result<(), ChainError> {
        let home = self.tendermint.home_dir().to_owned();
        self.tendermint
            .exec(
                &["tendermint", "init", "validator", "--home", home.as_str()].map(str::to_owned),
                Vec::new(),
                None,
            )
            .await?;

        let mut config = tendermint_test_config();
        config.insert(
            "proxy_app".to_owned(),
            Value::from(format!("tcp://{}:26658", self.app.hostname())),
        );
        self.tendermint
            .modify_toml("config/config.toml", &config)
            .await?;
        for (path, overrides) in &self.config_overrides {
            self.tendermint.modify_toml(path, overrides).await?;
        }
        Ok(())
    }

    pub(crate) async fn write_tendermint_file(
        &self,
        rel_path: &str,
        content: &[u8],
    ) -> Result<(), ChainError> {
        self.tendermint.write_file(rel_path, content).await
    }

    pub(crate) async fn node_id(&self) -> Result<String, ChainError> {
        let raw = self.tendermint.read_file("config/node_key.json").await?;
        tendermint_node_id(&raw)
            .map_err(|err| ChainError::parse(self.tendermint.chain_id(), "node_key.json", err))
    }

    #[must_use]
    pub fn peer_address(&self, node_id: &str) -> String {
        format!("{node_id}@{}:26656", self.tendermint.hostname())
    }

    pub(crate) async fn set_peers(&self, peers: &str) -> Result<(), ChainError> {
        let p2p = table([("persistent_peers", Value::from(peers))]);
        self.tendermint
            .modify_toml("config/config.toml", &table([("p2p", Value::Table(p2p))]))
            .await
    }

    pub(crate) async fn create_containers(&self) -> Result<(), ChainError> {
        let rocksdb = format!("{}/rocksdb", self.app.home_dir());
        let tendermint_home = self.tendermint.home_dir();
        self.app
            .create_container(
                &self.images.1,
                ContainerOptions {
                    cmd: ["pd", "start", "--host", "0.0.0.0", "-r", rocksdb.as_str()]
                        .map(str::to_owned)
                        .to_vec(),
                    ports: vec![ABCI_PORT.to_owned(), GRPC_PORT.to_owned()],
                    ..ContainerOptions::default()
                },
            )
            .await?;
        self.tendermint
            .create_container(
                &self.images.0,
                ContainerOptions {
                    cmd: ["tendermint", "start", "--home", tendermint_home]
                        .map(str::to_owned)
                        .to_vec(),
                    ports: vec![P2P_PORT.to_owned(), RPC_PORT.to_owned()],
                    ..ContainerOptions::default()
                },
            )
            .await
    }

    /// The application has to accept ABCI connections before tendermint
    /// dials it.
    pub(crate) async fn start(&self) -> Result<(), ChainError> {
        let app_ports = self.app.start(&[GRPC_PORT]).await?;
        let tendermint_ports = self.tendermint.start(&[RPC_PORT]).await?;
        let mut host = self.host.write().unwrap_or_else(PoisonError::into_inner);
        *host = (
            tendermint_ports.into_iter().next().unwrap_or_default(),
            app_ports.into_iter().next().unwrap_or_default(),
        );
        debug!(node = %self.name(), rpc = %host.0, grpc = %host.1, "penumbra node started");
        Ok(())
    }

    fn rpc(&self) -> Result<NodeRpc<'_>, ChainError> {
        NodeRpc::connect(
            self.tendermint.chain_id(),
            self.name(),
            Flavor::Tendermint,
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
