//! Hyperspace, the Composable relayer for Cosmos and Substrate chains. It
//! reads one TOML file per chain plus a core file, and writes the client,
//! connection and channel identifiers it creates back into the chain files.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use interchaintest_core::{
    chain::{COSMOS, ChainConfig, DockerImage, POLKADOT},
    relayer::{
        Capabilities, Capability, ChannelOutput, ClientOutput, ClientState, ConnectionOutput,
        CreateChannelOptions, CreateClientOptions, RelayerError, RelayerExecReporter,
    },
    wallet::{
        KeyError,
        cosmos::CosmosKey,
        substrate::{DEFAULT_SS58_FORMAT, sr25519_from_suri, ss58_encode},
    },
};
use serde::Serialize;
use tracing::{debug, info};

use crate::docker::{DockerRelayer, RelayerCommander, RelayerJobs, TX_TIMEOUT};

pub const HYPERSPACE_IMAGE: &str = "hyperspace";
pub const HYPERSPACE_VERSION: &str = "local";
pub const HYPERSPACE_UID_GID: &str = "1000:1000";
pub const DEFAULT_PARA_ID: u32 = 2000;

const CORE_CONFIG: &str = "core.config";
const COMMITMENT_PREFIX: &str = "0x6962632f";
const SUBSTRATE_RPC_PORT: &str = "27451";
const LEGACY_SUBSTRATE_RPC_PORT: &str = "9933";

#[derive(Debug, Serialize)]
struct CoreConfig {
    prometheus_endpoint: Option<String>,
}

#[derive(Debug, Serialize)]
struct CosmosChainFile<'a> {
    #[serde(rename = "type")]
    chain_type: &'a str,
    name: &'a str,
    rpc_url: String,
    grpc_url: String,
    websocket_url: String,
    chain_id: &'a str,
    account_prefix: &'a str,
    fee_denom: &'a str,
    fee_amount: &'a str,
    gas_limit: u64,
    store_prefix: &'a str,
    max_tx_size: u64,
    wasm_code_id: &'a str,
    channel_whitelist: Vec<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct SubstrateChainFile<'a> {
    #[serde(rename = "type")]
    chain_type: &'a str,
    name: &'a str,
    para_id: u32,
    parachain_rpc_url: String,
    relay_chain_rpc_url: String,
    beefy_activation_block: u32,
    commitment_prefix: &'a str,
    private_key: &'a str,
    ss58_version: u16,
    key_type: &'a str,
    finality_protocol: &'a str,
    channel_whitelist: Vec<Vec<String>>,
}

#[derive(Clone, Debug)]
struct HyperspacePath {
    chain_a: String,
    chain_b: String,
}

#[derive(Debug)]
pub struct Hyperspace {
    para_id: u32,
    paths: Mutex<BTreeMap<String, HyperspacePath>>,
}

impl Default for Hyperspace {
    fn default() -> Self {
        Self::new(DEFAULT_PARA_ID)
    }
}

fn is_substrate(chain_type: &str) -> bool {
    matches!(chain_type, POLKADOT | "parachain" | "relaychain")
}

fn chain_file(chain_id: &str) -> String {
    format!("{chain_id}.config")
}

/// `http(s)://` becomes `ws(s)://` and the legacy RPC port the merged one.
fn substrate_ws_url(addr: &str) -> String {
    addr.replacen("http", "ws", 1)
        .replacen(LEGACY_SUBSTRATE_RPC_PORT, SUBSTRATE_RPC_PORT, 1)
}

fn with_http(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_owned()
    } else {
        format!("http://{addr}")
    }
}

impl Hyperspace {
    #[must_use]
    pub fn new(para_id: u32) -> Self {
        Self {
            para_id,
            paths: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub const fn para_id(&self) -> u32 {
        self.para_id
    }

    fn paths(&self) -> MutexGuard<'_, BTreeMap<String, HyperspacePath>> {
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn path(&self, path_name: &str) -> Result<HyperspacePath, RelayerError> {
        self.paths()
            .get(path_name)
            .cloned()
            .ok_or_else(|| RelayerError::UnknownPath {
                relayer: self.name().to_owned(),
                path: path_name.to_owned(),
            })
    }

    fn config_error(&self, message: String) -> RelayerError {
        RelayerError::Config {
            relayer: self.name().to_owned(),
            message,
        }
    }

    fn key_error(&self, source: KeyError) -> RelayerError {
        RelayerError::Key {
            relayer: self.name().to_owned(),
            source,
        }
    }

    fn chain_file_content(
        &self,
        config: &ChainConfig,
        rpc_addr: &str,
        grpc_addr: &str,
    ) -> Result<String, RelayerError> {
        let content = if config.chain_type == COSMOS {
            let rpc_url = with_http(rpc_addr);
            toml::to_string(&CosmosChainFile {
                chain_type: COSMOS,
                name: &config.name,
                websocket_url: format!("{}/websocket", rpc_url.replacen("http", "ws", 1)),
                rpc_url,
                grpc_url: with_http(grpc_addr),
                chain_id: &config.chain_id,
                account_prefix: &config.bech32_prefix,
                fee_denom: &config.denom,
                fee_amount: "4000",
                gas_limit: 10_000_000,
                store_prefix: "ibc",
                max_tx_size: 200_000,
                wasm_code_id: "",
                channel_whitelist: Vec::new(),
            })
        } else if is_substrate(&config.chain_type) {
            // `para,relay` when both are known; otherwise the relay chain
            // comes from the second address.
            let (para, relay) = rpc_addr
                .split_once(',')
                .unwrap_or((rpc_addr, if grpc_addr.is_empty() { rpc_addr } else { grpc_addr }));
            toml::to_string(&SubstrateChainFile {
                chain_type: "parachain",
                name: &config.name,
                para_id: self.para_id,
                parachain_rpc_url: substrate_ws_url(para),
                relay_chain_rpc_url: substrate_ws_url(relay),
                beefy_activation_block: 0,
                commitment_prefix: COMMITMENT_PREFIX,
                private_key: "//Alice",
                ss58_version: config.ss58_format.unwrap_or(DEFAULT_SS58_FORMAT),
                key_type: "sr25519",
                finality_protocol: "Grandpa",
                channel_whitelist: Vec::new(),
            })
        } else {
            return Err(self.config_error(format!(
                "unsupported chain type {:?} for chain {}",
                config.chain_type, config.chain_id
            )));
        };
        content.map_err(|err| RelayerError::parse(self.name(), "chain file", err))
    }

    async fn read_chain_file(
        &self,
        jobs: &RelayerJobs<'_>,
        chain_id: &str,
    ) -> Result<toml::Table, RelayerError> {
        let raw = jobs.read_file(&chain_file(chain_id)).await?;
        let raw = String::from_utf8_lossy(&raw);
        toml::from_str(&raw)
            .map_err(|err| RelayerError::parse(self.name(), chain_file(chain_id), err))
    }

    async fn edit_chain_file(
        &self,
        jobs: &RelayerJobs<'_>,
        chain_id: &str,
        edit: impl FnOnce(&mut toml::Table) + Send,
    ) -> Result<(), RelayerError> {
        let mut table = self.read_chain_file(jobs, chain_id).await?;
        edit(&mut table);
        let content = toml::to_string(&table)
            .map_err(|err| RelayerError::parse(self.name(), chain_file(chain_id), err))?;
        jobs.write_file(&chain_file(chain_id), content.as_bytes()).await
    }

    /// `hyperspace <subcommand>` over both chain files of a path.
    fn path_command(
        &self,
        home_dir: &str,
        subcommand: &str,
        path_name: &str,
        port_id: &str,
        order: &str,
    ) -> Result<Vec<String>, RelayerError> {
        let path = self.path(path_name)?;
        Ok(vec![
            "hyperspace".to_owned(),
            subcommand.to_owned(),
            "--config-a".to_owned(),
            format!("{home_dir}/{}", chain_file(&path.chain_a)),
            "--config-b".to_owned(),
            format!("{home_dir}/{}", chain_file(&path.chain_b)),
            "--config-core".to_owned(),
            format!("{home_dir}/{CORE_CONFIG}"),
            "--delay-period".to_owned(),
            "0".to_owned(),
            "--port-id".to_owned(),
            port_id.to_owned(),
            "--order".to_owned(),
            order.to_owned(),
        ])
    }

    /// The chain on the other side of whichever path includes `chain_id`.
    fn counterparty(&self, chain_id: &str) -> Option<String> {
        self.paths().values().find_map(|path| {
            if path.chain_a == chain_id {
                Some(path.chain_b.clone())
            } else if path.chain_b == chain_id {
                Some(path.chain_a.clone())
            } else {
                None
            }
        })
    }
}

fn table_str<'a>(table: &'a toml::Table, key: &str) -> &'a str {
    table.get(key).and_then(toml::Value::as_str).unwrap_or_default()
}

#[async_trait]
impl RelayerCommander for Hyperspace {
    fn name(&self) -> &'static str {
        "hyperspace"
    }

    fn default_image(&self) -> DockerImage {
        DockerImage::new(HYPERSPACE_IMAGE, HYPERSPACE_VERSION, HYPERSPACE_UID_GID)
    }

    fn capabilities(&self) -> Capabilities {
        [
            (Capability::TimestampTimeout, true),
            (Capability::HeightTimeout, true),
            (Capability::Flush, false),
        ]
        .into_iter()
        .collect()
    }

    async fn init(&self, jobs: &RelayerJobs<'_>) -> Result<(), RelayerError> {
        let core = toml::to_string(&CoreConfig {
            prometheus_endpoint: None,
        })
        .map_err(|err| RelayerError::parse(self.name(), CORE_CONFIG, err))?;
        jobs.write_file(CORE_CONFIG, core.as_bytes()).await
    }

    async fn add_chain_configuration(
        &self,
        jobs: &RelayerJobs<'_>,
        config: &ChainConfig,
        _key_name: &str,
        rpc_addr: &str,
        grpc_addr: &str,
    ) -> Result<(), RelayerError> {
        let content = self.chain_file_content(config, rpc_addr, grpc_addr)?;
        jobs.write_file(&chain_file(&config.chain_id), content.as_bytes())
            .await
    }

    async fn restore_key(
        &self,
        jobs: &RelayerJobs<'_>,
        config: &ChainConfig,
        _key_name: &str,
        mnemonic: &str,
    ) -> Result<String, RelayerError> {
        if config.chain_type == COSMOS {
            let coin_type = config
                .coin_type_number()
                .map_err(|source| self.key_error(source))?;
            let key = CosmosKey::from_mnemonic(mnemonic, coin_type)
                .map_err(|source| self.key_error(source))?;
            let account = key
                .address(&config.bech32_prefix)
                .map_err(|source| self.key_error(source))?;
            let (private_key, public_key) = key.extended_keys();
            let address: toml::value::Array = key
                .address_bytes()
                .into_iter()
                .map(|byte| toml::Value::Integer(i64::from(byte)))
                .collect();

            let mut keybase = toml::Table::new();
            keybase.insert("public_key".to_owned(), public_key.into());
            keybase.insert("private_key".to_owned(), private_key.into());
            keybase.insert("account".to_owned(), account.clone().into());
            keybase.insert("address".to_owned(), toml::Value::Array(address));
            self.edit_chain_file(jobs, &config.chain_id, move |table| {
                table.insert("keybase".to_owned(), toml::Value::Table(keybase));
            })
            .await?;
            Ok(account)
        } else if is_substrate(&config.chain_type) {
            let keypair = sr25519_from_suri(mnemonic).map_err(|source| self.key_error(source))?;
            let format = config.ss58_format.unwrap_or(DEFAULT_SS58_FORMAT);
            let address = ss58_encode(&keypair.public.to_bytes(), format);
            let secret = mnemonic.to_owned();
            self.edit_chain_file(jobs, &config.chain_id, move |table| {
                table.insert("private_key".to_owned(), secret.into());
            })
            .await?;
            Ok(address)
        } else {
            Err(self.config_error(format!(
                "unsupported chain type {:?} for chain {}",
                config.chain_type, config.chain_id
            )))
        }
    }

    async fn generate_path(
        &self,
        _jobs: &RelayerJobs<'_>,
        src_chain_id: &str,
        dst_chain_id: &str,
        path_name: &str,
    ) -> Result<(), RelayerError> {
        self.paths().insert(
            path_name.to_owned(),
            HyperspacePath {
                chain_a: src_chain_id.to_owned(),
                chain_b: dst_chain_id.to_owned(),
            },
        );
        debug!(path = path_name, src_chain_id, dst_chain_id, "registered hyperspace path");
        Ok(())
    }

    async fn create_clients(
        &self,
        jobs: &RelayerJobs<'_>,
        path_name: &str,
        _opts: &CreateClientOptions,
    ) -> Result<(), RelayerError> {
        let cmd = self.path_command(
            jobs.home_dir(),
            "create-clients",
            path_name,
            "transfer",
            "unordered",
        )?;
        jobs.run(&cmd, TX_TIMEOUT).await.map(|_| ())
    }

    async fn create_connections(
        &self,
        jobs: &RelayerJobs<'_>,
        path_name: &str,
    ) -> Result<(), RelayerError> {
        let cmd = self.path_command(
            jobs.home_dir(),
            "create-connection",
            path_name,
            "transfer",
            "unordered",
        )?;
        jobs.run(&cmd, TX_TIMEOUT).await.map(|_| ())
    }

    async fn create_channel(
        &self,
        jobs: &RelayerJobs<'_>,
        path_name: &str,
        opts: &CreateChannelOptions,
    ) -> Result<(), RelayerError> {
        let mut cmd = self.path_command(
            jobs.home_dir(),
            "create-channel",
            path_name,
            &opts.source_port_name,
            opts.order.as_str(),
        )?;
        cmd.extend(["--version".to_owned(), opts.version.clone()]);
        jobs.run(&cmd, TX_TIMEOUT).await.map(|_| ())
    }

    async fn get_channels(
        &self,
        jobs: &RelayerJobs<'_>,
        chain_id: &str,
    ) -> Result<Vec<ChannelOutput>, RelayerError> {
        let table = self.read_chain_file(jobs, chain_id).await?;
        let whitelist = table
            .get("channel_whitelist")
            .and_then(toml::Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(whitelist
            .iter()
            .filter_map(toml::Value::as_array)
            .filter_map(|entry| {
                let channel_id = entry.first()?.as_str()?;
                let port_id = entry.get(1)?.as_str()?;
                Some(ChannelOutput {
                    channel_id: channel_id.to_owned(),
                    port_id: port_id.to_owned(),
                    ..ChannelOutput::default()
                })
            })
            .collect())
    }

    async fn get_connections(
        &self,
        jobs: &RelayerJobs<'_>,
        chain_id: &str,
    ) -> Result<Vec<ConnectionOutput>, RelayerError> {
        let table = self.read_chain_file(jobs, chain_id).await?;
        Ok(vec![ConnectionOutput {
            id: table_str(&table, "connection_id").to_owned(),
            client_id: table_str(&table, "client_id").to_owned(),
            delay_period: "0".to_owned(),
            ..ConnectionOutput::default()
        }])
    }

    async fn get_clients(
        &self,
        jobs: &RelayerJobs<'_>,
        chain_id: &str,
    ) -> Result<Vec<ClientOutput>, RelayerError> {
        let table = self.read_chain_file(jobs, chain_id).await?;
        let counterparty = self
            .counterparty(chain_id)
            .unwrap_or_else(|| chain_id.to_owned());
        Ok(vec![ClientOutput {
            client_id: table_str(&table, "client_id").to_owned(),
            client_state: ClientState {
                chain_id: counterparty,
            },
        }])
    }

    fn start_command(
        &self,
        home_dir: &str,
        path_names: &[String],
    ) -> Result<Vec<String>, RelayerError> {
        let [path_name] = path_names else {
            return Err(self.config_error(format!(
                "hyperspace relays exactly one path, got {}",
                path_names.len()
            )));
        };
        let mut cmd = self.path_command(home_dir, "relay", path_name, "transfer", "unordered")?;
        cmd.extend(["--version".to_owned(), "ics20-1".to_owned()]);
        Ok(cmd)
    }
}

impl DockerRelayer<Hyperspace> {
    /// Points the Cosmos chain file at an uploaded wasm light client.
    pub async fn set_client_contract_hash(
        &self,
        rep: &dyn RelayerExecReporter,
        chain_id: &str,
        hash: &str,
    ) -> Result<(), RelayerError> {
        let config = self.chain_config(chain_id)?;
        if config.chain_type != COSMOS {
            return Ok(());
        }
        let hash = hash.to_owned();
        let jobs = self.jobs(rep);
        self.commander()
            .edit_chain_file(&jobs, chain_id, move |table| {
                table.insert("wasm_code_id".to_owned(), hash.into());
            })
            .await?;
        info!(chain_id, "set wasm client code id");
        Ok(())
    }
}
