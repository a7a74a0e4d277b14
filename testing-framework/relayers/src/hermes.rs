//! Hermes. Configuration lives in one TOML file that is re-rendered from
//! in-memory state whenever a chain or path filter changes; path names only
//! exist on this side.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use interchaintest_core::{
    chain::{ChainConfig, DockerImage},
    relayer::{
        Capabilities, Capability, ChannelCounterparty, ChannelFilter, ChannelOutput,
        ClientOutput, ClientState, ConnectionCounterparty, ConnectionOutput, ConnectionVersion,
        CreateChannelOptions, CreateClientOptions, FilterRule, RelayerError, full_capabilities,
    },
    wallet::cosmos::generate_mnemonic,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::debug;

use crate::docker::{
    CONFIG_TIMEOUT, QUERY_TIMEOUT, RelayerCommander, RelayerJobs, RelayerKey, TX_TIMEOUT,
};

pub const HERMES_IMAGE: &str = "ghcr.io/informalsystems/hermes";
pub const HERMES_VERSION: &str = "1.7.4";
pub const HERMES_UID_GID: &str = "1000:1000";

const CONFIG_PATH: &str = ".hermes/config.toml";
const DEFAULT_TRUSTING_PERIOD: &str = "14days";

const CONFIG_TEMPLATE: &str = r"[global]
log_level = 'info'

[mode.clients]
enabled = true
refresh = true
misbehaviour = false

[mode.connections]
enabled = true

[mode.channels]
enabled = true

[mode.packets]
enabled = true
clear_interval = 0
clear_on_start = true
tx_confirmation = false

[rest]
enabled = false
host = '127.0.0.1'
port = 3000

[telemetry]
enabled = false
host = '127.0.0.1'
port = 3001
{% for chain in chains %}
[[chains]]
id = '{{ chain.id }}'
type = 'CosmosSdk'
rpc_addr = '{{ chain.rpc_addr }}'
grpc_addr = '{{ chain.grpc_addr }}'
event_source = { mode = 'push', url = '{{ chain.event_source }}', batch_delay = '500ms' }
rpc_timeout = '10s'
account_prefix = '{{ chain.account_prefix }}'
key_name = '{{ chain.key_name }}'
key_store_type = 'Test'
store_prefix = 'ibc'
default_gas = 100000
max_gas = 400000
gas_price = { price = {{ chain.gas_price }}, denom = '{{ chain.gas_denom }}' }
gas_multiplier = {{ chain.gas_multiplier }}
max_msg_num = 30
max_tx_size = 2097152
clock_drift = '5s'
max_block_time = '30s'
trusting_period = '{{ chain.trusting_period }}'
trust_threshold = { numerator = '1', denominator = '3' }
memo_prefix = 'hermes'
address_type = { derivation = 'cosmos' }
{% if chain.packet_filter %}
[chains.packet_filter]
policy = '{{ chain.packet_filter.policy }}'
list = [{% for channel in chain.packet_filter.channels %}['*', '{{ channel }}'], {% endfor %}]
{% endif %}{% endfor %}";

#[derive(Clone, Debug, Serialize)]
struct PacketFilter {
    policy: &'static str,
    channels: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
struct HermesChain {
    id: String,
    rpc_addr: String,
    grpc_addr: String,
    event_source: String,
    account_prefix: String,
    key_name: String,
    gas_price: String,
    gas_denom: String,
    gas_multiplier: f64,
    trusting_period: String,
    packet_filter: Option<PacketFilter>,
}

/// Both ends of a path plus the identifiers created along the way.
#[derive(Clone, Debug, Default)]
struct HermesPath {
    chain_a: String,
    chain_b: String,
    client_a: Option<String>,
    client_b: Option<String>,
    connection_a: Option<String>,
    filter: Option<ChannelFilter>,
}

#[derive(Debug, Default)]
struct HermesState {
    chains: BTreeMap<String, HermesChain>,
    paths: BTreeMap<String, HermesPath>,
}

#[derive(Serialize)]
struct ConfigContext<'a> {
    chains: Vec<&'a HermesChain>,
}

#[derive(Debug, Default)]
pub struct Hermes {
    state: Mutex<HermesState>,
}

impl Hermes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HermesState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cmd(home_dir: &str, json: bool, args: &[&str]) -> Vec<String> {
        let mut cmd = vec![
            "hermes".to_owned(),
            "--config".to_owned(),
            format!("{home_dir}/{CONFIG_PATH}"),
        ];
        if json {
            cmd.push("--json".to_owned());
        }
        cmd.extend(args.iter().map(|arg| (*arg).to_owned()));
        cmd
    }

    async fn run_json(
        &self,
        jobs: &RelayerJobs<'_>,
        args: &[&str],
        timeout: Duration,
    ) -> Result<Value, RelayerError> {
        let cmd = Self::cmd(jobs.home_dir(), true, args);
        let stdout = jobs.run(&cmd, timeout).await?.stdout_string();
        last_json_line(&stdout)
            .ok_or_else(|| RelayerError::parse(self.name(), args.join(" "), "no JSON result"))
    }

    fn path(&self, path_name: &str) -> Result<HermesPath, RelayerError> {
        self.state()
            .paths
            .get(path_name)
            .cloned()
            .ok_or_else(|| RelayerError::UnknownPath {
                relayer: self.name().to_owned(),
                path: path_name.to_owned(),
            })
    }

    fn update_path_state(&self, path_name: &str, update: impl FnOnce(&mut HermesPath)) {
        if let Some(path) = self.state().paths.get_mut(path_name) {
            update(path);
        }
    }

    /// Renders the config from the current state. Filters of every path
    /// touching a chain are merged onto that chain; the first rule wins.
    fn render_config(&self) -> Result<String, RelayerError> {
        let state = self.state();
        let mut chains: Vec<HermesChain> = state.chains.values().cloned().collect();
        for chain in &mut chains {
            let mut filter: Option<PacketFilter> = None;
            for path in state.paths.values() {
                let Some(path_filter) = &path.filter else {
                    continue;
                };
                if path.chain_a != chain.id && path.chain_b != chain.id {
                    continue;
                }
                let entry = filter.get_or_insert_with(|| PacketFilter {
                    policy: match path_filter.rule {
                        FilterRule::Allowlist => "allow",
                        FilterRule::Denylist => "deny",
                    },
                    channels: Vec::new(),
                });
                entry.channels.extend(path_filter.channel_list.iter().cloned());
            }
            chain.packet_filter = filter;
        }
        drop(state);

        let context = ConfigContext {
            chains: chains.iter().collect(),
        };
        let context = tera::Context::from_serialize(&context)
            .map_err(|err| RelayerError::parse(self.name(), "config context", err))?;
        tera::Tera::one_off(CONFIG_TEMPLATE, &context, false).map_err(|err| {
            RelayerError::Config {
                relayer: self.name().to_owned(),
                message: format!("rendering config: {err}"),
            }
        })
    }

    async fn write_config(&self, jobs: &RelayerJobs<'_>) -> Result<(), RelayerError> {
        let config = self.render_config()?;
        jobs.write_file(CONFIG_PATH, config.as_bytes()).await
    }

    fn chain_entry(
        &self,
        config: &ChainConfig,
        key_name: &str,
        rpc_addr: &str,
        grpc_addr: &str,
    ) -> Result<HermesChain, RelayerError> {
        let price = config
            .gas_prices
            .strip_suffix(config.denom.as_str())
            .unwrap_or(&config.gas_prices);
        if price.parse::<f64>().is_err() {
            return Err(RelayerError::Config {
                relayer: self.name().to_owned(),
                message: format!(
                    "gas prices {:?} are not a number of {}",
                    config.gas_prices, config.denom
                ),
            });
        }
        let trusting_period = if config.trusting_period.is_empty() {
            DEFAULT_TRUSTING_PERIOD.to_owned()
        } else {
            config.trusting_period.clone()
        };

        Ok(HermesChain {
            id: config.chain_id.clone(),
            rpc_addr: with_scheme(rpc_addr, "http"),
            grpc_addr: with_scheme(grpc_addr, "http"),
            event_source: format!(
                "{}/websocket",
                with_scheme(rpc_addr, "http").replacen("http", "ws", 1)
            ),
            account_prefix: config.bech32_prefix.clone(),
            key_name: key_name.to_owned(),
            gas_price: price.to_owned(),
            gas_denom: config.denom.clone(),
            gas_multiplier: config.gas_adjustment.max(1.0),
            trusting_period,
            packet_filter: None,
        })
    }

    fn client_id(&self, output: &Value) -> Result<String, RelayerError> {
        output
            .pointer("/result/CreateClient/client_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| RelayerError::parse(self.name(), "create client", output))
    }
}

fn with_scheme(addr: &str, scheme: &str) -> String {
    if addr.contains("://") {
        addr.to_owned()
    } else {
        format!("{scheme}://{addr}")
    }
}

/// Hermes logs before printing its result; the result is the last JSON line.
fn last_json_line(stdout: &str) -> Option<Value> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .find_map(|line| serde_json::from_str::<Value>(line).ok())
}

/// The `(address)` in the `keys add` result.
fn parse_key_address(stdout: &str) -> Option<String> {
    let start = stdout.find('(')? + 1;
    let end = stdout[start..].find(')')? + start;
    Some(stdout[start..end].to_owned())
}

fn results<T: DeserializeOwned>(
    relayer: &str,
    what: &str,
    output: Value,
) -> Result<Vec<T>, RelayerError> {
    let result = output
        .get("result")
        .cloned()
        .ok_or_else(|| RelayerError::parse(relayer, what, "missing result"))?;
    serde_json::from_value(result).map_err(|err| RelayerError::parse(relayer, what, err))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChannelRemote {
    channel_id: String,
    port_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChannelEnd {
    connection_hops: Vec<String>,
    ordering: String,
    state: String,
    version: String,
    remote: ChannelRemote,
}

#[derive(Debug, Deserialize)]
struct ChannelResult {
    channel_end: ChannelEnd,
    #[serde(default)]
    counterparty_channel_end: ChannelEnd,
}

impl From<ChannelResult> for ChannelOutput {
    fn from(result: ChannelResult) -> Self {
        let ChannelResult {
            channel_end,
            counterparty_channel_end,
        } = result;
        Self {
            state: channel_end.state,
            ordering: channel_end.ordering,
            counterparty: ChannelCounterparty {
                port_id: counterparty_channel_end.remote.port_id,
                channel_id: counterparty_channel_end.remote.channel_id,
            },
            connection_hops: channel_end.connection_hops,
            version: channel_end.version,
            port_id: channel_end.remote.port_id,
            channel_id: channel_end.remote.channel_id,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HermesConnectionCounterparty {
    client_id: String,
    connection_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConnectionEnd {
    client_id: String,
    counterparty: HermesConnectionCounterparty,
    state: String,
    versions: Vec<ConnectionVersion>,
    delay_period: Value,
}

#[derive(Debug, Deserialize)]
struct ConnectionResult {
    connection_id: String,
    connection_end: ConnectionEnd,
}

impl From<ConnectionResult> for ConnectionOutput {
    fn from(result: ConnectionResult) -> Self {
        let end = result.connection_end;
        let delay_period = match end.delay_period {
            Value::Null => String::new(),
            Value::String(period) => period,
            other => other.to_string(),
        };
        Self {
            id: result.connection_id,
            client_id: end.client_id,
            versions: end.versions,
            state: end.state,
            counterparty: ConnectionCounterparty {
                client_id: end.counterparty.client_id,
                connection_id: end.counterparty.connection_id.unwrap_or_default(),
            },
            delay_period,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClientResult {
    client_id: String,
    chain_id: String,
}

#[async_trait]
impl RelayerCommander for Hermes {
    fn name(&self) -> &'static str {
        "hermes"
    }

    fn default_image(&self) -> DockerImage {
        DockerImage::new(HERMES_IMAGE, HERMES_VERSION, HERMES_UID_GID)
    }

    fn capabilities(&self) -> Capabilities {
        let mut caps = full_capabilities();
        caps.insert(Capability::TimestampTimeout, false);
        caps
    }

    async fn add_chain_configuration(
        &self,
        jobs: &RelayerJobs<'_>,
        config: &ChainConfig,
        key_name: &str,
        rpc_addr: &str,
        grpc_addr: &str,
    ) -> Result<(), RelayerError> {
        let entry = self.chain_entry(config, key_name, rpc_addr, grpc_addr)?;
        self.state().chains.insert(config.chain_id.clone(), entry);
        self.write_config(jobs).await
    }

    async fn restore_key(
        &self,
        jobs: &RelayerJobs<'_>,
        config: &ChainConfig,
        key_name: &str,
        mnemonic: &str,
    ) -> Result<String, RelayerError> {
        let coin_type = config.coin_type_number().map_err(|source| RelayerError::Key {
            relayer: self.name().to_owned(),
            source,
        })?;
        let rel_path = format!("{}.mnemonic", config.chain_id);
        jobs.write_file(&rel_path, mnemonic.as_bytes()).await?;

        let mnemonic_file = format!("{}/{rel_path}", jobs.home_dir());
        let hd_path = format!("m/44'/{coin_type}'/0'/0/0");
        let args = [
            "keys",
            "add",
            "--chain",
            config.chain_id.as_str(),
            "--mnemonic-file",
            mnemonic_file.as_str(),
            "--key-name",
            key_name,
            "--hd-path",
            hd_path.as_str(),
            "--overwrite",
        ];
        let cmd = Self::cmd(jobs.home_dir(), false, &args);
        let stdout = jobs.run(&cmd, CONFIG_TIMEOUT).await?.stdout_string();
        parse_key_address(&stdout)
            .ok_or_else(|| RelayerError::parse(self.name(), "keys add output", stdout.trim()))
    }

    /// Hermes cannot generate keys; a fresh mnemonic is restored instead.
    async fn add_key(
        &self,
        jobs: &RelayerJobs<'_>,
        config: &ChainConfig,
        key_name: &str,
        _coin_type: &str,
    ) -> Result<RelayerKey, RelayerError> {
        let mnemonic = generate_mnemonic();
        let address = self.restore_key(jobs, config, key_name, &mnemonic).await?;
        Ok(RelayerKey { address, mnemonic })
    }

    async fn generate_path(
        &self,
        _jobs: &RelayerJobs<'_>,
        src_chain_id: &str,
        dst_chain_id: &str,
        path_name: &str,
    ) -> Result<(), RelayerError> {
        let mut state = self.state();
        for chain_id in [src_chain_id, dst_chain_id] {
            if !state.chains.contains_key(chain_id) {
                return Err(RelayerError::UnknownChain {
                    relayer: self.name().to_owned(),
                    chain_id: chain_id.to_owned(),
                });
            }
        }
        state.paths.insert(
            path_name.to_owned(),
            HermesPath {
                chain_a: src_chain_id.to_owned(),
                chain_b: dst_chain_id.to_owned(),
                ..HermesPath::default()
            },
        );
        debug!(path = path_name, src_chain_id, dst_chain_id, "registered hermes path");
        Ok(())
    }

    async fn update_path(
        &self,
        jobs: &RelayerJobs<'_>,
        path_name: &str,
        filter: &ChannelFilter,
    ) -> Result<(), RelayerError> {
        self.path(path_name)?;
        self.update_path_state(path_name, |path| path.filter = Some(filter.clone()));
        self.write_config(jobs).await
    }

    async fn link_path(
        &self,
        jobs: &RelayerJobs<'_>,
        path_name: &str,
        channel_opts: &CreateChannelOptions,
        client_opts: &CreateClientOptions,
    ) -> Result<(), RelayerError> {
        let path = self.path(path_name)?;
        if !client_opts.uses_relayer_default() {
            debug!(
                path = path_name,
                trusting_period = %client_opts.trusting_period,
                "hermes picks its own client options when linking in one step"
            );
        }
        let args = [
            "create",
            "channel",
            "--a-chain",
            path.chain_a.as_str(),
            "--b-chain",
            path.chain_b.as_str(),
            "--a-port",
            channel_opts.source_port_name.as_str(),
            "--b-port",
            channel_opts.dest_port_name.as_str(),
            "--order",
            channel_opts.order.as_str(),
            "--channel-version",
            channel_opts.version.as_str(),
            "--new-client-connection",
            "--yes",
        ];
        self.run_json(jobs, &args, TX_TIMEOUT).await.map(|_| ())
    }

    async fn create_clients(
        &self,
        jobs: &RelayerJobs<'_>,
        path_name: &str,
        opts: &CreateClientOptions,
    ) -> Result<(), RelayerError> {
        let path = self.path(path_name)?;
        let mut client_ids = Vec::with_capacity(2);
        for (host, reference) in [(&path.chain_a, &path.chain_b), (&path.chain_b, &path.chain_a)] {
            let mut args = vec![
                "create",
                "client",
                "--host-chain",
                host.as_str(),
                "--reference-chain",
                reference.as_str(),
            ];
            if !opts.uses_relayer_default() {
                args.extend(["--trusting-period", opts.trusting_period.as_str()]);
            }
            let output = self.run_json(jobs, &args, TX_TIMEOUT).await?;
            client_ids.push(self.client_id(&output)?);
        }

        let client_b = client_ids.pop();
        let client_a = client_ids.pop();
        self.update_path_state(path_name, |path| {
            path.client_a = client_a;
            path.client_b = client_b;
        });
        Ok(())
    }

    async fn create_connections(
        &self,
        jobs: &RelayerJobs<'_>,
        path_name: &str,
    ) -> Result<(), RelayerError> {
        let path = self.path(path_name)?;
        let (Some(client_a), Some(client_b)) = (&path.client_a, &path.client_b) else {
            return Err(RelayerError::Config {
                relayer: self.name().to_owned(),
                message: format!("path {path_name} has no clients yet"),
            });
        };
        let args = [
            "create",
            "connection",
            "--a-chain",
            path.chain_a.as_str(),
            "--a-client",
            client_a.as_str(),
            "--b-client",
            client_b.as_str(),
        ];
        let output = self.run_json(jobs, &args, TX_TIMEOUT).await?;
        let connection = output
            .pointer("/result/a_side/connection_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| RelayerError::parse(self.name(), "create connection", &output))?;
        self.update_path_state(path_name, |path| path.connection_a = Some(connection));
        Ok(())
    }

    async fn create_channel(
        &self,
        jobs: &RelayerJobs<'_>,
        path_name: &str,
        opts: &CreateChannelOptions,
    ) -> Result<(), RelayerError> {
        let path = self.path(path_name)?;
        let Some(connection) = &path.connection_a else {
            return Err(RelayerError::Config {
                relayer: self.name().to_owned(),
                message: format!("path {path_name} has no connection yet"),
            });
        };
        let args = [
            "create",
            "channel",
            "--a-chain",
            path.chain_a.as_str(),
            "--a-connection",
            connection.as_str(),
            "--a-port",
            opts.source_port_name.as_str(),
            "--b-port",
            opts.dest_port_name.as_str(),
            "--order",
            opts.order.as_str(),
            "--channel-version",
            opts.version.as_str(),
        ];
        self.run_json(jobs, &args, TX_TIMEOUT).await.map(|_| ())
    }

    async fn update_clients(
        &self,
        jobs: &RelayerJobs<'_>,
        path_name: &str,
    ) -> Result<(), RelayerError> {
        let path = self.path(path_name)?;
        for (host, client) in [(&path.chain_a, &path.client_a), (&path.chain_b, &path.client_b)] {
            let Some(client) = client else {
                return Err(RelayerError::Config {
                    relayer: self.name().to_owned(),
                    message: format!("path {path_name} has no client on {host}"),
                });
            };
            let args = [
                "update",
                "client",
                "--host-chain",
                host.as_str(),
                "--client",
                client.as_str(),
            ];
            self.run_json(jobs, &args, TX_TIMEOUT).await?;
        }
        Ok(())
    }

    async fn flush(
        &self,
        jobs: &RelayerJobs<'_>,
        path_name: &str,
        channel_id: &str,
    ) -> Result<(), RelayerError> {
        let path = self.path(path_name)?;
        let channels = self.get_channels(jobs, &path.chain_a).await?;
        let channel = channels
            .iter()
            .find(|channel| channel.channel_id == channel_id)
            .ok_or_else(|| RelayerError::Query {
                chain_id: path.chain_a.clone(),
                message: format!("channel {channel_id} not found"),
            })?;
        let args = [
            "clear",
            "packets",
            "--chain",
            path.chain_a.as_str(),
            "--channel",
            channel_id,
            "--port",
            channel.port_id.as_str(),
        ];
        self.run_json(jobs, &args, TX_TIMEOUT).await.map(|_| ())
    }

    async fn get_channels(
        &self,
        jobs: &RelayerJobs<'_>,
        chain_id: &str,
    ) -> Result<Vec<ChannelOutput>, RelayerError> {
        let args = [
            "query",
            "channels",
            "--chain",
            chain_id,
            "--show-counterparty",
            "--verbose",
        ];
        let output = self.run_json(jobs, &args, QUERY_TIMEOUT).await?;
        let channels: Vec<ChannelResult> = results(self.name(), "query channels", output)?;
        Ok(channels.into_iter().map(ChannelOutput::from).collect())
    }

    async fn get_connections(
        &self,
        jobs: &RelayerJobs<'_>,
        chain_id: &str,
    ) -> Result<Vec<ConnectionOutput>, RelayerError> {
        let args = ["query", "connections", "--chain", chain_id, "--verbose"];
        let output = self.run_json(jobs, &args, QUERY_TIMEOUT).await?;
        let connections: Vec<ConnectionResult> =
            results(self.name(), "query connections", output)?;
        Ok(connections.into_iter().map(ConnectionOutput::from).collect())
    }

    async fn get_clients(
        &self,
        jobs: &RelayerJobs<'_>,
        chain_id: &str,
    ) -> Result<Vec<ClientOutput>, RelayerError> {
        let args = ["query", "clients", "--host-chain", chain_id];
        let output = self.run_json(jobs, &args, QUERY_TIMEOUT).await?;
        let clients: Vec<ClientResult> = results(self.name(), "query clients", output)?;
        Ok(clients
            .into_iter()
            .map(|client| ClientOutput {
                client_id: client.client_id,
                client_state: ClientState {
                    chain_id: client.chain_id,
                },
            })
            .collect())
    }

    fn start_command(
        &self,
        home_dir: &str,
        _path_names: &[String],
    ) -> Result<Vec<String>, RelayerError> {
        Ok(Self::cmd(home_dir, true, &["start", "--full-scan"]))
    }
}
