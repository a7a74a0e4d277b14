//! The Go relayer (`rly`).

use std::time::Duration;

use async_trait::async_trait;
use interchaintest_core::{
    chain::{ChainConfig, DockerImage},
    relayer::{
        Capabilities, Capability, ChannelFilter, ChannelOutput, ClientOutput, ConnectionOutput,
        CreateChannelOptions, CreateClientOptions, RelayerError, full_capabilities,
    },
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::warn;

use crate::docker::{
    CONFIG_TIMEOUT, QUERY_TIMEOUT, RelayerCommander, RelayerJobs, RelayerKey, TX_TIMEOUT,
    optional_flag,
};

pub const RLY_IMAGE: &str = "ghcr.io/cosmos/relayer";
pub const RLY_VERSION: &str = "v2.5.2";
pub const RLY_UID_GID: &str = "100:1000";

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct RlyChainValue<'a> {
    key: &'a str,
    chain_id: &'a str,
    rpc_addr: &'a str,
    grpc_addr: &'a str,
    account_prefix: &'a str,
    keyring_backend: &'a str,
    gas_adjustment: f64,
    gas_prices: &'a str,
    debug: bool,
    timeout: &'a str,
    output_format: &'a str,
    sign_mode: &'a str,
}

/// One `rly chains add -f` file.
#[derive(Debug, Serialize)]
struct RlyChainConfig<'a> {
    #[serde(rename = "type")]
    chain_type: &'a str,
    value: RlyChainValue<'a>,
}

#[derive(Debug, Deserialize)]
struct AddedKey {
    mnemonic: String,
    address: String,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Rly;

impl Rly {
    fn cmd(home_dir: &str, args: &[&str]) -> Vec<String> {
        let mut cmd = Vec::with_capacity(args.len() + 3);
        cmd.push("rly".to_owned());
        cmd.extend(args.iter().map(|arg| (*arg).to_owned()));
        cmd.push("--home".to_owned());
        cmd.push(home_dir.to_owned());
        cmd
    }

    async fn run(
        jobs: &RelayerJobs<'_>,
        args: &[&str],
        extra: Vec<String>,
        timeout: Duration,
    ) -> Result<String, RelayerError> {
        let mut cmd = Self::cmd(jobs.home_dir(), args);
        cmd.extend(extra);
        Ok(jobs.run(&cmd, timeout).await?.stdout_string())
    }

    fn channel_flags(opts: &CreateChannelOptions) -> Vec<String> {
        vec![
            "--src-port".to_owned(),
            opts.source_port_name.clone(),
            "--dst-port".to_owned(),
            opts.dest_port_name.clone(),
            "--order".to_owned(),
            opts.order.as_str().to_owned(),
            "--version".to_owned(),
            opts.version.clone(),
        ]
    }

    async fn query<T: DeserializeOwned>(
        jobs: &RelayerJobs<'_>,
        what: &str,
        chain_id: &str,
    ) -> Result<Vec<T>, RelayerError> {
        let stdout = Self::run(jobs, &["q", what, chain_id], Vec::new(), QUERY_TIMEOUT).await?;
        Ok(parse_json_lines(what, &stdout))
    }
}

/// One JSON document per line; lines that do not parse are logged and
/// skipped.
fn parse_json_lines<T: DeserializeOwned>(what: &str, stdout: &str) -> Vec<T> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(item) => Some(item),
            Err(err) => {
                warn!(query = what, line, error = %err, "skipping unparsable rly output");
                None
            }
        })
        .collect()
}

#[async_trait]
impl RelayerCommander for Rly {
    fn name(&self) -> &'static str {
        "rly"
    }

    fn default_image(&self) -> DockerImage {
        DockerImage::new(RLY_IMAGE, RLY_VERSION, RLY_UID_GID)
    }

    fn capabilities(&self) -> Capabilities {
        let mut caps = full_capabilities();
        caps.insert(Capability::TimestampTimeout, false);
        caps
    }

    async fn init(&self, jobs: &RelayerJobs<'_>) -> Result<(), RelayerError> {
        Self::run(jobs, &["config", "init"], Vec::new(), CONFIG_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn add_chain_configuration(
        &self,
        jobs: &RelayerJobs<'_>,
        config: &ChainConfig,
        key_name: &str,
        rpc_addr: &str,
        grpc_addr: &str,
    ) -> Result<(), RelayerError> {
        let file = RlyChainConfig {
            chain_type: &config.chain_type,
            value: RlyChainValue {
                key: key_name,
                chain_id: &config.chain_id,
                rpc_addr,
                grpc_addr,
                account_prefix: &config.bech32_prefix,
                keyring_backend: "test",
                gas_adjustment: config.gas_adjustment,
                gas_prices: &config.gas_prices,
                debug: true,
                timeout: "10s",
                output_format: "json",
                sign_mode: "direct",
            },
        };
        let json = serde_json::to_vec(&file)
            .map_err(|err| RelayerError::parse(self.name(), "chain configuration", err))?;
        let rel_path = format!("{}.json", config.chain_id);
        jobs.write_file(&rel_path, &json).await?;

        let path = format!("{}/{rel_path}", jobs.home_dir());
        let args = ["chains", "add", "-f", path.as_str(), config.chain_id.as_str()];
        Self::run(jobs, &args, Vec::new(), CONFIG_TIMEOUT)
            .await
            .map(|_| ())
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
        let args = ["keys", "restore", config.chain_id.as_str(), key_name, mnemonic];
        let extra = vec!["--coin-type".to_owned(), coin_type.to_string()];
        let stdout = Self::run(jobs, &args, extra, CONFIG_TIMEOUT).await?;
        Ok(stdout.trim().to_owned())
    }

    async fn add_key(
        &self,
        jobs: &RelayerJobs<'_>,
        config: &ChainConfig,
        key_name: &str,
        coin_type: &str,
    ) -> Result<RelayerKey, RelayerError> {
        let args = ["keys", "add", config.chain_id.as_str(), key_name];
        let extra = optional_flag("--coin-type", coin_type);
        let stdout = Self::run(jobs, &args, extra, CONFIG_TIMEOUT).await?;
        let key: AddedKey = serde_json::from_str(stdout.trim())
            .map_err(|err| RelayerError::parse(self.name(), "keys add output", err))?;
        Ok(RelayerKey {
            address: key.address,
            mnemonic: key.mnemonic,
        })
    }

    async fn generate_path(
        &self,
        jobs: &RelayerJobs<'_>,
        src_chain_id: &str,
        dst_chain_id: &str,
        path_name: &str,
    ) -> Result<(), RelayerError> {
        let args = ["paths", "new", src_chain_id, dst_chain_id, path_name];
        Self::run(jobs, &args, Vec::new(), CONFIG_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn update_path(
        &self,
        jobs: &RelayerJobs<'_>,
        path_name: &str,
        filter: &ChannelFilter,
    ) -> Result<(), RelayerError> {
        let extra = vec![
            "--filter-rule".to_owned(),
            filter.rule.as_str().to_owned(),
            "--filter-channels".to_owned(),
            filter.channel_list.join(","),
        ];
        Self::run(jobs, &["paths", "update", path_name], extra, CONFIG_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn link_path(
        &self,
        jobs: &RelayerJobs<'_>,
        path_name: &str,
        channel_opts: &CreateChannelOptions,
        client_opts: &CreateClientOptions,
    ) -> Result<(), RelayerError> {
        let mut extra = Self::channel_flags(channel_opts);
        extra.extend(optional_flag("--client-tp", &client_opts.trusting_period));
        Self::run(jobs, &["tx", "link", path_name], extra, TX_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn create_clients(
        &self,
        jobs: &RelayerJobs<'_>,
        path_name: &str,
        opts: &CreateClientOptions,
    ) -> Result<(), RelayerError> {
        let extra = optional_flag("--client-tp", &opts.trusting_period);
        Self::run(jobs, &["tx", "clients", path_name], extra, TX_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn create_connections(
        &self,
        jobs: &RelayerJobs<'_>,
        path_name: &str,
    ) -> Result<(), RelayerError> {
        Self::run(jobs, &["tx", "connection", path_name], Vec::new(), TX_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn create_channel(
        &self,
        jobs: &RelayerJobs<'_>,
        path_name: &str,
        opts: &CreateChannelOptions,
    ) -> Result<(), RelayerError> {
        let extra = Self::channel_flags(opts);
        Self::run(jobs, &["tx", "channel", path_name], extra, TX_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn update_clients(
        &self,
        jobs: &RelayerJobs<'_>,
        path_name: &str,
    ) -> Result<(), RelayerError> {
        Self::run(jobs, &["tx", "update-clients", path_name], Vec::new(), TX_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn flush(
        &self,
        jobs: &RelayerJobs<'_>,
        path_name: &str,
        channel_id: &str,
    ) -> Result<(), RelayerError> {
        let args = ["tx", "flush", path_name, channel_id];
        Self::run(jobs, &args, Vec::new(), TX_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn get_channels(
        &self,
        jobs: &RelayerJobs<'_>,
        chain_id: &str,
    ) -> Result<Vec<ChannelOutput>, RelayerError> {
        Self::query(jobs, "channels", chain_id).await
    }

    async fn get_connections(
        &self,
        jobs: &RelayerJobs<'_>,
        chain_id: &str,
    ) -> Result<Vec<ConnectionOutput>, RelayerError> {
        Self::query(jobs, "connections", chain_id).await
    }

    async fn get_clients(
        &self,
        jobs: &RelayerJobs<'_>,
        chain_id: &str,
    ) -> Result<Vec<ClientOutput>, RelayerError> {
        Self::query(jobs, "clients", chain_id).await
    }

    fn start_command(
        &self,
        home_dir: &str,
        path_names: &[String],
    ) -> Result<Vec<String>, RelayerError> {
        let mut cmd = vec!["rly".to_owned(), "start".to_owned()];
        cmd.extend_from_slice(path_names);
        cmd.extend(["--home".to_owned(), home_dir.to_owned(), "--debug".to_owned()]);
        Ok(cmd)
    }
}
