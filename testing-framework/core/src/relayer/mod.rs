mod types;

use std::{collections::BTreeMap, fmt, time::Duration};

use async_trait::async_trait;
use time::OffsetDateTime;

pub use types::{
    ChannelCounterparty, ChannelFilter, ChannelOutput, ClientOutput, ClientState,
    ConnectionCounterparty, ConnectionOutput, ConnectionVersion, CreateChannelOptions,
    CreateClientOptions, FilterRule, Order,
};

use crate::{
    ChainConfig,
    node::NodeError,
    substrate::{EngineError, ExecOutput},
    wallet::{KeyError, Wallet},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    /// Packets may time out on a timestamp.
    TimestampTimeout,
    /// Packets may time out on a height.
    HeightTimeout,
    /// The relayer can flush pending packets on demand.
    Flush,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TimestampTimeout => "TimestampTimeout",
            Self::HeightTimeout => "HeightTimeout",
            Self::Flush => "Flush",
        };
        f.write_str(name)
    }
}

pub type Capabilities = BTreeMap<Capability, bool>;

/// Every capability enabled.
#[must_use]
pub fn full_capabilities() -> Capabilities {
    [
        Capability::TimestampTimeout,
        Capability::HeightTimeout,
        Capability::Flush,
    ]
    .into_iter()
    .map(|c| (c, true))
    .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum RelayerError {
    #[error("relayer {relayer} does not support {operation}")]
    Unsupported {
        relayer: String,
        operation: &'static str,
    },
    #[error("relayer {relayer}: {command:?} exited with {exit_code}: {stderr}")]
    Command {
        relayer: String,
        command: Vec<String>,
        exit_code: i64,
        stdout: String,
        stderr: String,
    },
    #[error("relayer {relayer}: container engine error: {source}")]
    Engine {
        relayer: String,
        #[source]
        source: EngineError,
    },
    #[error("relayer {relayer}: node error: {source}")]
    Node {
        relayer: String,
        #[source]
        source: NodeError,
    },
    #[error("relayer {relayer}: key error: {source}")]
    Key {
        relayer: String,
        #[source]
        source: KeyError,
    },
    #[error("relayer {relayer}: {command:?} timed out after {timeout:?}")]
    Timeout {
        relayer: String,
        command: Vec<String>,
        timeout: Duration,
    },
    #[error("relayer {relayer}: failed to parse {context}: {message}")]
    Parse {
        relayer: String,
        context: String,
        message: String,
    },
    #[error("relayer {relayer}: invalid configuration: {message}")]
    Config { relayer: String, message: String },
    #[error("relayer {relayer}: unknown path {path}")]
    UnknownPath { relayer: String, path: String },
    #[error("relayer {relayer}: no configuration for chain {chain_id}")]
    UnknownChain { relayer: String, chain_id: String },
    #[error("query on {chain_id} failed: {message}")]
    Query { chain_id: String, message: String },
}

impl RelayerError {
    #[must_use]
    pub fn unsupported(relayer: impl Into<String>, operation: &'static str) -> Self {
        Self::Unsupported {
            relayer: relayer.into(),
            operation,
        }
    }

    #[must_use]
    pub fn command(relayer: impl Into<String>, command: &[String], output: &ExecOutput) -> Self {
        Self::Command {
            relayer: relayer.into(),
            command: command.to_vec(),
            exit_code: output.exit_code,
            stdout: output.stdout_string(),
            stderr: output.stderr_string(),
        }
    }

    #[must_use]
    pub fn parse(
        relayer: impl Into<String>,
        context: impl Into<String>,
        message: impl ToString,
    ) -> Self {
        Self::Parse {
            relayer: relayer.into(),
            context: context.into(),
            message: message.to_string(),
        }
    }

    #[must_use]
    pub const fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }
}

/// One relayer CLI invocation, as recorded in the test report.
#[derive(Clone, Debug)]
pub struct RelayerExec {
    pub container_name: String,
    pub command: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub started_at: OffsetDateTime,
    pub finished_at: OffsetDateTime,
    /// Set only when the command could not be run at all.
    pub error: Option<String>,
}

pub trait RelayerExecReporter: Send + Sync {
    fn track_relayer_exec(&self, exec: RelayerExec);
}

/// Relays packets between chains. Every call takes a reporter that records
/// the commands the relayer ran.
#[async_trait]
pub trait Relayer: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Whether the relayer reaches chains over the test network rather than
    /// host ports.
    fn use_docker_network(&self) -> bool;

    async fn add_chain_configuration(
        &self,
        rep: &dyn RelayerExecReporter,
        config: &ChainConfig,
        key_name: &str,
        rpc_addr: &str,
        grpc_addr: &str,
    ) -> Result<(), RelayerError>;

    async fn restore_key(
        &self,
        rep: &dyn RelayerExecReporter,
        config: &ChainConfig,
        key_name: &str,
        mnemonic: &str,
    ) -> Result<(), RelayerError>;

    async fn add_key(
        &self,
        rep: &dyn RelayerExecReporter,
        chain_id: &str,
        key_name: &str,
        coin_type: &str,
    ) -> Result<Wallet, RelayerError>;

    /// Wallet restored or added for `chain_id`, if any.
    async fn get_wallet(&self, chain_id: &str) -> Option<Wallet>;

    async fn generate_path(
        &self,
        rep: &dyn RelayerExecReporter,
        src_chain_id: &str,
        dst_chain_id: &str,
        path_name: &str,
    ) -> Result<(), RelayerError>;

    async fn update_path(
        &self,
        rep: &dyn RelayerExecReporter,
        path_name: &str,
        filter: &ChannelFilter,
    ) -> Result<(), RelayerError>;

    /// Clients, then a connection, then a channel.
    async fn link_path(
        &self,
        rep: &dyn RelayerExecReporter,
        path_name: &str,
        channel_opts: &CreateChannelOptions,
        client_opts: &CreateClientOptions,
    ) -> Result<(), RelayerError>;

    async fn create_clients(
        &self,
        rep: &dyn RelayerExecReporter,
        path_name: &str,
        opts: &CreateClientOptions,
    ) -> Result<(), RelayerError>;

    async fn create_connections(
        &self,
        rep: &dyn RelayerExecReporter,
        path_name: &str,
    ) -> Result<(), RelayerError>;

    async fn create_channel(
        &self,
        rep: &dyn RelayerExecReporter,
        path_name: &str,
        opts: &CreateChannelOptions,
    ) -> Result<(), RelayerError>;

    async fn update_clients(
        &self,
        rep: &dyn RelayerExecReporter,
        path_name: &str,
    ) -> Result<(), RelayerError>;

    async fn flush(
        &self,
        rep: &dyn RelayerExecReporter,
        path_name: &str,
        channel_id: &str,
    ) -> Result<(), RelayerError>;

    async fn get_channels(
        &self,
        rep: &dyn RelayerExecReporter,
        chain_id: &str,
    ) -> Result<Vec<ChannelOutput>, RelayerError>;

    async fn get_connections(
        &self,
        rep: &dyn RelayerExecReporter,
        chain_id: &str,
    ) -> Result<Vec<ConnectionOutput>, RelayerError>;

    async fn get_clients(
        &self,
        rep: &dyn RelayerExecReporter,
        chain_id: &str,
    ) -> Result<Vec<ClientOutput>, RelayerError>;

    /// Starts the relaying daemon and returns once it runs.
    async fn start_relayer(
        &self,
        rep: &dyn RelayerExecReporter,
        path_names: &[String],
    ) -> Result<(), RelayerError>;

    /// Idempotent.
    async fn stop_relayer(&self, rep: &dyn RelayerExecReporter) -> Result<(), RelayerError>;

    async fn exec(
        &self,
        rep: &dyn RelayerExecReporter,
        cmd: &[String],
        env: &[String],
    ) -> Result<ExecOutput, RelayerError>;
}

/// The single `transfer` channel on `src_chain_id` whose connection rides the
/// only client tracking `dst_chain_id`.
pub async fn get_transfer_channel(
    relayer: &dyn Relayer,
    rep: &dyn RelayerExecReporter,
    src_chain_id: &str,
    dst_chain_id: &str,
) -> Result<ChannelOutput, RelayerError> {
    let query_error = |message: String| RelayerError::Query {
        chain_id: src_chain_id.to_owned(),
        message,
    };

    let clients = relayer.get_clients(rep, src_chain_id).await?;
    let mut tracking = clients
        .iter()
        .filter(|c| c.client_state.chain_id == dst_chain_id);
    let client = tracking.next().ok_or_else(|| {
        query_error(format!(
            "unable to find client on {src_chain_id} tracking {dst_chain_id}"
        ))
    })?;
    if tracking.next().is_some() {
        return Err(query_error(format!(
            "found multiple clients on {src_chain_id} tracking {dst_chain_id}"
        )));
    }

    let connections = relayer.get_connections(rep, src_chain_id).await?;
    let mut matching = connections.iter().filter(|c| c.client_id == client.client_id);
    let connection = matching.next().ok_or_else(|| {
        query_error(format!(
            "unable to find connection on {src_chain_id} for client {}",
            client.client_id
        ))
    })?;
    if matching.next().is_some() {
        return Err(query_error(format!(
            "found multiple connections on {src_chain_id} for client {}",
            client.client_id
        )));
    }

    let channels = relayer.get_channels(rep, src_chain_id).await?;
    let mut transfer = channels.into_iter().filter(|c| {
        c.connection_hops.len() == 1
            && c.connection_hops[0] == connection.id
            && c.port_id == "transfer"
    });
    let channel = transfer.next().ok_or_else(|| {
        query_error(format!(
            "no transfer channel found between chains: {src_chain_id} - {dst_chain_id}"
        ))
    })?;
    if transfer.next().is_some() {
        return Err(query_error(format!(
            "found multiple transfer channels on {src_chain_id} for connection {}",
            connection.id
        )));
    }
    Ok(channel)
}

#[cfg(test)]
mod tests {
    use super::{Capability, full_capabilities};

    #[test]
    fn capability_names_match_report_vocabulary() {
        let caps = full_capabilities();
        assert_eq!(caps.len(), 3);
        assert!(caps.values().all(|enabled| *enabled));
        assert_eq!(Capability::TimestampTimeout.to_string(), "TimestampTimeout");
    }
}
