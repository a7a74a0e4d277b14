use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;

use super::chain::{Journal, note};
use crate::{
    chain::ChainConfig,
    relayer::{
        Capabilities, ChannelCounterparty, ChannelFilter, ChannelOutput, ClientOutput, ClientState,
        ConnectionCounterparty, ConnectionOutput, CreateChannelOptions, CreateClientOptions,
        Relayer, RelayerError, RelayerExecReporter, full_capabilities,
    },
    substrate::ExecOutput,
    wallet::{Wallet, cosmos_wallet},
};

#[derive(Default)]
struct State {
    configs: BTreeMap<String, ChainConfig>,
    addresses: BTreeMap<String, (String, String)>,
    wallets: BTreeMap<String, Wallet>,
    paths: BTreeMap<String, (String, String)>,
    channels: BTreeMap<String, Vec<ChannelOutput>>,
    connections: BTreeMap<String, Vec<ConnectionOutput>>,
    clients: BTreeMap<String, Vec<ClientOutput>>,
    client_opts: BTreeMap<String, CreateClientOptions>,
    running: Option<Vec<String>>,
    fail_link: Option<String>,
}

impl State {
    fn next_index(&self, chain_id: &str) -> usize {
        self.channels.get(chain_id).map_or(0, Vec::len)
    }
}

/// In-memory [`Relayer`]. Linking a path fabricates one client, connection
/// and channel on each side.
pub struct FakeRelayer {
    name: String,
    use_docker_network: bool,
    journal: Journal,
    state: Mutex<State>,
}

impl FakeRelayer {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            use_docker_network: true,
            journal: Journal::default(),
            state: Mutex::new(State::default()),
        }
    }

    #[must_use]
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    #[must_use]
    pub const fn with_host_network(mut self) -> Self {
        self.use_docker_network = false;
        self
    }

    /// Makes `link_path` fail with `message`.
    #[must_use]
    pub fn failing_link(self, message: &str) -> Self {
        self.lock().fail_link = Some(message.to_owned());
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `(rpc, grpc)` the relayer was configured with for `chain_id`.
    #[must_use]
    pub fn addresses(&self, chain_id: &str) -> Option<(String, String)> {
        self.lock().addresses.get(chain_id).cloned()
    }

    #[must_use]
    pub fn paths(&self) -> BTreeMap<String, (String, String)> {
        self.lock().paths.clone()
    }

    /// Options the clients of `path_name` were last created with.
    #[must_use]
    pub fn client_options(&self, path_name: &str) -> Option<CreateClientOptions> {
        self.lock().client_opts.get(path_name).cloned()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lock().running.is_some()
    }

    fn record(&self, entry: String) {
        note(&self.journal, entry);
    }

    fn path(&self, path_name: &str) -> Result<(String, String), RelayerError> {
        self.lock()
            .paths
            .get(path_name)
            .cloned()
            .ok_or_else(|| RelayerError::UnknownPath {
                relayer: self.name.clone(),
                path: path_name.to_owned(),
            })
    }
}

#[async_trait]
impl Relayer for FakeRelayer {
    fn capabilities(&self) -> Capabilities {
        full_capabilities()
    }

    fn use_docker_network(&self) -> bool {
        self.use_docker_network
    }

    async fn add_chain_configuration(
        &self,
        _rep: &dyn RelayerExecReporter,
        config: &ChainConfig,
        key_name: &str,
        rpc_addr: &str,
        grpc_addr: &str,
    ) -> Result<(), RelayerError> {
        let mut state = self.lock();
        state
            .configs
            .insert(config.chain_id.clone(), config.clone());
        state.addresses.insert(
            config.chain_id.clone(),
            (rpc_addr.to_owned(), grpc_addr.to_owned()),
        );
        drop(state);
        self.record(format!(
            "add_chain_configuration {} {} {key_name}",
            self.name, config.chain_id
        ));
        Ok(())
    }

    async fn restore_key(
        &self,
        _rep: &dyn RelayerExecReporter,
        config: &ChainConfig,
        key_name: &str,
        mnemonic: &str,
    ) -> Result<(), RelayerError> {
        let wallet = cosmos_wallet(key_name, Some(mnemonic), config).map_err(|source| {
            RelayerError::Key {
                relayer: self.name.clone(),
                source,
            }
        })?;
        self.lock().wallets.insert(config.chain_id.clone(), wallet);
        self.record(format!("restore_key {} {} {key_name}", self.name, config.chain_id));
        Ok(())
    }

    async fn add_key(
        &self,
        _rep: &dyn RelayerExecReporter,
        chain_id: &str,
        key_name: &str,
        _coin_type: &str,
    ) -> Result<Wallet, RelayerError> {
        let config = self
            .lock()
            .configs
            .get(chain_id)
            .cloned()
            .ok_or_else(|| RelayerError::UnknownChain {
                relayer: self.name.clone(),
                chain_id: chain_id.to_owned(),
            })?;
        let wallet = cosmos_wallet(key_name, None, &config).map_err(|source| RelayerError::Key {
            relayer: self.name.clone(),
            source,
        })?;
        self.lock()
            .wallets
            .insert(chain_id.to_owned(), wallet.clone());
        Ok(wallet)
    }

    async fn get_wallet(&self, chain_id: &str) -> Option<Wallet> {
        self.lock().wallets.get(chain_id).cloned()
    }

    async fn generate_path(
        &self,
        _rep: &dyn RelayerExecReporter,
        src_chain_id: &str,
        dst_chain_id: &str,
        path_name: &str,
    ) -> Result<(), RelayerError> {
        self.lock().paths.insert(
            path_name.to_owned(),
            (src_chain_id.to_owned(), dst_chain_id.to_owned()),
        );
        self.record(format!("generate_path {} {path_name}", self.name));
        Ok(())
    }

    async fn update_path(
        &self,
        _rep: &dyn RelayerExecReporter,
        path_name: &str,
        _filter: &ChannelFilter,
    ) -> Result<(), RelayerError> {
        self.path(path_name).map(|_| ())
    }

    async fn link_path(
        &self,
        rep: &dyn RelayerExecReporter,
        path_name: &str,
        channel_opts: &CreateChannelOptions,
        client_opts: &CreateClientOptions,
    ) -> Result<(), RelayerError> {
        let failure = self.lock().fail_link.clone();
        if let Some(message) = failure {
            return Err(RelayerError::Command {
                relayer: self.name.clone(),
                command: vec!["link".to_owned(), path_name.to_owned()],
                exit_code: 1,
                stdout: String::new(),
                stderr: message,
            });
        }
        self.create_clients(rep, path_name, client_opts).await?;
        self.create_connections(rep, path_name).await?;
        self.create_channel(rep, path_name, channel_opts).await?;
        self.record(format!("link_path {} {path_name}", self.name));
        Ok(())
    }

    async fn create_clients(
        &self,
        _rep: &dyn RelayerExecReporter,
        path_name: &str,
        opts: &CreateClientOptions,
    ) -> Result<(), RelayerError> {
        let (src, dst) = self.path(path_name)?;
        let mut state = self.lock();
        state.client_opts.insert(path_name.to_owned(), opts.clone());
        for (host, tracked) in [(&src, &dst), (&dst, &src)] {
            let clients = state.clients.entry(host.clone()).or_default();
            clients.push(ClientOutput {
                client_id: format!("07-tendermint-{}", clients.len()),
                client_state: ClientState {
                    chain_id: tracked.clone(),
                },
            });
        }
        Ok(())
    }

    async fn create_connections(
        &self,
        _rep: &dyn RelayerExecReporter,
        path_name: &str,
    ) -> Result<(), RelayerError> {
        let (src, dst) = self.path(path_name)?;
        let mut state = self.lock();
        let latest_client = |state: &State, chain: &str| {
            state
                .clients
                .get(chain)
                .and_then(|c| c.last())
                .map(|c| c.client_id.clone())
                .unwrap_or_default()
        };
        let src_client = latest_client(&*state, src.as_str());
        let dst_client = latest_client(&*state, dst.as_str());
        let src_id = format!("connection-{}", state.connections.get(&src).map_or(0, Vec::len));
        let dst_id = format!("connection-{}", state.connections.get(&dst).map_or(0, Vec::len));
        for (chain, id, client, cp_client, cp_id) in [
            (&src, &src_id, &src_client, &dst_client, &dst_id),
            (&dst, &dst_id, &dst_client, &src_client, &src_id),
        ] {
            state
                .connections
                .entry(chain.clone())
                .or_default()
                .push(ConnectionOutput {
                    id: id.clone(),
                    client_id: client.clone(),
                    state: "STATE_OPEN".to_owned(),
                    counterparty: ConnectionCounterparty {
                        client_id: cp_client.clone(),
                        connection_id: cp_id.clone(),
                    },
                    ..ConnectionOutput::default()
                });
        }
        Ok(())
    }

    async fn create_channel(
        &self,
        _rep: &dyn RelayerExecReporter,
        path_name: &str,
        opts: &CreateChannelOptions,
    ) -> Result<(), RelayerError> {
        let (src, dst) = self.path(path_name)?;
        let mut state = self.lock();
        let src_channel = format!("channel-{}", state.next_index(&src));
        let dst_channel = format!("channel-{}", state.next_index(&dst));
        let hop = |state: &State, chain: &str| {
            state
                .connections
                .get(chain)
                .and_then(|c| c.last())
                .map(|c| vec![c.id.clone()])
                .unwrap_or_default()
        };
        let src_hops = hop(&*state, src.as_str());
        let dst_hops = hop(&*state, dst.as_str());

        let side = |channel: &str, port: &str, hops: Vec<String>, cp_port: &str, cp_channel: &str| {
            ChannelOutput {
                state: "STATE_OPEN".to_owned(),
                ordering: format!("ORDER_{}", opts.order.as_str().to_uppercase()),
                counterparty: ChannelCounterparty {
                    port_id: cp_port.to_owned(),
                    channel_id: cp_channel.to_owned(),
                },
                connection_hops: hops,
                version: opts.version.clone(),
                port_id: port.to_owned(),
                channel_id: channel.to_owned(),
            }
        };
        let src_side = side(
            &src_channel,
            &opts.source_port_name,
            src_hops,
            &opts.dest_port_name,
            &dst_channel,
        );
        let dst_side = side(
            &dst_channel,
            &opts.dest_port_name,
            dst_hops,
            &opts.source_port_name,
            &src_channel,
        );
        state.channels.entry(src).or_default().push(src_side);
        state.channels.entry(dst).or_default().push(dst_side);
        Ok(())
    }

    async fn update_clients(
        &self,
        _rep: &dyn RelayerExecReporter,
        path_name: &str,
    ) -> Result<(), RelayerError> {
        self.path(path_name).map(|_| ())
    }

    async fn flush(
        &self,
        _rep: &dyn RelayerExecReporter,
        path_name: &str,
        _channel_id: &str,
    ) -> Result<(), RelayerError> {
        self.path(path_name).map(|_| ())
    }

    async fn get_channels(
        &self,
        _rep: &dyn RelayerExecReporter,
        chain_id: &str,
    ) -> Result<Vec<ChannelOutput>, RelayerError> {
        Ok(self.lock().channels.get(chain_id).cloned().unwrap_or_default())
    }

    async fn get_connections(
        &self,
        _rep: &dyn RelayerExecReporter,
        chain_id: &str,
    ) -> Result<Vec<ConnectionOutput>, RelayerError> {
        Ok(self
            .lock()
            .connections
            .get(chain_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_clients(
        &self,
        _rep: &dyn RelayerExecReporter,
        chain_id: &str,
    ) -> Result<Vec<ClientOutput>, RelayerError> {
        Ok(self.lock().clients.get(chain_id).cloned().unwrap_or_default())
    }

    async fn start_relayer(
        &self,
        _rep: &dyn RelayerExecReporter,
        path_names: &[String],
    ) -> Result<(), RelayerError> {
        self.lock().running = Some(path_names.to_vec());
        self.record(format!("start_relayer {}", self.name));
        Ok(())
    }

    async fn stop_relayer(&self, _rep: &dyn RelayerExecReporter) -> Result<(), RelayerError> {
        if self.lock().running.take().is_some() {
            self.record(format!("stop_relayer {}", self.name));
        }
        Ok(())
    }

    async fn exec(
        &self,
        _rep: &dyn RelayerExecReporter,
        cmd: &[String],
        _env: &[String],
    ) -> Result<ExecOutput, RelayerError> {
        self.record(format!("exec {} {}", self.name, cmd.join(" ")));
        Ok(ExecOutput::default())
    }
}
