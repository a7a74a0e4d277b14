use std::{collections::BTreeMap, sync::Arc};

use futures::future::try_join_all;
use num_bigint::BigUint;
use tracing::{debug, info};

use super::{
    Interchain, InterchainBuildOptions, InterchainError, NamedRelayer, same_chain, same_relayer,
};
use crate::{
    blockdb::Database,
    chain::{Chain, ChainEnvironment},
    chain_set::ChainSet,
    relayer::{RelayerError, RelayerExecReporter},
    wallet::WalletAmount,
};

/// Key of the genesis account every chain is started with.
pub const FAUCET_KEY: &str = "faucet";
pub const FAUCET_AMOUNT: u64 = 100_000_000_000_000;
pub const RELAYER_WALLET_AMOUNT: u64 = 1_000_000_000_000;

impl Interchain {
    /// Brings the interchain up: initializes and starts every chain with its
    /// genesis allocations, configures relayer keys and chains, then creates
    /// and links every path. Relayers are left stopped.
    ///
    /// A failing stage aborts the remaining ones. Nothing is rolled back;
    /// [`Interchain::close`] and the label sweep reclaim what was created.
    ///
    /// # Panics
    ///
    /// When called more than once.
    pub async fn build(
        &mut self,
        rep: &dyn RelayerExecReporter,
        opts: InterchainBuildOptions,
    ) -> Result<(), InterchainError> {
        assert!(!self.built, "Interchain::build called more than once");
        self.built = true;

        self.validate()?;
        info!(
            test = %opts.test_name,
            chains = self.chains.len(),
            relayers = self.relayers.len(),
            links = self.links.len(),
            "building interchain"
        );

        let chain_set = Arc::new(ChainSet::new(self.chains.clone()));
        self.chain_set = Some(Arc::clone(&chain_set));

        chain_set
            .initialize(&ChainEnvironment {
                test_name: opts.test_name.clone(),
                engine: Arc::clone(&opts.engine),
                network_id: opts.network_id.clone(),
            })
            .await?;
        debug!("chains initialized");

        self.generate_relayer_wallets().await?;
        let genesis = self.genesis_allocations().await?;

        chain_set.start(&opts.test_name, &genesis).await?;
        info!(test = %opts.test_name, "chains started");

        if let Some(path) = &opts.block_database_file {
            let database = Database::open(path, &opts.git_sha)?;
            chain_set.track_blocks(&database, &opts.test_name, &opts.git_sha)?;
        }

        self.configure_relayers(rep).await?;

        if opts.skip_path_creation {
            info!(test = %opts.test_name, "interchain built without paths");
            return Ok(());
        }

        self.generate_paths(rep).await?;
        self.link_paths(rep).await?;
        info!(test = %opts.test_name, "interchain built");
        Ok(())
    }

    /// Each relayer with the chains its links touch, in link order.
    fn relayer_chains(&self) -> Vec<(&NamedRelayer, Vec<Arc<dyn Chain>>)> {
        let mut out: Vec<(&NamedRelayer, Vec<Arc<dyn Chain>>)> = Vec::new();
        for link in &self.links {
            let Some(relayer) = self
                .relayers
                .iter()
                .find(|r| same_relayer(&r.relayer, &link.relayer))
            else {
                continue;
            };
            let position = out
                .iter()
                .position(|(r, _)| same_relayer(&r.relayer, &relayer.relayer));
            let index = match position {
                Some(index) => index,
                None => {
                    out.push((relayer, Vec::new()));
                    out.len() - 1
                }
            };
            let chains = &mut out[index].1;
            for chain in [&link.chain1, &link.chain2] {
                if !chains.iter().any(|c| same_chain(c, chain)) {
                    chains.push(Arc::clone(chain));
                }
            }
        }
        out
    }

    async fn generate_relayer_wallets(&mut self) -> Result<(), InterchainError> {
        let pairs: Vec<(String, Arc<dyn Chain>)> = self
            .relayer_chains()
            .into_iter()
            .flat_map(|(relayer, chains)| {
                chains
                    .into_iter()
                    .map(move |chain| (relayer.name.clone(), chain))
            })
            .collect();

        let wallets = try_join_all(pairs.iter().map(|(relayer, chain)| async move {
            let key_name = format!("{relayer}-{}", chain.chain_id());
            chain
                .build_relayer_wallet(&key_name)
                .await
                .map(|wallet| ((relayer.clone(), chain.chain_id().to_owned()), wallet))
                .map_err(|source| {
                    InterchainError::chain(chain.chain_id(), "build relayer wallet", source)
                })
        }))
        .await?;

        self.relayer_wallets.extend(wallets);
        debug!(wallets = self.relayer_wallets.len(), "relayer wallets generated");
        Ok(())
    }

    /// Faucet first, then the allocations supplied with the chain, then one
    /// entry per relayer wallet.
    async fn genesis_allocations(
        &self,
    ) -> Result<BTreeMap<String, Vec<WalletAmount>>, InterchainError> {
        let faucets = try_join_all(self.chains.iter().map(|chain| async move {
            chain
                .build_wallet(FAUCET_KEY, None)
                .await
                .map(|wallet| (Arc::clone(chain), wallet))
                .map_err(|source| InterchainError::chain(chain.chain_id(), "create faucet", source))
        }))
        .await?;

        let mut genesis: BTreeMap<String, Vec<WalletAmount>> = BTreeMap::new();
        for (chain, faucet) in faucets {
            let denom = &chain.config().denom;
            let entry = genesis.entry(chain.chain_id().to_owned()).or_default();
            entry.push(WalletAmount::new(
                faucet.formatted_address(),
                denom.clone(),
                BigUint::from(FAUCET_AMOUNT),
            ));
            if let Some(extra) = self.additional_genesis.get(chain.chain_id()) {
                entry.extend(extra.iter().cloned());
            }
        }

        for ((_, chain_id), wallet) in &self.relayer_wallets {
            genesis
                .entry(chain_id.clone())
                .or_default()
                .push(WalletAmount::new(
                    wallet.formatted_address(),
                    wallet.chain_config().denom.clone(),
                    BigUint::from(RELAYER_WALLET_AMOUNT),
                ));
        }
        Ok(genesis)
    }

    /// Adds every chain to its relayers and restores the relayer key there.
    async fn configure_relayers(
        &self,
        rep: &dyn RelayerExecReporter,
    ) -> Result<(), InterchainError> {
        let pairs: Vec<(&NamedRelayer, Arc<dyn Chain>)> = self
            .relayer_chains()
            .into_iter()
            .flat_map(|(relayer, chains)| chains.into_iter().map(move |chain| (relayer, chain)))
            .collect();

        try_join_all(pairs.iter().map(|(named, chain)| async move {
            let relayer = &named.relayer;
            let config = chain.config();
            let (rpc, grpc) = if relayer.use_docker_network() {
                (chain.rpc_address(), chain.grpc_address())
            } else {
                (chain.host_rpc_address(), chain.host_grpc_address())
            };
            let fail = |stage: &'static str| {
                move |source: RelayerError| {
                    InterchainError::relayer(named.name.clone(), stage, source)
                }
            };

            relayer
                .add_chain_configuration(rep, config, &config.name, &rpc, &grpc)
                .await
                .map_err(fail("add chain configuration"))?;

            let mnemonic = self
                .relayer_wallet(&named.name, &config.chain_id)
                .and_then(|wallet| wallet.mnemonic())
                .unwrap_or_default();
            relayer
                .restore_key(rep, config, &config.name, mnemonic)
                .await
                .map_err(fail("restore key"))?;
            debug!(
                relayer = %named.name,
                chain_id = %config.chain_id,
                "relayer configured for chain"
            );
            Ok::<_, InterchainError>(())
        }))
        .await?;
        Ok(())
    }

    async fn generate_paths(&self, rep: &dyn RelayerExecReporter) -> Result<(), InterchainError> {
        for link in &self.links {
            let name = self.relayer_name(&link.relayer).unwrap_or_default();
            link.relayer
                .generate_path(rep, link.chain1.chain_id(), link.chain2.chain_id(), &link.path)
                .await
                .map_err(|source| InterchainError::relayer(name, "generate path", source))?;
            debug!(relayer = name, path = %link.path, "path generated");
        }
        Ok(())
    }

    async fn link_paths(&self, rep: &dyn RelayerExecReporter) -> Result<(), InterchainError> {
        try_join_all(self.links.iter().map(|link| async move {
            let name = self.relayer_name(&link.relayer).unwrap_or_default();
            let channel_opts = link.create_channel_opts.clone().or_default();
            let client_opts = link.create_client_opts.clone().or_default();
            link.relayer
                .link_path(rep, &link.path, &channel_opts, &client_opts)
                .await
                .map_err(|source| InterchainError::relayer(name, "link path", source))?;
            info!(
                relayer = name,
                path = %link.path,
                chain1 = %link.chain1.chain_id(),
                chain2 = %link.chain2.chain_id(),
                "path linked"
            );
            Ok::<_, InterchainError>(())
        }))
        .await?;
        Ok(())
    }
}
