use std::time::Duration;

use interchaintest_core::{
    adjust_timeout,
    chain::{BlockTx, ChainError, TxEvent},
};
use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::rpc::{RpcClient, RpcError, RuntimeVersion, decode_hex};

const READY_ATTEMPTS: usize = 40;
const READY_INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const READY_MAX_BACKOFF: Duration = Duration::from_secs(3);
const BLOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);
const BLOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Flavor {
    Tendermint,
    Substrate,
}

/// A node's host RPC endpoint with errors attributed to its chain.
pub(crate) struct NodeRpc<'a> {
    chain_id: &'a str,
    node: &'a str,
    flavor: Flavor,
    client: RpcClient,
}

impl<'a> NodeRpc<'a> {
    /// Fails with [`ChainError::NotInitialized`] until the node has a host
    /// address.
    pub(crate) fn connect(
        chain_id: &'a str,
        node: &'a str,
        flavor: Flavor,
        host_address: &str,
    ) -> Result<Self, ChainError> {
        if host_address.is_empty() {
            return Err(ChainError::NotInitialized {
                chain: chain_id.to_owned(),
            });
        }
        let client = RpcClient::parse(host_address).map_err(|err| ChainError::Rpc {
            chain: chain_id.to_owned(),
            url: host_address.to_owned(),
            source: Box::new(err),
        })?;
        Ok(Self {
            chain_id,
            node,
            flavor,
            client,
        })
    }

    fn error(&self, err: RpcError) -> ChainError {
        ChainError::Rpc {
            chain: self.chain_id.to_owned(),
            url: self.client.base_url().to_string(),
            source: Box::new(err),
        }
    }

    pub(crate) async fn height(&self) -> Result<u64, ChainError> {
        match self.flavor {
            Flavor::Tendermint => {
                let status = self.client.status().await.map_err(|err| self.error(err))?;
                status.height().map_err(|err| self.error(err))
            }
            Flavor::Substrate => self
                .client
                .substrate_height()
                .await
                .map_err(|err| self.error(err)),
        }
    }

    pub(crate) async fn storage(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
        self.client
            .substrate_storage(key)
            .await
            .map_err(|err| self.error(err))
    }

    pub(crate) async fn genesis_hash(&self) -> Result<[u8; 32], ChainError> {
        const METHOD: &str = "chain_getBlockHash";
        let hash = self
            .client
            .substrate_block_hash(0)
            .await
            .map_err(|err| self.error(err))?;
        decode_hex(METHOD, &hash)
            .map_err(|err| self.error(err))?
            .try_into()
            .map_err(|_| {
                self.error(RpcError::Decode {
                    method: METHOD.to_owned(),
                    message: format!("{hash} is not a 32 byte hash"),
                })
            })
    }

    pub(crate) async fn runtime_version(&self) -> Result<RuntimeVersion, ChainError> {
        self.client
            .substrate_runtime_version()
            .await
            .map_err(|err| self.error(err))
    }

    pub(crate) async fn submit_extrinsic(&self, extrinsic: &[u8]) -> Result<String, ChainError> {
        self.client
            .substrate_submit(extrinsic)
            .await
            .map_err(|err| self.error(err))
    }

    /// Height once the node produces blocks and, for Tendermint, is no longer
    /// catching up.
    async fn ready_height(&self) -> Result<Option<u64>, String> {
        match self.flavor {
            Flavor::Tendermint => {
                let status = self.client.status().await.map_err(|err| err.to_string())?;
                let height = status.height().map_err(|err| err.to_string())?;
                if status.sync_info.catching_up {
                    return Err(format!("catching up at height {height}"));
                }
                Ok((height > 0).then_some(height))
            }
            Flavor::Substrate => self
                .client
                .substrate_height()
                .await
                .map(|height| (height > 0).then_some(height))
                .map_err(|err| err.to_string()),
        }
    }

    /// Polls with exponential back-off until the node reports a block.
    pub(crate) async fn wait_until_ready(&self) -> Result<u64, ChainError> {
        let mut backoff = READY_INITIAL_BACKOFF;
        let mut last = String::from("no blocks yet");
        for attempt in 1..=READY_ATTEMPTS {
            match self.ready_height().await {
                Ok(Some(height)) => {
                    debug!(node = self.node, attempt, height, "node is ready");
                    return Ok(height);
                }
                Ok(None) => last = String::from("no blocks yet"),
                Err(err) => last = err,
            }
            sleep(backoff).await;
            backoff = (backoff * 2).min(READY_MAX_BACKOFF);
        }
        Err(ChainError::NotReady {
            chain: self.chain_id.to_owned(),
            attempts: READY_ATTEMPTS,
            message: format!("{}: {last}", self.node),
        })
    }

    pub(crate) async fn wait_for_blocks(&self, delta: u64) -> Result<u64, ChainError> {
        let timeout = adjust_timeout(BLOCK_WAIT_TIMEOUT);
        let deadline = Instant::now() + timeout;
        let target = self.height().await? + delta;
        loop {
            let height = self.height().await?;
            if height >= target {
                return Ok(height);
            }
            if Instant::now() >= deadline {
                return Err(ChainError::Timeout {
                    chain: self.chain_id.to_owned(),
                    operation: "wait for blocks",
                    timeout,
                });
            }
            sleep(BLOCK_POLL_INTERVAL).await;
        }
    }

    pub(crate) async fn block_events(&self, height: u64) -> Result<Vec<TxEvent>, ChainError> {
        self.client
            .block_results(height)
            .await
            .map(|results| results.all_events())
            .map_err(|err| self.error(err))
    }

    /// Transactions of a block with their events. The raw transaction is
    /// stored hex encoded; finalize-block events become a trailing pseudo
    /// transaction.
    pub(crate) async fn find_txs(&self, height: u64) -> Result<Vec<BlockTx>, ChainError> {
        let (block, results) =
            tokio::try_join!(self.client.block(height), self.client.block_results(height))
                .map_err(|err| self.error(err))?;
        let raw_txs = block.txs().map_err(|err| self.error(err))?;

        let tx_results = results.tx_results();
        let mut txs: Vec<BlockTx> = raw_txs
            .iter()
            .enumerate()
            .map(|(i, raw)| BlockTx {
                data: serde_json::json!({ "data": hex::encode(raw) })
                    .to_string()
                    .into_bytes(),
                events: tx_results.get(i).map(|r| r.events()).unwrap_or_default(),
            })
            .collect();

        let finalize = results.finalize_events();
        if !finalize.is_empty() {
            txs.push(BlockTx {
                data: serde_json::json!({
                    "data": "finalize_block",
                    "note": "artificial transaction holding finalize block events",
                })
                .to_string()
                .into_bytes(),
                events: finalize,
            });
        }
        Ok(txs)
    }
}

#[cfg(test)]
mod tests {
    use interchaintest_core::chain::ChainError;

    use super::{Flavor, NodeRpc};

    #[test]
    fn nodes_without_host_address_are_not_initialized() {
        let err = NodeRpc::connect("gaia-1", "gaia-1-val-0", Flavor::Tendermint, "")
            .err()
            .expect("no address");
        assert!(matches!(err, ChainError::NotInitialized { .. }));

        let rpc = NodeRpc::connect("gaia-1", "gaia-1-val-0", Flavor::Tendermint, "127.0.0.1:26657");
        assert!(rpc.is_ok());
    }
}
