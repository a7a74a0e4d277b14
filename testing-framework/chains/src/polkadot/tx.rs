//! Balance reads and signed submissions against one Substrate node.

use std::time::Duration;

use interchaintest_core::{adjust_timeout, chain::ChainError};
use schnorrkel::Keypair;
use tokio::time::{Instant, sleep};
use tracing::debug;

use super::extrinsic::{
    AccountInfo, SigningContext, asset_account_key, decode_asset_balance, signed_extrinsic,
    system_account_key,
};
use crate::node_rpc::NodeRpc;

const INCLUSION_POLL_INTERVAL: Duration = Duration::from_millis(250);
const INCLUSION_TIMEOUT: Duration = Duration::from_secs(60);

/// A submitted extrinsic once the chain has applied it.
#[derive(Clone, Debug)]
pub(crate) struct Included {
    pub hash: String,
    pub height: u64,
}

/// `System.Account` of `account`; unknown accounts are empty.
pub(crate) async fn account_info(
    rpc: &NodeRpc<'_>,
    chain_id: &str,
    account: &[u8],
) -> Result<AccountInfo, ChainError> {
    match rpc.storage(&system_account_key(account)).await? {
        None => Ok(AccountInfo::default()),
        Some(raw) => AccountInfo::decode(&raw)
            .ok_or_else(|| ChainError::parse(chain_id, "account info", hex::encode(raw))),
    }
}

/// `Assets.Account` balance of `account`, zero when the entry is unset.
pub(crate) async fn asset_balance(
    rpc: &NodeRpc<'_>,
    chain_id: &str,
    asset_id: u128,
    account: &[u8],
) -> Result<u128, ChainError> {
    match rpc.storage(&asset_account_key(asset_id, account)).await? {
        None => Ok(0),
        Some(raw) => decode_asset_balance(&raw)
            .ok_or_else(|| ChainError::parse(chain_id, "asset account", hex::encode(raw))),
    }
}

/// Signs `call` with the signer's next nonce, submits it and waits until the
/// nonce moves past it.
pub(crate) async fn submit(
    rpc: &NodeRpc<'_>,
    chain_id: &str,
    signer: &Keypair,
    call: &[u8],
) -> Result<Included, ChainError> {
    let account = signer.public.to_bytes();
    let nonce = account_info(rpc, chain_id, &account).await?.nonce;
    let version = rpc.runtime_version().await?;
    let context = SigningContext {
        nonce,
        spec_version: version.spec_version,
        transaction_version: version.transaction_version,
        genesis_hash: rpc.genesis_hash().await?,
    };
    let hash = rpc
        .submit_extrinsic(&signed_extrinsic(signer, call, &context))
        .await?;
    debug!(chain = chain_id, %hash, nonce, "submitted extrinsic");

    let timeout = adjust_timeout(INCLUSION_TIMEOUT);
    let deadline = Instant::now() + timeout;
    while account_info(rpc, chain_id, &account).await?.nonce <= nonce {
        if Instant::now() >= deadline {
            return Err(ChainError::Timeout {
                chain: chain_id.to_owned(),
                operation: "extrinsic inclusion",
                timeout,
            });
        }
        sleep(INCLUSION_POLL_INTERVAL).await;
    }
    Ok(Included {
        hash,
        height: rpc.height().await?,
    })
}
