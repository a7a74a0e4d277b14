//! JSON-RPC over HTTP for the node endpoints the drivers poll: Tendermint
//! `status`, `block` and `block_results`, and the Substrate chain, state and
//! author calls.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use interchaintest_core::chain::{EventAttribute, TxEvent};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("invalid rpc address {address:?}: {source}")]
    Address {
        address: String,
        #[source]
        source: url::ParseError,
    },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{method} returned error {code}: {message}")]
    Remote {
        method: String,
        code: i64,
        message: String,
    },
    #[error("{method} returned neither a result nor an error")]
    EmptyResponse { method: String },
    #[error("{method}: unexpected result: {message}")]
    Decode { method: String, message: String },
}

#[derive(Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct Response<R> {
    result: Option<R>,
    error: Option<RemoteError>,
}

#[derive(Deserialize)]
struct RemoteError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Clone)]
pub struct RpcClient {
    base_url: Url,
    client: Client,
    next_id: Arc<AtomicU64>,
}

impl RpcClient {
    #[must_use]
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            client: Client::new(),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Accepts `http://host:port` or a bare `host:port`.
    pub fn parse(address: &str) -> Result<Self, RpcError> {
        let with_scheme = if address.contains("://") {
            address.to_owned()
        } else {
            format!("http://{address}")
        };
        Url::parse(&with_scheme)
            .map(Self::new)
            .map_err(|source| RpcError::Address {
                address: address.to_owned(),
                source,
            })
    }

    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn call<R>(&self, method: &str, params: Value) -> Result<R, RpcError>
    where
        R: DeserializeOwned,
    {
        self.call_optional(method, params)
            .await?
            .ok_or_else(|| RpcError::EmptyResponse {
                method: method.to_owned(),
            })
    }

    /// Like [`Self::call`] but a `null` result is `None` rather than an error.
    pub async fn call_optional<R>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Option<R>, RpcError>
    where
        R: DeserializeOwned,
    {
        let request = Request {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let response: Response<R> = self
            .client
            .post(self.base_url.clone())
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(error) = response.error {
            let message = match error.data {
                Some(Value::String(data)) if !data.is_empty() => {
                    format!("{} ({data})", error.message)
                }
                _ => error.message,
            };
            return Err(RpcError::Remote {
                method: method.to_owned(),
                code: error.code,
                message,
            });
        }
        Ok(response.result)
    }

    pub async fn status(&self) -> Result<Status, RpcError> {
        self.call("status", json!({})).await
    }

    pub async fn block(&self, height: u64) -> Result<BlockResponse, RpcError> {
        self.call("block", json!({ "height": height.to_string() }))
            .await
    }

    pub async fn block_results(&self, height: u64) -> Result<BlockResults, RpcError> {
        self.call("block_results", json!({ "height": height.to_string() }))
            .await
    }

    /// Number of the best block of a Substrate node.
    pub async fn substrate_height(&self) -> Result<u64, RpcError> {
        let header: SubstrateHeader = self.call("chain_getHeader", json!([])).await?;
        let digits = header.number.trim_start_matches("0x");
        u64::from_str_radix(digits, 16).map_err(|err| RpcError::Decode {
            method: "chain_getHeader".to_owned(),
            message: format!("block number {:?}: {err}", header.number),
        })
    }

    /// Hash of block `number`, hex encoded with a `0x` prefix.
    pub async fn substrate_block_hash(&self, number: u64) -> Result<String, RpcError> {
        self.call("chain_getBlockHash", json!([number])).await
    }

    pub async fn substrate_runtime_version(&self) -> Result<RuntimeVersion, RpcError> {
        self.call("state_getRuntimeVersion", json!([])).await
    }

    /// Raw SCALE value under a storage key, `None` when the key is unset.
    pub async fn substrate_storage(&self, key: &[u8]) -> Result<Option<Vec<u8>>, RpcError> {
        const METHOD: &str = "state_getStorage";
        let value: Option<String> = self
            .call_optional(METHOD, json!([format!("0x{}", hex::encode(key))]))
            .await?;
        value.map(|value| decode_hex(METHOD, &value)).transpose()
    }

    /// Submits a signed extrinsic and returns its hash.
    pub async fn substrate_submit(&self, extrinsic: &[u8]) -> Result<String, RpcError> {
        self.call(
            "author_submitExtrinsic",
            json!([format!("0x{}", hex::encode(extrinsic))]),
        )
        .await
    }
}

pub(crate) fn decode_hex(method: &str, value: &str) -> Result<Vec<u8>, RpcError> {
    hex::decode(value.trim_start_matches("0x")).map_err(|err| RpcError::Decode {
        method: method.to_owned(),
        message: format!("{value:?} is not hex: {err}"),
    })
}

#[derive(Clone, Debug, Deserialize)]
pub struct Status {
    pub node_info: NodeInfo,
    pub sync_info: SyncInfo,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    #[serde(default)]
    pub network: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SyncInfo {
    pub latest_block_height: String,
    pub catching_up: bool,
}

impl Status {
    pub fn height(&self) -> Result<u64, RpcError> {
        self.sync_info
            .latest_block_height
            .parse()
            .map_err(|err| RpcError::Decode {
                method: "status".to_owned(),
                message: format!("latest_block_height: {err}"),
            })
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct BlockResponse {
    pub block: Block,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Block {
    pub data: BlockData,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BlockData {
    /// Base64 encoded transactions.
    #[serde(default)]
    pub txs: Option<Vec<String>>,
}

impl BlockResponse {
    /// Raw transaction bytes in block order.
    pub fn txs(&self) -> Result<Vec<Vec<u8>>, RpcError> {
        self.block
            .data
            .txs
            .iter()
            .flatten()
            .map(|tx| {
                STANDARD.decode(tx).map_err(|err| RpcError::Decode {
                    method: "block".to_owned(),
                    message: format!("transaction is not base64: {err}"),
                })
            })
            .collect()
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct BlockResults {
    #[serde(default)]
    pub txs_results: Option<Vec<TxResult>>,
    #[serde(default)]
    pub begin_block_events: Option<Vec<RpcEvent>>,
    #[serde(default)]
    pub end_block_events: Option<Vec<RpcEvent>>,
    #[serde(default)]
    pub finalize_block_events: Option<Vec<RpcEvent>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TxResult {
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub events: Option<Vec<RpcEvent>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RpcEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub attributes: Option<Vec<RpcAttribute>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RpcAttribute {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

impl From<&RpcEvent> for TxEvent {
    fn from(event: &RpcEvent) -> Self {
        Self {
            kind: event.kind.clone(),
            attributes: event
                .attributes
                .iter()
                .flatten()
                .map(|attr| EventAttribute {
                    key: attr.key.clone().unwrap_or_default(),
                    value: attr.value.clone().unwrap_or_default(),
                })
                .collect(),
        }
    }
}

impl TxResult {
    #[must_use]
    pub fn events(&self) -> Vec<TxEvent> {
        self.events.iter().flatten().map(TxEvent::from).collect()
    }
}

impl BlockResults {
    #[must_use]
    pub fn tx_results(&self) -> &[TxResult] {
        self.txs_results.as_deref().unwrap_or_default()
    }

    #[must_use]
    pub fn finalize_events(&self) -> Vec<TxEvent> {
        self.finalize_block_events
            .iter()
            .flatten()
            .map(TxEvent::from)
            .collect()
    }

    /// Every event of the block: per-transaction events first, then the
    /// begin, end and finalize block events.
    #[must_use]
    pub fn all_events(&self) -> Vec<TxEvent> {
        self.tx_results()
            .iter()
            .flat_map(TxResult::events)
            .chain(
                [
                    &self.begin_block_events,
                    &self.end_block_events,
                    &self.finalize_block_events,
                ]
                .into_iter()
                .flatten()
                .flatten()
                .map(TxEvent::from),
            )
            .collect()
    }
}

#[derive(Deserialize)]
struct SubstrateHeader {
    number: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeVersion {
    pub spec_version: u32,
    pub transaction_version: u32,
}
