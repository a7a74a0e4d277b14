//! An in-process Substrate JSON-RPC endpoint. It keeps a balance ledger,
//! checks the signature and nonce of every submitted extrinsic and applies
//! balance transfers; `Ibc.transfer` calls are recorded as submitted.

use std::{
    collections::BTreeMap,
    net::Ipv4Addr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use axum::{Json, Router, extract::State, routing::post};
use blake2::{Blake2b, Digest as _, digest::consts::U32};
use schnorrkel::{PublicKey, Signature};
use serde_json::{Value, json};
use tokio::{net::TcpListener, task::JoinHandle};

use super::extrinsic::{CallIndex, SigningContext, asset_account_key, system_account_key};

pub(crate) const GENESIS_HASH: [u8; 32] = [7; 32];
const SPEC_VERSION: u32 = 9360;
const TRANSACTION_VERSION: u32 = 16;

struct Ledger {
    accounts: BTreeMap<[u8; 32], (u32, u128)>,
    assets: BTreeMap<(u128, [u8; 32]), u128>,
    height: u64,
    balances_transfer: CallIndex,
    ibc_transfer: CallIndex,
    ibc_calls: Vec<Vec<u8>>,
}

fn decode_compact(raw: &[u8]) -> Option<(u128, usize)> {
    let first = *raw.first()?;
    match first & 0b11 {
        0b00 => Some((u128::from(first >> 2), 1)),
        0b01 => {
            let value = u16::from_le_bytes(raw.get(..2)?.try_into().ok()?);
            Some((u128::from(value >> 2), 2))
        }
        0b10 => {
            let value = u32::from_le_bytes(raw.get(..4)?.try_into().ok()?);
            Some((u128::from(value >> 2), 4))
        }
        _ => {
            let len = usize::from(first >> 2) + 4;
            let mut bytes = [0u8; 16];
            bytes[..len].copy_from_slice(raw.get(1..=len)?);
            Some((u128::from_le_bytes(bytes), len + 1))
        }
    }
}

fn account_info(nonce: u32, free: u128) -> Vec<u8> {
    let mut raw = nonce.to_le_bytes().to_vec();
    // consumers, providers, sufficients
    raw.extend([0u8; 12]);
    raw.extend(free.to_le_bytes());
    // reserved and frozen balances
    raw.extend([0u8; 48]);
    raw
}

impl Ledger {
    fn storage(&self, key: &[u8]) -> Option<Vec<u8>> {
        if let Some((_, (nonce, free))) = self
            .accounts
            .iter()
            .find(|(account, _)| system_account_key(account.as_slice()) == key)
        {
            return Some(account_info(*nonce, *free));
        }
        self.assets
            .iter()
            .find(|((asset, account), _)| asset_account_key(*asset, account) == key)
            .map(|(_, balance)| balance.to_le_bytes().to_vec())
    }

    fn apply(&mut self, extrinsic: &[u8]) -> Result<(), String> {
        let (len, offset) = decode_compact(extrinsic).ok_or("bad length prefix")?;
        let body = &extrinsic[offset..];
        if body.len() as u128 != len {
            return Err("length prefix does not match".to_owned());
        }
        if body.get(..2) != Some([0x84, 0x00].as_slice()) || body.get(34) != Some(&0x01) {
            return Err("not a signed sr25519 extrinsic".to_owned());
        }
        let signer: [u8; 32] = body
            .get(2..34)
            .and_then(|raw| raw.try_into().ok())
            .ok_or("short signer")?;
        let signature = body
            .get(35..99)
            .and_then(|raw| Signature::from_bytes(raw).ok())
            .ok_or("bad signature encoding")?;
        let extra = body.get(99..).ok_or("missing signed extra")?;
        if extra.first() != Some(&0x00) {
            return Err("only immortal extrinsics are accepted".to_owned());
        }
        let (nonce, nonce_len) = decode_compact(&extra[1..]).ok_or("bad nonce")?;
        let (_tip, tip_len) = decode_compact(&extra[1 + nonce_len..]).ok_or("bad tip")?;
        let call = &extra[1 + nonce_len + tip_len..];

        let (current, free) = self.accounts.get(&signer).copied().unwrap_or_default();
        if nonce != u128::from(current) {
            return Err(format!("stale nonce {nonce}, expected {current}"));
        }
        let context = SigningContext {
            nonce: current,
            spec_version: SPEC_VERSION,
            transaction_version: TRANSACTION_VERSION,
            genesis_hash: GENESIS_HASH,
        };
        PublicKey::from_bytes(&signer)
            .and_then(|key| key.verify_simple(b"substrate", &context.payload(call), &signature))
            .map_err(|err| format!("bad signature: {err}"))?;

        let index = call.get(..2).ok_or("empty call")?;
        if index == [self.balances_transfer.pallet, self.balances_transfer.call] {
            let dest: [u8; 32] = call
                .get(3..35)
                .and_then(|raw| raw.try_into().ok())
                .ok_or("bad destination")?;
            let (amount, _) = call
                .get(35..)
                .and_then(decode_compact)
                .ok_or("bad amount")?;
            let remaining = free.checked_sub(amount).ok_or("insufficient balance")?;
            self.accounts.insert(signer, (current + 1, remaining));
            self.accounts.entry(dest).or_default().1 += amount;
        } else if index == [self.ibc_transfer.pallet, self.ibc_transfer.call] {
            self.ibc_calls.push(call.to_vec());
            self.accounts.insert(signer, (current + 1, free));
        } else {
            return Err(format!("unknown call {index:?}"));
        }
        self.height += 1;
        Ok(())
    }
}

fn respond(ledger: &Mutex<Ledger>, request: &Value) -> Value {
    let mut ledger = ledger.lock().unwrap_or_else(PoisonError::into_inner);
    let param = request["params"][0].as_str().unwrap_or_default();
    let bytes = hex::decode(param.trim_start_matches("0x")).unwrap_or_default();
    let result = match request["method"].as_str().unwrap_or_default() {
        "chain_getBlockHash" => Ok(json!(format!("0x{}", hex::encode(GENESIS_HASH)))),
        "chain_getHeader" => Ok(json!({ "number": format!("0x{:x}", ledger.height) })),
        "state_getRuntimeVersion" => Ok(json!({
            "specName": "rococo",
            "specVersion": SPEC_VERSION,
            "transactionVersion": TRANSACTION_VERSION,
        })),
        "state_getStorage" => Ok(ledger
            .storage(&bytes)
            .map_or(Value::Null, |value| json!(format!("0x{}", hex::encode(value))))),
        "author_submitExtrinsic" => ledger
            .apply(&bytes)
            .map(|()| json!(format!("0x{}", hex::encode(Blake2b::<U32>::digest(&bytes))))),
        other => Err(format!("method {other} not found")),
    };
    match result {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": request["id"], "result": result }),
        Err(message) => json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": { "code": 1010, "message": message },
        }),
    }
}

async fn handle(
    State(ledger): State<Arc<Mutex<Ledger>>>,
    Json(request): Json<Value>,
) -> Json<Value> {
    Json(respond(&ledger, &request))
}

pub(crate) struct FakeSubstrate {
    ledger: Arc<Mutex<Ledger>>,
    address: String,
    server: JoinHandle<()>,
}

impl FakeSubstrate {
    pub(crate) async fn start(balances_transfer: CallIndex, ibc_transfer: CallIndex) -> Self {
        let ledger = Arc::new(Mutex::new(Ledger {
            accounts: BTreeMap::new(),
            assets: BTreeMap::new(),
            height: 1,
            balances_transfer,
            ibc_transfer,
            ibc_calls: Vec::new(),
        }));
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind fake rpc");
        let address = listener.local_addr().expect("local address").to_string();
        let app = Router::new()
            .route("/", post(handle))
            .with_state(Arc::clone(&ledger));
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service()).await;
        });
        Self {
            ledger,
            address,
            server,
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `host:port` of the endpoint.
    pub(crate) fn address(&self) -> String {
        self.address.clone()
    }

    pub(crate) fn fund(&self, account: [u8; 32], amount: u128) {
        self.ledger().accounts.entry(account).or_default().1 += amount;
    }

    pub(crate) fn set_asset_balance(&self, asset_id: u128, account: [u8; 32], amount: u128) {
        self.ledger().assets.insert((asset_id, account), amount);
    }

    pub(crate) fn free_balance(&self, account: [u8; 32]) -> u128 {
        self.ledger().accounts.get(&account).map_or(0, |entry| entry.1)
    }

    pub(crate) fn nonce(&self, account: [u8; 32]) -> u32 {
        self.ledger().accounts.get(&account).map_or(0, |entry| entry.0)
    }

    pub(crate) fn ibc_calls(&self) -> Vec<Vec<u8>> {
        self.ledger().ibc_calls.clone()
    }
}

impl Drop for FakeSubstrate {
    fn drop(&mut self) {
        self.server.abort();
    }
}
