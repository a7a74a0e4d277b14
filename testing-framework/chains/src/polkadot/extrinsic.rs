//! SCALE encoding of the extrinsics and storage keys the Polkadot driver
//! needs: balance transfers, ICS-20 transfers out of a parachain, and the
//! account and asset balance entries.
//!
//! Call indexes are fixed per runtime rather than read from metadata, see
//! [`CallIndex`].

use blake2::{
    Blake2b, Digest as _,
    digest::consts::{U16, U32},
};
use schnorrkel::Keypair;

type Blake2b128 = Blake2b<U16>;
type Blake2b256 = Blake2b<U32>;

const SIGNING_CONTEXT: &[u8] = b"substrate";
/// Signed extrinsic, format version 4.
const SIGNED_V4: u8 = 0x84;
const MULTI_ADDRESS_ID: u8 = 0x00;
const SR25519_SIGNATURE: u8 = 0x01;
const IMMORTAL_ERA: u8 = 0x00;
/// Payloads longer than this are signed by hash.
const MAX_PLAIN_PAYLOAD: usize = 256;

/// `twox128("System") ++ twox128("Account")`.
const SYSTEM_ACCOUNT_PREFIX: [u8; 32] = [
    0x26, 0xaa, 0x39, 0x4e, 0xea, 0x56, 0x30, 0xe0, 0x7c, 0x48, 0xae, 0x0c, 0x95, 0x58, 0xce, 0xf7,
    0xb9, 0x9d, 0x88, 0x0e, 0xc6, 0x81, 0x79, 0x9c, 0x0c, 0xf3, 0x0e, 0x88, 0x86, 0x37, 0x1d, 0xa9,
];
/// `twox128("Assets") ++ twox128("Account")`.
const ASSETS_ACCOUNT_PREFIX: [u8; 32] = [
    0x68, 0x2a, 0x59, 0xd5, 0x1a, 0xb9, 0xe4, 0x8a, 0x8c, 0x8c, 0xc4, 0x18, 0xff, 0x97, 0x08, 0xd2,
    0xb9, 0x9d, 0x88, 0x0e, 0xc6, 0x81, 0x79, 0x9c, 0x0c, 0xf3, 0x0e, 0x88, 0x86, 0x37, 0x1d, 0xa9,
];

/// Pallet and call position of a dispatchable in the runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallIndex {
    pub pallet: u8,
    pub call: u8,
}

impl CallIndex {
    #[must_use]
    pub const fn new(pallet: u8, call: u8) -> Self {
        Self { pallet, call }
    }

    const fn bytes(self) -> [u8; 2] {
        [self.pallet, self.call]
    }
}

/// `Balances.transfer` on the rococo relay runtime.
pub const RELAY_BALANCES_TRANSFER: CallIndex = CallIndex::new(4, 0);

/// SCALE compact encoding.
#[must_use]
pub fn compact(value: u128) -> Vec<u8> {
    match value {
        0..=0x3f => vec![(value as u8) << 2],
        0x40..=0x3fff => (((value as u16) << 2) | 0b01).to_le_bytes().to_vec(),
        0x4000..=0x3fff_ffff => (((value as u32) << 2) | 0b10).to_le_bytes().to_vec(),
        _ => {
            let len = 16 - (value.leading_zeros() / 8) as usize;
            let mut out = vec![(((len - 4) as u8) << 2) | 0b11];
            out.extend_from_slice(&value.to_le_bytes()[..len]);
            out
        }
    }
}

/// `Balances.transfer(MultiAddress::Id(dest), Compact(amount))`.
#[must_use]
pub fn balances_transfer(index: CallIndex, dest: &[u8; 32], amount: u128) -> Vec<u8> {
    let mut call = index.bytes().to_vec();
    call.push(MULTI_ADDRESS_ID);
    call.extend_from_slice(dest);
    call.extend(compact(amount));
    call
}

/// Arguments of the parachain `Ibc.transfer` call.
#[derive(Clone, Debug)]
pub struct IbcTransfer<'a> {
    /// Receiver address on the counterparty, as text.
    pub to: &'a str,
    pub channel: u64,
    /// Absolute timeout timestamp in nanoseconds; zero disables it.
    pub timeout_timestamp: u64,
    /// Absolute timeout height; zero disables it.
    pub timeout_height: u64,
    pub asset_id: u128,
    pub amount: u128,
    pub memo: Option<&'a str>,
}

#[must_use]
pub fn ibc_transfer(index: CallIndex, transfer: &IbcTransfer<'_>) -> Vec<u8> {
    let mut call = index.bytes().to_vec();
    // MultiAddress::Raw
    call.push(0x01);
    call.extend(compact(transfer.to.len() as u128));
    call.extend_from_slice(transfer.to.as_bytes());
    call.extend_from_slice(&transfer.channel.to_le_bytes());
    // Timeout::Absolute
    call.push(0x01);
    for value in [transfer.timeout_timestamp, transfer.timeout_height] {
        call.push(0x01);
        call.extend_from_slice(&value.to_le_bytes());
    }
    call.extend_from_slice(&transfer.asset_id.to_le_bytes());
    call.extend_from_slice(&transfer.amount.to_le_bytes());
    match transfer.memo {
        Some(memo) => {
            call.push(0x01);
            call.extend(compact(memo.len() as u128));
            call.extend_from_slice(memo.as_bytes());
        }
        None => call.push(0x00),
    }
    call
}

/// What an immortal extrinsic commits to besides its call.
#[derive(Clone, Debug)]
pub struct SigningContext {
    pub nonce: u32,
    pub spec_version: u32,
    pub transaction_version: u32,
    pub genesis_hash: [u8; 32],
}

impl SigningContext {
    fn extra(&self) -> Vec<u8> {
        let mut extra = vec![IMMORTAL_ERA];
        extra.extend(compact(self.nonce.into()));
        // tip
        extra.extend(compact(0));
        extra
    }

    /// The bytes the sender signs for `call`.
    #[must_use]
    pub fn payload(&self, call: &[u8]) -> Vec<u8> {
        let mut payload = call.to_vec();
        payload.extend(self.extra());
        payload.extend_from_slice(&self.spec_version.to_le_bytes());
        payload.extend_from_slice(&self.transaction_version.to_le_bytes());
        // An immortal era checkpoints the genesis block.
        payload.extend_from_slice(&self.genesis_hash);
        payload.extend_from_slice(&self.genesis_hash);
        if payload.len() > MAX_PLAIN_PAYLOAD {
            Blake2b256::digest(&payload).to_vec()
        } else {
            payload
        }
    }
}

/// Signs `call` with `signer` and returns the length-prefixed extrinsic
/// ready for `author_submitExtrinsic`.
#[must_use]
pub fn signed_extrinsic(signer: &Keypair, call: &[u8], context: &SigningContext) -> Vec<u8> {
    let signature = signer.sign_simple(SIGNING_CONTEXT, &context.payload(call));

    let mut body = vec![SIGNED_V4, MULTI_ADDRESS_ID];
    body.extend_from_slice(&signer.public.to_bytes());
    body.push(SR25519_SIGNATURE);
    body.extend_from_slice(&signature.to_bytes());
    body.extend(context.extra());
    body.extend_from_slice(call);

    let mut extrinsic = compact(body.len() as u128);
    extrinsic.extend(body);
    extrinsic
}

fn blake2_128_concat(data: &[u8]) -> Vec<u8> {
    let mut out = Blake2b128::digest(data).to_vec();
    out.extend_from_slice(data);
    out
}

/// Storage key of `System.Account(account)`.
#[must_use]
pub fn system_account_key(account: &[u8]) -> Vec<u8> {
    let mut key = SYSTEM_ACCOUNT_PREFIX.to_vec();
    key.extend(blake2_128_concat(account));
    key
}

/// Storage key of `Assets.Account(asset_id, account)`.
#[must_use]
pub fn asset_account_key(asset_id: u128, account: &[u8]) -> Vec<u8> {
    let mut key = ASSETS_ACCOUNT_PREFIX.to_vec();
    key.extend(blake2_128_concat(&asset_id.to_le_bytes()));
    key.extend(blake2_128_concat(account));
    key
}

/// The fields of `frame_system::AccountInfo` the driver reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccountInfo {
    pub nonce: u32,
    pub free: u128,
    pub reserved: u128,
}

fn u128_at(raw: &[u8], offset: usize) -> Option<u128> {
    raw.get(offset..offset + 16)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u128::from_le_bytes)
}

impl AccountInfo {
    /// Decodes `nonce, consumers, providers, sufficients` followed by the
    /// balances data. Trailing frozen balances are ignored.
    #[must_use]
    pub fn decode(raw: &[u8]) -> Option<Self> {
        let nonce = raw.get(..4)?.try_into().ok().map(u32::from_le_bytes)?;
        Some(Self {
            nonce,
            free: u128_at(raw, 16)?,
            reserved: u128_at(raw, 32)?,
        })
    }
}

/// `pallet_assets::AssetAccount` starts with the balance.
#[must_use]
pub fn decode_asset_balance(raw: &[u8]) -> Option<u128> {
    u128_at(raw, 0)
}

#[cfg(test)]
mod tests {
    use interchaintest_core::wallet::substrate::sr25519_from_suri;
    use schnorrkel::Signature;

    use super::{
        AccountInfo, CallIndex, IbcTransfer, RELAY_BALANCES_TRANSFER, SigningContext,
        asset_account_key, balances_transfer, compact, ibc_transfer, signed_extrinsic,
        system_account_key,
    };

    #[test]
    fn compact_integers_pick_the_shortest_mode() {
        let cases: [(u128, &str); 8] = [
            (0, "00"),
            (1, "04"),
            (63, "fc"),
            (64, "0101"),
            (16_383, "fdff"),
            (16_384, "02000100"),
            ((1 << 30) - 1, "feffffff"),
            (1 << 30, "0300000040"),
        ];
        for (value, expected) in cases {
            assert_eq!(hex::encode(compact(value)), expected, "{value}");
        }
        assert_eq!(compact(u128::MAX).len(), 17);
    }

    #[test]
    fn alice_account_key_matches_polkadot_js() {
        let alice = sr25519_from_suri("//Alice").expect("alice");
        assert_eq!(
            hex::encode(system_account_key(&alice.public.to_bytes())),
            "26aa394eea5630e07c48ae0c9558cef7b99d880ec681799c0cf30e8886371da9\
             de1e86a9a8c739864cf3cc5ec2bea59fd43593c715fdd31c61141abd04a99fd6\
             822c8558854ccde39a5684e7a56da27d"
        );
        let asset_key = asset_account_key(1, &alice.public.to_bytes());
        assert_eq!(asset_key.len(), 32 + 16 + 16 + 16 + 32);
        assert_eq!(hex::encode(&asset_key[..16]), "682a59d51ab9e48a8c8cc418ff9708d2");
    }

    #[test]
    fn account_info_reads_nonce_and_balances() {
        let mut raw = vec![0u8; 80];
        raw[..4].copy_from_slice(&7u32.to_le_bytes());
        raw[16..32].copy_from_slice(&1_000u128.to_le_bytes());
        raw[32..48].copy_from_slice(&5u128.to_le_bytes());
        assert_eq!(
            AccountInfo::decode(&raw),
            Some(AccountInfo {
                nonce: 7,
                free: 1_000,
                reserved: 5,
            })
        );
        assert_eq!(AccountInfo::decode(&raw[..20]), None);
    }

    #[test]
    fn ibc_transfers_carry_receiver_channel_and_timeout() {
        let call = ibc_transfer(
            CallIndex::new(190, 0),
            &IbcTransfer {
                to: "cosmos1abc",
                channel: 3,
                timeout_timestamp: 0,
                timeout_height: 3000,
                asset_id: 1,
                amount: 10_000,
                memo: None,
            },
        );
        let mut expected = vec![190, 0, 0x01, 10 << 2];
        expected.extend_from_slice(b"cosmos1abc");
        expected.extend_from_slice(&3u64.to_le_bytes());
        expected.extend_from_slice(&[0x01, 0x01]);
        expected.extend_from_slice(&0u64.to_le_bytes());
        expected.push(0x01);
        expected.extend_from_slice(&3000u64.to_le_bytes());
        expected.extend_from_slice(&1u128.to_le_bytes());
        expected.extend_from_slice(&10_000u128.to_le_bytes());
        expected.push(0x00);
        assert_eq!(call, expected);
    }

    #[test]
    fn signed_transfers_verify_against_the_sender() {
        let alice = sr25519_from_suri("//Alice").expect("alice");
        let bob = sr25519_from_suri("//Bob").expect("bob");
        let call = balances_transfer(RELAY_BALANCES_TRANSFER, &bob.public.to_bytes(), 10_000);
        assert_eq!(&call[..3], &[4, 0, 0]);
        assert_eq!(&call[35..], compact(10_000).as_slice());

        let context = SigningContext {
            nonce: 2,
            spec_version: 9360,
            transaction_version: 16,
            genesis_hash: [9; 32],
        };
        let extrinsic = signed_extrinsic(&alice, &call, &context);

        // compact(139), the body length
        assert_eq!(&extrinsic[..2], &[0x2d, 0x02]);
        let body = &extrinsic[2..];
        assert_eq!(body.len(), 139);
        assert_eq!(&body[..2], &[0x84, 0x00]);
        assert_eq!(&body[2..34], alice.public.to_bytes().as_slice());
        assert_eq!(body[34], 0x01);
        // era, nonce, tip
        assert_eq!(&body[99..102], &[0x00, 2 << 2, 0x00]);
        assert_eq!(&body[102..], call.as_slice());

        let signature = Signature::from_bytes(&body[35..99]).expect("signature");
        alice
            .public
            .verify_simple(b"substrate", &context.payload(&call), &signature)
            .expect("valid signature");
    }
}
