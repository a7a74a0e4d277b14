//! Substrate-style keys: dev account derivation, sr25519 secret URIs, SS58
//! addresses and libp2p peer ids.

use bip39::{Language, Mnemonic};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use blake2::{Blake2b, Blake2b512, Digest as _, digest::consts::U32};
use ed25519_dalek::SigningKey;
use schnorrkel::{ExpansionMode, Keypair, MiniSecretKey, derive::ChainCode};
use sha2::Sha512;

use super::KeyError;

type Blake2b256 = Blake2b<U32>;

/// Mini-secret of the well-known Substrate development phrase.
pub const DEV_SEED: [u8; 32] = [
    0xfa, 0xc7, 0x95, 0x9d, 0xbf, 0xe7, 0x2f, 0x05, 0x2e, 0x5a, 0x0c, 0x3c, 0x8d, 0x65, 0x30, 0xf2,
    0x02, 0xb0, 0x2f, 0xd8, 0xf9, 0xf5, 0xca, 0x35, 0x80, 0xec, 0x8d, 0xeb, 0x77, 0x97, 0x47, 0x9e,
];

/// Address format used by the relay chains the harness runs.
pub const DEFAULT_SS58_FORMAT: u16 = 49;
/// Generic Substrate format.
pub const SUBSTRATE_SS58_FORMAT: u16 = 42;

const ED25519_HDKD: &str = "Ed25519HDKD";
const SECP256K1_HDKD: &str = "Secp256k1HDKD";
const SS58_PREFIX: &[u8] = b"SS58PRE";
const PEER_ID_PREFIX: [u8; 6] = [0x00, 0x24, 0x08, 0x01, 0x12, 0x20];

/// Dev validator names in index order.
pub const DEV_ACCOUNTS: [&str; 5] = ["alice", "bob", "charlie", "dave", "ferdie"];

/// SCALE compact length prefix for short byte strings.
fn compact_len(len: usize) -> Vec<u8> {
    if len < 64 {
        vec![(len as u8) << 2]
    } else {
        let encoded = ((len as u16) << 2) | 0b01;
        encoded.to_le_bytes().to_vec()
    }
}

fn scale_str(value: &str) -> Vec<u8> {
    let mut out = compact_len(value.len());
    out.extend_from_slice(value.as_bytes());
    out
}

/// Chain code of a hard junction: SCALE-encoded and zero-padded, hashed when
/// longer than 32 bytes.
fn junction_chain_code(junction: &str) -> [u8; 32] {
    let encoded = junction
        .parse::<u64>()
        .map_or_else(|_| scale_str(junction), |n| n.to_le_bytes().to_vec());
    let mut code = [0u8; 32];
    if encoded.len() > 32 {
        code.copy_from_slice(&Blake2b256::digest(&encoded));
    } else {
        code[..encoded.len()].copy_from_slice(&encoded);
    }
    code
}

/// Capitalizes the first letter: `alice` → `Alice`.
#[must_use]
pub fn name_case(name: &str) -> String {
    let mut chars = name.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect()
    })
}

fn hdkd(prefix: &str, seed: &[u8; 32], name: &str) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(scale_str(prefix));
    hasher.update(seed);
    hasher.update(junction_chain_code(&name_case(name)));
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Ed25519 key of `//<Name>` derived from the dev seed.
#[must_use]
pub fn derive_ed25519_from_name(name: &str) -> SigningKey {
    SigningKey::from_bytes(&hdkd(ED25519_HDKD, &DEV_SEED, name))
}

/// Secp256k1 key of `//<Name>` derived from the dev seed.
pub fn derive_secp256k1_from_name(name: &str) -> Result<SecretKey, KeyError> {
    SecretKey::from_slice(&hdkd(SECP256K1_HDKD, &DEV_SEED, name))
        .map_err(|err| KeyError::Secret(err.to_string()))
}

/// Compressed public key of a secp256k1 secret.
#[must_use]
pub fn secp256k1_public(secret: &SecretKey) -> [u8; 33] {
    PublicKey::from_secret_key(&Secp256k1::new(), secret).serialize()
}

/// Sr25519 keypair of the dev seed followed by hard junctions, e.g.
/// `["Alice", "stash"]` for `//Alice//stash`.
pub fn derive_sr25519_from_path(path: &[&str]) -> Result<Keypair, KeyError> {
    derive_sr25519(&DEV_SEED, path)
}

fn derive_sr25519(seed: &[u8; 32], path: &[&str]) -> Result<Keypair, KeyError> {
    let mut mini =
        MiniSecretKey::from_bytes(seed).map_err(|err| KeyError::Secret(err.to_string()))?;
    for junction in path {
        let secret = mini.expand(ExpansionMode::Ed25519);
        mini = secret
            .hard_derive_mini_secret_key(Some(ChainCode(junction_chain_code(junction))), b"")
            .0;
    }
    Ok(mini.expand_to_keypair(ExpansionMode::Ed25519))
}

/// Mini-secret seed of a BIP-39 phrase: `pbkdf2(entropy, "mnemonic")[..32]`.
pub fn mini_secret_from_mnemonic(phrase: &str) -> Result<[u8; 32], KeyError> {
    let mnemonic = Mnemonic::from_phrase(phrase.trim(), Language::English)
        .map_err(|err| KeyError::Mnemonic(err.to_string()))?;
    let mut seed = [0u8; 64];
    pbkdf2::pbkdf2_hmac::<Sha512>(mnemonic.entropy(), b"mnemonic", 2048, &mut seed);
    let mut mini = [0u8; 32];
    mini.copy_from_slice(&seed[..32]);
    Ok(mini)
}

/// Sr25519 keypair of a secret URI: `<phrase>` optionally followed by
/// `//hard` junctions. An empty phrase means the dev phrase, so `//Alice`
/// works as is. Soft junctions are rejected.
pub fn sr25519_from_suri(suri: &str) -> Result<Keypair, KeyError> {
    let (phrase, path) = suri
        .find("//")
        .map_or((suri, ""), |idx| (&suri[..idx], &suri[idx..]));
    let seed = if phrase.trim().is_empty() {
        DEV_SEED
    } else {
        mini_secret_from_mnemonic(phrase)?
    };

    let junctions: Vec<&str> = path.split("//").filter(|j| !j.is_empty()).collect();
    if junctions.iter().any(|j| j.contains('/')) {
        return Err(KeyError::Secret(format!(
            "soft derivation is not supported: {suri}"
        )));
    }
    derive_sr25519(&seed, &junctions)
}

/// SS58: `format ‖ key ‖ blake2b512("SS58PRE" ‖ format ‖ key)[..n]`, base58.
#[must_use]
pub fn ss58_encode(key: &[u8], format: u16) -> String {
    let mut payload = if format < 64 {
        vec![format as u8]
    } else {
        vec![
            (((format & 0b1111_1100) >> 2) as u8) | 0b0100_0000,
            ((format >> 8) as u8) | (((format & 0b11) as u8) << 6),
        ]
    };
    payload.extend_from_slice(key);

    let checksum = ss58_checksum(&payload);
    let len = if matches!(key.len(), 32 | 33) { 2 } else { 1 };
    payload.extend_from_slice(&checksum[..len]);
    bs58::encode(payload).into_string()
}

/// Decodes an address with a one-byte format prefix, returning `(format, key)`.
pub fn ss58_decode(address: &str) -> Result<(u16, Vec<u8>), KeyError> {
    let raw = bs58::decode(address)
        .into_vec()
        .map_err(|err| KeyError::Address(err.to_string()))?;
    let checksum_len = match raw.len() {
        3 | 4 | 6 | 10 => 1,
        5 | 7 | 11 | 35 | 36 => 2,
        _ => return Err(KeyError::Address(format!("unexpected length {}", raw.len()))),
    };
    if raw[0] >= 64 {
        return Err(KeyError::Address("two-byte formats are not supported".to_owned()));
    }
    let (body, checksum) = raw.split_at(raw.len() - checksum_len);
    if ss58_checksum(body)[..checksum_len] != *checksum {
        return Err(KeyError::Address(format!("bad checksum in {address}")));
    }
    Ok((u16::from(body[0]), body[1..].to_vec()))
}

fn ss58_checksum(payload: &[u8]) -> [u8; 64] {
    let mut hasher = Blake2b512::new();
    hasher.update(SS58_PREFIX);
    hasher.update(payload);
    let mut out = [0u8; 64];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Base58 libp2p peer id (identity multihash of the protobuf ed25519 key).
#[must_use]
pub fn libp2p_peer_id(node_key: &SigningKey) -> String {
    let mut bytes = PEER_ID_PREFIX.to_vec();
    bytes.extend_from_slice(node_key.verifying_key().as_bytes());
    bs58::encode(bytes).into_string()
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::SigningKey;

    use super::*;

    #[test]
    fn node_key_peer_id_matches_libp2p() {
        let seed: [u8; 32] =
            hex::decode("1b57e31ddf03e39c58207dfcb5445958924b818c08c303a91838e68cfac551b2")
                .expect("hex")
                .try_into()
                .expect("32 bytes");
        assert_eq!(
            libp2p_peer_id(&SigningKey::from_bytes(&seed)),
            "12D3KooWCqDbuUHRNWPAuHpVnzZGCkkMwgEx7Xd6xgszqtVpH56c"
        );
    }

    #[test]
    fn ed25519_alice_matches_substrate() {
        let key = derive_ed25519_from_name("alice");
        assert_eq!(
            ss58_encode(key.verifying_key().as_bytes(), SUBSTRATE_SS58_FORMAT),
            "5FA9nQDVg267DEd8m1ZypXLBnvN7SFxYwV7ndqSYGiN9TTpu"
        );
    }

    #[test]
    fn sr25519_dev_accounts_match_substrate() {
        let alice = derive_sr25519_from_path(&["Alice"]).expect("derive");
        assert_eq!(
            ss58_encode(&alice.public.to_bytes(), SUBSTRATE_SS58_FORMAT),
            "5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY"
        );

        let stash = sr25519_from_suri("//Alice//stash").expect("derive");
        assert_eq!(
            ss58_encode(&stash.public.to_bytes(), SUBSTRATE_SS58_FORMAT),
            "5GNJqTPyNqANBkUVMN1LPPrxXnFouWXoe2wNSmmEoLctxiZY"
        );
    }

    #[test]
    fn dev_phrase_matches_dev_seed() {
        let phrase = "bottom drive obey lake curtain smoke basket hold race lonely fit walk";
        assert_eq!(mini_secret_from_mnemonic(phrase).expect("phrase"), DEV_SEED);
    }

    #[test]
    fn ss58_decode_inverts_encode() {
        let alice = derive_sr25519_from_path(&["Alice"]).expect("derive");
        let address = ss58_encode(&alice.public.to_bytes(), DEFAULT_SS58_FORMAT);
        let (format, key) = ss58_decode(&address).expect("decode");
        assert_eq!(format, DEFAULT_SS58_FORMAT);
        assert_eq!(key, alice.public.to_bytes());
    }

    #[test]
    fn soft_junctions_are_rejected() {
        assert!(sr25519_from_suri("//Alice/soft").is_err());
    }

    #[test]
    fn name_case_capitalizes() {
        assert_eq!(name_case("charlie"), "Charlie");
        assert_eq!(name_case(""), "");
    }
}
