use std::str::FromStr as _;

use bech32::{FromBase32 as _, ToBase32 as _, Variant};
use bip39::{Language, Mnemonic, MnemonicType, Seed};
use bitcoin::{
    Network,
    secp256k1::Secp256k1,
    util::bip32::{DerivationPath, ExtendedPrivKey, ExtendedPubKey},
};
use ripemd::Ripemd160;
use sha2::{Digest as _, Sha256};

use super::KeyError;

/// A secp256k1 account key derived at `m/44'/<coin>'/0'/0/0`.
#[derive(Clone)]
pub struct CosmosKey {
    mnemonic: String,
    xprv: ExtendedPrivKey,
    xpub: ExtendedPubKey,
}

impl std::fmt::Debug for CosmosKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CosmosKey")
            .field("public_key", &hex::encode(self.public_key()))
            .finish_non_exhaustive()
    }
}

/// Fresh 24-word English mnemonic.
#[must_use]
pub fn generate_mnemonic() -> String {
    Mnemonic::new(MnemonicType::Words24, Language::English).into_phrase()
}

impl CosmosKey {
    pub fn from_mnemonic(mnemonic: &str, coin_type: u32) -> Result<Self, KeyError> {
        let parsed = Mnemonic::from_phrase(mnemonic.trim(), Language::English)
            .map_err(|err| KeyError::Mnemonic(err.to_string()))?;
        let seed = Seed::new(&parsed, "");

        let secp = Secp256k1::new();
        let path = DerivationPath::from_str(&format!("m/44'/{coin_type}'/0'/0/0"))?;
        let xprv = ExtendedPrivKey::new_master(Network::Bitcoin, seed.as_bytes())?
            .derive_priv(&secp, &path)?;
        let xpub = ExtendedPubKey::from_priv(&secp, &xprv);

        Ok(Self {
            mnemonic: parsed.into_phrase(),
            xprv,
            xpub,
        })
    }

    #[must_use]
    pub fn mnemonic(&self) -> &str {
        &self.mnemonic
    }

    /// Compressed SEC1 public key.
    #[must_use]
    pub fn public_key(&self) -> [u8; 33] {
        self.xpub.public_key.serialize()
    }

    #[must_use]
    pub fn address_bytes(&self) -> Vec<u8> {
        address_bytes(&self.public_key())
    }

    pub fn address(&self, prefix: &str) -> Result<String, KeyError> {
        encode_bech32(prefix, &self.address_bytes())
    }

    /// BIP-32 serialized `(xprv, xpub)` of the account key.
    #[must_use]
    pub fn extended_keys(&self) -> (String, String) {
        (self.xprv.to_string(), self.xpub.to_string())
    }
}

/// `ripemd160(sha256(pubkey))`.
#[must_use]
pub fn address_bytes(public_key: &[u8]) -> Vec<u8> {
    Ripemd160::digest(Sha256::digest(public_key)).to_vec()
}

pub fn encode_bech32(prefix: &str, bytes: &[u8]) -> Result<String, KeyError> {
    Ok(bech32::encode(prefix, bytes.to_base32(), Variant::Bech32)?)
}

/// Returns the human readable part and the payload.
pub fn decode_bech32(address: &str) -> Result<(String, Vec<u8>), KeyError> {
    let (hrp, data, _) = bech32::decode(address)?;
    Ok((hrp, Vec::<u8>::from_base32(&data)?))
}

#[cfg(test)]
mod tests {
    use super::{CosmosKey, decode_bech32, generate_mnemonic};

    const ABANDON: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn known_mnemonic_derives_known_address() {
        let key = CosmosKey::from_mnemonic(ABANDON, 118).expect("valid mnemonic");
        assert_eq!(
            key.address("cosmos").expect("bech32"),
            "cosmos19rl4cm2hmr8afy4kldpxz3fka4jguq0auqdal4"
        );
    }

    #[test]
    fn prefix_only_changes_the_hrp() {
        let key = CosmosKey::from_mnemonic(ABANDON, 118).expect("valid mnemonic");
        let osmo = key.address("osmo").expect("bech32");
        let (hrp, bytes) = decode_bech32(&osmo).expect("decode");
        assert_eq!(hrp, "osmo");
        assert_eq!(bytes, key.address_bytes());
        assert_eq!(bytes.len(), 20);
    }

    #[test]
    fn coin_type_changes_the_account() {
        let atom = CosmosKey::from_mnemonic(ABANDON, 118).expect("valid mnemonic");
        let eth = CosmosKey::from_mnemonic(ABANDON, 60).expect("valid mnemonic");
        assert_ne!(atom.address_bytes(), eth.address_bytes());
    }

    #[test]
    fn generated_mnemonics_have_24_words() {
        let mnemonic = generate_mnemonic();
        assert_eq!(mnemonic.split_whitespace().count(), 24);
        assert!(CosmosKey::from_mnemonic(&mnemonic, 118).is_ok());
    }

    #[test]
    fn invalid_mnemonic_is_rejected() {
        assert!(CosmosKey::from_mnemonic("not a mnemonic", 118).is_err());
    }
}
