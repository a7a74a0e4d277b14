pub mod cosmos;
pub mod substrate;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::chain::ChainConfig;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid mnemonic: {0}")]
    Mnemonic(String),
    #[error("key derivation failed: {0}")]
    Derivation(#[from] bitcoin::util::bip32::Error),
    #[error("bech32 encoding failed: {0}")]
    Bech32(#[from] bech32::Error),
    #[error("invalid secret: {0}")]
    Secret(String),
    #[error("invalid address: {0}")]
    Address(String),
    #[error("invalid coin type {0:?}")]
    CoinType(String),
}

/// A funded or fundable account on one chain. Immutable once built.
#[derive(Clone, Debug)]
pub struct Wallet {
    key_name: String,
    address: String,
    address_bytes: Vec<u8>,
    mnemonic: Option<String>,
    chain_config: ChainConfig,
}

impl Wallet {
    #[must_use]
    pub const fn new(
        key_name: String,
        address: String,
        address_bytes: Vec<u8>,
        mnemonic: Option<String>,
        chain_config: ChainConfig,
    ) -> Self {
        Self {
            key_name,
            address,
            address_bytes,
            mnemonic,
            chain_config,
        }
    }

    #[must_use]
    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    /// Address formatted for the chain (bech32, SS58, ...).
    #[must_use]
    pub fn formatted_address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn address_bytes(&self) -> &[u8] {
        &self.address_bytes
    }

    #[must_use]
    pub fn mnemonic(&self) -> Option<&str> {
        self.mnemonic.as_deref()
    }

    #[must_use]
    pub const fn chain_config(&self) -> &ChainConfig {
        &self.chain_config
    }
}

impl PartialEq for Wallet {
    fn eq(&self, other: &Self) -> bool {
        self.mnemonic == other.mnemonic
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletAmount {
    pub address: String,
    pub denom: String,
    pub amount: BigUint,
}

impl WalletAmount {
    #[must_use]
    pub fn new(
        address: impl Into<String>,
        denom: impl Into<String>,
        amount: impl Into<BigUint>,
    ) -> Self {
        Self {
            address: address.into(),
            denom: denom.into(),
            amount: amount.into(),
        }
    }
}

/// Builds a wallet off-node from a cosmos mnemonic, generating one if empty.
pub fn cosmos_wallet(
    key_name: &str,
    mnemonic: Option<&str>,
    config: &ChainConfig,
) -> Result<Wallet, KeyError> {
    let mnemonic = mnemonic
        .filter(|m| !m.trim().is_empty())
        .map_or_else(cosmos::generate_mnemonic, str::to_owned);
    let key = cosmos::CosmosKey::from_mnemonic(&mnemonic, config.coin_type_number()?)?;
    Ok(Wallet::new(
        key_name.to_owned(),
        key.address(&config.bech32_prefix)?,
        key.address_bytes(),
        Some(mnemonic),
        config.clone(),
    ))
}

#[cfg(test)]
mod tests {
    use super::cosmos_wallet;
    use crate::chain::ChainConfig;

    fn config() -> ChainConfig {
        ChainConfig {
            bech32_prefix: "cosmos".to_owned(),
            coin_type: "118".to_owned(),
            ..ChainConfig::default()
        }
    }

    #[test]
    fn wallets_compare_by_mnemonic() {
        let a = cosmos_wallet("a", None, &config()).expect("wallet");
        let b = cosmos_wallet("b", a.mnemonic(), &config()).expect("wallet");
        let c = cosmos_wallet("c", None, &config()).expect("wallet");

        assert_eq!(a, b);
        assert_eq!(a.formatted_address(), b.formatted_address());
        assert_ne!(a, c);
        assert!(a.formatted_address().starts_with("cosmos1"));
    }
}
