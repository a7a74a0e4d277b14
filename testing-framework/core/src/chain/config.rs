use std::{collections::BTreeMap, fmt, sync::Arc};

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::{DynError, wallet::KeyError};

pub const COSMOS: &str = "cosmos";
pub const PENUMBRA: &str = "penumbra";
pub const POLKADOT: &str = "polkadot";

const DEFAULT_COIN_TYPE: u32 = 118;
const DEFAULT_COIN_DECIMALS: u32 = 6;

macro_rules! hook {
    ($(#[$meta:meta])* $name:ident, $($sig:tt)+) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name(Arc<dyn $($sig)+ + Send + Sync>);

        impl $name {
            pub fn new(f: impl $($sig)+ + Send + Sync + 'static) -> Self {
                Self(Arc::new(f))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(concat!(stringify!($name), "(..)"))
            }
        }
    };
}

hook!(
    /// Runs before validator identities and genesis are generated.
    PreGenesisHook,
    Fn(&ChainConfig) -> Result<(), DynError>
);
hook!(
    /// Rewrites the rendered genesis document before it is shared with nodes.
    GenesisHook,
    Fn(&ChainConfig, Vec<u8>) -> Result<Vec<u8>, DynError>
);
hook!(
    /// Genesis balance and self-delegation of the validator at an index.
    GenesisAmountsHook,
    Fn(usize) -> (BigUint, BigUint)
);

impl PreGenesisHook {
    pub fn call(&self, config: &ChainConfig) -> Result<(), DynError> {
        (self.0)(config)
    }
}

impl GenesisHook {
    pub fn call(&self, config: &ChainConfig, genesis: Vec<u8>) -> Result<Vec<u8>, DynError> {
        (self.0)(config, genesis)
    }
}

impl GenesisAmountsHook {
    #[must_use]
    pub fn call(&self, index: usize) -> (BigUint, BigUint) {
        (self.0)(index)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DockerImage {
    pub repository: String,
    pub version: String,
    pub uid_gid: String,
}

impl DockerImage {
    #[must_use]
    pub fn new(
        repository: impl Into<String>,
        version: impl Into<String>,
        uid_gid: impl Into<String>,
    ) -> Self {
        Self {
            repository: repository.into(),
            version: version.into(),
            uid_gid: uid_gid.into(),
        }
    }

    /// `repository:version`, or `repository:latest` without a version.
    #[must_use]
    pub fn image_ref(&self) -> String {
        if self.version.is_empty() {
            format!("{}:latest", self.repository)
        } else {
            format!("{}:{}", self.repository, self.version)
        }
    }

    /// Lists missing required fields. The version may come from a chain spec.
    pub fn validate(&self) -> Result<(), Vec<&'static str>> {
        let mut missing = Vec::new();
        if self.repository.is_empty() {
            missing.push("repository");
        }
        if self.uid_gid.is_empty() {
            missing.push("uid-gid");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(missing)
        }
    }

    #[must_use]
    pub fn is_fully_configured(&self) -> bool {
        self.validate().is_ok()
    }
}

/// Everything a chain driver needs to know about one chain. Loaded from the
/// configured-chains catalog and overlaid by test code.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ChainConfig {
    #[serde(rename = "type")]
    pub chain_type: String,
    pub name: String,
    pub chain_id: String,
    pub images: Vec<DockerImage>,
    pub bin: String,
    pub bech32_prefix: String,
    pub denom: String,
    /// BIP-44 coin type; empty means 118.
    pub coin_type: String,
    pub coin_decimals: Option<u32>,
    pub gas_prices: String,
    pub gas_adjustment: f64,
    pub trusting_period: String,
    pub no_host_mount: bool,
    pub skip_gen_tx: bool,
    pub using_chain_id_flag_cli: bool,
    pub additional_start_args: Vec<String>,
    /// `KEY=VALUE` pairs for node containers.
    pub env: Vec<String>,
    pub expose_additional_ports: Vec<String>,
    /// Fixed host ports for the first validator, keyed by container port.
    pub host_port_override: BTreeMap<u16, u16>,
    pub ss58_format: Option<u16>,
    /// TOML overrides keyed by file path relative to the node home.
    pub config_file_overrides: BTreeMap<String, toml::Table>,
    #[serde(skip)]
    pub pre_genesis: Option<PreGenesisHook>,
    #[serde(skip)]
    pub modify_genesis: Option<GenesisHook>,
    #[serde(skip)]
    pub modify_genesis_amounts: Option<GenesisAmountsHook>,
}

impl ChainConfig {
    pub fn coin_type_number(&self) -> Result<u32, KeyError> {
        if self.coin_type.is_empty() {
            return Ok(DEFAULT_COIN_TYPE);
        }
        self.coin_type
            .parse()
            .map_err(|_| KeyError::CoinType(self.coin_type.clone()))
    }

    #[must_use]
    pub fn coin_decimals(&self) -> u32 {
        self.coin_decimals.unwrap_or(DEFAULT_COIN_DECIMALS)
    }

    /// Overlays every non-empty field of `other`. The name and `no_host_mount`
    /// are left alone so a chain spec can tell "unset" from `false`.
    pub fn merge_chain_config(&mut self, other: &Self) {
        fn take(dst: &mut String, src: &str) {
            if !src.is_empty() {
                src.clone_into(dst);
            }
        }

        take(&mut self.chain_type, &other.chain_type);
        take(&mut self.chain_id, &other.chain_id);
        if !other.images.is_empty() {
            self.images.clone_from(&other.images);
        }
        take(&mut self.bin, &other.bin);
        take(&mut self.bech32_prefix, &other.bech32_prefix);
        take(&mut self.denom, &other.denom);
        take(&mut self.coin_type, &other.coin_type);
        take(&mut self.gas_prices, &other.gas_prices);
        if other.gas_adjustment > 0.0 {
            self.gas_adjustment = other.gas_adjustment;
        }
        take(&mut self.trusting_period, &other.trusting_period);
        if other.coin_decimals.is_some() {
            self.coin_decimals = other.coin_decimals;
        }
        self.skip_gen_tx |= other.skip_gen_tx;
        self.using_chain_id_flag_cli |= other.using_chain_id_flag_cli;
        self.additional_start_args
            .extend(other.additional_start_args.iter().cloned());
        self.env.extend(other.env.iter().cloned());
        self.expose_additional_ports
            .extend(other.expose_additional_ports.iter().cloned());
        if !other.host_port_override.is_empty() {
            self.host_port_override.clone_from(&other.host_port_override);
        }
        if other.ss58_format.is_some() {
            self.ss58_format = other.ss58_format;
        }
        if !other.config_file_overrides.is_empty() {
            self.config_file_overrides
                .clone_from(&other.config_file_overrides);
        }
        if other.pre_genesis.is_some() {
            self.pre_genesis.clone_from(&other.pre_genesis);
        }
        if other.modify_genesis.is_some() {
            self.modify_genesis.clone_from(&other.modify_genesis);
        }
        if other.modify_genesis_amounts.is_some() {
            self.modify_genesis_amounts
                .clone_from(&other.modify_genesis_amounts);
        }
    }

    /// All required fields are set. `gas_adjustment` and `no_host_mount` may
    /// legitimately be zero values.
    #[must_use]
    pub fn is_fully_configured(&self) -> bool {
        self.images.iter().all(DockerImage::is_fully_configured)
            && !self.chain_type.is_empty()
            && !self.name.is_empty()
            && !self.chain_id.is_empty()
            && !self.images.is_empty()
            && !self.bin.is_empty()
            && !self.bech32_prefix.is_empty()
            && !self.denom.is_empty()
            && !self.gas_prices.is_empty()
            && !self.trusting_period.is_empty()
    }

    /// `denom` amount scaled by `10^coin_decimals`.
    #[must_use]
    pub fn whole_tokens(&self, tokens: u64) -> BigUint {
        BigUint::from(tokens) * BigUint::from(10u32).pow(self.coin_decimals())
    }
}
