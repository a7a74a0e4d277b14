//! Genesis edits applied to the output of `build-spec`, for the relay chain
//! and for the parachains it registers.

use interchaintest_core::chain::{GenesisError, GenesisKV, apply_genesis_patches};
use serde_json::{Value, json};

const LEGACY_RUNTIME: &str = "genesis.runtime.runtime_genesis_config";
const RUNTIME: &str = "genesis.runtime";
const SESSION_LENGTH_IN_BLOCKS: u64 = 20;
const VALIDATION_UPGRADE_DELAY: u64 = 2;

/// Session keys of one validator, all SS58 encoded.
#[derive(Clone, Debug)]
pub(crate) struct Authority {
    pub stash: String,
    pub account: String,
    pub grandpa: String,
    pub beefy: String,
}

impl Authority {
    fn session_keys(&self) -> Value {
        json!([
            self.stash,
            self.stash,
            {
                "grandpa": self.grandpa,
                "babe": self.account,
                "im_online": self.account,
                "parachain_validator": self.account,
                "authority_discovery": self.account,
                "para_validator": self.account,
                "para_assignment": self.account,
                "beefy": self.beefy,
            }
        ])
    }
}

/// A parachain the relay chain knows from genesis.
#[derive(Clone, Debug)]
pub(crate) struct ParachainRegistration {
    pub id: u32,
    pub genesis_head: String,
    pub validation_code: String,
}

impl ParachainRegistration {
    fn entry(&self) -> Value {
        json!([
            self.id,
            {
                "genesis_head": self.genesis_head,
                "validation_code": self.validation_code,
                "parachain": true,
            }
        ])
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct RelayGenesis {
    pub boot_nodes: Vec<String>,
    pub authorities: Vec<Authority>,
    pub balances: Vec<(String, u64)>,
    pub sudo: String,
    pub parachains: Vec<ParachainRegistration>,
}

/// Older specs nest the pallets one level deeper.
fn runtime_prefix(spec: &Value) -> &'static str {
    if spec
        .pointer("/genesis/runtime/runtime_genesis_config")
        .is_some_and(Value::is_object)
    {
        LEGACY_RUNTIME
    } else {
        RUNTIME
    }
}

pub(crate) fn patch_chain_spec(
    spec: &[u8],
    genesis: &RelayGenesis,
) -> Result<Vec<u8>, GenesisError> {
    let prefix = runtime_prefix(&serde_json::from_slice(spec)?);
    let balances: Vec<Value> = genesis
        .balances
        .iter()
        .map(|(address, amount)| json!([address, amount]))
        .collect();
    let mut patches = vec![
        GenesisKV::new("bootNodes", genesis.boot_nodes.clone()),
        GenesisKV::new(
            format!("{prefix}.session.keys"),
            genesis
                .authorities
                .iter()
                .map(Authority::session_keys)
                .collect::<Vec<_>>(),
        ),
        GenesisKV::new(format!("{prefix}.balances.balances"), balances),
        GenesisKV::new(format!("{prefix}.sudo.key"), genesis.sudo.clone()),
        GenesisKV::new(
            format!("{prefix}.configuration.config.validation_upgrade_delay"),
            VALIDATION_UPGRADE_DELAY,
        ),
        GenesisKV::new(
            format!("{RUNTIME}.session_length_in_blocks"),
            SESSION_LENGTH_IN_BLOCKS,
        ),
    ];
    if !genesis.parachains.is_empty() {
        patches.push(GenesisKV::new(
            format!("{prefix}.paras.paras"),
            genesis
                .parachains
                .iter()
                .map(ParachainRegistration::entry)
                .collect::<Vec<_>>(),
        ));
    }
    apply_genesis_patches(spec, &patches)
}

/// Appends `balances` to the ones the parachain's own spec funds.
pub(crate) fn patch_parachain_spec(
    spec: &[u8],
    balances: &[(String, u64)],
) -> Result<Vec<u8>, GenesisError> {
    let parsed: Value = serde_json::from_slice(spec)?;
    let key = format!("{}.balances.balances", runtime_prefix(&parsed));
    let mut all = parsed
        .pointer(&format!("/{}", key.replace('.', "/")))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    all.extend(
        balances
            .iter()
            .map(|(address, amount)| json!([address, amount])),
    );
    apply_genesis_patches(spec, &[GenesisKV::new(key, all)])
}

/// The parachain id a collator spec declares, `para_id` or `paraId`.
pub(crate) fn parachain_id(spec: &[u8]) -> Result<u32, GenesisError> {
    let parsed: Value = serde_json::from_slice(spec)?;
    parsed
        .get("para_id")
        .or_else(|| parsed.get("paraId"))
        .and_then(Value::as_u64)
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| GenesisError::Path {
            index: 0,
            key: "para_id".to_owned(),
            reason: "missing or not a u32".to_owned(),
        })
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::{
        Authority, ParachainRegistration, RelayGenesis, parachain_id, patch_chain_spec,
        patch_parachain_spec,
    };

    fn genesis() -> RelayGenesis {
        RelayGenesis {
            boot_nodes: vec!["/dns4/relaychain-0/tcp/27452/p2p/12D3KooW".to_owned()],
            authorities: vec![Authority {
                stash: "stash0".to_owned(),
                account: "alice".to_owned(),
                grandpa: "grandpa0".to_owned(),
                beefy: "beefy0".to_owned(),
            }],
            balances: vec![("alice".to_owned(), 1_100), ("user".to_owned(), 5)],
            sudo: "alice".to_owned(),
            parachains: Vec::new(),
        }
    }

    fn runtime() -> Value {
        json!({
            "session": { "keys": [] },
            "balances": { "balances": [] },
            "sudo": { "key": "" },
            "configuration": { "config": { "validation_upgrade_delay": 10 } },
        })
    }

    #[test]
    fn legacy_runtime_layout_is_patched_in_place() {
        let spec = json!({
            "name": "Rococo Local Testnet",
            "bootNodes": [],
            "genesis": { "runtime": { "runtime_genesis_config": runtime() } },
        });
        let spec = serde_json::to_vec(&spec).expect("json");
        let patched = patch_chain_spec(&spec, &genesis()).expect("patch");
        let patched: Value = serde_json::from_slice(&patched).expect("json");

        let runtime = &patched["genesis"]["runtime"]["runtime_genesis_config"];
        assert_eq!(patched["bootNodes"][0], "/dns4/relaychain-0/tcp/27452/p2p/12D3KooW");
        assert_eq!(runtime["balances"]["balances"], json!([["alice", 1_100], ["user", 5]]));
        assert_eq!(runtime["sudo"]["key"], "alice");
        assert_eq!(runtime["session"]["keys"][0][0], "stash0");
        assert_eq!(runtime["session"]["keys"][0][2]["grandpa"], "grandpa0");
        assert_eq!(runtime["session"]["keys"][0][2]["babe"], "alice");
        assert_eq!(runtime["configuration"]["config"]["validation_upgrade_delay"], 2);
        assert_eq!(patched["genesis"]["runtime"]["session_length_in_blocks"], 20);
    }

    #[test]
    fn flat_runtime_layout_is_patched() {
        let spec = json!({ "bootNodes": [], "genesis": { "runtime": runtime() } });
        let spec = serde_json::to_vec(&spec).expect("json");
        let patched = patch_chain_spec(&spec, &genesis()).expect("patch");
        let patched: Value = serde_json::from_slice(&patched).expect("json");
        assert_eq!(patched["genesis"]["runtime"]["sudo"]["key"], "alice");
    }

    #[test]
    fn specs_without_a_runtime_are_rejected() {
        let spec = serde_json::to_vec(&json!({ "bootNodes": [], "genesis": {} })).expect("json");
        assert!(patch_chain_spec(&spec, &genesis()).is_err());
    }

    #[test]
    fn registered_parachains_are_added_to_paras() {
        let mut runtime = runtime();
        runtime["paras"] = json!({ "paras": [] });
        let spec = json!({ "bootNodes": [], "genesis": { "runtime": runtime } });
        let spec = serde_json::to_vec(&spec).expect("json");
        let genesis = RelayGenesis {
            parachains: vec![ParachainRegistration {
                id: 2087,
                genesis_head: "0x00aa".to_owned(),
                validation_code: "0x0061736d".to_owned(),
            }],
            ..genesis()
        };
        let patched = patch_chain_spec(&spec, &genesis).expect("patch");
        let patched: Value = serde_json::from_slice(&patched).expect("json");
        assert_eq!(
            patched["genesis"]["runtime"]["paras"]["paras"],
            json!([[2087, {
                "genesis_head": "0x00aa",
                "validation_code": "0x0061736d",
                "parachain": true,
            }]])
        );
    }

    #[test]
    fn parachain_balances_are_appended() {
        let spec = json!({
            "para_id": 2087,
            "genesis": { "runtime": { "balances": { "balances": [["alice", 1]] } } },
        });
        let spec = serde_json::to_vec(&spec).expect("json");
        let patched =
            patch_parachain_spec(&spec, &[("faucet".to_owned(), 10_000)]).expect("patch");
        let patched: Value = serde_json::from_slice(&patched).expect("json");
        assert_eq!(
            patched["genesis"]["runtime"]["balances"]["balances"],
            json!([["alice", 1], ["faucet", 10_000]])
        );
        assert_eq!(parachain_id(&serde_json::to_vec(&patched).expect("json")).expect("id"), 2087);
        assert_eq!(parachain_id(br#"{"paraId": 1000}"#).expect("id"), 1000);
        assert!(parachain_id(br#"{"name": "dali"}"#).is_err());
    }
}
