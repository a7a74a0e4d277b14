use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::config::GenesisHook;

#[derive(Debug, thiserror::Error)]
pub enum GenesisError {
    #[error("genesis is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("genesis patch #{index} ({key}): {reason}")]
    Path {
        index: usize,
        key: String,
        reason: String,
    },
}

/// One dotted-path patch, e.g. `app_state.gov.params.min_deposit.0.denom`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenesisKV {
    pub key: String,
    pub value: Value,
}

impl GenesisKV {
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Applies `patches` in order. Intermediate segments must already exist.
/// The last segment may add a key to an object but only replace an existing
/// array element.
pub fn apply_genesis_patches(
    genesis: &[u8],
    patches: &[GenesisKV],
) -> Result<Vec<u8>, GenesisError> {
    let mut doc: Value = serde_json::from_slice(genesis)?;
    for (index, patch) in patches.iter().enumerate() {
        let path_error = |reason: String| GenesisError::Path {
            index,
            key: patch.key.clone(),
            reason,
        };

        let segments: Vec<&str> = patch.key.split('.').collect();
        let Some((last, parents)) = segments.split_last() else {
            return Err(path_error("empty key".to_owned()));
        };

        let mut current = &mut doc;
        for segment in parents {
            current = step(current, segment).map_err(path_error)?;
        }
        match current {
            Value::Object(map) => {
                map.insert((*last).to_owned(), patch.value.clone());
            }
            Value::Array(items) => {
                let slot = last
                    .parse::<usize>()
                    .ok()
                    .and_then(|idx| items.get_mut(idx))
                    .ok_or_else(|| path_error(format!("no array element {last}")))?;
                *slot = patch.value.clone();
            }
            other => {
                return Err(path_error(format!("cannot index {} with {last}", kind(other))));
            }
        }
    }
    Ok(serde_json::to_vec_pretty(&doc)?)
}

fn step<'a>(value: &'a mut Value, segment: &str) -> Result<&'a mut Value, String> {
    match value {
        Value::Object(map) => map
            .get_mut(segment)
            .ok_or_else(|| format!("missing key {segment}")),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(|idx| items.get_mut(idx))
            .ok_or_else(|| format!("no array element {segment}")),
        other => Err(format!("cannot index {} with {segment}", kind(other))),
    }
}

const fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Genesis hook applying a fixed patch list.
#[must_use]
pub fn modify_genesis(patches: Vec<GenesisKV>) -> GenesisHook {
    GenesisHook::new(move |_, genesis| Ok(apply_genesis_patches(&genesis, &patches)?))
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::{GenesisKV, apply_genesis_patches, modify_genesis};
    use crate::chain::ChainConfig;

    fn genesis() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "chain_id": "gaia-1",
            "app_state": {
                "gov": {"params": {"min_deposit": [{"denom": "stake", "amount": "10"}]}},
                "staking": {"params": {"bond_denom": "stake"}}
            }
        }))
        .expect("json")
    }

    #[test]
    fn empty_patch_set_keeps_the_document() {
        let out = apply_genesis_patches(&genesis(), &[]).expect("patched");
        let before: Value = serde_json::from_slice(&genesis()).expect("json");
        let after: Value = serde_json::from_slice(&out).expect("json");
        assert_eq!(before, after);
    }

    #[test]
    fn patches_walk_objects_and_arrays() {
        let hook = modify_genesis(vec![
            GenesisKV::new("app_state.gov.params.min_deposit.0.denom", "uatom"),
            GenesisKV::new("app_state.staking.params.unbonding_time", "10s"),
        ]);
        let out = hook
            .call(&ChainConfig::default(), genesis())
            .expect("patched");
        let doc: Value = serde_json::from_slice(&out).expect("json");

        assert_eq!(doc["app_state"]["gov"]["params"]["min_deposit"][0]["denom"], "uatom");
        assert_eq!(doc["app_state"]["staking"]["params"]["unbonding_time"], "10s");
        assert_eq!(doc["app_state"]["staking"]["params"]["bond_denom"], "stake");
    }

    #[test]
    fn missing_parents_are_rejected() {
        let err = apply_genesis_patches(&genesis(), &[GenesisKV::new("app_state.mint.params", 1)])
            .expect_err("missing key");
        assert!(err.to_string().contains("missing key mint"));

        let err = apply_genesis_patches(
            &genesis(),
            &[GenesisKV::new("app_state.gov.params.min_deposit.3", 1)],
        )
        .expect_err("out of bounds");
        assert!(err.to_string().contains("no array element 3"));
    }
}
