//! Inputs of `pd testnet generate` and parsing of `pcli` output.

use std::fmt::Write as _;

use num_bigint::BigUint;
use serde_json::Value;

/// One row of the allocations CSV.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Allocation {
    pub amount: BigUint,
    pub denom: String,
    pub address: String,
}

pub(crate) fn allocations_csv(allocations: &[Allocation]) -> String {
    let mut csv = String::from("\"amount\",\"denom\",\"address\"\n");
    for allocation in allocations {
        // Writing to a String cannot fail.
        let _ = writeln!(
            csv,
            "\"{}\",\"{}\",\"{}\"",
            allocation.amount, allocation.denom, allocation.address
        );
    }
    csv
}

/// Names a validator definition produced by `validator template-definition`
/// after its node, keeping every other field as generated.
pub(crate) fn named_validator(mut definition: Value, name: &str) -> Result<Value, String> {
    let Some(object) = definition.as_object_mut() else {
        return Err("validator definition is not a JSON object".to_owned());
    };
    object.insert("name".to_owned(), Value::from(name));
    Ok(definition)
}

/// Address labelled `label` in `pcli addr list` output, whose rows read
/// `<index> <label> <address>`.
pub(crate) fn address_for_label(addr_list: &str, label: &str) -> Option<String> {
    addr_list.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [_, found, address, ..] if *found == label => Some((*address).to_owned()),
            _ => None,
        }
    })
}

/// Sum of the `<amount><denom>` entries for `denom` in `pcli view balance`
/// output.
pub(crate) fn balance_of(view_balance: &str, denom: &str) -> BigUint {
    view_balance
        .split_whitespace()
        .filter_map(|token| token.strip_suffix(denom))
        .filter(|amount| !amount.is_empty() && amount.bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|amount| amount.parse::<BigUint>().ok())
        .sum()
}

#[cfg(test)]
mod tests {
    use num_bigint::BigUint;
    use serde_json::json;

    use super::{Allocation, address_for_label, allocations_csv, balance_of, named_validator};

    #[test]
    fn allocations_render_as_quoted_csv() {
        let csv = allocations_csv(&[
            Allocation {
                amount: "100000000000000000000000".parse().expect("big"),
                denom: "upenumbra".to_owned(),
                address: "penumbrav2t1abc".to_owned(),
            },
            Allocation {
                amount: BigUint::from(5u32),
                denom: "gm".to_owned(),
                address: "penumbrav2t1def".to_owned(),
            },
        ]);
        assert_eq!(
            csv,
            "\"amount\",\"denom\",\"address\"\n\
             \"100000000000000000000000\",\"upenumbra\",\"penumbrav2t1abc\"\n\
             \"5\",\"gm\",\"penumbrav2t1def\"\n"
        );
    }

    #[test]
    fn validator_definitions_take_the_node_name() {
        let definition =
            json!({"identity_key": "penumbravalid1x", "name": "", "sequence_number": 0});
        let named = named_validator(definition, "penumbra-1-val-0").expect("named");
        assert_eq!(named["name"], "penumbra-1-val-0");
        assert_eq!(named["identity_key"], "penumbravalid1x");
        assert!(named_validator(json!([]), "x").is_err());
    }

    #[test]
    fn addr_list_and_balances_are_parsed() {
        let list = " Index  Label      Address\n 0      validator  penumbrav2t1aaa\n 1      user       penumbrav2t1bbb\n";
        assert_eq!(address_for_label(list, "user").as_deref(), Some("penumbrav2t1bbb"));
        assert_eq!(address_for_label(list, "missing"), None);

        let balance = " Account  Amount\n 0        1000upenumbra\n 0        7gm\n 1        24upenumbra\n";
        assert_eq!(balance_of(balance, "upenumbra"), BigUint::from(1024u32));
        assert_eq!(balance_of(balance, "atom"), BigUint::default());
    }
}
