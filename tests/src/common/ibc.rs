use sha2::{Digest as _, Sha256};

/// Denom a token of `base_denom` takes after crossing `port_id/channel_id`
/// into the receiving chain.
#[must_use]
pub fn ibc_denom(port_id: &str, channel_id: &str, base_denom: &str) -> String {
    let trace = format!("{port_id}/{channel_id}/{base_denom}");
    format!("ibc/{}", hex::encode_upper(Sha256::digest(trace.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::ibc_denom;

    #[test]
    fn hashes_the_full_trace() {
        assert_eq!(
            ibc_denom("transfer", "channel-0", "uatom"),
            "ibc/27394FB092D2ECCD56123C74F36E4C1F926001CEADA9CA97EA622B25F41E5EB2"
        );
    }
}
