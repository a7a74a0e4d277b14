use rand::{Rng as _, distributions::Alphanumeric};

use super::engine::{LabelFilter, Labels};

/// Carried by every resource the harness creates; the value is the test name.
pub const CLEANUP_LABEL: &str = "ibc-test";
/// Names the chain or relayer node that owns a container.
pub const NODE_OWNER_LABEL: &str = "ventures.strangelove.interchaintest.node-owner";

#[must_use]
pub fn cleanup_labels(test_name: &str) -> Labels {
    Labels::from([(CLEANUP_LABEL.to_owned(), test_name.to_owned())])
}

#[must_use]
pub fn node_labels(test_name: &str, owner: &str) -> Labels {
    let mut labels = cleanup_labels(test_name);
    labels.insert(NODE_OWNER_LABEL.to_owned(), owner.to_owned());
    labels
}

#[must_use]
pub fn cleanup_filter(test_name: &str) -> LabelFilter {
    LabelFilter::new(CLEANUP_LABEL, test_name)
}

/// Container and volume names must be DNS-ish: keep `[A-Za-z0-9_.-]`.
#[must_use]
pub fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Hostnames over 63 characters keep their first and last 30 characters,
/// joined by `_._`.
#[must_use]
pub fn condense_hostname(name: &str) -> String {
    const KEEP: usize = 30;
    if name.len() < 64 || !name.is_ascii() {
        return name.to_owned();
    }
    format!("{}_._{}", &name[..KEEP], &name[name.len() - KEEP..])
}

/// Lowercase alphanumeric suffix for job containers and networks.
#[must_use]
pub fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_hostnames_are_condensed() {
        assert_eq!(condense_hostname("gaia-1-val-0-Test"), "gaia-1-val-0-Test");
        let long = format!("gaia-1-val-0-{}", "a".repeat(70));
        let short = condense_hostname(&long);
        assert_eq!(short.len(), 63);
        assert!(short.starts_with("gaia-1-val-0-"));
        assert!(short.contains("_._"));
    }

    #[test]
    fn node_labels_extend_cleanup_labels() {
        let labels = node_labels("TestTransfer", "gaia-1-val-0-TestTransfer");
        assert_eq!(labels.get(CLEANUP_LABEL).map(String::as_str), Some("TestTransfer"));
        assert_eq!(
            labels.get(NODE_OWNER_LABEL).map(String::as_str),
            Some("gaia-1-val-0-TestTransfer")
        );
        assert!(cleanup_filter("TestTransfer").matches(&labels));
        assert!(!cleanup_filter("TestOther").matches(&labels));
    }

    #[test]
    fn sanitize_replaces_path_separators() {
        assert_eq!(sanitize_name("TestChains/gaia v7"), "TestChains_gaia_v7");
    }
}
