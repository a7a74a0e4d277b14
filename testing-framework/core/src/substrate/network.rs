use std::collections::BTreeSet;

use rand::Rng as _;
use tracing::info;

use super::{
    engine::{ContainerEngine, EngineError},
    labels::{cleanup_labels, random_suffix},
};

/// Test network created for one run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestNetwork {
    pub id: String,
    pub name: String,
    pub subnet: String,
}

/// Creates `interchaintest-<random>` on a `/24` under a random `172.X.0.0/16`
/// that does not clash with an existing network.
pub async fn create_network(
    engine: &dyn ContainerEngine,
    test_name: &str,
) -> Result<TestNetwork, EngineError> {
    let taken: BTreeSet<String> = engine
        .list_networks()
        .await?
        .into_iter()
        .flat_map(|network| network.subnets)
        .collect();

    let subnet = pick_subnet(&taken).ok_or_else(|| EngineError::Parse {
        context: "network subnets".to_owned(),
        message: "no free 172.x.y.0/24 subnet left".to_owned(),
    })?;
    let name = format!("interchaintest-{}", random_suffix(8));
    let id = engine
        .create_network(&name, &subnet, &cleanup_labels(test_name))
        .await?;

    info!(network = %name, %subnet, test = test_name, "created test network");
    Ok(TestNetwork { id, name, subnet })
}

fn pick_subnet(taken: &BTreeSet<String>) -> Option<String> {
    let mut rng = rand::thread_rng();
    // 172.16.0.0/12 spans second octets 16..=31.
    let base: u8 = rng.gen_range(16..=31);
    let offset: u8 = rng.gen();
    (0..=u8::MAX)
        .map(|i| offset.wrapping_add(i))
        .map(|third| format!("172.{base}.{third}.0/24"))
        .find(|candidate| !clashes(candidate, taken))
}

fn clashes(candidate: &str, taken: &BTreeSet<String>) -> bool {
    let prefix = candidate.trim_end_matches("0/24");
    taken.iter().any(|subnet| {
        subnet == candidate
            || subnet.starts_with(prefix)
            || covering_sixteen(subnet).is_some_and(|p| candidate.starts_with(&p))
    })
}

/// `172.18.0.0/16` covers every `172.18.*`.
fn covering_sixteen(subnet: &str) -> Option<String> {
    let base = subnet.strip_suffix(".0.0/16")?;
    Some(format!("{base}."))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::{clashes, create_network, pick_subnet};
    use crate::{
        substrate::{CLEANUP_LABEL, ContainerEngine as _},
        testing::FakeEngine,
    };

    #[test]
    fn overlapping_subnets_clash() {
        let taken = BTreeSet::from(["172.18.0.0/16".to_owned(), "172.20.4.0/24".to_owned()]);
        assert!(clashes("172.18.9.0/24", &taken));
        assert!(clashes("172.20.4.0/24", &taken));
        assert!(!clashes("172.20.5.0/24", &taken));
    }

    #[test]
    fn picked_subnet_avoids_taken_ones() {
        let taken = BTreeSet::from(["172.17.0.0/16".to_owned()]);
        for _ in 0..32 {
            let subnet = pick_subnet(&taken).expect("free subnet");
            assert!(!subnet.starts_with("172.17."));
            assert!(subnet.ends_with(".0/24"));
        }
    }

    #[tokio::test]
    async fn network_is_labelled_with_the_test_name() {
        let engine = FakeEngine::new();
        let network = create_network(&engine, "TestNetwork").await.expect("network");

        assert!(network.name.starts_with("interchaintest-"));
        let listed = engine.list_networks().await.expect("list");
        let created = listed
            .iter()
            .find(|n| n.id == network.id)
            .expect("network listed");
        assert_eq!(
            created.labels.get(CLEANUP_LABEL).map(String::as_str),
            Some("TestNetwork")
        );
        assert_eq!(created.subnets, vec![network.subnet]);
    }
}
