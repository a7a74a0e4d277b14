//! Relayer drivers. Every family runs its CLI in job containers over one
//! relayer volume; see [`DockerRelayer`] and [`RelayerCommander`].

pub mod docker;
pub mod hermes;
pub mod hyperspace;
pub mod rly;

use std::{fmt, sync::Arc};

use interchaintest_core::{Relayer, RelayerError, chain::ChainEnvironment};

pub use docker::{DockerRelayer, RELAYER_HOME, RelayerCommander, RelayerJobs, RelayerOptions};
pub use hermes::Hermes;
pub use hyperspace::Hyperspace;
pub use rly::Rly;

pub type RlyRelayer = DockerRelayer<Rly>;
pub type HermesRelayer = DockerRelayer<Hermes>;
pub type HyperspaceRelayer = DockerRelayer<Hyperspace>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayerKind {
    Rly,
    Hermes,
    /// Relays from a parachain with the given id.
    Hyperspace { para_id: u32 },
}

impl RelayerKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rly => "rly",
            Self::Hermes => "hermes",
            Self::Hyperspace { .. } => "hyperspace",
        }
    }
}

impl fmt::Display for RelayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds one relayer of a family per test.
#[derive(Clone, Debug)]
pub struct RelayerFactory {
    kind: RelayerKind,
    options: RelayerOptions,
}

impl RelayerFactory {
    #[must_use]
    pub fn new(kind: RelayerKind) -> Self {
        Self {
            kind,
            options: RelayerOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: RelayerOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub const fn kind(&self) -> RelayerKind {
        self.kind
    }

    /// Family name, plus the image when one is pinned.
    #[must_use]
    pub fn name(&self) -> String {
        match &self.options.image {
            Some(image) => format!("{}@{}", self.kind, image.version),
            None => self.kind.to_string(),
        }
    }

    pub async fn build(&self, env: &ChainEnvironment) -> Result<Arc<dyn Relayer>, RelayerError> {
        let options = self.options.clone();
        let relayer: Arc<dyn Relayer> = match self.kind {
            RelayerKind::Rly => Arc::new(DockerRelayer::new(env, Rly, options).await?),
            RelayerKind::Hermes => Arc::new(DockerRelayer::new(env, Hermes::new(), options).await?),
            RelayerKind::Hyperspace { para_id } => {
                Arc::new(DockerRelayer::new(env, Hyperspace::new(para_id), options).await?)
            }
        };
        Ok(relayer)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use interchaintest_core::{chain::DockerImage, relayer::Capability, testing::FakeEngine};

    use super::{RelayerFactory, RelayerKind, RelayerOptions};
    use crate::docker::tests::environment;

    #[test]
    fn names_include_pinned_versions() {
        assert_eq!(RelayerFactory::new(RelayerKind::Rly).name(), "rly");
        let pinned = RelayerFactory::new(RelayerKind::Hermes).with_options(RelayerOptions {
            image: Some(DockerImage::new("ghcr.io/informalsystems/hermes", "1.8.0", "1000:1000")),
            ..RelayerOptions::default()
        });
        assert_eq!(pinned.name(), "hermes@1.8.0");
    }

    #[tokio::test]
    async fn builds_each_family_with_its_capabilities() {
        let engine = Arc::new(FakeEngine::new());
        let env = environment(&engine, "TestFactory");

        let mut flush = Vec::new();
        for kind in [
            RelayerKind::Rly,
            RelayerKind::Hermes,
            RelayerKind::Hyperspace { para_id: 2000 },
        ] {
            let relayer = RelayerFactory::new(kind).build(&env).await.expect("relayer");
            assert!(relayer.use_docker_network());
            flush.push(relayer.capabilities()[&Capability::Flush]);
        }
        assert_eq!(flush, [true, true, false]);
        assert_eq!(engine.volume_count(), 3);
    }
}
