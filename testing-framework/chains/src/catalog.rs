use std::{
    collections::BTreeMap,
    fmt, fs, io,
    path::{Path, PathBuf},
};

use interchaintest_core::{chain::ChainConfig, env::HarnessEnv};

const EMBEDDED_CATALOG: &str = include_str!("../configured_chains.yaml");

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read configured chains from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse configured chains from {origin}: {source}")]
    Parse {
        origin: CatalogSource,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CatalogSource {
    Embedded,
    File(PathBuf),
}

impl fmt::Display for CatalogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embedded => f.write_str("embedded configured_chains.yaml"),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Named chain configurations that a [`crate::ChainSpec`] can refer to.
#[derive(Clone, Debug)]
pub struct ChainCatalog {
    chains: BTreeMap<String, ChainConfig>,
    source: CatalogSource,
}

impl ChainCatalog {
    /// The catalog named by `IBCTEST_CONFIGURED_CHAINS`, or the embedded one.
    pub fn load(env: &HarnessEnv) -> Result<Self, CatalogError> {
        match &env.configured_chains_path {
            Some(path) => Self::from_file(path),
            None => Self::embedded(),
        }
    }

    pub fn embedded() -> Result<Self, CatalogError> {
        Self::parse(EMBEDDED_CATALOG, CatalogSource::Embedded)
    }

    pub fn from_file(path: &Path) -> Result<Self, CatalogError> {
        let contents = fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents, CatalogSource::File(path.to_path_buf()))
    }

    pub fn parse(contents: &str, source: CatalogSource) -> Result<Self, CatalogError> {
        let chains = serde_yaml::from_str(contents).map_err(|err| CatalogError::Parse {
            origin: source.clone(),
            source: err,
        })?;
        Ok(Self { chains, source })
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ChainConfig> {
        self.chains.get(name)
    }

    /// Sorted entry names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.chains.keys().cloned().collect()
    }

    #[must_use]
    pub const fn source(&self) -> &CatalogSource {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use interchaintest_core::env::HarnessEnv;

    use super::{CatalogSource, ChainCatalog};

    #[test]
    fn embedded_catalog_parses() {
        let catalog = ChainCatalog::embedded().expect("catalog");
        assert_eq!(catalog.source(), &CatalogSource::Embedded);

        let gaia = catalog.get("gaia").expect("gaia");
        assert_eq!(gaia.chain_type, "cosmos");
        assert_eq!(gaia.bin, "gaiad");
        assert_eq!(gaia.denom, "uatom");
        assert_eq!(gaia.images[0].uid_gid, "1025:1025");
        assert!(gaia.images[0].version.is_empty());

        assert!(catalog.get("agoric").expect("agoric").no_host_mount);
        assert_eq!(catalog.get("penumbra").expect("penumbra").images.len(), 2);
        assert_eq!(catalog.get("polkadot").expect("polkadot").ss58_format, Some(49));
    }

    #[test]
    fn environment_file_replaces_embedded_catalog() {
        let mut file = tempfile::NamedTempFile::new().expect("file");
        writeln!(
            file,
            "mychain:\n  type: cosmos\n  bin: mychaind\n  denom: umy\n  images:\n    \
             - repository: example/mychain\n      uid-gid: \"1000:1000\""
        )
        .expect("write");

        let env = HarnessEnv {
            configured_chains_path: Some(file.path().to_path_buf()),
            ..HarnessEnv::default()
        };
        let catalog = ChainCatalog::load(&env).expect("catalog");

        assert_eq!(catalog.names(), vec!["mychain".to_owned()]);
        assert_eq!(catalog.source(), &CatalogSource::File(file.path().to_path_buf()));
    }

    #[test]
    fn malformed_catalog_names_its_origin() {
        let err = ChainCatalog::parse("gaia: [", CatalogSource::Embedded).expect_err("invalid");
        assert!(err.to_string().contains("embedded configured_chains.yaml"));
    }
}
