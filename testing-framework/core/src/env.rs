use std::{
    env,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

/// Points at an alternative configured-chains YAML file.
pub const CONFIGURED_CHAINS_ENV: &str = "IBCTEST_CONFIGURED_CHAINS";
/// Non-empty value keeps temp dirs and volumes of failed tests.
pub const SKIP_FAILURE_CLEANUP_ENV: &str = "IBCTEST_SKIP_FAILURE_CLEANUP";
/// Non-empty value skips the label sweep entirely (debugging aid).
pub const KEEP_CONTAINERS_ENV: &str = "KEEP_CONTAINERS";
pub const SLOW_TEST_ENV: &str = "SLOW_TEST_ENV";

const HARNESS_HOME_DIR: &str = ".interchaintest";

static KEEP_ON_FAILURE_OVERRIDE: AtomicBool = AtomicBool::new(false);

/// Snapshot of every environment knob the harness consults.
#[derive(Clone, Debug, Default)]
pub struct HarnessEnv {
    pub configured_chains_path: Option<PathBuf>,
    pub skip_failure_cleanup: bool,
    pub keep_containers: bool,
    pub slow_test_env: bool,
    pub home_dir: Option<PathBuf>,
}

impl HarnessEnv {
    #[must_use]
    pub fn load() -> Self {
        Self {
            configured_chains_path: non_empty(CONFIGURED_CHAINS_ENV).map(PathBuf::from),
            skip_failure_cleanup: non_empty(SKIP_FAILURE_CLEANUP_ENV).is_some(),
            keep_containers: non_empty(KEEP_CONTAINERS_ENV).is_some(),
            slow_test_env: env::var(SLOW_TEST_ENV).is_ok_and(|s| s == "true"),
            home_dir: env::var_os("HOME").map(PathBuf::from),
        }
    }

    /// `~/.interchaintest`, falling back to the temp dir when `HOME` is unset.
    #[must_use]
    pub fn harness_home(&self) -> PathBuf {
        self.home_dir
            .clone()
            .unwrap_or_else(env::temp_dir)
            .join(HARNESS_HOME_DIR)
    }

    #[must_use]
    pub fn default_block_database_path(&self) -> PathBuf {
        self.harness_home().join("databases").join("block.db")
    }

    #[must_use]
    pub fn default_log_path(&self, name: &str) -> PathBuf {
        self.harness_home().join("logs").join(name)
    }
}

/// Whether artifacts of a failed test should stay on disk. Read at teardown so
/// a late in-process override or environment change is honoured.
#[must_use]
pub fn keep_on_failure() -> bool {
    KEEP_ON_FAILURE_OVERRIDE.load(Ordering::SeqCst) || HarnessEnv::load().skip_failure_cleanup
}

/// In-process equivalent of setting `IBCTEST_SKIP_FAILURE_CLEANUP`.
pub fn set_keep_on_failure(keep: bool) {
    KEEP_ON_FAILURE_OVERRIDE.store(keep, Ordering::SeqCst);
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

pub(crate) fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::HarnessEnv;

    #[test]
    fn default_paths_live_under_harness_home() {
        let env = HarnessEnv {
            home_dir: Some(PathBuf::from("/home/tester")),
            ..HarnessEnv::default()
        };

        assert_eq!(
            env.default_block_database_path(),
            PathBuf::from("/home/tester/.interchaintest/databases/block.db")
        );
        assert_eq!(
            env.default_log_path("TestTransfer"),
            PathBuf::from("/home/tester/.interchaintest/logs/TestTransfer")
        );
    }
}
