use std::{
    io,
    path::{Path, PathBuf},
    thread,
};

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::{env::keep_on_failure, substrate::sanitize_name};

/// Creates per-test scratch directories named `interchaintest-<test>-*`.
#[derive(Clone, Debug, Default)]
pub struct TempDirPolicy {
    root: Option<PathBuf>,
}

impl TempDirPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates directories under `root` instead of the system temp dir.
    #[must_use]
    pub fn in_dir(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    pub fn temp_dir(&self, test_name: &str) -> io::Result<TestTempDir> {
        let prefix = format!("interchaintest-{}-", sanitize_name(test_name));
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match &self.root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        debug!(test = test_name, path = %dir.path().display(), "created test temp dir");
        Ok(TestTempDir {
            dir: Some(dir),
            test_name: test_name.to_owned(),
            failed: false,
        })
    }
}

/// Scratch directory of one test. Removed on drop unless the test failed
/// and failed-test artifacts are retained.
#[derive(Debug)]
pub struct TestTempDir {
    dir: Option<TempDir>,
    test_name: String,
    failed: bool,
}

impl TestTempDir {
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.as_ref().map_or_else(|| Path::new(""), TempDir::path)
    }

    /// Marks the owning test as failed. A panicking thread counts as failed
    /// without this.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    /// Tears the directory down now. Returns the path when it was kept.
    pub fn finish(mut self) -> Option<PathBuf> {
        self.release()
    }

    fn release(&mut self) -> Option<PathBuf> {
        let dir = self.dir.take()?;
        let failed = self.failed || thread::panicking();
        if failed && keep_on_failure() {
            let path = dir.keep();
            warn!(
                test = %self.test_name,
                path = %path.display(),
                "keeping temp dir of failed test"
            );
            return Some(path);
        }
        if let Err(err) = dir.close() {
            warn!(test = %self.test_name, error = %err, "failed to remove test temp dir");
        }
        None
    }
}

impl Drop for TestTempDir {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::TempDirPolicy;
    use crate::env::set_keep_on_failure;

    #[test]
    fn passing_test_dir_is_removed() {
        let root = tempfile::tempdir().expect("root");
        let policy = TempDirPolicy::in_dir(root.path());
        let dir = policy.temp_dir("Test/Passing").expect("temp dir");
        let path = dir.path().to_path_buf();

        let name = path.file_name().and_then(|n| n.to_str()).expect("name");
        assert!(name.starts_with("interchaintest-Test_Passing-"), "{name}");
        assert!(path.is_dir());

        assert!(dir.finish().is_none());
        assert!(!path.exists());
    }

    #[test]
    fn failed_test_dir_is_kept_when_retention_is_on() {
        let root = tempfile::tempdir().expect("root");
        let policy = TempDirPolicy::in_dir(root.path());

        set_keep_on_failure(true);
        let mut dir = policy.temp_dir("Failing").expect("temp dir");
        std::fs::write(dir.path().join("genesis.json"), b"{}").expect("write");
        dir.mark_failed();
        let kept = dir.finish();
        set_keep_on_failure(false);

        let kept = kept.expect("kept");
        assert!(kept.join("genesis.json").is_file());
    }
}
