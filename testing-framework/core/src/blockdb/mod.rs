//! SQLite record of the blocks and transactions each chain produced during a
//! test.

mod collector;
mod migrate;
mod query;
mod test_case;

use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use rusqlite::Connection;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

pub use collector::Collector;
pub use query::{CosmosMessageResult, TestCaseResult, TxResult};
pub use test_case::{ChainRecord, TestCase};

#[derive(Debug, thiserror::Error)]
pub enum BlockDbError {
    #[error("failed to open block database {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to create directory for {path}: {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("migration step {step} failed: {source}")]
    Migration {
        step: &'static str,
        #[source]
        source: rusqlite::Error,
    },
    #[error("{context}: {source}")]
    Query {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },
    #[error("block database connection is poisoned")]
    Poisoned,
}

impl BlockDbError {
    pub(crate) fn query(context: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| Self::Query { context, source }
    }
}

pub(crate) fn now_rfc3339() -> String {
    // Formatting a UTC timestamp with a well-known format cannot fail.
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// Shared handle to one migrated database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Opens (creating parent directories) and migrates the database at `path`.
    pub fn open(path: impl AsRef<Path>, git_sha: &str) -> Result<Self, BlockDbError> {
        let path = path.as_ref();
        crate::env::ensure_parent(path).map_err(|source| BlockDbError::Directory {
            path: path.display().to_string(),
            source,
        })?;
        let conn = Connection::open(path).map_err(|source| BlockDbError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Self::migrated(conn, git_sha)
    }

    pub fn open_in_memory(git_sha: &str) -> Result<Self, BlockDbError> {
        let conn = Connection::open_in_memory().map_err(|source| BlockDbError::Open {
            path: ":memory:".to_owned(),
            source,
        })?;
        Self::migrated(conn, git_sha)
    }

    fn migrated(mut conn: Connection, git_sha: &str) -> Result<Self, BlockDbError> {
        migrate::migrate(&mut conn, git_sha)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, BlockDbError> {
        self.conn.lock().map_err(|_| BlockDbError::Poisoned)
    }

    /// Re-runs the migration, e.g. under a new git sha.
    pub fn migrate(&self, git_sha: &str) -> Result<(), BlockDbError> {
        migrate::migrate(&mut *self.lock()?, git_sha)
    }

    /// Records a test run started now.
    pub fn create_test_case(&self, name: &str, git_sha: &str) -> Result<TestCase, BlockDbError> {
        TestCase::create(self.clone(), name, git_sha)
    }
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use super::{Database, migrate};

    #[test]
    fn migration_is_idempotent() {
        let db = Database::open_in_memory("abc123").expect("migrate");
        db.migrate("abc123").expect("same sha again");
        db.migrate("def456").expect("new sha");

        let count: i64 = db
            .lock()
            .expect("lock")
            .query_row("SELECT count(*) FROM schema_version", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 2);
    }

    #[test]
    fn empty_git_sha_is_rejected() {
        let mut conn = Connection::open_in_memory().expect("open");
        assert!(migrate::migrate(&mut conn, "").is_err());
    }

    #[test]
    fn file_database_creates_parent_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("databases").join("block.db");
        Database::open(&path, "abc123").expect("open");
        assert!(path.exists());
    }
}
