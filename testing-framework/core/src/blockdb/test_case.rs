use rusqlite::{OptionalExtension as _, params};

use super::{BlockDbError, Database, now_rfc3339};
use crate::chain::BlockTx;

/// A `test_case` row.
#[derive(Clone, Debug)]
pub struct TestCase {
    db: Database,
    id: i64,
}

impl TestCase {
    pub(super) fn create(db: Database, name: &str, git_sha: &str) -> Result<Self, BlockDbError> {
        let id = db
            .lock()?
            .query_row(
                "INSERT INTO test_case(name, created_at, git_sha) VALUES (?1, ?2, ?3) RETURNING id",
                params![name, now_rfc3339(), git_sha],
                |row| row.get(0),
            )
            .map_err(BlockDbError::query("insert test_case"))?;
        Ok(Self { db, id })
    }

    #[must_use]
    pub const fn id(&self) -> i64 {
        self.id
    }

    /// Adds a chain to the test case. A chain id may appear once per test case.
    pub fn add_chain(&self, chain_id: &str, chain_type: &str) -> Result<ChainRecord, BlockDbError> {
        let id = self
            .db
            .lock()?
            .query_row(
                "INSERT INTO chain(chain_id, chain_type, fk_test_id) VALUES (?1, ?2, ?3) RETURNING id",
                params![chain_id, chain_type, self.id],
                |row| row.get(0),
            )
            .map_err(BlockDbError::query("insert chain"))?;
        Ok(ChainRecord {
            db: self.db.clone(),
            id,
        })
    }
}

/// A `chain` row blocks are saved under.
#[derive(Clone, Debug)]
pub struct ChainRecord {
    db: Database,
    id: i64,
}

impl ChainRecord {
    /// Primary key of the row, used by the query API.
    #[must_use]
    pub const fn id(&self) -> i64 {
        self.id
    }

    /// Saves a block with its transactions and their events. Saving a height
    /// twice keeps the first copy.
    pub fn save_block(&self, height: u64, txs: &[BlockTx]) -> Result<(), BlockDbError> {
        let mut conn = self.db.lock()?;
        let tx = conn
            .transaction()
            .map_err(BlockDbError::query("begin save block"))?;

        let block_id: Option<i64> = tx
            .query_row(
                "INSERT INTO block(height, fk_chain_id, created_at) VALUES (?1, ?2, ?3)
ON CONFLICT(height, fk_chain_id) DO NOTHING RETURNING id",
                params![height, self.id, now_rfc3339()],
                |row| row.get(0),
            )
            .optional()
            .map_err(BlockDbError::query("insert block"))?;
        let Some(block_id) = block_id else {
            return Ok(());
        };

        for block_tx in txs {
            let tx_id: i64 = tx
                .query_row(
                    "INSERT INTO tx(data, fk_block_id) VALUES (?1, ?2) RETURNING id",
                    params![indented(&block_tx.data), block_id],
                    |row| row.get(0),
                )
                .map_err(BlockDbError::query("insert tx"))?;

            for event in &block_tx.events {
                let event_id: i64 = tx
                    .query_row(
                        "INSERT INTO tendermint_event(type, fk_tx_id) VALUES (?1, ?2) RETURNING id",
                        params![event.kind, tx_id],
                        |row| row.get(0),
                    )
                    .map_err(BlockDbError::query("insert tendermint_event"))?;
                for attr in &event.attributes {
                    tx.execute(
                        "INSERT INTO tendermint_event_attr(key, value, fk_event_id) VALUES (?1, ?2, ?3)",
                        params![attr.key, attr.value, event_id],
                    )
                    .map_err(BlockDbError::query("insert tendermint_event_attr"))?;
                }
            }
        }

        tx.commit().map_err(BlockDbError::query("commit save block"))
    }
}

/// JSON is stored indented for readability; anything else as text.
fn indented(data: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(data)
        .ok()
        .and_then(|value| serde_json::to_string_pretty(&value).ok())
        .unwrap_or_else(|| String::from_utf8_lossy(data).into_owned())
}
