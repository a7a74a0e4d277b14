use rusqlite::{Connection, params};

use super::{BlockDbError, now_rfc3339};

const TABLES: &[(&str, &str)] = &[
    (
        "test_case",
        "CREATE TABLE IF NOT EXISTS test_case (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL CHECK (length(name) > 0),
    git_sha TEXT NOT NULL CHECK (length(git_sha) > 0),
    created_at TEXT NOT NULL CHECK (length(created_at) > 0),
    UNIQUE(name, created_at)
)",
    ),
    (
        "chain",
        "CREATE TABLE IF NOT EXISTS chain (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    chain_id TEXT NOT NULL CHECK (length(chain_id) > 0),
    fk_test_id INTEGER,
    FOREIGN KEY(fk_test_id) REFERENCES test_case(id) ON DELETE CASCADE,
    UNIQUE(chain_id, fk_test_id)
)",
    ),
    (
        "block",
        "CREATE TABLE IF NOT EXISTS block (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    height INTEGER NOT NULL CHECK (height > 0),
    fk_chain_id INTEGER,
    created_at TEXT NOT NULL CHECK (length(created_at) > 0),
    FOREIGN KEY(fk_chain_id) REFERENCES chain(id) ON DELETE CASCADE,
    UNIQUE(height, fk_chain_id)
)",
    ),
    (
        "tx",
        "CREATE TABLE IF NOT EXISTS tx (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    data TEXT NOT NULL CHECK (length(data) > 0),
    fk_block_id INTEGER,
    FOREIGN KEY(fk_block_id) REFERENCES block(id) ON DELETE CASCADE
)",
    ),
];

const ADD_CHAIN_TYPE: &str = "ALTER TABLE chain ADD COLUMN chain_type TEXT NOT NULL \
     CHECK (length(chain_type) > 0) DEFAULT 'unknown'";

const EVENT_TABLES: &[(&str, &str)] = &[
    (
        "tendermint_event",
        "CREATE TABLE IF NOT EXISTS tendermint_event (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    type TEXT NOT NULL CHECK (length(type) > 0),
    fk_tx_id INTEGER,
    FOREIGN KEY(fk_tx_id) REFERENCES tx(id) ON DELETE CASCADE
)",
    ),
    (
        "tendermint_event_attr",
        "CREATE TABLE IF NOT EXISTS tendermint_event_attr (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL CHECK (length(key) > 0),
    value TEXT NOT NULL,
    fk_event_id INTEGER,
    FOREIGN KEY(fk_event_id) REFERENCES tendermint_event(id) ON DELETE CASCADE
)",
    ),
];

const V_TX_FLATTENED: &str = "CREATE VIEW v_tx_flattened AS
SELECT
  test_case.id AS test_case_id
  , test_case.created_at AS test_case_created_at
  , test_case.name AS test_case_name
  , chain.id AS chain_kid
  , chain.chain_id AS chain_id
  , chain.chain_type AS chain_type
  , block.id AS block_id
  , block.created_at AS block_created_at
  , block.height AS block_height
  , tx.id AS tx_id
  , tx.data AS tx
FROM tx
LEFT JOIN block ON tx.fk_block_id = block.id
LEFT JOIN chain ON block.fk_chain_id = chain.id
LEFT JOIN test_case ON chain.fk_test_id = test_case.id";

// Message shapes differ per IBC message; COALESCE picks whichever field the
// message carries.
const V_COSMOS_MESSAGES: &str = "CREATE VIEW v_cosmos_messages AS
SELECT
  test_case_id
  , test_case_name
  , chain_kid
  , chain_id
  , block_id
  , block_height
  , tx_id
  , key AS msg_n
  , json_extract(value, '$.@type') AS type
  , json_extract(value, '$.client_state.chain_id') AS client_chain_id
  , json_extract(value, '$.client_id') AS client_id
  , json_extract(value, '$.counterparty.client_id') AS counterparty_client_id
  , json_extract(value, '$.connection_id') AS conn_id
  , COALESCE(
      json_extract(value, '$.counterparty_connection_id'),
      json_extract(value, '$.counterparty.connection_id')
    ) AS counterparty_conn_id
  , COALESCE(
      json_extract(value, '$.port_id'),
      json_extract(value, '$.source_port'),
      json_extract(value, '$.packet.source_port')
    ) AS port_id
  , COALESCE(
      json_extract(value, '$.channel.counterparty.port_id'),
      json_extract(value, '$.packet.destination_port')
    ) AS counterparty_port_id
  , COALESCE(
      json_extract(value, '$.channel_id'),
      json_extract(value, '$.source_channel'),
      json_extract(value, '$.packet.source_channel')
    ) AS channel_id
  , COALESCE(
      json_extract(value, '$.counterparty_channel_id'),
      json_extract(value, '$.channel.counterparty.channel_id'),
      json_extract(value, '$.packet.destination_channel')
    ) AS counterparty_channel_id
  , value AS raw
FROM v_tx_flattened, json_each(v_tx_flattened.tx, '$.body.messages')";

const V_TX_AGG: &str = "CREATE VIEW v_tx_agg AS
SELECT
  test_case.id AS test_case_id
  , test_case.created_at AS test_case_created_at
  , test_case.name AS test_case_name
  , test_case.git_sha AS test_case_git_sha
  , chain.id AS chain_kid
  , chain.chain_id AS chain_id
  , chain.chain_type AS chain_type
  , MAX(COALESCE(block.height, 0)) AS chain_height
  , COUNT(tx.data) AS tx_total
FROM test_case
LEFT JOIN chain ON chain.fk_test_id = test_case.id
LEFT JOIN block ON block.fk_chain_id = chain.id
LEFT JOIN tx ON tx.fk_block_id = block.id
GROUP BY test_case.id, chain.id";

const VIEWS: &[(&str, &str)] = &[
    ("v_tx_flattened", V_TX_FLATTENED),
    ("v_cosmos_messages", V_COSMOS_MESSAGES),
    ("v_tx_agg", V_TX_AGG),
];

fn step(step: &'static str) -> impl FnOnce(rusqlite::Error) -> BlockDbError {
    move |source| BlockDbError::Migration { step, source }
}

pub(super) fn set_pragmas(conn: &Connection) -> Result<(), BlockDbError> {
    conn.busy_timeout(std::time::Duration::from_millis(4000))
        .map_err(step("pragma busy_timeout"))?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(step("pragma journal_mode"))?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(step("pragma foreign_keys"))
}

/// Creates or upgrades the schema in one transaction. Safe to run on every
/// open.
pub(super) fn migrate(conn: &mut Connection, git_sha: &str) -> Result<(), BlockDbError> {
    set_pragmas(conn)?;
    let tx = conn.transaction().map_err(step("begin"))?;

    tx.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    created_at TEXT NOT NULL CHECK (length(created_at) > 0),
    git_sha TEXT NOT NULL CHECK (length(git_sha) > 0),
    UNIQUE(git_sha)
)",
        [],
    )
    .map_err(step("create table schema_version"))?;
    tx.execute(
        "INSERT INTO schema_version(created_at, git_sha) VALUES (?1, ?2)
ON CONFLICT(git_sha) DO UPDATE SET git_sha = git_sha",
        params![now_rfc3339(), git_sha],
    )
    .map_err(step("upsert schema_version"))?;

    for &(name, sql) in TABLES {
        tx.execute(sql, []).map_err(step(name))?;
    }
    match tx.execute(ADD_CHAIN_TYPE, []) {
        Ok(_) => {}
        Err(err) if err.to_string().contains("duplicate column name: chain_type") => {}
        Err(err) => return Err(step("alter table chain add chain_type")(err)),
    }
    for &(name, sql) in EVENT_TABLES {
        tx.execute(sql, []).map_err(step(name))?;
    }

    // Views go last so they see every column added above.
    for &(name, sql) in VIEWS {
        tx.execute(&format!("DROP VIEW IF EXISTS {name}"), [])
            .map_err(step("drop view"))?;
        tx.execute(sql, []).map_err(step(name))?;
    }

    tx.commit().map_err(step("commit"))
}
