use rusqlite::params;
use serde::Serialize;

use super::{BlockDbError, Database};

/// One chain of a recent test case, aggregated from `v_tx_agg`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TestCaseResult {
    pub id: i64,
    pub name: String,
    pub git_sha: String,
    pub created_at: String,
    pub chain_kid: Option<i64>,
    pub chain_id: Option<String>,
    pub chain_type: Option<String>,
    pub chain_height: i64,
    pub tx_total: i64,
}

/// One message of a Cosmos transaction, from `v_cosmos_messages`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CosmosMessageResult {
    pub height: i64,
    pub index: i64,
    pub msg_type: String,
    pub client_chain_id: Option<String>,
    pub client_id: Option<String>,
    pub counterparty_client_id: Option<String>,
    pub connection_id: Option<String>,
    pub counterparty_connection_id: Option<String>,
    pub port_id: Option<String>,
    pub counterparty_port_id: Option<String>,
    pub channel_id: Option<String>,
    pub counterparty_channel_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TxResult {
    pub height: i64,
    pub tx: String,
}

impl Database {
    /// Newest test cases first, one row per chain.
    pub fn recent_test_cases(&self, limit: usize) -> Result<Vec<TestCaseResult>, BlockDbError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT test_case_id, test_case_name, test_case_git_sha, test_case_created_at,
    chain_kid, chain_id, chain_type, chain_height, tx_total
FROM v_tx_agg
ORDER BY test_case_id DESC, chain_kid ASC
LIMIT ?1",
            )
            .map_err(BlockDbError::query("prepare recent test cases"))?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(TestCaseResult {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    git_sha: row.get(2)?,
                    created_at: row.get(3)?,
                    chain_kid: row.get(4)?,
                    chain_id: row.get(5)?,
                    chain_type: row.get(6)?,
                    chain_height: row.get(7)?,
                    tx_total: row.get(8)?,
                })
            })
            .map_err(BlockDbError::query("query recent test cases"))?;
        rows.collect::<Result<_, _>>()
            .map_err(BlockDbError::query("read recent test cases"))
    }

    /// Messages of every transaction recorded for a chain row, in block order.
    pub fn cosmos_messages(
        &self,
        chain_kid: i64,
    ) -> Result<Vec<CosmosMessageResult>, BlockDbError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT block_height, msg_n, type,
    client_chain_id, client_id, counterparty_client_id,
    conn_id, counterparty_conn_id,
    port_id, counterparty_port_id,
    channel_id, counterparty_channel_id
FROM v_cosmos_messages
WHERE chain_kid = ?1
ORDER BY block_height ASC, tx_id ASC, msg_n ASC",
            )
            .map_err(BlockDbError::query("prepare cosmos messages"))?;
        let rows = stmt
            .query_map(params![chain_kid], |row| {
                Ok(CosmosMessageResult {
                    height: row.get(0)?,
                    index: row.get(1)?,
                    msg_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    client_chain_id: row.get(3)?,
                    client_id: row.get(4)?,
                    counterparty_client_id: row.get(5)?,
                    connection_id: row.get(6)?,
                    counterparty_connection_id: row.get(7)?,
                    port_id: row.get(8)?,
                    counterparty_port_id: row.get(9)?,
                    channel_id: row.get(10)?,
                    counterparty_channel_id: row.get(11)?,
                })
            })
            .map_err(BlockDbError::query("query cosmos messages"))?;
        rows.collect::<Result<_, _>>()
            .map_err(BlockDbError::query("read cosmos messages"))
    }

    pub fn txs(&self, chain_kid: i64) -> Result<Vec<TxResult>, BlockDbError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT block_height, tx FROM v_tx_flattened
WHERE chain_kid = ?1
ORDER BY block_height ASC, tx_id ASC",
            )
            .map_err(BlockDbError::query("prepare txs"))?;
        let rows = stmt
            .query_map(params![chain_kid], |row| {
                Ok(TxResult {
                    height: row.get(0)?,
                    tx: row.get(1)?,
                })
            })
            .map_err(BlockDbError::query("query txs"))?;
        rows.collect::<Result<_, _>>()
            .map_err(BlockDbError::query("read txs"))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::{blockdb::Database, chain::BlockTx};

    fn json_tx(value: &serde_json::Value) -> BlockTx {
        BlockTx {
            data: serde_json::to_vec(value).expect("json"),
            events: Vec::new(),
        }
    }

    #[test]
    fn views_expose_ibc_message_fields() {
        let db = Database::open_in_memory("abc123").expect("db");
        let tc = db.create_test_case("mytest", "abc123").expect("test case");
        let chain = tc.add_chain("chain1", "cosmos").expect("chain");

        chain
            .save_block(
                3,
                &[json_tx(&json!({"body": {"messages": [
                    {
                        "@type": "/ibc.applications.transfer.v1.MsgTransfer",
                        "source_port": "transfer",
                        "source_channel": "channel-0"
                    },
                    {
                        "@type": "/ibc.core.channel.v1.MsgChannelOpenTry",
                        "port_id": "transfer",
                        "channel": {"counterparty": {"port_id": "transfer", "channel_id": "channel-7"}}
                    }
                ]}}))],
            )
            .expect("save");

        let messages = db.cosmos_messages(chain.id()).expect("messages");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].height, 3);
        assert_eq!(messages[0].msg_type, "/ibc.applications.transfer.v1.MsgTransfer");
        assert_eq!(messages[0].port_id.as_deref(), Some("transfer"));
        assert_eq!(messages[0].channel_id.as_deref(), Some("channel-0"));
        assert_eq!(messages[1].index, 1);
        assert_eq!(messages[1].counterparty_channel_id.as_deref(), Some("channel-7"));

        let txs = db.txs(chain.id()).expect("txs");
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].height, 3);
    }

    #[test]
    fn recent_test_cases_aggregate_per_chain() {
        let db = Database::open_in_memory("abc123").expect("db");
        let tc = db.create_test_case("mytest", "abc123").expect("test case");
        let gaia = tc.add_chain("gaia-1", "cosmos").expect("chain");
        tc.add_chain("osmosis-1", "cosmos").expect("chain");

        gaia.save_block(1, &[json_tx(&json!({"a": 1}))]).expect("save");
        gaia.save_block(2, &[json_tx(&json!({"b": 2})), json_tx(&json!({"c": 3}))])
            .expect("save");

        let cases = db.recent_test_cases(10).expect("cases");
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].chain_id.as_deref(), Some("gaia-1"));
        assert_eq!(cases[0].chain_height, 2);
        assert_eq!(cases[0].tx_total, 3);
        assert_eq!(cases[1].chain_height, 0);
        assert_eq!(cases[1].tx_total, 0);
    }
}
