use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One line of the report stream: `{"Type": <name>, "Message": {...}}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "Type", content = "Message")]
pub enum Message {
    BeginSuite(BeginSuite),
    FinishSuite(FinishSuite),
    BeginTest(BeginTest),
    FinishTest(FinishTest),
    PauseTest(TestTimestamp),
    ContinueTest(TestTimestamp),
    TestError(TestNote),
    TestSkip(TestNote),
    RelayerExec(RelayerExecMessage),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BeginSuite {
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FinishSuite {
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BeginTest {
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FinishTest {
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub failed: bool,
    pub skipped: bool,
}

/// Body of `PauseTest` and `ContinueTest`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestTimestamp {
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub when: OffsetDateTime,
}

/// Body of `TestError` and `TestSkip`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestNote {
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub when: OffsetDateTime,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RelayerExecMessage {
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub container_name: String,
    pub command: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::{FinishTest, Message, RelayerExecMessage};

    #[test]
    fn wrapped_messages_decode_back() {
        let messages = [
            Message::FinishTest(FinishTest {
                name: "TestLink".to_owned(),
                finished_at: datetime!(2024-03-01 12:00:00 UTC),
                failed: true,
                skipped: false,
            }),
            Message::RelayerExec(RelayerExecMessage {
                name: "TestLink".to_owned(),
                started_at: datetime!(2024-03-01 12:00:00 UTC),
                finished_at: datetime!(2024-03-01 12:00:01 UTC),
                container_name: "rly-abc".to_owned(),
                command: vec!["rly".to_owned(), "tx".to_owned(), "link".to_owned()],
                stdout: String::new(),
                stderr: "boom".to_owned(),
                exit_code: 1,
                error: None,
            }),
        ];

        for message in messages {
            let line = serde_json::to_string(&message).expect("encode");
            let decoded: Message = serde_json::from_str(&line).expect("decode");
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn wire_shape_uses_type_and_message_keys() {
        let line = serde_json::to_value(Message::FinishTest(FinishTest {
            name: "T".to_owned(),
            finished_at: datetime!(2024-03-01 12:00:00 UTC),
            failed: false,
            skipped: true,
        }))
        .expect("encode");
        assert_eq!(line["Type"], "FinishTest");
        assert_eq!(line["Message"]["Skipped"], true);
        assert_eq!(line["Message"]["FinishedAt"], "2024-03-01T12:00:00Z");
    }

    #[test]
    fn unknown_types_fail_to_decode() {
        let result = serde_json::from_str::<Message>(r#"{"Type":"Bogus","Message":{}}"#);
        assert!(result.is_err());
    }
}
