use serde::{Deserialize, Serialize};

/// An IBC packet as seen in chain events.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub sequence: u64,
    pub source_port: String,
    pub source_channel: String,
    pub dest_port: String,
    pub dest_channel: String,
    pub data: Vec<u8>,
    /// `revision-height`, e.g. `0-1234`; empty when the packet has no height
    /// timeout.
    pub timeout_height: String,
    /// Nanoseconds since the unix epoch, 0 when unset.
    pub timeout_timestamp: u64,
}

impl Packet {
    /// Collects every problem with the packet instead of stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();
        if self.sequence == 0 {
            problems.push("packet sequence cannot be 0".to_owned());
        }
        for (value, name) in [
            (&self.source_port, "source port"),
            (&self.source_channel, "source channel"),
            (&self.dest_port, "destination port"),
            (&self.dest_channel, "destination channel"),
        ] {
            if value.is_empty() {
                problems.push(format!("packet {name} missing"));
            }
        }
        if self.data.is_empty() {
            problems.push("packet data cannot be empty".to_owned());
        }
        if self.timeout_height.is_empty() && self.timeout_timestamp == 0 {
            problems
                .push("packet timeout height and timeout timestamp cannot both be 0".to_owned());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketAcknowledgement {
    pub packet: Packet,
    pub acknowledgement: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketTimeout {
    pub packet: Packet,
}

/// A confirmed transaction carrying an IBC packet.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tx {
    pub height: u64,
    pub tx_hash: String,
    pub gas_spent: i64,
    pub packet: Packet,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IbcTimeout {
    pub nanoseconds: u64,
    pub height: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOptions {
    pub timeout: Option<IbcTimeout>,
    pub memo: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAttribute {
    pub key: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub attributes: Vec<EventAttribute>,
}

impl TxEvent {
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attr| attr.key == key)
            .map(|attr| attr.value.as_str())
    }
}

/// One transaction of a block as recorded by the block tracker. `data` is the
/// decoded transaction, usually JSON.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTx {
    pub data: Vec<u8>,
    pub events: Vec<TxEvent>,
}

#[cfg(test)]
mod tests {
    use super::Packet;

    #[test]
    fn packet_validation_reports_every_problem() {
        let problems = Packet::default().validate().expect_err("invalid");
        assert_eq!(problems.len(), 7);

        let packet = Packet {
            sequence: 1,
            source_port: "transfer".to_owned(),
            source_channel: "channel-0".to_owned(),
            dest_port: "transfer".to_owned(),
            dest_channel: "channel-1".to_owned(),
            data: b"{}".to_vec(),
            timeout_height: String::new(),
            timeout_timestamp: 1_700_000_000_000_000_000,
        };
        assert!(packet.validate().is_ok());
    }
}
