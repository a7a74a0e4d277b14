//! JSON emitted by the node CLI for transactions and balances, and the IBC
//! packet fields carried in Tendermint events.

use interchaintest_core::chain::{
    EventAttribute, Packet, PacketAcknowledgement, PacketTimeout, TxEvent,
};
use num_bigint::BigUint;
use serde::{Deserialize, Deserializer, de::Error as _};

pub(crate) const SEND_PACKET: &str = "send_packet";
pub(crate) const ACKNOWLEDGE_PACKET: &str = "acknowledge_packet";
pub(crate) const TIMEOUT_PACKET: &str = "timeout_packet";

/// The subset of `TxResponse` the driver reads. Numbers arrive as strings
/// from some SDK versions and as integers from others.
#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct CliTxResponse {
    #[serde(default, deserialize_with = "lenient_u64")]
    pub height: u64,
    #[serde(default)]
    pub txhash: String,
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub raw_log: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub gas_wanted: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub gas_used: i64,
    #[serde(default)]
    pub events: Vec<CliEvent>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct CliEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub attributes: Vec<CliAttribute>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct CliAttribute {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: String,
}

impl CliTxResponse {
    pub(crate) fn events(&self) -> Vec<TxEvent> {
        self.events
            .iter()
            .map(|event| TxEvent {
                kind: event.kind.clone(),
                attributes: event
                    .attributes
                    .iter()
                    .map(|attr| EventAttribute {
                        key: attr.key.clone(),
                        value: attr.value.clone(),
                    })
                    .collect(),
            })
            .collect()
    }
}

/// `query bank balances --denom` prints a bare coin on older SDKs and wraps
/// it in `balance` on newer ones.
#[derive(Deserialize)]
#[serde(untagged)]
pub(crate) enum BalanceResponse {
    Wrapped { balance: Coin },
    Bare(Coin),
}

#[derive(Deserialize)]
pub(crate) struct Coin {
    #[serde(default)]
    pub amount: String,
}

impl BalanceResponse {
    pub(crate) fn amount(&self) -> Result<BigUint, String> {
        let coin = match self {
            Self::Wrapped { balance } => balance,
            Self::Bare(coin) => coin,
        };
        if coin.amount.is_empty() {
            return Ok(BigUint::default());
        }
        coin.amount
            .parse()
            .map_err(|err| format!("amount {:?}: {err}", coin.amount))
    }
}

/// Packet described by the `packet_*` attributes of an IBC channel event.
pub(crate) fn packet_from_event(event: &TxEvent) -> Result<Packet, String> {
    let required = |key: &str| {
        event
            .attribute(key)
            .map(str::to_owned)
            .ok_or_else(|| format!("{} event without {key}", event.kind))
    };

    let sequence = required("packet_sequence")?;
    let timeout_timestamp = event.attribute("packet_timeout_timestamp").unwrap_or("0");
    let data = match event.attribute("packet_data_hex") {
        Some(encoded) => hex::decode(encoded).map_err(|err| format!("packet_data_hex: {err}"))?,
        None => event
            .attribute("packet_data")
            .map(|data| data.as_bytes().to_vec())
            .unwrap_or_default(),
    };
    let timeout_height = event
        .attribute("packet_timeout_height")
        .filter(|height| *height != "0-0")
        .unwrap_or_default()
        .to_owned();

    Ok(Packet {
        sequence: sequence
            .parse()
            .map_err(|err| format!("packet_sequence {sequence:?}: {err}"))?,
        source_port: required("packet_src_port")?,
        source_channel: required("packet_src_channel")?,
        dest_port: required("packet_dst_port")?,
        dest_channel: required("packet_dst_channel")?,
        data,
        timeout_height,
        timeout_timestamp: timeout_timestamp
            .parse()
            .map_err(|err| format!("packet_timeout_timestamp {timeout_timestamp:?}: {err}"))?,
    })
}

/// Acknowledged packets among `events`. The acknowledgement bytes are only
/// known when the event carries `packet_ack_hex`.
pub(crate) fn acknowledgements(events: &[TxEvent]) -> Result<Vec<PacketAcknowledgement>, String> {
    events
        .iter()
        .filter(|event| event.kind == ACKNOWLEDGE_PACKET)
        .map(|event| {
            let acknowledgement = match event.attribute("packet_ack_hex") {
                Some(encoded) => {
                    hex::decode(encoded).map_err(|err| format!("packet_ack_hex: {err}"))?
                }
                None => Vec::new(),
            };
            Ok(PacketAcknowledgement {
                packet: packet_from_event(event)?,
                acknowledgement,
            })
        })
        .collect()
}

pub(crate) fn timeouts(events: &[TxEvent]) -> Result<Vec<PacketTimeout>, String> {
    events
        .iter()
        .filter(|event| event.kind == TIMEOUT_PACKET)
        .map(|event| packet_from_event(event).map(|packet| PacketTimeout { packet }))
        .collect()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Lenient<T> {
    Number(T),
    Text(String),
}

fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default + std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match Lenient::<T>::deserialize(deserializer)? {
        Lenient::Number(value) => Ok(value),
        Lenient::Text(text) if text.is_empty() => Ok(T::default()),
        Lenient::Text(text) => text.parse().map_err(D::Error::custom),
    }
}

fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    lenient(deserializer)
}

fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    lenient(deserializer)
}

#[cfg(test)]
mod tests {
    use interchaintest_core::chain::{EventAttribute, TxEvent};
    use num_bigint::BigUint;

    use super::{BalanceResponse, CliTxResponse, acknowledgements, packet_from_event, timeouts};

    fn event(kind: &str, attributes: &[(&str, &str)]) -> TxEvent {
        TxEvent {
            kind: kind.to_owned(),
            attributes: attributes
                .iter()
                .map(|(key, value)| EventAttribute {
                    key: (*key).to_owned(),
                    value: (*value).to_owned(),
                })
                .collect(),
        }
    }

    const PACKET: [(&str, &str); 8] = [
        ("packet_sequence", "3"),
        ("packet_src_port", "transfer"),
        ("packet_src_channel", "channel-0"),
        ("packet_dst_port", "transfer"),
        ("packet_dst_channel", "channel-1"),
        ("packet_timeout_height", "0-0"),
        ("packet_timeout_timestamp", "1700000000000000000"),
        ("packet_data_hex", "7b7d"),
    ];

    #[test]
    fn send_packet_event_decodes_into_packet() {
        let packet = packet_from_event(&event("send_packet", &PACKET)).expect("packet");

        assert_eq!(packet.sequence, 3);
        assert_eq!(packet.source_channel, "channel-0");
        assert_eq!(packet.dest_channel, "channel-1");
        assert_eq!(packet.data, b"{}");
        assert!(packet.timeout_height.is_empty());
        assert_eq!(packet.timeout_timestamp, 1_700_000_000_000_000_000);
        assert!(packet.validate().is_ok());
    }

    #[test]
    fn missing_attributes_are_reported() {
        let err = packet_from_event(&event("send_packet", &PACKET[..3])).expect_err("partial");
        assert_eq!(err, "send_packet event without packet_dst_port");
    }

    #[test]
    fn acknowledgements_and_timeouts_are_picked_by_event_type() {
        let mut ack = PACKET.to_vec();
        ack.push(("packet_ack_hex", "7b22726573756c74223a2241513d3d227d"));
        let events = vec![
            event("send_packet", &PACKET),
            event("acknowledge_packet", &ack),
            event("timeout_packet", &PACKET),
            event("message", &[("action", "/ibc.core.channel.v1.MsgTimeout")]),
        ];

        let acks = acknowledgements(&events).expect("acks");
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].acknowledgement, br#"{"result":"AQ=="}"#);
        assert_eq!(acks[0].packet.sequence, 3);

        let timeouts = timeouts(&events).expect("timeouts");
        assert_eq!(timeouts.len(), 1);
        assert_eq!(timeouts[0].packet.dest_port, "transfer");
    }

    #[test]
    fn tx_response_numbers_may_be_strings() {
        let response: CliTxResponse = serde_json::from_str(
            r#"{"height":"12","txhash":"ABC","code":0,"raw_log":"","gas_wanted":"200000",
                "events":[{"type":"send_packet","attributes":[{"key":"packet_sequence","value":"1","index":true}]}]}"#,
        )
        .expect("response");
        assert_eq!(response.height, 12);
        assert_eq!(response.gas_wanted, 200_000);
        assert_eq!(response.events()[0].attribute("packet_sequence"), Some("1"));

        let broadcast = r#"{"height":0,"txhash":"ABC","code":5,"raw_log":"insufficient funds"}"#;
        let broadcast: CliTxResponse = serde_json::from_str(broadcast).expect("broadcast");
        assert_eq!(broadcast.code, 5);
        assert_eq!(broadcast.gas_wanted, 0);
    }

    #[test]
    fn balances_parse_bare_and_wrapped_coins() {
        let bare: BalanceResponse =
            serde_json::from_str(r#"{"denom":"uatom","amount":"100000000000000"}"#).expect("bare");
        assert_eq!(bare.amount().expect("amount"), BigUint::from(100_000_000_000_000u64));

        let wrapped: BalanceResponse =
            serde_json::from_str(r#"{"balance":{"denom":"uatom","amount":"7"}}"#).expect("wrapped");
        assert_eq!(wrapped.amount().expect("amount"), BigUint::from(7u32));
    }
}
