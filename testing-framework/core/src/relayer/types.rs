use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    #[default]
    Unordered,
    Ordered,
}

impl Order {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unordered => "unordered",
            Self::Ordered => "ordered",
        }
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateChannelOptions {
    pub source_port_name: String,
    pub dest_port_name: String,
    pub order: Order,
    pub version: String,
}

impl Default for CreateChannelOptions {
    fn default() -> Self {
        Self {
            source_port_name: "transfer".to_owned(),
            dest_port_name: "transfer".to_owned(),
            order: Order::Unordered,
            version: "ics20-1".to_owned(),
        }
    }
}

impl CreateChannelOptions {
    /// Zero-valued options are replaced by the defaults before linking.
    #[must_use]
    pub fn or_default(self) -> Self {
        if self.source_port_name.is_empty()
            && self.dest_port_name.is_empty()
            && self.version.is_empty()
        {
            Self {
                order: self.order,
                ..Self::default()
            }
        } else {
            self
        }
    }
}

/// A trusting period of `0` leaves the choice to the relayer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateClientOptions {
    pub trusting_period: String,
}

impl Default for CreateClientOptions {
    fn default() -> Self {
        Self {
            trusting_period: "0".to_owned(),
        }
    }
}

impl CreateClientOptions {
    /// Zero-valued options are replaced by the defaults before linking.
    #[must_use]
    pub fn or_default(self) -> Self {
        if self.trusting_period.is_empty() {
            Self::default()
        } else {
            self
        }
    }

    /// Whether the relayer should pick the trusting period itself.
    #[must_use]
    pub fn uses_relayer_default(&self) -> bool {
        matches!(self.trusting_period.as_str(), "" | "0")
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCounterparty {
    pub port_id: String,
    pub channel_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOutput {
    pub state: String,
    pub ordering: String,
    pub counterparty: ChannelCounterparty,
    pub connection_hops: Vec<String>,
    pub version: String,
    pub port_id: String,
    pub channel_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionVersion {
    pub identifier: String,
    #[serde(default)]
    pub features: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionCounterparty {
    pub client_id: String,
    #[serde(default)]
    pub connection_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOutput {
    pub id: String,
    pub client_id: String,
    #[serde(default)]
    pub versions: Vec<ConnectionVersion>,
    pub state: String,
    #[serde(default)]
    pub counterparty: ConnectionCounterparty,
    #[serde(default)]
    pub delay_period: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientState {
    pub chain_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientOutput {
    pub client_id: String,
    pub client_state: ClientState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterRule {
    Allowlist,
    Denylist,
}

impl FilterRule {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allowlist => "allowlist",
            Self::Denylist => "denylist",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFilter {
    pub rule: FilterRule,
    pub channel_list: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::{ChannelOutput, CreateChannelOptions, CreateClientOptions, Order};

    #[test]
    fn zero_channel_options_take_defaults() {
        let filled = CreateChannelOptions {
            source_port_name: String::new(),
            dest_port_name: String::new(),
            order: Order::Ordered,
            version: String::new(),
        }
        .or_default();
        assert_eq!(filled.source_port_name, "transfer");
        assert_eq!(filled.version, "ics20-1");
        assert_eq!(filled.order, Order::Ordered);

        let custom = CreateChannelOptions {
            version: "ics27-1".to_owned(),
            ..CreateChannelOptions::default()
        };
        assert_eq!(custom.clone().or_default(), custom);
    }

    #[test]
    fn empty_client_options_leave_the_trusting_period_to_the_relayer() {
        let filled = CreateClientOptions {
            trusting_period: String::new(),
        }
        .or_default();
        assert_eq!(filled.trusting_period, "0");
        assert!(filled.uses_relayer_default());

        let custom = CreateClientOptions {
            trusting_period: "330h".to_owned(),
        };
        assert_eq!(custom.clone().or_default(), custom);
        assert!(!custom.uses_relayer_default());
    }

    #[test]
    fn channel_output_parses_relayer_json() {
        let channel: ChannelOutput = serde_json::from_str(
            r#"{"state":"STATE_OPEN","ordering":"ORDER_UNORDERED",
                "counterparty":{"port_id":"transfer","channel_id":"channel-0"},
                "connection_hops":["connection-0"],"version":"ics20-1",
                "port_id":"transfer","channel_id":"channel-0"}"#,
        )
        .expect("json");
        assert_eq!(channel.counterparty.channel_id, "channel-0");
        assert_eq!(channel.connection_hops, vec!["connection-0".to_owned()]);
    }
}
