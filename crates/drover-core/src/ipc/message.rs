//! Supervisor/worker message types.
//!
//! Every packet on a worker channel is one [`Envelope`]. The outer tag
//! (`action`) selects the protocol; the inner tag (`act` for the scheduler,
//! `cmd` for channels) selects the message.
//!
//! ```text
//! {"action":"scheduler","act":"newconn","key":"0.0.0.0:8080:tcp4:-1","seq":7}
//! {"action":"channel","cmd":"queryback","channel":"stats","ack":3,"status":"ok","result":[1,2]}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top-level worker channel message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Envelope {
    Scheduler(SchedulerMessage),
    Channel(ChannelMessage),
}

/// Listening endpoint families understood by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    Tcp4,
    Tcp6,
    Udp4,
    Udp6,
    /// `address` is a filesystem path; `port` is ignored.
    Unix,
}

impl AddressType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressType::Tcp4 => "tcp4",
            AddressType::Tcp6 => "tcp6",
            AddressType::Udp4 => "udp4",
            AddressType::Udp6 => "udp6",
            AddressType::Unix => "unix",
        }
    }

    /// Connectionless endpoints are always shared.
    pub fn is_datagram(&self) -> bool {
        matches!(self, AddressType::Udp4 | AddressType::Udp6)
    }
}

impl std::fmt::Display for AddressType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address actually bound by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub address: String,
    pub port: u16,
}

/// Scheduler protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "act")]
pub enum SchedulerMessage {
    /// Worker asks to join (or create) the entry for a key.
    #[serde(rename = "queryServer")]
    QueryServer {
        seq: u64,
        address: String,
        port: u16,
        #[serde(rename = "addressType")]
        address_type: AddressType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fd: Option<i32>,
    },

    /// Reply to `queryServer`. A shared-mode handle rides along as the
    /// packet's descriptor; `errno` is non-zero when the bind failed.
    #[serde(rename = "serverAck")]
    ServerAck {
        seq: u64,
        key: String,
        errno: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<ServerInfo>,
    },

    /// Round-robin connection handoff; the connection is the packet's
    /// descriptor.
    #[serde(rename = "newconn")]
    NewConn { key: String, seq: u64 },

    #[serde(rename = "handoffAck")]
    HandoffAck { key: String, ack: u64, accepted: bool },

    /// Explicit release of one membership in `key`.
    #[serde(rename = "close")]
    Close { key: String },
}

/// Outcome of answering a channel query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelStatus {
    Ok,
    NoProvider,
}

/// Channel bus protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum ChannelMessage {
    Query {
        channel: String,
        seq: u64,
    },
    Dispatch {
        channel: String,
        #[serde(default)]
        data: Value,
    },
    /// From a sibling: its single answer. From the supervisor to the
    /// originator: the aggregated array.
    Queryback {
        channel: String,
        ack: u64,
        status: ChannelStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
}

impl From<SchedulerMessage> for Envelope {
    fn from(msg: SchedulerMessage) -> Self {
        Envelope::Scheduler(msg)
    }
}

impl From<ChannelMessage> for Envelope {
    fn from(msg: ChannelMessage) -> Self {
        Envelope::Channel(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_server_wire_shape() {
        let msg = Envelope::from(SchedulerMessage::QueryServer {
            seq: 1,
            address: "127.0.0.1".into(),
            port: 8080,
            address_type: AddressType::Tcp4,
            fd: None,
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "action": "scheduler",
                "act": "queryServer",
                "seq": 1,
                "address": "127.0.0.1",
                "port": 8080,
                "addressType": "tcp4"
            })
        );
    }

    #[test]
    fn test_handoff_ack_parses() {
        let raw = r#"{"action":"scheduler","act":"handoffAck","key":"k","ack":9,"accepted":false}"#;
        let parsed: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(
            parsed,
            Envelope::Scheduler(SchedulerMessage::HandoffAck {
                key: "k".into(),
                ack: 9,
                accepted: false,
            })
        );
    }

    #[test]
    fn test_queryback_wire_shape() {
        let msg = Envelope::from(ChannelMessage::Queryback {
            channel: "stats".into(),
            ack: 3,
            status: ChannelStatus::NoProvider,
            result: None,
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["action"], "channel");
        assert_eq!(value["cmd"], "queryback");
        assert_eq!(value["status"], "noProvider");
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_dispatch_without_data_defaults_to_null() {
        let raw = r#"{"action":"channel","cmd":"dispatch","channel":"reload"}"#;
        let parsed: Envelope = serde_json::from_str(raw).unwrap();
        match parsed {
            Envelope::Channel(ChannelMessage::Dispatch { channel, data }) => {
                assert_eq!(channel, "reload");
                assert!(data.is_null());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let raw = r#"{"action":"bogus"}"#;
        assert!(serde_json::from_str::<Envelope>(raw).is_err());
    }

    #[test]
    fn test_datagram_types() {
        assert!(AddressType::Udp4.is_datagram());
        assert!(AddressType::Udp6.is_datagram());
        assert!(!AddressType::Tcp4.is_datagram());
        assert!(!AddressType::Unix.is_datagram());
    }
}
