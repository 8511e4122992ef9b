//! Wire records exchanged with the manager.

use chrono::{DateTime, Utc};
use node_agent_core::{WireMessage, context::wire_timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Boot/start times that let the manager correlate requests with an agent run.
///
/// Sent as query parameters on GET and inside the POST envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Correlation {
    pub server_boot_time: String,
    pub client_start_time: String,
}

impl Correlation {
    /// Build from the node's boot time and the agent's start time.
    #[must_use]
    pub fn new(boot_time: &DateTime<Utc>, start_time: &DateTime<Utc>) -> Self {
        Self {
            server_boot_time: wire_timestamp(boot_time),
            client_start_time: wire_timestamp(start_time),
        }
    }
}

/// Body of a send POST.
#[derive(Debug, Clone, Serialize)]
pub struct PostEnvelope {
    pub messages: Vec<WireMessage>,
    #[serde(flatten)]
    pub correlation: Correlation,
}

impl PostEnvelope {
    /// Empty envelope.
    #[must_use]
    pub const fn new(correlation: Correlation) -> Self {
        Self {
            messages: Vec::new(),
            correlation,
        }
    }
}

/// Body of a long-poll GET response.
///
/// Messages are kept raw so each one is validated on its own.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReceiveEnvelope {
    #[serde(default)]
    pub messages: Vec<Value>,
}

/// Registration POST body.
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub address: Option<String>,
    pub fqdn: String,
    pub nodename: String,
    pub capabilities: Vec<String>,
    pub version: String,
    pub csr: String,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use node_agent_core::MessageType;
    use serde_json::json;

    use super::*;

    fn correlation() -> Correlation {
        let boot = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        let start = Utc.timestamp_opt(1_700_000_100, 500_000_000).single().unwrap();
        Correlation::new(&boot, &start)
    }

    #[test]
    fn test_post_envelope_serialization() {
        let mut envelope = PostEnvelope::new(correlation());
        envelope.messages.push(WireMessage {
            kind: MessageType::SessionCreateRequest,
            plugin: Some("linux".into()),
            session_id: None,
            session_seq: None,
            body: Value::Null,
            fqdn: "node1".into(),
        });

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "messages": [{
                    "type": "SESSION_CREATE_REQUEST",
                    "plugin": "linux",
                    "session_id": null,
                    "session_seq": null,
                    "body": null,
                    "fqdn": "node1",
                }],
                "server_boot_time": "2023-11-14T22:13:20.000000Z",
                "client_start_time": "2023-11-14T22:15:00.500000Z",
            })
        );
    }

    #[test]
    fn test_envelope_size_matches_value_size() {
        let envelope = PostEnvelope::new(correlation());
        let direct = serde_json::to_string(&envelope).unwrap();
        let via_value = serde_json::to_string(&serde_json::to_value(&envelope).unwrap()).unwrap();
        assert_eq!(direct.len(), via_value.len());
    }

    #[test]
    fn test_receive_envelope_tolerates_missing_messages() {
        let parsed: ReceiveEnvelope = serde_json::from_value(json!({})).unwrap();
        assert!(parsed.messages.is_empty());

        let parsed: ReceiveEnvelope =
            serde_json::from_value(json!({"messages": [{"type": "SESSION_TERMINATE_ALL"}, 5]}))
                .unwrap();
        assert_eq!(parsed.messages.len(), 2);
    }

    #[test]
    fn test_correlation_as_query() {
        let query = serde_json::to_value(correlation()).unwrap();
        assert_eq!(query["server_boot_time"], "2023-11-14T22:13:20.000000Z");
    }
}
