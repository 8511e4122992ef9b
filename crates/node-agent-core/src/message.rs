//! Protocol message envelope exchanged with the manager.

use std::{cmp::Ordering, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Kind of protocol unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Agent asks the manager to open a session for a plugin.
    SessionCreateRequest,
    /// Manager grants a session id for a plugin.
    SessionCreateResponse,
    /// Manager ends one plugin's session.
    SessionTerminate,
    /// Plugin payload travelling in either direction.
    Data,
    /// Manager ends every session.
    SessionTerminateAll,
}

impl MessageType {
    /// Wire name of this type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SessionCreateRequest => "SESSION_CREATE_REQUEST",
            Self::SessionCreateResponse => "SESSION_CREATE_RESPONSE",
            Self::SessionTerminate => "SESSION_TERMINATE",
            Self::Data => "DATA",
            Self::SessionTerminateAll => "SESSION_TERMINATE_ALL",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SESSION_CREATE_REQUEST" => Ok(Self::SessionCreateRequest),
            "SESSION_CREATE_RESPONSE" => Ok(Self::SessionCreateResponse),
            "SESSION_TERMINATE" => Ok(Self::SessionTerminate),
            "DATA" => Ok(Self::Data),
            "SESSION_TERMINATE_ALL" => Ok(Self::SessionTerminateAll),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

/// Send priority of an outbound message. Higher variants leave first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Plugin payload wrapped with a priority hint.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginMessage {
    /// Opaque payload.
    pub message: Value,
    /// Send priority.
    pub priority: Priority,
}

impl PluginMessage {
    /// Wrap a payload at normal priority.
    #[must_use]
    pub fn new(message: Value) -> Self {
        Self {
            message,
            priority: Priority::Normal,
        }
    }

    /// Wrap a payload at the given priority.
    #[must_use]
    pub const fn with_priority(message: Value, priority: Priority) -> Self {
        Self { message, priority }
    }
}

/// Hook fired once a message has been sent or permanently dropped.
///
/// Fires exactly once: either through [`Completion::fire`] or, failing
/// that, when dropped.
pub struct Completion(Option<Box<dyn FnOnce() + Send>>);

impl Completion {
    /// Wrap a closure.
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    /// Run the hook now.
    pub fn fire(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.is_some() {
            "Completion(pending)"
        } else {
            "Completion(fired)"
        })
    }
}

/// Malformed wire message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Missing field: {0}")]
    MissingField(&'static str),
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Wire record of a single message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub plugin: Option<String>,
    pub session_id: Option<String>,
    pub session_seq: Option<u64>,
    pub body: Value,
    pub fqdn: String,
}

/// Inbound record before validation.
#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    plugin: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    session_seq: Option<u64>,
    #[serde(default)]
    body: Value,
}

/// One protocol unit.
///
/// Equality and ordering compare priority only; they exist for queueing
/// and say nothing about session semantics.
pub struct Message {
    pub kind: MessageType,
    pub plugin_name: Option<String>,
    pub body: Option<PluginMessage>,
    pub session_id: Option<String>,
    pub session_seq: Option<u64>,
    callback: Option<Completion>,
}

impl Message {
    /// Control-plane message without a body.
    #[must_use]
    pub fn control(kind: MessageType, plugin_name: impl Into<String>) -> Self {
        Self {
            kind,
            plugin_name: Some(plugin_name.into()),
            body: None,
            session_id: None,
            session_seq: None,
            callback: None,
        }
    }

    /// Ask the manager to open a session for `plugin_name`.
    #[must_use]
    pub fn session_create_request(plugin_name: impl Into<String>) -> Self {
        Self::control(MessageType::SessionCreateRequest, plugin_name)
    }

    /// Outbound DATA message for an established session.
    #[must_use]
    pub fn data(
        plugin_name: impl Into<String>,
        session_id: impl Into<String>,
        session_seq: u64,
        body: PluginMessage,
        callback: Option<Completion>,
    ) -> Self {
        Self {
            kind: MessageType::Data,
            plugin_name: Some(plugin_name.into()),
            body: Some(body),
            session_id: Some(session_id.into()),
            session_seq: Some(session_seq),
            callback,
        }
    }

    /// Populate a message from an inbound wire record.
    ///
    /// # Errors
    /// Returns [`ProtocolError`] if the type is unknown or a field required
    /// by that type is absent.
    pub fn parse(data: Value) -> Result<Self, ProtocolError> {
        let raw: RawMessage = serde_json::from_value(data)?;
        let kind: MessageType = raw
            .kind
            .as_deref()
            .ok_or(ProtocolError::MissingField("type"))?
            .parse()?;

        if kind != MessageType::SessionTerminateAll && raw.plugin.is_none() {
            return Err(ProtocolError::MissingField("plugin"));
        }
        if matches!(
            kind,
            MessageType::SessionCreateResponse | MessageType::Data
        ) && raw.session_id.is_none()
        {
            return Err(ProtocolError::MissingField("session_id"));
        }

        let body = match raw.body {
            Value::Null => None,
            other => Some(PluginMessage::new(other)),
        };

        Ok(Self {
            kind,
            plugin_name: raw.plugin,
            body,
            session_id: raw.session_id,
            session_seq: raw.session_seq,
            callback: None,
        })
    }

    /// Produce the wire record, stamped with the sender's identity.
    #[must_use]
    pub fn dump(&self, fqdn: &str) -> WireMessage {
        WireMessage {
            kind: self.kind,
            plugin: self.plugin_name.clone(),
            session_id: self.session_id.clone(),
            session_seq: self.session_seq,
            body: self
                .body
                .as_ref()
                .map_or(Value::Null, |b| b.message.clone()),
            fqdn: fqdn.to_string(),
        }
    }

    /// Queue priority. Control messages without a body are high priority.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.body.as_ref().map_or(Priority::High, |b| b.priority)
    }

    /// Whether a completion hook is still attached.
    #[must_use]
    pub const fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Fire the completion hook, if any. Later calls do nothing.
    pub fn complete(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback.fire();
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("plugin_name", &self.plugin_name)
            .field("session_id", &self.session_id)
            .field("session_seq", &self.session_seq)
            .field("priority", &self.priority())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.priority() == other.priority()
    }
}

impl Eq for Message {}

impl PartialOrd for Message {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Message {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority().cmp(&other.priority())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering as AtomicOrdering},
    };

    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_data_message() {
        let msg = Message::parse(json!({
            "type": "DATA",
            "plugin": "linux",
            "session_id": "sid1",
            "session_seq": 4,
            "body": {"devices": []},
        }))
        .unwrap();

        assert_eq!(msg.kind, MessageType::Data);
        assert_eq!(msg.plugin_name.as_deref(), Some("linux"));
        assert_eq!(msg.session_id.as_deref(), Some("sid1"));
        assert_eq!(msg.session_seq, Some(4));
        assert_eq!(msg.body.unwrap().message, json!({"devices": []}));
    }

    #[test]
    fn test_parse_terminate_all_without_plugin() {
        let msg = Message::parse(json!({"type": "SESSION_TERMINATE_ALL"})).unwrap();
        assert_eq!(msg.kind, MessageType::SessionTerminateAll);
        assert!(msg.plugin_name.is_none());
        assert!(msg.body.is_none());
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        let err = Message::parse(json!({"type": "SESSION_REBOOT", "plugin": "x"})).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(t) if t == "SESSION_REBOOT"));
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        let err = Message::parse(json!({"plugin": "x"})).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField("type")));

        let err = Message::parse(json!({"type": "SESSION_TERMINATE"})).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField("plugin")));

        let err = Message::parse(json!({"type": "DATA", "plugin": "x", "body": 1})).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField("session_id")));
    }

    #[test]
    fn test_parse_rejects_non_object() {
        assert!(matches!(
            Message::parse(json!([1, 2])),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_dump_embeds_identity() {
        let msg = Message::data(
            "linux",
            "sid1",
            7,
            PluginMessage::with_priority(json!("payload"), Priority::Low),
            None,
        );
        let wire = serde_json::to_value(msg.dump("node1.example.com")).unwrap();

        assert_eq!(
            wire,
            json!({
                "type": "DATA",
                "plugin": "linux",
                "session_id": "sid1",
                "session_seq": 7,
                "body": "payload",
                "fqdn": "node1.example.com",
            })
        );
    }

    #[test]
    fn test_control_messages_outrank_data() {
        let control = Message::session_create_request("linux");
        let high = Message::data(
            "linux",
            "s",
            0,
            PluginMessage::with_priority(json!(1), Priority::High),
            None,
        );
        let normal = Message::data("linux", "s", 1, PluginMessage::new(json!(1)), None);

        assert_eq!(control.priority(), Priority::High);
        assert!(control > normal);
        assert_eq!(control, high);
    }

    #[test]
    fn test_completion_fires_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let mut msg = Message::data(
            "linux",
            "s",
            0,
            PluginMessage::new(json!(null)),
            Some(Completion::new(move || {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
            })),
        );

        assert!(msg.has_callback());
        msg.complete();
        msg.complete();
        drop(msg);
        assert_eq!(count.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn test_completion_fires_on_drop() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        drop(Completion::new(move || {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
        }));
        assert_eq!(count.load(AtomicOrdering::SeqCst), 1);
    }
}
