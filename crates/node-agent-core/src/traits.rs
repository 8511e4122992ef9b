//! Traits for the agent's external collaborators: device plugins and crypto.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::{PluginMessage, Priority};

/// Data returned by a plugin's start or update hook.
#[derive(Debug, Clone, PartialEq)]
pub enum PluginOutput {
    /// Several payloads sharing one priority.
    Collection {
        messages: Vec<Value>,
        priority: Priority,
    },
    /// One payload with its own priority.
    Message(PluginMessage),
    /// One payload at normal priority.
    Bare(Value),
}

impl PluginOutput {
    /// Flatten into individual prioritized payloads, preserving order.
    #[must_use]
    pub fn into_messages(self) -> Vec<PluginMessage> {
        match self {
            Self::Collection { messages, priority } => messages
                .into_iter()
                .map(|m| PluginMessage::with_priority(m, priority))
                .collect(),
            Self::Message(message) => vec![message],
            Self::Bare(value) => vec![PluginMessage::new(value)],
        }
    }
}

/// Plugin error.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Plugin failed: {0}")]
    Failed(String),
    #[error("Plugin does not accept messages")]
    MessagesUnsupported,
    #[error("Plugin panicked: {0}")]
    Panicked(String),
}

/// A device plugin: the producer/consumer behind one session.
///
/// Hooks that a plugin does not implement return `Ok(None)`, which the
/// agent treats as "nothing to send".
#[async_trait]
pub trait DevicePlugin: Send {
    /// Called on the first poll of a new session.
    async fn start_session(&mut self) -> Result<Option<PluginOutput>, PluginError> {
        Ok(None)
    }

    /// Called on every later poll.
    async fn update_session(&mut self) -> Result<Option<PluginOutput>, PluginError> {
        Ok(None)
    }

    /// Inbound DATA payload from the manager.
    async fn on_message(&mut self, body: Value) -> Result<(), PluginError> {
        let _ = body;
        Err(PluginError::MessagesUnsupported)
    }

    /// Release resources when the session ends.
    fn teardown(&mut self) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Crypto error.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Provider of the client certificate/key pair and CSRs.
pub trait Crypto: Send + Sync {
    /// PEM client certificate, once one has been issued.
    fn certificate_file(&self) -> Option<PathBuf>;

    /// PEM private key matching the certificate.
    fn private_key_file(&self) -> Option<PathBuf>;

    /// Produce a PEM certificate signing request for `fqdn`.
    ///
    /// # Errors
    /// Returns error if key material cannot be generated or stored.
    fn generate_csr(&self, fqdn: &str) -> Result<String, CryptoError>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_test::block_on;

    use super::*;

    struct Silent;

    #[async_trait]
    impl DevicePlugin for Silent {}

    #[test]
    fn test_output_shapes_flatten() {
        let collection = PluginOutput::Collection {
            messages: vec![json!(1), json!(2)],
            priority: Priority::High,
        };
        assert_eq!(
            collection.into_messages(),
            vec![
                PluginMessage::with_priority(json!(1), Priority::High),
                PluginMessage::with_priority(json!(2), Priority::High),
            ]
        );

        let single = PluginOutput::Message(PluginMessage::with_priority(json!("x"), Priority::Low));
        assert_eq!(single.into_messages()[0].priority, Priority::Low);

        let bare = PluginOutput::Bare(json!({"k": 1}));
        assert_eq!(bare.into_messages(), vec![PluginMessage::new(json!({"k": 1}))]);
    }

    #[test]
    fn test_default_hooks() {
        let mut plugin = Silent;
        assert!(block_on(plugin.start_session()).unwrap().is_none());
        assert!(block_on(plugin.update_session()).unwrap().is_none());
        assert!(matches!(
            block_on(plugin.on_message(json!(1))),
            Err(PluginError::MessagesUnsupported)
        ));
        assert!(plugin.teardown().is_ok());
    }
}
