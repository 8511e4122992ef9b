//! Core abstractions for the node agent.
//!
//! This crate provides the fundamental building blocks:
//! - `Message` - Protocol envelope with priority and completion hook
//! - `Outbox` - Priority queue + retry queue for outbound messages
//! - `ServerProperties` - Node identity and boot time
//! - `DevicePlugin` and `Crypto` traits

pub mod context;
pub mod message;
pub mod outbox;
pub mod traits;

pub use context::ServerProperties;
pub use message::{
    Completion, Message, MessageType, PluginMessage, Priority, ProtocolError, WireMessage,
};
pub use outbox::Outbox;
pub use traits::{Crypto, CryptoError, DevicePlugin, PluginError, PluginOutput};

/// Largest POST body the manager accepts, in bytes.
pub const MAX_BYTES_PER_POST: usize = 64 * 1024;
