//! Remote-management agent for storage nodes.
//!
//! Provides:
//! - `Agent` - Register, start, stop and join the transport loops
//! - `AgentConfig` - Environment-driven configuration
//! - `FileCrypto` - Client key and CSR generation
//! - `plugins` - Built-in device plugins

pub mod agent;
pub mod config;
pub mod crypto;
pub mod plugins;

pub use agent::{Agent, AgentError, AgentOptions};
pub use config::AgentConfig;
pub use crypto::FileCrypto;
