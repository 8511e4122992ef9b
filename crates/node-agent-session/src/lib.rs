//! Session state for the node agent.
//!
//! Provides:
//! - `Session` / `SessionHandle` - One plugin's conversation with the manager
//! - `SessionTable` - Active sessions plus session-request backoff
//! - `PluginRegistry` - Plugin factories keyed by name

pub mod registry;
pub mod session;
pub mod table;

pub use registry::{PluginFactory, PluginRegistry};
pub use session::{POLL_PERIOD, Session, SessionHandle};
pub use table::{MAX_SESSION_BACKOFF, MIN_SESSION_BACKOFF, SessionError, SessionTable};
