//! HTTP transport between the node agent and its manager.
//!
//! Provides:
//! - `protocol` - Wire envelopes and the registration record
//! - `http` - `Transport` trait and the reqwest-backed `HttpTransport`
//! - `Writer` - Send loop with batching, overflow retry and session recovery
//! - `Reader` - Long-poll receive loop and message dispatch

pub mod http;
pub mod protocol;
pub mod reader;
#[cfg(test)]
mod testing;
pub mod writer;

pub use http::{HttpConfig, HttpTransport, SetupError, Transport, TransportError};
pub use protocol::{Correlation, PostEnvelope, ReceiveEnvelope, Registration};
pub use reader::{DispatchError, HTTP_RETRY_PERIOD, Reader};
pub use writer::{DEFAULT_CYCLE, Writer, WriterConfig};
