//! The agent: owns the session table and runs the writer and reader.

use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::Utc;
use futures::FutureExt;
use node_agent_core::{Crypto, CryptoError, Outbox, ServerProperties};
use node_agent_session::{PluginRegistry, SessionTable};
use node_agent_transport::{
    Correlation, HTTP_RETRY_PERIOD, Reader, Registration, SetupError, Transport, TransportError,
    Writer, WriterConfig,
};
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// FQDN a host reports when its name does not resolve.
const UNRESOLVED_FQDN: &str = "localhost.localdomain";

/// Agent error.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("Name resolution error, FQDN resolves to {0}")]
    NameResolution(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("HTTP client setup failed: {0}")]
    Client(#[from] SetupError),
}

/// Agent tuning.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub writer: WriterConfig,
    /// Wait after a failed long-poll.
    pub reader_retry: Duration,
    /// Action capabilities advertised on registration.
    pub capabilities: Vec<String>,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            writer: WriterConfig::default(),
            reader_retry: HTTP_RETRY_PERIOD,
            capabilities: Vec::new(),
        }
    }
}

/// Session-multiplexed connection between this node and the manager.
pub struct Agent {
    transport: Arc<dyn Transport>,
    crypto: Arc<dyn Crypto>,
    server: ServerProperties,
    capabilities: Vec<String>,
    sessions: Arc<SessionTable>,
    writer: Arc<Writer>,
    reader: Arc<Reader>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: PluginRegistry,
        crypto: Arc<dyn Crypto>,
        server: ServerProperties,
        options: AgentOptions,
    ) -> Self {
        let correlation = Correlation::new(&server.boot_time, &Utc::now());
        let outbox = Arc::new(Outbox::new());
        let sessions = Arc::new(SessionTable::new(registry, Arc::clone(&outbox)));

        let writer = Arc::new(Writer::new(
            Arc::clone(&transport),
            Arc::clone(&sessions),
            outbox,
            server.fqdn.clone(),
            correlation.clone(),
            options.writer,
        ));
        let reader = Arc::new(Reader::new(
            Arc::clone(&transport),
            Arc::clone(&sessions),
            correlation,
            options.reader_retry,
        ));

        Self {
            transport,
            crypto,
            server,
            capabilities: options.capabilities,
            sessions,
            writer,
            reader,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Active sessions.
    #[must_use]
    pub const fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    /// Register this node with the manager.
    ///
    /// Not retried; the caller decides what to do on failure.
    ///
    /// # Errors
    /// Returns error if the host name does not resolve, no CSR can be
    /// produced or the request fails.
    pub async fn register(&self, address: Option<String>) -> Result<Option<Value>, AgentError> {
        if self.server.fqdn == UNRESOLVED_FQDN {
            tracing::error!(fqdn = %self.server.fqdn, "Registration failed");
            return Err(AgentError::NameResolution(self.server.fqdn.clone()));
        }

        let registration = Registration {
            address,
            fqdn: self.server.fqdn.clone(),
            nodename: self.server.nodename.clone(),
            capabilities: self.capabilities.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            csr: self.crypto.generate_csr(&self.server.fqdn)?,
        };
        let body = serde_json::to_value(&registration)
            .map_err(|e| AgentError::Config(format!("Unencodable registration: {e}")))?;

        tracing::info!(fqdn = %registration.fqdn, "Registering");
        self.transport.post(&body).await.map_err(|e| {
            tracing::error!(fqdn = %registration.fqdn, error = %e, "Registration failed");
            AgentError::from(e)
        })
    }

    /// Start the reader, then the writer.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            tracing::warn!("Agent already started");
            return;
        }
        tracing::info!(fqdn = %self.server.fqdn, "Agent starting");

        let reader = Arc::clone(&self.reader);
        let cancel = self.cancel.clone();
        tasks.push(tokio::spawn(supervised("reader", async move {
            reader.run(cancel).await;
        })));

        let writer = Arc::clone(&self.writer);
        let cancel = self.cancel.clone();
        tasks.push(tokio::spawn(supervised("writer", async move {
            writer.run(cancel).await;
        })));
    }

    /// Ask both loops to stop. Returns immediately.
    pub fn stop(&self) {
        tracing::debug!("Agent stopping");
        self.cancel.cancel();
    }

    /// Wait for both loops to exit, then tear down every session.
    pub async fn join(&self) {
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Agent task failed");
            }
        }
        self.sessions.terminate_all().await;
        tracing::debug!("Agent joined");
    }
}

async fn supervised(name: &'static str, task: impl Future<Output = ()>) {
    if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
        tracing::error!(task = name, panic = %panic_message(&*panic), "Task panicked");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
