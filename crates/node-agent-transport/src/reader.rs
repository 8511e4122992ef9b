//! Receive loop: long-polls the manager and dispatches what arrives.

use std::{sync::Arc, time::Duration};

use node_agent_core::{Message, MessageType, ProtocolError};
use node_agent_session::{SessionError, SessionTable};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{Correlation, ReceiveEnvelope, Transport};

/// Wait after a failed long-poll before trying again.
pub const HTTP_RETRY_PERIOD: Duration = Duration::from_secs(10);

/// Why an inbound message could not be dispatched.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("Unexpected message type from manager: {0}")]
    Unexpected(MessageType),
}

/// The agent's single receiver.
pub struct Reader {
    transport: Arc<dyn Transport>,
    sessions: Arc<SessionTable>,
    correlation: Correlation,
    retry_period: Duration,
}

impl Reader {
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        sessions: Arc<SessionTable>,
        correlation: Correlation,
        retry_period: Duration,
    ) -> Self {
        Self {
            transport,
            sessions,
            correlation,
            retry_period,
        }
    }

    /// Long-poll until cancelled. Failed requests are retried after a fixed
    /// delay, forever.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("Reader starting");
        loop {
            let response = tokio::select! {
                () = cancel.cancelled() => break,
                response = self.transport.get(&self.correlation) => response,
            };

            let handled = match response {
                Ok(body) => self.handle_response(body).await,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        retry_secs = self.retry_period.as_secs_f64(),
                        "Receive failed, retrying"
                    );
                    false
                }
            };

            if !handled {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(self.retry_period) => {}
                }
            }
        }
        tracing::info!("Reader stopped");
    }

    /// Dispatch every message of a long-poll response.
    ///
    /// A message that fails is logged and skipped; the rest still run.
    /// Returns false if the body was empty or not a message envelope.
    pub async fn handle_response(&self, body: Option<Value>) -> bool {
        let Some(body) = body else {
            tracing::warn!("Empty response from manager");
            return false;
        };
        let envelope: ReceiveEnvelope = match serde_json::from_value(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(error = %e, "Malformed response from manager");
                return false;
            }
        };

        for data in envelope.messages {
            if let Err(e) = self.dispatch(data).await {
                tracing::error!(error = %e, "Error dispatching message");
            }
        }
        true
    }

    /// Route one inbound message.
    ///
    /// # Errors
    /// Returns error if the message is malformed, names an unknown plugin
    /// or has a type the manager must not send.
    pub async fn dispatch(&self, data: Value) -> Result<(), DispatchError> {
        let message = Message::parse(data)?;
        tracing::info!(
            kind = %message.kind,
            plugin = ?message.plugin_name,
            session_id = ?message.session_id,
            "Reader.dispatch"
        );

        let plugin = message.plugin_name.as_deref().unwrap_or_default();
        match message.kind {
            MessageType::SessionCreateResponse => {
                let id = message
                    .session_id
                    .as_deref()
                    .ok_or(ProtocolError::MissingField("session_id"))?;
                match self.sessions.create(plugin, id) {
                    Ok(_) => {}
                    Err(SessionError::AlreadyExists { id: old, .. }) => {
                        tracing::warn!(
                            plugin = %plugin,
                            old_session_id = %old,
                            session_id = %id,
                            "Replacing existing session"
                        );
                        self.sessions.terminate(plugin).await;
                        self.sessions.create(plugin, id)?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            MessageType::SessionTerminateAll => self.sessions.terminate_all().await,
            MessageType::SessionTerminate => {
                self.sessions.terminate(plugin).await;
            }
            MessageType::Data => {
                let session = match self.sessions.get(plugin, message.session_id.as_deref()) {
                    Ok(session) => session,
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping message for stale session");
                        return Ok(());
                    }
                };
                let body = message.body.map_or(Value::Null, |b| b.message);
                if let Err(e) = session.receive_message(body).await {
                    tracing::error!(
                        plugin = %plugin,
                        session_id = %session.id(),
                        error = %e,
                        "Error handling message, terminating session"
                    );
                    self.sessions.terminate_session(plugin, session.id()).await;
                }
            }
            MessageType::SessionCreateRequest => {
                return Err(DispatchError::Unexpected(message.kind));
            }
        }
        Ok(())
    }
}
