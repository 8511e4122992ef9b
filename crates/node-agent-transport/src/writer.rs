//! Send loop: polls plugins, requests sessions and drains the outbox into
//! size-bounded POST batches.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use node_agent_core::{MAX_BYTES_PER_POST, Message, MessageType, Outbox};
use node_agent_session::SessionTable;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{Correlation, PostEnvelope, Transport};

/// Default minimum length of one writer cycle.
pub const DEFAULT_CYCLE: Duration = Duration::from_secs(1);

/// Writer timing and size limits.
#[derive(Debug, Clone, Copy)]
pub struct WriterConfig {
    /// Minimum length of one poll/drain cycle.
    pub cycle: Duration,
    /// Ceiling on a POST body.
    pub max_bytes: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            cycle: DEFAULT_CYCLE,
            max_bytes: MAX_BYTES_PER_POST,
        }
    }
}

/// The agent's single sender.
pub struct Writer {
    transport: Arc<dyn Transport>,
    sessions: Arc<SessionTable>,
    outbox: Arc<Outbox>,
    fqdn: String,
    correlation: Correlation,
    config: WriterConfig,
}

/// (plugin, session id) pairs whose sequence continuity is lost.
type Kills = BTreeSet<(String, String)>;

fn mark_for_termination(kills: &mut Kills, message: &Message) {
    if message.kind != MessageType::Data {
        return;
    }
    if let (Some(plugin), Some(id)) = (&message.plugin_name, &message.session_id) {
        kills.insert((plugin.clone(), id.clone()));
    }
}

impl Writer {
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        sessions: Arc<SessionTable>,
        outbox: Arc<Outbox>,
        fqdn: impl Into<String>,
        correlation: Correlation,
        config: WriterConfig,
    ) -> Self {
        Self {
            transport,
            sessions,
            outbox,
            fqdn: fqdn.into(),
            correlation,
            config,
        }
    }

    /// Queue a message for sending.
    pub fn put(&self, message: Message) {
        tracing::debug!(kind = %message.kind, plugin = ?message.plugin_name, "Writer.put");
        self.outbox.push(message);
    }

    /// Poll, drain, sleep out the cycle; until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(cycle_ms = self.config.cycle.as_millis(), "Writer starting");
        while !cancel.is_cancelled() {
            let started = Instant::now();
            self.poll(started).await;

            while !self.outbox.is_empty() && !cancel.is_cancelled() {
                self.send().await;
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep_until(started + self.config.cycle) => {}
            }
        }
        tracing::info!("Writer stopped");
    }

    /// Request missing sessions and collect data from active ones.
    pub async fn poll(&self, now: Instant) {
        let plugins: Vec<String> = self
            .sessions
            .registry()
            .names()
            .map(ToString::to_string)
            .collect();

        for plugin in plugins {
            let Ok(session) = self.sessions.get(&plugin, None) else {
                if self.sessions.should_request(&plugin, now) {
                    tracing::info!(plugin = %plugin, "Requesting session");
                    self.put(Message::session_create_request(&plugin));
                }
                continue;
            };

            match session.poll(now).await {
                Ok(Some(output)) => {
                    for body in output.into_messages() {
                        session.send_message(body, None);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        plugin = %plugin,
                        session_id = %session.id(),
                        error = %e,
                        "Error polling session, terminating"
                    );
                    if self.sessions.terminate_session(&plugin, session.id()).await {
                        self.sessions.note_request(&plugin, now);
                        self.put(Message::session_create_request(&plugin));
                    }
                }
            }
        }
    }

    /// Build and POST one batch.
    ///
    /// Returns false if the POST failed.
    pub async fn send(&self) -> bool {
        let mut envelope = PostEnvelope::new(self.correlation.clone());
        let base = serde_json::to_vec(&envelope).map_or(0, |b| b.len());
        let mut total = base;
        let mut batch: Vec<Message> = Vec::new();
        let mut dropped: Vec<Message> = Vec::new();
        let mut kills = Kills::new();

        while let Some(message) = self.outbox.pop() {
            let wire = message.dump(&self.fqdn);
            let len = match serde_json::to_vec(&wire) {
                Ok(bytes) => bytes.len(),
                Err(e) => {
                    tracing::error!(error = %e, ?message, "Unserializable message, dropping");
                    mark_for_termination(&mut kills, &message);
                    dropped.push(message);
                    continue;
                }
            };

            if base + len > self.config.max_bytes {
                tracing::error!(
                    plugin = ?message.plugin_name,
                    session_id = ?message.session_id,
                    bytes = len,
                    limit = self.config.max_bytes,
                    "Message oversized, dropping"
                );
                mark_for_termination(&mut kills, &message);
                dropped.push(message);
                continue;
            }

            let separator = usize::from(!batch.is_empty());
            if total + separator + len > self.config.max_bytes {
                tracing::debug!(
                    plugin = ?message.plugin_name,
                    bytes = total,
                    "Batch full, deferring message"
                );
                self.outbox.retry(message);
                break;
            }

            total += separator + len;
            envelope.messages.push(wire);
            batch.push(message);
        }

        let success = if batch.is_empty() {
            true
        } else {
            tracing::debug!(count = batch.len(), bytes = total, "Writer.send");
            let posted = match serde_json::to_value(&envelope) {
                Ok(body) => self.transport.post(&body).await.is_ok(),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode batch");
                    false
                }
            };
            if !posted {
                tracing::error!(count = batch.len(), "Send failed, terminating affected sessions");
                for message in &batch {
                    mark_for_termination(&mut kills, message);
                }
            }
            posted
        };

        for message in batch.iter_mut().chain(dropped.iter_mut()) {
            message.complete();
        }

        for (plugin, id) in kills {
            self.sessions.terminate_session(&plugin, &id).await;
        }

        success
    }
}
