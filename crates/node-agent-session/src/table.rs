//! Registry of active sessions and session-creation backoff.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use node_agent_core::Outbox;
use tokio::time::Instant;

use crate::{PluginRegistry, Session};

/// Wait after the first unanswered session request.
pub const MIN_SESSION_BACKOFF: Duration = Duration::from_secs(10);

/// Longest wait between unanswered session requests.
pub const MAX_SESSION_BACKOFF: Duration = Duration::from_secs(60);

/// Session table error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found: {plugin}")]
    NotFound { plugin: String, id: Option<String> },
    #[error("Session already exists: {plugin}/{id}")]
    AlreadyExists { plugin: String, id: String },
    #[error("Unknown plugin: {0}")]
    UnknownPlugin(String),
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Arc<Session>>,
    /// When a session was last requested, per plugin.
    requested_at: HashMap<String, Instant>,
    /// Wait before re-requesting, per plugin.
    backoffs: HashMap<String, Duration>,
}

/// All sessions of this agent, keyed by plugin name.
///
/// One mutex covers sessions and backoff state together. It is never
/// held across an await: sessions are handed out as `Arc`s and torn down
/// after removal.
pub struct SessionTable {
    inner: Mutex<Inner>,
    registry: PluginRegistry,
    outbox: Arc<Outbox>,
}

impl SessionTable {
    /// Create an empty table for the plugins in `registry`.
    #[must_use]
    pub fn new(registry: PluginRegistry, outbox: Arc<Outbox>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            registry,
            outbox,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registered plugins.
    #[must_use]
    pub const fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Open a session granted by the manager.
    ///
    /// Clears the plugin's backoff state.
    ///
    /// # Errors
    /// Returns `AlreadyExists` if the plugin still has a session (the
    /// caller must terminate it first) and `UnknownPlugin` if the plugin
    /// is not registered.
    pub fn create(&self, plugin_name: &str, id: &str) -> Result<Arc<Session>, SessionError> {
        tracing::info!(plugin = %plugin_name, session_id = %id, "SessionTable.create");
        let factory = self
            .registry
            .get(plugin_name)
            .ok_or_else(|| SessionError::UnknownPlugin(plugin_name.to_string()))?;

        if let Some(existing) = self.lock().sessions.get(plugin_name) {
            return Err(SessionError::AlreadyExists {
                plugin: plugin_name.to_string(),
                id: existing.id().to_string(),
            });
        }

        // Plugin construction runs outside the lock.
        let session = Arc::new(Session::new(
            plugin_name,
            id,
            Arc::clone(&self.outbox),
            factory,
        ));

        let mut inner = self.lock();
        if let Some(existing) = inner.sessions.get(plugin_name) {
            return Err(SessionError::AlreadyExists {
                plugin: plugin_name.to_string(),
                id: existing.id().to_string(),
            });
        }
        inner.requested_at.remove(plugin_name);
        inner.backoffs.remove(plugin_name);
        inner
            .sessions
            .insert(plugin_name.to_string(), Arc::clone(&session));
        Ok(session)
    }

    /// Look up a plugin's session, optionally requiring a specific id.
    ///
    /// # Errors
    /// Returns `NotFound` if there is no session or its id differs.
    pub fn get(&self, plugin_name: &str, id: Option<&str>) -> Result<Arc<Session>, SessionError> {
        let not_found = || SessionError::NotFound {
            plugin: plugin_name.to_string(),
            id: id.map(ToString::to_string),
        };
        let session = self.lock().sessions.get(plugin_name).cloned().ok_or_else(not_found)?;
        match id {
            Some(id) if session.id() != id => Err(not_found()),
            _ => Ok(session),
        }
    }

    /// Tear down and remove a plugin's session.
    ///
    /// Returns false (and logs) if there was none.
    pub async fn terminate(&self, plugin_name: &str) -> bool {
        self.terminate_matching(plugin_name, None).await
    }

    /// Like [`terminate`](Self::terminate), but only if the session id is `id`.
    pub async fn terminate_session(&self, plugin_name: &str, id: &str) -> bool {
        self.terminate_matching(plugin_name, Some(id)).await
    }

    async fn terminate_matching(&self, plugin_name: &str, id: Option<&str>) -> bool {
        let removed = {
            let mut inner = self.lock();
            let matches = inner
                .sessions
                .get(plugin_name)
                .is_some_and(|session| id.is_none_or(|id| session.id() == id));
            if matches {
                inner.sessions.remove(plugin_name)
            } else {
                None
            }
        };

        if let Some(session) = removed {
            tracing::info!(plugin = %plugin_name, session_id = %session.id(), "SessionTable.terminate");
            session.teardown().await;
            true
        } else {
            tracing::warn!(plugin = %plugin_name, session_id = ?id, "SessionTable.terminate not found");
            false
        }
    }

    /// Tear down and remove every session.
    pub async fn terminate_all(&self) {
        let sessions: Vec<_> = self.lock().sessions.drain().map(|(_, s)| s).collect();
        tracing::info!(count = sessions.len(), "SessionTable.terminate_all");
        for session in sessions {
            session.teardown().await;
        }
    }

    /// Decide whether to request a session for `plugin_name` now.
    ///
    /// The first request goes out immediately. While unanswered, each
    /// repeat waits out the current backoff, which then doubles up to
    /// [`MAX_SESSION_BACKOFF`]. A `true` result records the request.
    pub fn should_request(&self, plugin_name: &str, now: Instant) -> bool {
        let mut inner = self.lock();
        if inner.sessions.contains_key(plugin_name) {
            return false;
        }

        if let Some(&requested_at) = inner.requested_at.get(plugin_name) {
            let backoff = inner
                .backoffs
                .get(plugin_name)
                .copied()
                .unwrap_or(MIN_SESSION_BACKOFF);
            let next_request_at = requested_at + backoff;
            if now < next_request_at {
                tracing::debug!(
                    plugin = %plugin_name,
                    wait_secs = next_request_at.saturating_duration_since(now).as_secs(),
                    "Delaying session request"
                );
                return false;
            }
            inner
                .backoffs
                .insert(plugin_name.to_string(), (backoff * 2).min(MAX_SESSION_BACKOFF));
        }

        inner.requested_at.insert(plugin_name.to_string(), now);
        true
    }

    /// Record a session request made outside [`should_request`](Self::should_request).
    pub fn note_request(&self, plugin_name: &str, now: Instant) {
        self.lock()
            .requested_at
            .insert(plugin_name.to_string(), now);
    }

    /// Current backoff for `plugin_name`.
    #[must_use]
    pub fn backoff(&self, plugin_name: &str) -> Duration {
        self.lock()
            .backoffs
            .get(plugin_name)
            .copied()
            .unwrap_or(MIN_SESSION_BACKOFF)
    }

    /// True if `plugin_name` has an active session.
    #[must_use]
    pub fn contains(&self, plugin_name: &str) -> bool {
        self.lock().sessions.contains_key(plugin_name)
    }

    /// Number of active sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    /// True if there are no active sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().sessions.is_empty()
    }
}
