//! A single plugin's conversation with the manager.

use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::FutureExt;
use node_agent_core::{
    Completion, DevicePlugin, Message, Outbox, PluginError, PluginMessage, PluginOutput,
};
use serde_json::Value;
use tokio::time::Instant;

use crate::PluginFactory;

/// Minimum time between two polls of the same session.
pub const POLL_PERIOD: Duration = Duration::from_secs(10);

struct Shared {
    plugin_name: String,
    id: String,
    seq: Mutex<u64>,
    closed: AtomicBool,
    outbox: Arc<Outbox>,
}

/// Send side of a session, handed to the plugin instance.
///
/// Cheap to clone and safe to use from any thread, so plugins can push
/// data from their own timers.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    fn new(plugin_name: String, id: String, outbox: Arc<Outbox>) -> Self {
        Self {
            shared: Arc::new(Shared {
                plugin_name,
                id,
                seq: Mutex::new(0),
                closed: AtomicBool::new(false),
                outbox,
            }),
        }
    }

    fn seq_lock(&self) -> MutexGuard<'_, u64> {
        self.shared.seq.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Name of the plugin this session belongs to.
    #[must_use]
    pub fn plugin_name(&self) -> &str {
        &self.shared.plugin_name
    }

    /// Session id assigned by the manager.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Sequence number the next DATA message will carry.
    #[must_use]
    pub fn seq(&self) -> u64 {
        *self.seq_lock()
    }

    /// Whether the session has been torn down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Queue a DATA message under the next sequence number.
    ///
    /// Returns the sequence number used, or `None` if the session has
    /// already been torn down (the message is dropped and its completion
    /// fires immediately).
    pub fn send_message(&self, body: PluginMessage, callback: Option<Completion>) -> Option<u64> {
        let mut seq = self.seq_lock();
        if self.is_closed() {
            drop(seq);
            tracing::warn!(
                plugin = %self.plugin_name(),
                session_id = %self.id(),
                "Dropping message for closed session"
            );
            // Fired unlocked: the hook may send again on this handle.
            if let Some(callback) = callback {
                callback.fire();
            }
            return None;
        }

        let current = *seq;
        tracing::info!(
            plugin = %self.plugin_name(),
            session_id = %self.id(),
            seq = current,
            "Session.send_message"
        );
        // Pushed under the seq lock so enqueue order matches seq order.
        self.shared.outbox.push(Message::data(
            self.plugin_name(),
            self.id(),
            current,
            body,
            callback,
        ));
        *seq += 1;
        Some(current)
    }

    fn close(&self) {
        let _seq = self.seq_lock();
        self.shared.closed.store(true, Ordering::Release);
    }
}

struct PluginState {
    plugin: Box<dyn DevicePlugin>,
    poll_counter: u64,
    last_poll: Option<Instant>,
}

/// Active session: owns the plugin instance and its poll timing.
pub struct Session {
    handle: SessionHandle,
    state: tokio::sync::Mutex<PluginState>,
}

impl Session {
    /// Create a session and instantiate its plugin.
    #[must_use]
    pub fn new(
        plugin_name: impl Into<String>,
        id: impl Into<String>,
        outbox: Arc<Outbox>,
        factory: &PluginFactory,
    ) -> Self {
        let handle = SessionHandle::new(plugin_name.into(), id.into(), outbox);
        let plugin = factory(handle.clone());
        Self {
            handle,
            state: tokio::sync::Mutex::new(PluginState {
                plugin,
                poll_counter: 0,
                last_poll: None,
            }),
        }
    }

    /// Session id assigned by the manager.
    #[must_use]
    pub fn id(&self) -> &str {
        self.handle.id()
    }

    /// Name of the owning plugin.
    #[must_use]
    pub fn plugin_name(&self) -> &str {
        self.handle.plugin_name()
    }

    /// Send side of this session.
    #[must_use]
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Give the plugin a chance to produce data.
    ///
    /// Does nothing until [`POLL_PERIOD`] has passed since the previous
    /// poll. The first poll runs the plugin's start hook, later ones its
    /// update hook.
    ///
    /// # Errors
    /// Returns the plugin's error; the caller must end the session.
    pub async fn poll(&self, now: Instant) -> Result<Option<PluginOutput>, PluginError> {
        let mut state = self.state.lock().await;
        if let Some(last) = state.last_poll {
            if now.saturating_duration_since(last) < POLL_PERIOD {
                return Ok(None);
            }
        }
        state.last_poll = Some(now);
        state.poll_counter += 1;

        if state.poll_counter == 1 {
            guarded(state.plugin.start_session()).await
        } else {
            guarded(state.plugin.update_session()).await
        }
    }

    /// Queue a DATA message; see [`SessionHandle::send_message`].
    pub fn send_message(&self, body: PluginMessage, callback: Option<Completion>) -> Option<u64> {
        self.handle.send_message(body, callback)
    }

    /// Deliver an inbound DATA payload to the plugin.
    ///
    /// # Errors
    /// Returns the plugin's error; the caller must end the session.
    pub async fn receive_message(&self, body: Value) -> Result<(), PluginError> {
        tracing::info!(
            plugin = %self.plugin_name(),
            session_id = %self.id(),
            "Session.receive_message"
        );
        let mut state = self.state.lock().await;
        guarded(state.plugin.on_message(body)).await
    }

    /// Close the send side and run the plugin's teardown hook.
    ///
    /// Plugin failures are logged, never returned.
    pub async fn teardown(&self) {
        self.handle.close();
        let mut state = self.state.lock().await;
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| state.plugin.teardown()))
            .unwrap_or_else(|panic| Err(PluginError::Panicked(panic_message(&*panic))));
        if let Err(e) = result {
            tracing::error!(
                plugin = %self.plugin_name(),
                session_id = %self.id(),
                error = %e,
                "Plugin teardown failed"
            );
        }
    }
}

async fn guarded<T, F>(fut: F) -> Result<T, PluginError>
where
    F: Future<Output = Result<T, PluginError>>,
{
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(PluginError::Panicked(panic_message(&*panic))))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
