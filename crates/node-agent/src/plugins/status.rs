//! Reports the agent's own version and uptime.

use std::time::Instant;

use async_trait::async_trait;
use node_agent_core::{DevicePlugin, PluginError, PluginMessage, PluginOutput, Priority};
use node_agent_session::SessionHandle;
use serde::Serialize;
use serde_json::Value;

pub const NAME: &str = "agent_status";

#[derive(Debug, Serialize)]
struct Report<'a> {
    version: &'static str,
    session_id: &'a str,
    uptime_secs: u64,
    updates: u64,
}

pub struct AgentStatus {
    handle: SessionHandle,
    started: Instant,
    updates: u64,
}

impl AgentStatus {
    #[must_use]
    pub fn new(handle: SessionHandle) -> Self {
        Self {
            handle,
            started: Instant::now(),
            updates: 0,
        }
    }

    fn report(&self) -> Result<Value, PluginError> {
        serde_json::to_value(Report {
            version: env!("CARGO_PKG_VERSION"),
            session_id: self.handle.id(),
            uptime_secs: self.started.elapsed().as_secs(),
            updates: self.updates,
        })
        .map_err(|e| PluginError::Failed(e.to_string()))
    }
}

#[async_trait]
impl DevicePlugin for AgentStatus {
    async fn start_session(&mut self) -> Result<Option<PluginOutput>, PluginError> {
        Ok(Some(PluginOutput::Message(PluginMessage::with_priority(
            self.report()?,
            Priority::High,
        ))))
    }

    async fn update_session(&mut self) -> Result<Option<PluginOutput>, PluginError> {
        self.updates += 1;
        Ok(Some(PluginOutput::Bare(self.report()?)))
    }

    async fn on_message(&mut self, body: Value) -> Result<(), PluginError> {
        tracing::info!(session_id = %self.handle.id(), body = %body, "Status requested");
        self.handle.send_message(PluginMessage::new(self.report()?), None);
        Ok(())
    }
}
