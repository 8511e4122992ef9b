//! Device plugins shipped with the agent.

pub mod status;

use node_agent_session::PluginRegistry;

/// Registry of the built-in plugins.
#[must_use]
pub fn builtin() -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    registry.register(status::NAME, status::AgentStatus::new);
    registry
}
