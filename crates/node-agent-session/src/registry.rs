//! Registry of device plugins the agent should open sessions for.

use std::{collections::BTreeMap, fmt, sync::Arc};

use node_agent_core::DevicePlugin;

use crate::SessionHandle;

/// Builds a plugin instance for a newly created session.
pub type PluginFactory = Arc<dyn Fn(SessionHandle) -> Box<dyn DevicePlugin> + Send + Sync>;

/// Plugin name to factory mapping, owned by the agent and passed explicitly.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, PluginFactory>,
}

impl PluginRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin under `name`, replacing any earlier registration.
    pub fn register<F, P>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(SessionHandle) -> P + Send + Sync + 'static,
        P: DevicePlugin + 'static,
    {
        self.plugins.insert(
            name.into(),
            Arc::new(move |handle| Box::new(factory(handle)) as Box<dyn DevicePlugin>),
        );
    }

    /// Factory for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PluginFactory> {
        self.plugins.get(name)
    }

    /// Registered plugin names, in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.plugins.keys()).finish()
    }
}
