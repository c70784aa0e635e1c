//! Capability extensions registered before the configuration is resolved.

mod builtin;
mod etherscan;

use std::sync::Arc;

use serde_json::Value;

use crate::config::{ConfigSchema, Configuration};
use crate::engine::TaskGraphBuilder;
use crate::error::PluginError;
use crate::network::NetworkDefinition;

pub use builtin::{Builtin, Deployment};
pub use etherscan::Etherscan;

/// An extension of the framework. Every capability is optional; the default
/// methods contribute nothing.
///
/// Plugins are consulted in registration order, so a later plugin sees the
/// tasks of earlier ones and may override them.
pub trait Plugin: Send + Sync {
    /// Unique name of this plugin.
    fn name(&self) -> &str;

    /// Paths this plugin expects in the configuration.
    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::new()
    }

    /// A default configuration layer, merged above the framework defaults
    /// and below the user's configuration. `Null` contributes nothing.
    fn config_defaults(&self) -> Value {
        Value::Null
    }

    /// Defines or overrides tasks.
    fn tasks(&self, _tasks: &mut TaskGraphBuilder) {}

    /// Networks provided by this plugin, given the resolved configuration.
    fn networks(&self, _config: &Configuration) -> Vec<NetworkDefinition> {
        Vec::new()
    }
}

/// Ordered set of registered plugins.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: impl Plugin + 'static) -> Result<(), PluginError> {
        self.register_arc(Arc::new(plugin))
    }

    pub fn register_arc(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        if self.plugins.iter().any(|p| p.name() == plugin.name()) {
            return Err(PluginError::Duplicate(plugin.name().to_owned()));
        }

        tracing::debug!(plugin = plugin.name(), "registered plugin");
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.plugins.iter().map(|p| p.name())
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Every plugin's schema fragment, concatenated.
    pub fn schema(&self) -> ConfigSchema {
        let mut schema = ConfigSchema::new();
        for plugin in &self.plugins {
            schema.extend(plugin.config_schema());
        }
        schema
    }

    /// Default layers with the name of the plugin that contributed each, in
    /// registration order.
    pub fn defaults(&self) -> Vec<(String, Value)> {
        self.plugins
            .iter()
            .map(|p| (p.name().to_owned(), p.config_defaults()))
            .filter(|(_, layer)| !layer.is_null())
            .collect()
    }

    pub fn contribute_tasks(&self, tasks: &mut TaskGraphBuilder) {
        for plugin in &self.plugins {
            plugin.tasks(tasks);
        }
    }

    pub fn networks(&self, config: &Configuration) -> Vec<NetworkDefinition> {
        self.plugins
            .iter()
            .flat_map(|p| p.networks(config))
            .collect()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
