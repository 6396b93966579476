//! Process-wide plugin registry.
//!
//! Plugins are registered at startup and toggled rarely. Registry gates only ask
//! "is plugin P enabled for this root account", so that is all this tracks.
//! Tests flip state with [`PluginRegistry::scoped_enabled`], which restores the
//! previous state when the guard drops.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use tracing::debug;

use crate::error::Result;
use crate::model::AccountId;
use crate::store::PluginProvider;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct PluginState {
    enabled: bool,
    /// Per-root-account overrides of `enabled`.
    accounts: HashMap<AccountId, bool>,
}

/// Registered plugins and their enablement.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: RwLock<HashMap<String, PluginState>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by the whole process.
    pub fn global() -> Arc<PluginRegistry> {
        static REGISTRY: OnceLock<Arc<PluginRegistry>> = OnceLock::new();
        REGISTRY
            .get_or_init(|| Arc::new(PluginRegistry::new()))
            .clone()
    }

    /// Register a plugin. Re-registering keeps existing per-account state.
    pub fn register(&self, name: &str, enabled: bool) {
        let mut plugins = self.plugins.write().unwrap_or_else(PoisonError::into_inner);
        plugins.entry(name.to_string()).or_default().enabled = enabled;
        debug!(plugin = name, enabled, "registered plugin");
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Set the global enablement of a plugin, registering it if needed.
    pub fn set_enabled(&self, name: &str, enabled: bool) {
        self.register(name, enabled);
    }

    /// Enable or disable a plugin for one root account only.
    pub fn set_enabled_for(&self, name: &str, root_account_id: AccountId, enabled: bool) {
        let mut plugins = self.plugins.write().unwrap_or_else(PoisonError::into_inner);
        plugins
            .entry(name.to_string())
            .or_default()
            .accounts
            .insert(root_account_id, enabled);
    }

    /// Whether the plugin is enabled for a root account (or globally when `None`).
    /// Unregistered plugins are disabled.
    pub fn is_enabled(&self, name: &str, root_account_id: Option<AccountId>) -> bool {
        let plugins = self.plugins.read().unwrap_or_else(PoisonError::into_inner);
        let Some(state) = plugins.get(name) else {
            return false;
        };
        root_account_id
            .and_then(|root| state.accounts.get(&root).copied())
            .unwrap_or(state.enabled)
    }

    /// Set a plugin's global enablement until the returned guard is dropped.
    pub fn scoped_enabled(&self, name: &str, enabled: bool) -> ScopedPlugin<'_> {
        let previous = self
            .plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        self.set_enabled(name, enabled);
        ScopedPlugin {
            registry: self,
            name: name.to_string(),
            previous,
        }
    }
}

/// Restores a plugin's previous state on drop.
#[must_use = "the plugin state is restored as soon as the guard is dropped"]
pub struct ScopedPlugin<'a> {
    registry: &'a PluginRegistry,
    name: String,
    previous: Option<PluginState>,
}

impl Drop for ScopedPlugin<'_> {
    fn drop(&mut self) {
        let mut plugins = self
            .registry
            .plugins
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match self.previous.take() {
            Some(state) => {
                plugins.insert(self.name.clone(), state);
            }
            None => {
                plugins.remove(&self.name);
            }
        }
    }
}

#[async_trait]
impl PluginProvider for PluginRegistry {
    async fn plugin_enabled(&self, plugin: &str, root_account_id: Option<AccountId>) -> Result<bool> {
        Ok(self.is_enabled(plugin, root_account_id))
    }
}
