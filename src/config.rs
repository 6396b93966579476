//! Configuration parsing for rolegate.toml files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::model::AccountId;

/// Root configuration structure matching the rolegate.toml schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// The account at the top of the whole multi-tenant system, if there is one.
    pub site_admin_account_id: Option<AccountId>,
    /// Global setting holding the comma-separated custom site-admin role allow-list.
    #[serde(default = "default_allowed_roles_setting")]
    pub allowed_roles_setting: String,
    #[serde(default = "default_max_chain_depth")]
    pub max_chain_depth: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            site_admin_account_id: None,
            allowed_roles_setting: default_allowed_roles_setting(),
            max_chain_depth: default_max_chain_depth(),
        }
    }
}

fn default_allowed_roles_setting() -> String {
    "allowed_custom_site_admin_roles".to_string()
}

fn default_max_chain_depth() -> usize {
    64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// When false every call behaves as if the cache were bypassed.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_table_capacity")]
    pub table_capacity: u64,
    #[serde(default = "default_chain_capacity")]
    pub chain_capacity: u64,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            table_capacity: default_table_capacity(),
            chain_capacity: default_chain_capacity(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_table_capacity() -> u64 {
    10_000
}

fn default_chain_capacity() -> u64 {
    50_000
}

fn default_ttl_secs() -> u64 {
    3600
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(content).context("Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.engine.max_chain_depth == 0 {
            anyhow::bail!("engine.max_chain_depth must be at least 1");
        }
        if self.engine.allowed_roles_setting.trim().is_empty() {
            anyhow::bail!("engine.allowed_roles_setting must not be empty");
        }
        Ok(())
    }

    pub fn with_site_admin(mut self, account: AccountId) -> Self {
        self.engine.site_admin_account_id = Some(account);
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.cache.enabled = false;
        self
    }
}
