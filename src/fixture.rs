//! TOML fixtures that populate a [`MemoryStore`].
//!
//! The CLI resolves against a fixture file instead of a live database. Accounts
//! must be listed parents first.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::model::{
    Account, AccountId, BaseRoleType, Course, CourseId, Group, GroupId, Role, RoleId,
    RoleOverride, ShardId,
};
use crate::plugins::PluginRegistry;
use crate::store::{ContextProvider, MemoryStore, OverrideStore};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Fixture {
    #[serde(default)]
    pub accounts: Vec<AccountFixture>,
    #[serde(default)]
    pub courses: Vec<CourseFixture>,
    #[serde(default)]
    pub groups: Vec<GroupFixture>,
    #[serde(default)]
    pub roles: Vec<RoleFixture>,
    #[serde(default)]
    pub overrides: Vec<OverrideFixture>,
    /// Global settings, e.g. the custom site-admin role allow-list.
    #[serde(default)]
    pub settings: HashMap<String, String>,
    #[serde(default)]
    pub account_settings: Vec<AccountSettingFixture>,
    #[serde(default)]
    pub plugins: HashMap<String, bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountFixture {
    pub id: AccountId,
    pub name: String,
    pub parent: Option<AccountId>,
    /// Roots default to shard 0; sub-accounts default to their parent's shard.
    pub shard: Option<ShardId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CourseFixture {
    pub id: CourseId,
    pub name: String,
    pub account: AccountId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupFixture {
    pub id: GroupId,
    pub name: String,
    pub account: Option<AccountId>,
    #[serde(default)]
    pub shard: ShardId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoleFixture {
    pub id: RoleId,
    /// Defaults to the base type's name for built-in roles.
    pub name: Option<String>,
    pub base: BaseRoleType,
    pub account: AccountId,
    #[serde(default)]
    pub built_in: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OverrideFixture {
    pub account: AccountId,
    pub permission: String,
    pub role: RoleId,
    pub enabled: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default = "default_true")]
    pub applies_to_self: bool,
    #[serde(default = "default_true")]
    pub applies_to_descendants: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountSettingFixture {
    pub account: AccountId,
    pub key: String,
    pub value: serde_json::Value,
}

impl Fixture {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixture file: {}", path.display()))?;
        Self::from_str(&content)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML fixture")
    }

    /// Load everything into `store` and `plugins`.
    pub async fn apply(&self, store: &MemoryStore, plugins: &PluginRegistry) -> Result<()> {
        let mut accounts: HashMap<AccountId, Account> = HashMap::new();
        for entry in &self.accounts {
            let account = match entry.parent {
                None => Account::root(entry.id, &entry.name, entry.shard.unwrap_or_default()),
                Some(parent_id) => {
                    let parent = accounts.get(&parent_id).with_context(|| {
                        format!(
                            "Account {} lists parent {} which is not defined before it",
                            entry.id, parent_id
                        )
                    })?;
                    let mut account = Account::sub_account(entry.id, &entry.name, parent);
                    if let Some(shard) = entry.shard {
                        account.shard = shard;
                    }
                    account
                }
            };
            accounts.insert(account.id, store.add_account(account));
        }

        for entry in &self.courses {
            let account = lookup(&accounts, entry.account, &format!("Course {}", entry.id))?;
            store.add_course(Course::new(entry.id, &entry.name, account));
        }

        for entry in &self.groups {
            if let Some(account) = entry.account {
                lookup(&accounts, account, &format!("Group {}", entry.id))?;
            }
            store.add_group(Group {
                id: entry.id,
                name: entry.name.clone(),
                account_id: entry.account,
                shard: entry.shard,
            });
        }

        for entry in &self.roles {
            let account = lookup(&accounts, entry.account, &format!("Role {}", entry.id))?;
            let mut role = if entry.built_in {
                if !account.is_root() {
                    bail!("Built-in role {} must belong to a root account", entry.id);
                }
                Role::built_in(entry.id, entry.base, account.id)
            } else {
                let name = entry
                    .name
                    .as_deref()
                    .with_context(|| format!("Custom role {} needs a name", entry.id))?;
                Role::custom(entry.id, name, entry.base, account)
            };
            if let Some(name) = &entry.name {
                role.name = name.clone();
            }
            store.add_role(role);
        }

        for entry in &self.overrides {
            let account = lookup(&accounts, entry.account, "Override")?;
            ContextProvider::role(store, entry.role)
                .await?
                .with_context(|| format!("Override refers to unknown role {}", entry.role))?;
            let mut role_override =
                RoleOverride::new(account.id, &entry.permission, entry.role, entry.enabled)
                    .with_locked(entry.locked)
                    .with_applies_to_self(entry.applies_to_self)
                    .with_applies_to_descendants(entry.applies_to_descendants);
            role_override.derive_root_account(account);
            store
                .insert_override(account.shard, role_override)
                .await
                .with_context(|| {
                    format!(
                        "Failed to load override {} for role {} on account {}",
                        entry.permission, entry.role, entry.account
                    )
                })?;
        }

        for (key, value) in &self.settings {
            store.set_global_setting(key, value);
        }
        for entry in &self.account_settings {
            store.set_account_setting(entry.account, &entry.key, entry.value.clone());
        }
        for (name, enabled) in &self.plugins {
            plugins.register(name, *enabled);
        }
        Ok(())
    }
}

fn lookup<'a>(accounts: &'a HashMap<AccountId, Account>, id: AccountId, what: &str) -> Result<&'a Account> {
    accounts
        .get(&id)
        .with_context(|| format!("{} refers to unknown account {}", what, id))
}
