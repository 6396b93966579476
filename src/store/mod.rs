//! Collaborator interfaces the engine consumes.
//!
//! The engine never owns persistence. Entity lookups, override CRUD, settings and
//! plugin state all come through these traits; [`memory::MemoryStore`] implements
//! every one of them for embedding and tests.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{
    Account, AccountId, BaseRoleType, Course, CourseId, Group, GroupId, OverrideId, Role,
    RoleId, RoleOverride, ShardId,
};

pub use memory::MemoryStore;

/// Organization tree and entity lookups.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn account(&self, id: AccountId) -> Result<Option<Account>>;

    async fn course(&self, id: CourseId) -> Result<Option<Course>>;

    async fn group(&self, id: GroupId) -> Result<Option<Group>>;

    async fn role(&self, id: RoleId) -> Result<Option<Role>>;

    /// The singleton built-in role of `base` for a root account.
    async fn built_in_role(
        &self,
        base: BaseRoleType,
        root_account_id: AccountId,
    ) -> Result<Option<Role>>;
}

/// Sharded role override persistence.
///
/// Every call names the shard that owns the data. Implementations must fail with
/// [`crate::Error::ShardUnavailable`] rather than return an empty answer for a
/// partition they cannot reach.
#[async_trait]
pub trait OverrideStore: Send + Sync {
    /// All overrides for `role` stored on `shard`, across every account there.
    async fn overrides_for_role(&self, shard: ShardId, role: RoleId) -> Result<Vec<RoleOverride>>;

    /// The override at exactly (account, permission, role), if any.
    async fn find_override(
        &self,
        shard: ShardId,
        account: AccountId,
        permission: &str,
        role: RoleId,
    ) -> Result<Option<RoleOverride>>;

    /// Persist a new override and return it with its id assigned. Fails with
    /// [`crate::Error::Conflict`] if the (account, permission, role) triple is taken.
    async fn insert_override(&self, shard: ShardId, role_override: RoleOverride)
    -> Result<RoleOverride>;

    async fn update_override(&self, shard: ShardId, role_override: &RoleOverride) -> Result<()>;

    /// Returns whether a row was removed.
    async fn delete_override(&self, shard: ShardId, id: OverrideId) -> Result<bool>;

    /// Bump the role's modification marker. Returns the new generation.
    async fn touch_role(&self, role: RoleId) -> Result<u64>;
}

/// Key-value settings.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// A setting on a root account.
    async fn account_setting(
        &self,
        root_account_id: AccountId,
        key: &str,
    ) -> Result<Option<serde_json::Value>>;

    /// A process-wide setting.
    async fn global_setting(&self, key: &str) -> Result<Option<String>>;
}

/// Plugin and feature enablement.
#[async_trait]
pub trait PluginProvider: Send + Sync {
    async fn plugin_enabled(&self, plugin: &str, root_account_id: Option<AccountId>)
    -> Result<bool>;
}
