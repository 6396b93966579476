//! In-memory, sharded implementation of the collaborator traits.
//!
//! Entities live in one directory; role overrides live in per-shard partitions.
//! A shard can be marked unavailable to exercise failure propagation, and an
//! artificial latency can be set on override fetches and account lookups.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::debug;

use super::{ContextProvider, OverrideStore, SettingsStore};
use crate::error::{Error, Result};
use crate::model::{
    Account, AccountId, BaseRoleType, Course, CourseId, Group, GroupId, OverrideId, Role,
    RoleId, RoleOverride, ShardId,
};

#[derive(Default)]
struct Directory {
    accounts: HashMap<AccountId, Account>,
    courses: HashMap<CourseId, Course>,
    groups: HashMap<GroupId, Group>,
    roles: HashMap<RoleId, Role>,
}

#[derive(Default)]
struct Partition {
    overrides: BTreeMap<OverrideId, RoleOverride>,
}

#[derive(Default)]
struct Settings {
    global: HashMap<String, String>,
    accounts: HashMap<(AccountId, String), serde_json::Value>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Shared-nothing store for tests, fixtures and single-process embedding.
pub struct MemoryStore {
    directory: RwLock<Directory>,
    partitions: RwLock<HashMap<ShardId, Partition>>,
    settings: RwLock<Settings>,
    unavailable: RwLock<HashSet<ShardId>>,
    next_id: AtomicU64,
    override_fetches: AtomicUsize,
    latency: Option<Duration>,
    account_latency: Option<Duration>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            directory: RwLock::new(Directory::default()),
            partitions: RwLock::new(HashMap::new()),
            settings: RwLock::new(Settings::default()),
            unavailable: RwLock::new(HashSet::new()),
            next_id: AtomicU64::new(1),
            override_fetches: AtomicUsize::new(0),
            latency: None,
            account_latency: None,
        }
    }

    /// Delay every `overrides_for_role` call, simulating a remote partition.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Delay every `account` lookup, simulating a slow directory.
    pub fn with_account_latency(mut self, latency: Duration) -> Self {
        self.account_latency = Some(latency);
        self
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn reserve_id(&self, id: u64) {
        self.next_id.fetch_max(id + 1, Ordering::SeqCst);
    }

    // === Directory setup ===

    pub fn add_account(&self, account: Account) -> Account {
        self.reserve_id(account.id.0);
        write(&self.directory)
            .accounts
            .insert(account.id, account.clone());
        account
    }

    pub fn create_root_account(&self, name: &str, shard: ShardId) -> Account {
        let id = AccountId(self.allocate_id());
        self.add_account(Account::root(id, name, shard))
    }

    pub fn create_sub_account(&self, name: &str, parent: &Account) -> Account {
        let id = AccountId(self.allocate_id());
        self.add_account(Account::sub_account(id, name, parent))
    }

    pub fn add_course(&self, course: Course) -> Course {
        self.reserve_id(course.id.0);
        write(&self.directory)
            .courses
            .insert(course.id, course.clone());
        course
    }

    pub fn create_course(&self, name: &str, account: &Account) -> Course {
        let id = CourseId(self.allocate_id());
        self.add_course(Course::new(id, name, account))
    }

    pub fn add_group(&self, group: Group) -> Group {
        self.reserve_id(group.id.0);
        write(&self.directory).groups.insert(group.id, group.clone());
        group
    }

    pub fn add_role(&self, role: Role) -> Role {
        self.reserve_id(role.id.0);
        write(&self.directory).roles.insert(role.id, role.clone());
        role
    }

    pub fn create_custom_role(&self, name: &str, base: BaseRoleType, account: &Account) -> Role {
        let id = RoleId(self.allocate_id());
        self.add_role(Role::custom(id, name, base, account))
    }

    /// The built-in role of `base` for a root account, created on first use.
    pub fn built_in_role_for(&self, base: BaseRoleType, root_account_id: AccountId) -> Role {
        let existing = read(&self.directory)
            .roles
            .values()
            .find(|r| r.built_in && r.base_role_type == base && r.root_account_id == root_account_id)
            .cloned();
        match existing {
            Some(role) => role,
            None => {
                let id = RoleId(self.allocate_id());
                self.add_role(Role::built_in(id, base, root_account_id))
            }
        }
    }

    /// Move an account (and its subtree) under a new parent.
    ///
    /// Callers must also signal the engine (`PermissionEngine::touch_account`) so cached
    /// ancestor chains through this account are dropped.
    pub fn reparent_account(&self, id: AccountId, new_parent: AccountId) -> Result<Account> {
        let mut directory = write(&self.directory);
        let parent = directory
            .accounts
            .get(&new_parent)
            .cloned()
            .ok_or_else(|| Error::not_found("account", new_parent))?;

        let mut cursor = Some(parent.id);
        while let Some(ancestor) = cursor {
            if ancestor == id {
                return Err(Error::InvalidTree {
                    account: id,
                    reason: format!("moving under {} would create a cycle", new_parent),
                });
            }
            cursor = directory.accounts.get(&ancestor).and_then(|a| a.parent_id);
        }

        let old_root = {
            let account = directory
                .accounts
                .get_mut(&id)
                .ok_or_else(|| Error::not_found("account", id))?;
            let old_root = account.root_account_id;
            account.parent_id = Some(parent.id);
            account.root_account_id = parent.root_account_id;
            old_root
        };

        if old_root != parent.root_account_id {
            let moved: Vec<AccountId> = directory
                .accounts
                .keys()
                .copied()
                .filter(|candidate| descends_from(&directory.accounts, *candidate, id))
                .collect();
            for account_id in moved {
                if let Some(account) = directory.accounts.get_mut(&account_id) {
                    account.root_account_id = parent.root_account_id;
                }
            }
        }

        directory
            .accounts
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("account", id))
    }

    // === Settings ===

    pub fn set_global_setting(&self, key: &str, value: &str) {
        write(&self.settings)
            .global
            .insert(key.to_string(), value.to_string());
    }

    pub fn set_account_setting(&self, root_account_id: AccountId, key: &str, value: serde_json::Value) {
        write(&self.settings)
            .accounts
            .insert((root_account_id, key.to_string()), value);
    }

    // === Partitions ===

    pub fn set_shard_available(&self, shard: ShardId, available: bool) {
        let mut unavailable = write(&self.unavailable);
        if available {
            unavailable.remove(&shard);
        } else {
            unavailable.insert(shard);
        }
    }

    fn check_shard(&self, shard: ShardId) -> Result<()> {
        if read(&self.unavailable).contains(&shard) {
            return Err(Error::ShardUnavailable {
                shard,
                message: "partition is offline".to_string(),
            });
        }
        Ok(())
    }

    /// Number of `overrides_for_role` calls served so far.
    pub fn override_fetch_count(&self) -> usize {
        self.override_fetches.load(Ordering::SeqCst)
    }

    /// Every stored override on a shard.
    pub fn overrides_on(&self, shard: ShardId) -> Vec<RoleOverride> {
        read(&self.partitions)
            .get(&shard)
            .map(|p| p.overrides.values().cloned().collect())
            .unwrap_or_default()
    }
}

fn descends_from(accounts: &HashMap<AccountId, Account>, candidate: AccountId, ancestor: AccountId) -> bool {
    let mut cursor = Some(candidate);
    let mut steps = 0;
    while let Some(id) = cursor {
        if id == ancestor {
            return true;
        }
        steps += 1;
        if steps > accounts.len() {
            return false;
        }
        cursor = accounts.get(&id).and_then(|a| a.parent_id);
    }
    false
}

#[async_trait]
impl ContextProvider for MemoryStore {
    async fn account(&self, id: AccountId) -> Result<Option<Account>> {
        if let Some(latency) = self.account_latency {
            tokio::time::sleep(latency).await;
        }
        Ok(read(&self.directory).accounts.get(&id).cloned())
    }

    async fn course(&self, id: CourseId) -> Result<Option<Course>> {
        Ok(read(&self.directory).courses.get(&id).cloned())
    }

    async fn group(&self, id: GroupId) -> Result<Option<Group>> {
        Ok(read(&self.directory).groups.get(&id).cloned())
    }

    async fn role(&self, id: RoleId) -> Result<Option<Role>> {
        Ok(read(&self.directory).roles.get(&id).cloned())
    }

    async fn built_in_role(
        &self,
        base: BaseRoleType,
        root_account_id: AccountId,
    ) -> Result<Option<Role>> {
        Ok(read(&self.directory)
            .roles
            .values()
            .find(|r| r.built_in && r.base_role_type == base && r.root_account_id == root_account_id)
            .cloned())
    }
}

#[async_trait]
impl OverrideStore for MemoryStore {
    async fn overrides_for_role(&self, shard: ShardId, role: RoleId) -> Result<Vec<RoleOverride>> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.check_shard(shard)?;
        self.override_fetches.fetch_add(1, Ordering::SeqCst);

        let overrides: Vec<RoleOverride> = read(&self.partitions)
            .get(&shard)
            .map(|p| {
                p.overrides
                    .values()
                    .filter(|o| o.role_id == role)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        debug!(%shard, %role, count = overrides.len(), "served role overrides");
        Ok(overrides)
    }

    async fn find_override(
        &self,
        shard: ShardId,
        account: AccountId,
        permission: &str,
        role: RoleId,
    ) -> Result<Option<RoleOverride>> {
        self.check_shard(shard)?;
        Ok(read(&self.partitions).get(&shard).and_then(|p| {
            p.overrides
                .values()
                .find(|o| o.account_id == account && o.permission == permission && o.role_id == role)
                .cloned()
        }))
    }

    async fn insert_override(
        &self,
        shard: ShardId,
        mut role_override: RoleOverride,
    ) -> Result<RoleOverride> {
        self.check_shard(shard)?;
        let mut partitions = write(&self.partitions);
        let partition = partitions.entry(shard).or_default();

        let taken = partition.overrides.values().any(|o| {
            o.account_id == role_override.account_id
                && o.permission == role_override.permission
                && o.role_id == role_override.role_id
        });
        if taken {
            return Err(Error::Conflict {
                account: role_override.account_id,
                permission: role_override.permission.clone(),
                role: role_override.role_id,
            });
        }

        let id = OverrideId(self.allocate_id());
        role_override.id = Some(id);
        partition.overrides.insert(id, role_override.clone());
        Ok(role_override)
    }

    async fn update_override(&self, shard: ShardId, role_override: &RoleOverride) -> Result<()> {
        self.check_shard(shard)?;
        let id = role_override
            .id
            .ok_or_else(|| Error::Store("cannot update an unsaved role override".to_string()))?;
        let mut partitions = write(&self.partitions);
        let stored = partitions
            .get_mut(&shard)
            .and_then(|p| p.overrides.get_mut(&id))
            .ok_or_else(|| Error::not_found("role override", id))?;
        *stored = role_override.clone();
        Ok(())
    }

    async fn delete_override(&self, shard: ShardId, id: OverrideId) -> Result<bool> {
        self.check_shard(shard)?;
        Ok(write(&self.partitions)
            .get_mut(&shard)
            .and_then(|p| p.overrides.remove(&id))
            .is_some())
    }

    async fn touch_role(&self, role: RoleId) -> Result<u64> {
        let mut directory = write(&self.directory);
        let stored = directory
            .roles
            .get_mut(&role)
            .ok_or_else(|| Error::not_found("role", role))?;
        stored.generation += 1;
        stored.updated_at = Utc::now();
        Ok(stored.generation)
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn account_setting(
        &self,
        root_account_id: AccountId,
        key: &str,
    ) -> Result<Option<serde_json::Value>> {
        Ok(read(&self.settings)
            .accounts
            .get(&(root_account_id, key.to_string()))
            .cloned())
    }

    async fn global_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(read(&self.settings).global.get(key).cloned())
    }
}
