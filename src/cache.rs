//! Per-role override tables, memoized across the partitions an ancestor chain spans.
//!
//! A table holds every override a role has on a set of shards, indexed by
//! permission and account. Keys carry the role's generation and a per-role
//! epoch. [`OverrideCache::invalidate_role`] bumps the epoch before dropping
//! entries, so a load that began before a write lands under a key no reader
//! asks for again.

use moka::future::Cache;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;
use crate::model::{AccountId, Role, RoleId, RoleOverride, ShardId};
use crate::store::OverrideStore;

/// Cache key: one role, at one generation and epoch, over one set of partitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableKey {
    pub role: RoleId,
    pub generation: u64,
    pub epoch: u64,
    pub shards: Vec<ShardId>,
}

impl TableKey {
    pub fn new(role: &Role, epoch: u64, shards: &[ShardId]) -> Self {
        let mut shards = shards.to_vec();
        shards.sort();
        shards.dedup();
        Self {
            role: role.id,
            generation: role.generation,
            epoch,
            shards,
        }
    }
}

/// A role's overrides indexed by permission, then account.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OverrideTable {
    by_permission: HashMap<String, HashMap<AccountId, RoleOverride>>,
}

impl OverrideTable {
    pub fn from_overrides(overrides: impl IntoIterator<Item = RoleOverride>) -> Self {
        let mut by_permission: HashMap<String, HashMap<AccountId, RoleOverride>> = HashMap::new();
        for role_override in overrides {
            by_permission
                .entry(role_override.permission.clone())
                .or_default()
                .insert(role_override.account_id, role_override);
        }
        Self { by_permission }
    }

    pub fn get(&self, permission: &str, account: AccountId) -> Option<&RoleOverride> {
        self.by_permission.get(permission)?.get(&account)
    }

    pub fn len(&self) -> usize {
        self.by_permission.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct OverrideCache {
    store: Arc<dyn OverrideStore>,
    tables: Cache<TableKey, Arc<OverrideTable>>,
    epochs: RwLock<HashMap<RoleId, u64>>,
    enabled: bool,
    computations: AtomicU64,
}

impl OverrideCache {
    pub fn new(store: Arc<dyn OverrideStore>, enabled: bool, capacity: u64, ttl: Duration) -> Self {
        let tables = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .support_invalidation_closures()
            .build();
        Self {
            store,
            tables,
            epochs: RwLock::new(HashMap::new()),
            enabled,
            computations: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The role's override table over `shards`.
    ///
    /// Concurrent misses on the same key share one load. With `bypass` (or the
    /// cache disabled) the table is loaded fresh and not stored.
    pub async fn table(&self, role: &Role, shards: &[ShardId], bypass: bool) -> Result<Arc<OverrideTable>> {
        let key = TableKey::new(role, self.epoch(role.id), shards);
        if bypass || !self.enabled {
            return self.load(&key).await.map(Arc::new);
        }
        if let Some(table) = self.tables.get(&key).await {
            debug!(role = %key.role, generation = key.generation, epoch = key.epoch, "override table cache hit");
            return Ok(table);
        }
        self.tables
            .try_get_with(key.clone(), async { self.load(&key).await.map(Arc::new) })
            .await
            .map_err(|e| (*e).clone())
    }

    async fn load(&self, key: &TableKey) -> Result<OverrideTable> {
        self.computations.fetch_add(1, Ordering::SeqCst);
        let mut overrides = Vec::new();
        for shard in &key.shards {
            let found = self.store.overrides_for_role(*shard, key.role).await?;
            debug!(role = %key.role, %shard, count = found.len(), "loaded overrides from shard");
            overrides.extend(found);
        }
        Ok(OverrideTable::from_overrides(overrides))
    }

    fn epoch(&self, role: RoleId) -> u64 {
        self.epochs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&role)
            .copied()
            .unwrap_or(0)
    }

    /// Drop every table for `role`, whatever its generation or shards.
    ///
    /// Loads still in flight finish under the previous epoch and are never read.
    pub fn invalidate_role(&self, role: RoleId) {
        let epoch = {
            let mut epochs = self.epochs.write().unwrap_or_else(PoisonError::into_inner);
            let epoch = epochs.entry(role).or_default();
            *epoch += 1;
            *epoch
        };
        debug!(%role, epoch, "invalidating override tables");
        if let Err(e) = self.tables.invalidate_entries_if(move |key, _| key.role == role) {
            warn!(%role, error = %e, "predicate invalidation failed, clearing all tables");
            self.tables.invalidate_all();
        }
    }

    pub fn invalidate_all(&self) {
        self.tables.invalidate_all();
    }

    /// Number of table loads performed so far.
    pub fn computations(&self) -> u64 {
        self.computations.load(Ordering::SeqCst)
    }
}
