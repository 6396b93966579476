//! The permission engine.
//!
//! Ties the registry, the context tree, the override cache and the fold together
//! behind the query and mutation entry points. Every mutation touches the role and
//! invalidates its cached tables before returning.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::{OverrideCache, OverrideTable};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::model::{Account, AccountId, BaseRoleType, Context, Role, RoleId, RoleOverride};
use crate::registry::{AccountOnly, AllowList, PermissionDefinition, PermissionRegistry, Predicate, PredicateEnv};
use crate::resolution::{Fold, Outcome, ResolvedPermission, fold};
use crate::scope::AppliesTo;
use crate::store::{ContextProvider, OverrideStore, PluginProvider, SettingsStore};
use crate::tree::ContextTreeResolver;

/// The external services the engine reads and writes through.
#[derive(Clone)]
pub struct Collaborators {
    pub contexts: Arc<dyn ContextProvider>,
    pub overrides: Arc<dyn OverrideStore>,
    pub settings: Arc<dyn SettingsStore>,
    pub plugins: Arc<dyn PluginProvider>,
}

impl Collaborators {
    /// Use one store for entities, overrides and settings.
    pub fn from_store<S>(store: Arc<S>, plugins: Arc<dyn PluginProvider>) -> Self
    where
        S: ContextProvider + OverrideStore + SettingsStore + 'static,
    {
        Self {
            contexts: store.clone(),
            overrides: store.clone(),
            settings: store,
            plugins,
        }
    }
}

/// Per-call options for [`PermissionEngine::permission_for`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Where the role is held. Defaults to the queried context.
    pub role_context: Option<Context>,
    /// Skip both reading and writing the caches.
    pub bypass_cache: bool,
}

impl ResolveOptions {
    pub fn with_role_context(mut self, role_context: Context) -> Self {
        self.role_context = Some(role_context);
        self
    }

    pub fn uncached(mut self) -> Self {
        self.bypass_cache = true;
        self
    }
}

/// Fields to change in [`PermissionEngine::manage_override`]. `None` leaves a field alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverrideChange {
    pub enabled: Option<bool>,
    pub locked: Option<bool>,
}

impl OverrideChange {
    pub fn new(enabled: Option<bool>, locked: Option<bool>) -> Self {
        Self { enabled, locked }
    }

    pub fn enabled(enabled: bool) -> Self {
        Self::new(Some(enabled), None)
    }

    pub fn locked(locked: bool) -> Self {
        Self::new(None, Some(locked))
    }

    /// Whether the override should exist after applying this change.
    fn keeps_override(&self) -> bool {
        self.enabled.is_some() || self.locked == Some(true)
    }
}

/// How the custom site-admin role allow-list affects one resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllowListGate {
    NotApplicable,
    /// Listed role outside site admin: starts from account admin defaults.
    Listed,
    /// Unlisted role: disabled, site-admin overrides ignored.
    Unlisted,
}

pub struct PermissionEngine {
    registry: Arc<PermissionRegistry>,
    collaborators: Collaborators,
    tree: ContextTreeResolver,
    cache: OverrideCache,
    config: EngineConfig,
}

impl PermissionEngine {
    pub fn new(collaborators: Collaborators, config: EngineConfig) -> Self {
        let tree = ContextTreeResolver::new(
            collaborators.contexts.clone(),
            config.engine.site_admin_account_id,
            config.engine.max_chain_depth,
            config.cache.chain_capacity,
            config.cache.ttl(),
        );
        let cache = OverrideCache::new(
            collaborators.overrides.clone(),
            config.cache.enabled,
            config.cache.table_capacity,
            config.cache.ttl(),
        );
        Self {
            registry: Arc::new(PermissionRegistry::builtin()),
            collaborators,
            tree,
            cache,
            config,
        }
    }

    /// Replace the built-in permission catalog.
    pub fn with_registry(mut self, registry: Arc<PermissionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &PermissionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of override table loads so far.
    pub fn computations(&self) -> u64 {
        self.cache.computations()
    }

    /// The effective value of `permission` for `role` at `context`.
    pub async fn permission_for(
        &self,
        context: Context,
        permission: &str,
        role: &Role,
        options: ResolveOptions,
    ) -> Result<ResolvedPermission> {
        let definition = self.registry.definition_for(permission)?;
        let role_context = options.role_context.unwrap_or(context);
        let bypass = options.bypass_cache || !self.cache.is_enabled();

        let chain = self
            .tree
            .ancestor_chain(context, role_context, role, bypass)
            .await?;
        let allow_list = self.allow_list().await?;
        let env = PredicateEnv {
            root_account: chain.root_account_id(),
            role: Some(role),
            settings: self.collaborators.settings.as_ref(),
            plugins: self.collaborators.plugins.as_ref(),
            allow_list: &allow_list,
        };
        let account_allows = definition.account_allows.evaluate(&env).await?;
        let resolved = |outcome: Outcome| {
            ResolvedPermission::from_outcome(
                definition.key,
                context,
                role.id,
                role.base_role_type,
                account_allows,
                outcome,
            )
        };

        if let Some(scope) = definition.account_only
            && !self.account_only_permits(scope, role_context).await?
        {
            debug!(permission, %role_context, ?scope, "account-only permission outside its scope");
            return Ok(resolved(Outcome::blocked()));
        }

        let gate = self.allow_list_gate(definition, role, &env).await?;
        let base = match gate {
            AllowListGate::Listed => BaseRoleType::AccountAdmin,
            _ => role.base_role_type,
        };
        if !definition.is_available_to(base) {
            return Ok(resolved(Outcome::blocked()));
        }

        let (start, skip_root) = match gate {
            AllowListGate::Unlisted => (AppliesTo::NONE, self.tree.site_admin()),
            _ => (AppliesTo::from_bool(definition.default_for(base)), None),
        };

        let table = if chain.is_empty() {
            Arc::new(OverrideTable::default())
        } else {
            self.cache.table(role, &chain.shards(), bypass).await?
        };
        let outcome = fold(&Fold {
            permission: definition.key,
            chain: &chain,
            overrides: &table,
            start,
            skip_root,
        });
        debug!(
            permission,
            %context,
            role = %role.id,
            enabled = %outcome.enabled,
            locked = outcome.locked,
            "resolved permission"
        );
        Ok(resolved(outcome))
    }

    /// Where the permission applies when `context` itself is the point of use,
    /// masked by the account setting.
    pub async fn enabled_for(&self, context: Context, permission: &str, role: &Role) -> Result<AppliesTo> {
        let resolved = self
            .permission_for(context, permission, role, ResolveOptions::default())
            .await?;
        Ok(resolved.enabled.when(resolved.account_allows))
    }

    /// Create, partially update or delete the override at exactly
    /// (account, permission, role).
    ///
    /// With neither a value nor a truthy lock the override is removed (or never
    /// created) and `None` is returned.
    pub async fn manage_override(
        &self,
        account: AccountId,
        role: &Role,
        permission: &str,
        change: OverrideChange,
    ) -> Result<Option<RoleOverride>> {
        let definition = self.registry.definition_for(permission)?;
        let account = self.load_account(account).await?;
        let overrides = &self.collaborators.overrides;
        let existing = overrides
            .find_override(account.shard, account.id, definition.key, role.id)
            .await?;

        let result = match existing {
            Some(existing) if !change.keeps_override() => {
                if let Some(id) = existing.id {
                    overrides.delete_override(account.shard, id).await?;
                }
                info!(account = %account.id, permission, role = %role.id, "deleted role override");
                None
            }
            Some(mut existing) => {
                if let Some(enabled) = change.enabled {
                    existing.enabled = enabled;
                }
                if let Some(locked) = change.locked {
                    existing.locked = locked;
                }
                existing.derive_root_account(&account);
                existing.updated_at = Utc::now();
                overrides.update_override(account.shard, &existing).await?;
                info!(account = %account.id, permission, role = %role.id, "updated role override");
                Some(existing)
            }
            None if !change.keeps_override() => return Ok(None),
            None => {
                let enabled = change
                    .enabled
                    .unwrap_or_else(|| definition.default_for(role.base_role_type));
                let mut created = RoleOverride::new(account.id, definition.key, role.id, enabled)
                    .with_locked(change.locked.unwrap_or(false));
                created.derive_root_account(&account);
                let created = overrides.insert_override(account.shard, created).await?;
                info!(account = %account.id, permission, role = %role.id, "created role override");
                Some(created)
            }
        };

        self.after_write(role.id).await?;
        Ok(result)
    }

    /// Persist an override as given, including its scope markers.
    pub async fn save_override(&self, mut role_override: RoleOverride) -> Result<RoleOverride> {
        self.registry.definition_for(&role_override.permission)?;
        let account = self.load_account(role_override.account_id).await?;
        role_override.derive_root_account(&account);
        role_override.updated_at = Utc::now();

        let overrides = &self.collaborators.overrides;
        let saved = if role_override.is_persisted() {
            overrides.update_override(account.shard, &role_override).await?;
            role_override
        } else {
            overrides.insert_override(account.shard, role_override).await?
        };
        info!(
            account = %saved.account_id,
            permission = %saved.permission,
            role = %saved.role_id,
            "saved role override"
        );

        self.after_write(saved.role_id).await?;
        Ok(saved)
    }

    /// Remove a persisted override. Returns whether a row was deleted.
    pub async fn delete_override(&self, role_override: &RoleOverride) -> Result<bool> {
        let Some(id) = role_override.id else {
            return Ok(false);
        };
        let account = self.load_account(role_override.account_id).await?;
        let deleted = self
            .collaborators
            .overrides
            .delete_override(account.shard, id)
            .await?;
        if deleted {
            info!(account = %account.id, override_id = %id, "deleted role override");
            self.after_write(role_override.role_id).await?;
        }
        Ok(deleted)
    }

    /// Permissions an administrator may manage at `context`, optionally limited to
    /// those available to `base`. Plugin gates are evaluated on every call.
    pub async fn manageable_permissions(
        &self,
        context: Context,
        base: Option<BaseRoleType>,
    ) -> Result<BTreeMap<&'static str, &'static PermissionDefinition>> {
        let (account, root_account) = match context {
            Context::Account(id) => {
                let account = self.load_account(id).await?;
                let root = account.root_account_id;
                (Some(account), Some(root))
            }
            Context::Course(id) => {
                let root = self.collaborators.contexts.course(id).await?.map(|c| c.root_account_id);
                (None, root)
            }
            Context::Group(id) => {
                let root = match self.collaborators.contexts.group(id).await?.and_then(|g| g.account_id) {
                    Some(owner) => self.collaborators.contexts.account(owner).await?.map(|a| a.root_account_id),
                    None => None,
                };
                (None, root)
            }
        };
        let is_site_admin = account.as_ref().is_some_and(|a| self.tree.is_site_admin(a.id));
        let is_root = account.as_ref().is_some_and(Account::is_root);

        let allow_list = self.allow_list().await?;
        let env = PredicateEnv {
            root_account,
            role: None,
            settings: self.collaborators.settings.as_ref(),
            plugins: self.collaborators.plugins.as_ref(),
            allow_list: &allow_list,
        };

        let mut manageable = BTreeMap::new();
        for definition in self.registry.iter() {
            match definition.account_only {
                Some(AccountOnly::SiteAdmin) if !is_site_admin => continue,
                Some(AccountOnly::Root) if !is_root => continue,
                _ => {}
            }
            if base.is_some_and(|base| !definition.is_available_to(base)) {
                continue;
            }
            if !definition.account_allows.evaluate(&env).await? {
                continue;
            }
            if !definition.visible_when.evaluate(&env).await? {
                continue;
            }
            manageable.insert(definition.key, definition);
        }
        Ok(manageable)
    }

    /// Signal that an account moved or changed so cached chains through it are dropped.
    pub fn touch_account(&self, account: AccountId) {
        info!(%account, "account touched, dropping cached chains");
        self.tree.touch_account(account);
    }

    /// The configured custom site-admin role allow-list.
    pub async fn allow_list(&self) -> Result<AllowList> {
        let raw = self
            .collaborators
            .settings
            .global_setting(&self.config.engine.allowed_roles_setting)
            .await?;
        Ok(raw.as_deref().map(AllowList::parse).unwrap_or_default())
    }

    async fn after_write(&self, role: RoleId) -> Result<()> {
        self.collaborators.overrides.touch_role(role).await?;
        self.cache.invalidate_role(role);
        Ok(())
    }

    async fn load_account(&self, id: AccountId) -> Result<Account> {
        self.collaborators
            .contexts
            .account(id)
            .await?
            .ok_or_else(|| Error::not_found("account", id))
    }

    async fn account_only_permits(&self, scope: AccountOnly, role_context: Context) -> Result<bool> {
        let Context::Account(id) = role_context else {
            return Ok(false);
        };
        Ok(match scope {
            AccountOnly::Accounts => true,
            AccountOnly::Root => self.load_account(id).await?.is_root(),
            AccountOnly::SiteAdmin => self.tree.is_site_admin(id),
        })
    }

    async fn allow_list_gate(
        &self,
        definition: &PermissionDefinition,
        role: &Role,
        env: &PredicateEnv<'_>,
    ) -> Result<AllowListGate> {
        let Some(site_admin) = self.tree.site_admin() else {
            return Ok(AllowListGate::NotApplicable);
        };
        if definition.role_gate != Predicate::AllowListedRole
            || !env.allow_list.is_configured()
            || !role.is_custom_account_role()
            || role.root_account_id != site_admin
        {
            return Ok(AllowListGate::NotApplicable);
        }
        if !definition.role_gate.evaluate(env).await? {
            return Ok(AllowListGate::Unlisted);
        }
        if env.root_account == Some(site_admin) {
            Ok(AllowListGate::NotApplicable)
        } else {
            Ok(AllowListGate::Listed)
        }
    }
}
