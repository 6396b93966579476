//! Context tree resolution.
//!
//! Expands a context into its ancestor chain, root first. Account chains are
//! cached per account and dropped by [`ContextTreeResolver::touch_account`] when
//! any account on them is restructured. Each touch also advances an epoch that
//! is part of the cache key, so a chain loaded across a touch is never served.

use moka::future::Cache;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{Account, AccountId, Context, Role, ShardId};
use crate::store::ContextProvider;

/// Root-first accounts above (and including) a context's owning account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AncestorChain {
    accounts: Vec<Account>,
    context: Context,
    boundary: Option<usize>,
}

impl AncestorChain {
    /// A chain with no accounts: the context has no owning account.
    pub fn detached(context: Context) -> Self {
        Self {
            accounts: Vec::new(),
            context,
            boundary: None,
        }
    }

    pub fn new(accounts: Vec<Account>, context: Context, role_context: Context) -> Self {
        let boundary = accounts
            .iter()
            .position(|account| Context::Account(account.id) == role_context);
        Self {
            accounts,
            context,
            boundary,
        }
    }

    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    pub fn context(&self) -> Context {
        self.context
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    /// Index of the account that is the queried context itself.
    pub fn terminal_index(&self) -> Option<usize> {
        let last = self.accounts.len().checked_sub(1)?;
        (self.context == Context::Account(self.accounts[last].id)).then_some(last)
    }

    /// True when the context is a course or group hanging below the last account.
    pub fn has_leaf_below(&self) -> bool {
        !self.accounts.is_empty() && self.terminal_index().is_none()
    }

    /// Index of the role-context account, if it lies on the chain.
    pub fn boundary_index(&self) -> Option<usize> {
        self.boundary
    }

    /// Root account of the queried context (not of a prefixed site-admin account).
    pub fn root_account_id(&self) -> Option<AccountId> {
        self.accounts.last().map(|a| a.root_account_id)
    }

    /// Sorted, de-duplicated partitions the chain spans.
    pub fn shards(&self) -> Vec<ShardId> {
        let mut shards: Vec<ShardId> = self.accounts.iter().map(|a| a.shard).collect();
        shards.sort();
        shards.dedup();
        shards
    }
}

pub struct ContextTreeResolver {
    provider: Arc<dyn ContextProvider>,
    chains: Cache<(AccountId, u64), Arc<[Account]>>,
    epoch: AtomicU64,
    max_depth: usize,
    site_admin: Option<AccountId>,
}

impl ContextTreeResolver {
    pub fn new(
        provider: Arc<dyn ContextProvider>,
        site_admin: Option<AccountId>,
        max_depth: usize,
        capacity: u64,
        ttl: Duration,
    ) -> Self {
        let chains = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .support_invalidation_closures()
            .build();
        Self {
            provider,
            chains,
            epoch: AtomicU64::new(0),
            max_depth,
            site_admin,
        }
    }

    pub fn site_admin(&self) -> Option<AccountId> {
        self.site_admin
    }

    pub fn is_site_admin(&self, account: AccountId) -> bool {
        self.site_admin == Some(account)
    }

    /// The ancestor chain for `context`, marking `role_context` if it is on it.
    ///
    /// Roles owned by the site-admin root get the site-admin account prepended so
    /// its overrides reach every tree. Courses and groups without an owning account
    /// yield an empty chain.
    pub async fn ancestor_chain(
        &self,
        context: Context,
        role_context: Context,
        role: &Role,
        bypass_cache: bool,
    ) -> Result<AncestorChain> {
        let Some(owner) = self.owning_account(context).await? else {
            debug!(%context, "context has no owning account, resolving with an empty chain");
            return Ok(AncestorChain::detached(context));
        };

        let chain = self.account_chain(owner, bypass_cache).await?;
        let mut accounts = Vec::with_capacity(chain.len() + 1);

        if let Some(site_admin) = self.site_admin
            && role.root_account_id == site_admin
            && chain.first().is_some_and(|root| root.id != site_admin)
        {
            let prefix = self.account_chain(site_admin, bypass_cache).await?;
            accounts.extend(prefix.iter().cloned());
        }
        accounts.extend(chain.iter().cloned());

        Ok(AncestorChain::new(accounts, context, role_context))
    }

    async fn owning_account(&self, context: Context) -> Result<Option<AccountId>> {
        match context {
            Context::Account(id) => Ok(Some(id)),
            Context::Course(id) => Ok(self.provider.course(id).await?.map(|c| c.account_id)),
            Context::Group(id) => Ok(self.provider.group(id).await?.and_then(|g| g.account_id)),
        }
    }

    /// Root-first chain ending at `account`.
    pub async fn account_chain(&self, account: AccountId, bypass_cache: bool) -> Result<Arc<[Account]>> {
        if bypass_cache {
            return self.load_chain(account).await;
        }
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.chains
            .try_get_with((account, epoch), self.load_chain(account))
            .await
            .map_err(|e| (*e).clone())
    }

    async fn load_chain(&self, start: AccountId) -> Result<Arc<[Account]>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = Some(start);

        while let Some(id) = cursor {
            if !seen.insert(id) {
                return Err(Error::InvalidTree {
                    account: start,
                    reason: format!("cycle through account {}", id),
                });
            }
            if chain.len() >= self.max_depth {
                return Err(Error::InvalidTree {
                    account: start,
                    reason: format!("deeper than {} levels", self.max_depth),
                });
            }
            let account = match self.provider.account(id).await? {
                Some(account) => account,
                None if id == start => return Err(Error::not_found("account", id)),
                None => {
                    return Err(Error::InvalidTree {
                        account: start,
                        reason: format!("parent account {} does not exist", id),
                    });
                }
            };
            cursor = account.parent_id;
            chain.push(account);
        }

        chain.reverse();
        debug!(account = %start, depth = chain.len(), "loaded account chain");
        Ok(chain.into())
    }

    /// Drop every cached chain that passes through `account`.
    pub fn touch_account(&self, account: AccountId) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let result = self
            .chains
            .invalidate_entries_if(move |_, chain| chain.iter().any(|a| a.id == account));
        if let Err(e) = result {
            warn!(%account, error = %e, "predicate invalidation failed, clearing all chains");
            self.chains.invalidate_all();
        }
    }
}
