//! The fold that turns a registry default and a role's overrides into the
//! effective value at one context.
//!
//! Nothing here performs I/O. The engine gathers the chain, the override table and
//! the starting value, then calls [`fold`].

use serde::Serialize;

use crate::cache::OverrideTable;
use crate::model::{AccountId, BaseRoleType, Context, RoleId};
use crate::scope::AppliesTo;
use crate::tree::AncestorChain;

/// Inputs to one fold.
pub struct Fold<'a> {
    pub permission: &'a str,
    pub chain: &'a AncestorChain,
    pub overrides: &'a OverrideTable,
    /// Value before the first node: the registry default for the role.
    pub start: AppliesTo,
    /// Overrides on accounts belonging to this root are skipped.
    pub skip_root: Option<AccountId>,
}

/// Fold state after the terminal step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub enabled: AppliesTo,
    pub locked: bool,
    pub explicit: bool,
    pub prior_default: bool,
    pub readonly: bool,
    pub inherited: AppliesTo,
    pub source_account: Option<AccountId>,
}

impl Outcome {
    /// The permission cannot be granted to this role here at all.
    pub fn blocked() -> Self {
        Self {
            enabled: AppliesTo::NONE,
            locked: true,
            explicit: false,
            prior_default: true,
            readonly: true,
            inherited: AppliesTo::NONE,
            source_account: None,
        }
    }
}

/// Walk the chain root to leaf.
///
/// A lock stops every override below the node that set it. Below the role-context
/// boundary an override can only widen the value. Scope masking happens through
/// [`AppliesTo::carried_to_child`] on each step down, so only the winning value's
/// scope shows in the result.
pub fn fold(input: &Fold<'_>) -> Outcome {
    let chain = input.chain;
    let terminal = chain.terminal_index();
    let boundary = chain.boundary_index();

    let mut enabled = input.start;
    let mut locked = false;
    let mut lock_owner: Option<usize> = None;
    let mut explicit = false;
    let mut prior_default = true;
    let mut inherited = input.start;
    let mut source_account = None;

    for (index, account) in chain.accounts().iter().enumerate() {
        if index > 0 {
            enabled = enabled.carried_to_child();
        }
        let previous = enabled;
        explicit = false;
        prior_default = true;
        inherited = previous;

        if locked {
            continue;
        }
        if input.skip_root == Some(account.root_account_id) {
            continue;
        }
        let Some(role_override) = input.overrides.get(input.permission, account.id) else {
            continue;
        };

        let value = role_override.effective();
        enabled = if boundary.is_some_and(|b| b < index) {
            previous.union(value)
        } else {
            value
        };
        if role_override.locked {
            locked = true;
            lock_owner = Some(index);
        }
        explicit = terminal == Some(index);
        prior_default = enabled == previous;
        source_account = Some(account.id);
    }

    if chain.has_leaf_below() {
        enabled = enabled.carried_to_child();
        explicit = false;
        prior_default = true;
        inherited = enabled;
    }

    Outcome {
        enabled,
        locked,
        explicit,
        prior_default,
        readonly: lock_owner.is_some_and(|owner| Some(owner) != terminal),
        inherited,
        source_account,
    }
}

/// Result of `permission_for`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedPermission {
    pub permission: String,
    pub context: Context,
    pub role_id: RoleId,
    pub base_role_type: BaseRoleType,
    /// Where the permission applies from this context: `[]`, `[self]`,
    /// `[descendants]` or `[self, descendants]`.
    pub enabled: AppliesTo,
    pub locked: bool,
    /// An override exists at exactly this context.
    pub explicit: bool,
    /// The value did not change at this context's step.
    pub prior_default: bool,
    /// Cannot be changed here: locked by an ancestor or unavailable to the role.
    pub readonly: bool,
    pub account_allows: bool,
    /// The value this context would have without its own override.
    pub inherited: AppliesTo,
    /// Account whose override produced the value, if any.
    pub source_account: Option<AccountId>,
}

impl ResolvedPermission {
    pub(crate) fn from_outcome(
        permission: &str,
        context: Context,
        role_id: RoleId,
        base_role_type: BaseRoleType,
        account_allows: bool,
        outcome: Outcome,
    ) -> Self {
        Self {
            permission: permission.to_string(),
            context,
            role_id,
            base_role_type,
            enabled: outcome.enabled,
            locked: outcome.locked,
            explicit: outcome.explicit,
            prior_default: outcome.prior_default,
            readonly: outcome.readonly,
            account_allows,
            inherited: outcome.inherited,
            source_account: outcome.source_account,
        }
    }

    /// Would a grant check at this context succeed.
    pub fn is_grantable(&self) -> bool {
        self.account_allows && self.enabled.includes_self()
    }
}
