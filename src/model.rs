//! Records the engine reads and writes: accounts, courses, groups, roles and
//! role overrides, plus the typed identifiers that keep their id spaces apart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::scope::AppliesTo;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> u64 {
                u64::from(id.0)
            }
        }
    };
}

id_type!(
    /// Identifier of an account (organization unit).
    AccountId(u64)
);
id_type!(
    /// Identifier of a course. Shares no namespace with [`AccountId`].
    CourseId(u64)
);
id_type!(
    /// Identifier of a group (collaboration space).
    GroupId(u64)
);
id_type!(RoleId(u64));
id_type!(OverrideId(u64));
id_type!(
    /// Data partition. Every account, course and override lives on exactly one shard.
    ShardId(u32)
);

/// A node at which a permission is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum Context {
    Account(AccountId),
    Course(CourseId),
    Group(GroupId),
}

impl Context {
    /// The account id if this context is an account.
    pub fn as_account(&self) -> Option<AccountId> {
        match self {
            Context::Account(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Context::Account(id) => write!(f, "account:{}", id),
            Context::Course(id) => write!(f, "course:{}", id),
            Context::Group(id) => write!(f, "group:{}", id),
        }
    }
}

impl FromStr for Context {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| format!("Invalid context '{}'. Expected <kind>:<id>", s))?;
        let id: u64 = id
            .trim()
            .parse()
            .map_err(|_| format!("Invalid context id in '{}'", s))?;
        match kind.trim().to_lowercase().as_str() {
            "account" => Ok(Context::Account(AccountId(id))),
            "course" => Ok(Context::Course(CourseId(id))),
            "group" => Ok(Context::Group(GroupId(id))),
            other => Err(format!(
                "Unknown context kind '{}'. Valid options: account, course, group",
                other
            )),
        }
    }
}

/// An organization unit. Roots have no parent and are their own root account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub parent_id: Option<AccountId>,
    pub root_account_id: AccountId,
    pub shard: ShardId,
}

impl Account {
    /// Create a root account.
    pub fn root(id: AccountId, name: &str, shard: ShardId) -> Self {
        Self {
            id,
            name: name.to_string(),
            parent_id: None,
            root_account_id: id,
            shard,
        }
    }

    /// Create a sub-account of `parent`, on the parent's shard.
    pub fn sub_account(id: AccountId, name: &str, parent: &Account) -> Self {
        Self {
            id,
            name: name.to_string(),
            parent_id: Some(parent.id),
            root_account_id: parent.root_account_id,
            shard: parent.shard,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// A course. Treated as a leaf below its account when resolving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub id: CourseId,
    pub name: String,
    pub account_id: AccountId,
    pub root_account_id: AccountId,
    pub shard: ShardId,
}

impl Course {
    pub fn new(id: CourseId, name: &str, account: &Account) -> Self {
        Self {
            id,
            name: name.to_string(),
            account_id: account.id,
            root_account_id: account.root_account_id,
            shard: account.shard,
        }
    }
}

/// A group. Detached groups have no owning account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub account_id: Option<AccountId>,
    pub shard: ShardId,
}

/// Built-in role types. Every role, built-in or custom, has exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BaseRoleType {
    AccountAdmin,
    AccountMembership,
    TeacherEnrollment,
    TaEnrollment,
    DesignerEnrollment,
    StudentEnrollment,
    StudentViewEnrollment,
    ObserverEnrollment,
    /// Base type for roles that start with nothing enabled.
    NoPermissions,
}

impl BaseRoleType {
    pub const ALL: [BaseRoleType; 9] = [
        BaseRoleType::AccountAdmin,
        BaseRoleType::AccountMembership,
        BaseRoleType::TeacherEnrollment,
        BaseRoleType::TaEnrollment,
        BaseRoleType::DesignerEnrollment,
        BaseRoleType::StudentEnrollment,
        BaseRoleType::StudentViewEnrollment,
        BaseRoleType::ObserverEnrollment,
        BaseRoleType::NoPermissions,
    ];

    /// The type whose registry defaults this type uses.
    pub fn permission_base(self) -> BaseRoleType {
        match self {
            BaseRoleType::StudentViewEnrollment => BaseRoleType::StudentEnrollment,
            other => other,
        }
    }

    pub fn is_account_role(self) -> bool {
        matches!(
            self,
            BaseRoleType::AccountAdmin | BaseRoleType::AccountMembership
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BaseRoleType::AccountAdmin => "AccountAdmin",
            BaseRoleType::AccountMembership => "AccountMembership",
            BaseRoleType::TeacherEnrollment => "TeacherEnrollment",
            BaseRoleType::TaEnrollment => "TaEnrollment",
            BaseRoleType::DesignerEnrollment => "DesignerEnrollment",
            BaseRoleType::StudentEnrollment => "StudentEnrollment",
            BaseRoleType::StudentViewEnrollment => "StudentViewEnrollment",
            BaseRoleType::ObserverEnrollment => "ObserverEnrollment",
            BaseRoleType::NoPermissions => "NoPermissions",
        }
    }
}

impl fmt::Display for BaseRoleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BaseRoleType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        BaseRoleType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("Unknown base role type '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowState {
    #[default]
    Active,
    Inactive,
}

/// A role owned by a root account.
///
/// `generation` is the cache-busting marker: every override write for the role bumps
/// it (together with `updated_at`) in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub base_role_type: BaseRoleType,
    pub account_id: AccountId,
    pub root_account_id: AccountId,
    pub built_in: bool,
    #[serde(default)]
    pub workflow_state: WorkflowState,
    #[serde(default)]
    pub generation: u64,
    pub updated_at: DateTime<Utc>,
}

impl Role {
    /// The built-in role of `base` for a root account; named after its base type.
    pub fn built_in(id: RoleId, base: BaseRoleType, root_account_id: AccountId) -> Self {
        Self {
            id,
            name: base.as_str().to_string(),
            base_role_type: base,
            account_id: root_account_id,
            root_account_id,
            built_in: true,
            workflow_state: WorkflowState::Active,
            generation: 0,
            updated_at: Utc::now(),
        }
    }

    /// A custom role defined on `account`.
    pub fn custom(id: RoleId, name: &str, base: BaseRoleType, account: &Account) -> Self {
        Self {
            id,
            name: name.to_string(),
            base_role_type: base,
            account_id: account.id,
            root_account_id: account.root_account_id,
            built_in: false,
            workflow_state: WorkflowState::Active,
            generation: 0,
            updated_at: Utc::now(),
        }
    }

    /// A non-built-in account-level role.
    pub fn is_custom_account_role(&self) -> bool {
        !self.built_in && self.base_role_type.is_account_role()
    }
}

/// An explicit enable/disable/lock for (account, permission, role).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleOverride {
    /// `None` until persisted.
    pub id: Option<OverrideId>,
    pub account_id: AccountId,
    pub permission: String,
    pub role_id: RoleId,
    pub enabled: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default = "default_true")]
    pub applies_to_self: bool,
    #[serde(default = "default_true")]
    pub applies_to_descendants: bool,
    #[serde(default)]
    root_account_id: Option<AccountId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl RoleOverride {
    /// An unsaved, unlocked override that applies to the account and its descendants.
    pub fn new(
        account_id: AccountId,
        permission: &str,
        role_id: RoleId,
        enabled: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            account_id,
            permission: permission.to_string(),
            role_id,
            enabled,
            locked: false,
            applies_to_self: true,
            applies_to_descendants: true,
            root_account_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_locked(mut self, locked: bool) -> Self {
        self.locked = locked;
        self
    }

    pub fn with_applies_to_self(mut self, applies: bool) -> Self {
        self.applies_to_self = applies;
        self
    }

    pub fn with_applies_to_descendants(mut self, applies: bool) -> Self {
        self.applies_to_descendants = applies;
        self
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }

    /// Where this override's value is visible, ignoring `enabled`.
    pub fn applies_to(&self) -> AppliesTo {
        AppliesTo::from_flags(self.applies_to_self, self.applies_to_descendants)
    }

    /// The value this override contributes at its own account.
    pub fn effective(&self) -> AppliesTo {
        if self.enabled {
            self.applies_to()
        } else {
            AppliesTo::NONE
        }
    }

    pub fn root_account_id(&self) -> Option<AccountId> {
        self.root_account_id
    }

    /// Set the root account unconditionally.
    pub fn assign_root_account(&mut self, root_account_id: AccountId) {
        self.root_account_id = Some(root_account_id);
    }

    /// Fill the root account from the owning account, unless one is already set.
    /// Returns whether the value changed.
    pub fn derive_root_account(&mut self, account: &Account) -> bool {
        if self.root_account_id.is_some() {
            return false;
        }
        self.root_account_id = Some(account.root_account_id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_from_str() {
        assert_eq!(
            "account:7".parse::<Context>().unwrap(),
            Context::Account(AccountId(7))
        );
        assert_eq!(
            "Course:12".parse::<Context>().unwrap(),
            Context::Course(CourseId(12))
        );
        assert!("section:1".parse::<Context>().is_err());
        assert!("account".parse::<Context>().is_err());
        assert!("account:x".parse::<Context>().is_err());
    }

    #[test]
    fn test_course_and_account_with_same_number_differ() {
        assert_ne!(Context::Account(AccountId(1)), Context::Course(CourseId(1)));
        assert_eq!(Context::Course(CourseId(1)).as_account(), None);
    }

    #[test]
    fn test_base_role_type_round_trip_names() {
        for base in BaseRoleType::ALL {
            assert_eq!(base.as_str().parse::<BaseRoleType>().unwrap(), base);
        }
        assert!("Janitor".parse::<BaseRoleType>().is_err());
    }

    #[test]
    fn test_student_view_uses_student_defaults() {
        assert_eq!(
            BaseRoleType::StudentViewEnrollment.permission_base(),
            BaseRoleType::StudentEnrollment
        );
        assert_eq!(
            BaseRoleType::TaEnrollment.permission_base(),
            BaseRoleType::TaEnrollment
        );
    }

    #[test]
    fn test_derive_root_account_only_when_unset() {
        let root = Account::root(AccountId(1), "Root", ShardId(0));
        let sub = Account::sub_account(AccountId(2), "Sub", &root);

        let mut ov = RoleOverride::new(sub.id, "read_reports", RoleId(3), true);
        assert!(ov.derive_root_account(&sub));
        assert_eq!(ov.root_account_id(), Some(AccountId(1)));

        ov.assign_root_account(AccountId(99));
        assert!(!ov.derive_root_account(&sub));
        assert_eq!(ov.root_account_id(), Some(AccountId(99)));
    }

    #[test]
    fn test_override_effective_scope() {
        let ov = RoleOverride::new(AccountId(1), "read_forum", RoleId(1), true)
            .with_applies_to_self(false);
        assert_eq!(ov.effective(), AppliesTo::DESCENDANTS);

        let disabled = RoleOverride::new(AccountId(1), "read_forum", RoleId(1), false);
        assert_eq!(disabled.effective(), AppliesTo::NONE);
    }
}
