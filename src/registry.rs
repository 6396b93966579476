//! Static catalog of permission definitions.
//!
//! Definitions are plain data registered once for the process. Conditional
//! availability is described by [`Predicate`] values and evaluated live against
//! the settings and plugin collaborators, never captured at build time.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::error::{Error, Result};
use crate::model::{AccountId, BaseRoleType, Role};
use crate::store::{PluginProvider, SettingsStore};

use BaseRoleType::{
    AccountAdmin, AccountMembership, DesignerEnrollment, ObserverEnrollment, StudentEnrollment,
    TaEnrollment, TeacherEnrollment,
};

/// Where an account-only permission may be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountOnly {
    /// Any account, never a course or group.
    Accounts,
    /// Root accounts only.
    Root,
    /// The site-admin account only.
    SiteAdmin,
}

/// A condition attached to a definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Predicate {
    /// No condition.
    Always,
    /// A root-account setting that must be truthy.
    Setting(&'static str),
    /// A plugin that must be registered and enabled.
    PluginEnabled(&'static str),
    /// The role must be on the configured custom site-admin role allow-list.
    AllowListedRole,
}

/// Everything a predicate may consult.
pub struct PredicateEnv<'a> {
    pub root_account: Option<AccountId>,
    pub role: Option<&'a Role>,
    pub settings: &'a dyn SettingsStore,
    pub plugins: &'a dyn PluginProvider,
    pub allow_list: &'a AllowList,
}

impl Predicate {
    pub async fn evaluate(&self, env: &PredicateEnv<'_>) -> Result<bool> {
        match self {
            Predicate::Always => Ok(true),
            Predicate::Setting(key) => {
                let Some(root) = env.root_account else {
                    return Ok(false);
                };
                let value = env.settings.account_setting(root, key).await?;
                Ok(value.as_ref().is_some_and(setting_is_truthy))
            }
            Predicate::PluginEnabled(plugin) => {
                env.plugins.plugin_enabled(plugin, env.root_account).await
            }
            Predicate::AllowListedRole => {
                Ok(env.role.is_some_and(|role| env.allow_list.contains(&role.name)))
            }
        }
    }
}

fn setting_is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::String(s) => matches!(s.as_str(), "true" | "1" | "yes"),
        serde_json::Value::Number(n) => n.as_i64().is_some_and(|n| n != 0),
        _ => false,
    }
}

/// Custom site-admin role names, parsed from a comma-separated setting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    names: Vec<String>,
}

impl AllowList {
    pub fn parse(raw: &str) -> Self {
        let names = raw
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        Self { names }
    }

    /// An empty list means the gate is switched off.
    pub fn is_configured(&self) -> bool {
        !self.names.is_empty()
    }

    pub fn contains(&self, role_name: &str) -> bool {
        self.names.iter().any(|name| name == role_name)
    }
}

/// A registered permission.
#[derive(Debug, Clone, Serialize)]
pub struct PermissionDefinition {
    pub key: &'static str,
    pub label: &'static str,
    /// Base role types for which the permission is enabled by default.
    pub true_for: &'static [BaseRoleType],
    /// Base role types that may be granted the permission at all.
    pub available_to: &'static [BaseRoleType],
    pub account_only: Option<AccountOnly>,
    /// Evaluated against the querying context's root account.
    pub account_allows: Predicate,
    /// Whether the permission is surfaced for management (plugin gates).
    pub visible_when: Predicate,
    /// Extra condition on the role itself.
    pub role_gate: Predicate,
}

impl PermissionDefinition {
    const fn new(
        key: &'static str,
        label: &'static str,
        true_for: &'static [BaseRoleType],
        available_to: &'static [BaseRoleType],
    ) -> Self {
        Self {
            key,
            label,
            true_for,
            available_to,
            account_only: None,
            account_allows: Predicate::Always,
            visible_when: Predicate::Always,
            role_gate: Predicate::Always,
        }
    }

    const fn account_only(mut self, scope: AccountOnly) -> Self {
        self.account_only = Some(scope);
        self
    }

    const fn account_allows(mut self, predicate: Predicate) -> Self {
        self.account_allows = predicate;
        self
    }

    const fn visible_when(mut self, predicate: Predicate) -> Self {
        self.visible_when = predicate;
        self
    }

    const fn role_gate(mut self, predicate: Predicate) -> Self {
        self.role_gate = predicate;
        self
    }

    /// Registry default for a base role type.
    pub fn default_for(&self, base: BaseRoleType) -> bool {
        self.true_for.contains(&base.permission_base())
    }

    pub fn is_available_to(&self, base: BaseRoleType) -> bool {
        self.available_to.contains(&base.permission_base())
    }
}

const ADMIN: &[BaseRoleType] = &[AccountAdmin];
const ACCOUNT_ROLES: &[BaseRoleType] = &[AccountAdmin, AccountMembership];
const NONE: &[BaseRoleType] = &[];
const ALL_ROLES: &[BaseRoleType] = &[
    AccountAdmin,
    AccountMembership,
    TeacherEnrollment,
    TaEnrollment,
    DesignerEnrollment,
    StudentEnrollment,
    ObserverEnrollment,
];
const INSTRUCTORS: &[BaseRoleType] = &[AccountAdmin, TeacherEnrollment, TaEnrollment, DesignerEnrollment];
const ALL_BUT_OBSERVERS: &[BaseRoleType] = &[
    AccountAdmin,
    TeacherEnrollment,
    TaEnrollment,
    DesignerEnrollment,
    StudentEnrollment,
];
const ALL_ENROLLED: &[BaseRoleType] = &[
    AccountAdmin,
    TeacherEnrollment,
    TaEnrollment,
    DesignerEnrollment,
    StudentEnrollment,
    ObserverEnrollment,
];
const STAFF: &[BaseRoleType] = &[
    AccountAdmin,
    AccountMembership,
    TeacherEnrollment,
    TaEnrollment,
    DesignerEnrollment,
];
const GRADERS: &[BaseRoleType] = &[AccountAdmin, TeacherEnrollment, TaEnrollment];
const OUTCOME_MANAGERS: &[BaseRoleType] = &[
    AccountAdmin,
    AccountMembership,
    DesignerEnrollment,
    TeacherEnrollment,
];

static DEFINITIONS: &[PermissionDefinition] = &[
    // Account administration
    PermissionDefinition::new("become_user", "Users - act as", ADMIN, ACCOUNT_ROLES)
        .account_only(AccountOnly::Root)
        .role_gate(Predicate::AllowListedRole),
    PermissionDefinition::new(
        "manage_site_settings",
        "Manage site-wide settings",
        ADMIN,
        ACCOUNT_ROLES,
    )
    .account_only(AccountOnly::SiteAdmin),
    PermissionDefinition::new(
        "manage_account_memberships",
        "Admins - add / remove",
        ADMIN,
        ACCOUNT_ROLES,
    )
    .account_only(AccountOnly::Accounts)
    .role_gate(Predicate::AllowListedRole),
    PermissionDefinition::new(
        "manage_account_settings",
        "Account-level settings - manage",
        ADMIN,
        ACCOUNT_ROLES,
    )
    .account_only(AccountOnly::Accounts),
    PermissionDefinition::new(
        "manage_role_overrides",
        "Permissions - manage",
        ADMIN,
        ACCOUNT_ROLES,
    )
    .account_only(AccountOnly::Accounts),
    PermissionDefinition::new(
        "view_course_changes",
        "Courses - view change logs",
        ADMIN,
        ACCOUNT_ROLES,
    )
    .account_only(AccountOnly::Root),
    PermissionDefinition::new(
        "view_notifications",
        "Notifications - view",
        NONE,
        ACCOUNT_ROLES,
    )
    .account_only(AccountOnly::Accounts)
    .account_allows(Predicate::Setting("admins_can_view_notifications")),
    PermissionDefinition::new(
        "undelete_courses",
        "Courses - undelete",
        ADMIN,
        ACCOUNT_ROLES,
    )
    .account_only(AccountOnly::Accounts),
    PermissionDefinition::new(
        "allow_course_admin_actions",
        "Users - allow administrative actions in courses",
        ADMIN,
        ACCOUNT_ROLES,
    )
    .account_only(AccountOnly::Accounts),
    PermissionDefinition::new(
        "read_reports",
        "Reports - manage",
        &[AccountAdmin, TeacherEnrollment, TaEnrollment, DesignerEnrollment],
        STAFF,
    ),
    // Temporary enrollments
    PermissionDefinition::new(
        "temporary_enrollments_add",
        "Temporary Enrollments - add",
        ADMIN,
        ACCOUNT_ROLES,
    ),
    PermissionDefinition::new(
        "temporary_enrollments_edit",
        "Temporary Enrollments - edit",
        ADMIN,
        ACCOUNT_ROLES,
    ),
    PermissionDefinition::new(
        "temporary_enrollments_delete",
        "Temporary Enrollments - delete",
        ADMIN,
        ACCOUNT_ROLES,
    ),
    // Outcomes and grading
    PermissionDefinition::new(
        "manage_proficiency_calculations",
        "Outcome Proficiency Calculations - add / edit",
        ADMIN,
        OUTCOME_MANAGERS,
    ),
    PermissionDefinition::new(
        "manage_proficiency_scales",
        "Outcome Proficiency/Mastery Scales - add / edit",
        ADMIN,
        OUTCOME_MANAGERS,
    ),
    PermissionDefinition::new(
        "select_final_grade",
        "Grades - select final grade for moderation",
        GRADERS,
        &[AccountAdmin, AccountMembership, TeacherEnrollment, TaEnrollment],
    ),
    PermissionDefinition::new(
        "view_audit_trail",
        "Grades - view audit trail",
        ADMIN,
        &[TeacherEnrollment, AccountAdmin, AccountMembership],
    ),
    PermissionDefinition::new(
        "manage_frozen_assignments",
        "Assignments - manage frozen assignments",
        ADMIN,
        STAFF,
    )
    .visible_when(Predicate::PluginEnabled("assignment_freezer")),
    // Course content
    PermissionDefinition::new(
        "read_course_content",
        "Course Content - view",
        INSTRUCTORS,
        ALL_ROLES,
    ),
    PermissionDefinition::new(
        "manage_course_content",
        "Course Content - add / edit / delete",
        INSTRUCTORS,
        STAFF,
    ),
    PermissionDefinition::new(
        "read_course_list",
        "Courses - view list",
        ADMIN,
        ACCOUNT_ROLES,
    )
    .account_only(AccountOnly::Accounts),
    // Discussions
    PermissionDefinition::new(
        "read_forum",
        "Discussions - view",
        ALL_ENROLLED,
        ALL_ROLES,
    ),
    PermissionDefinition::new(
        "post_to_forum",
        "Discussions - post",
        ALL_BUT_OBSERVERS,
        ALL_ROLES,
    ),
    PermissionDefinition::new(
        "moderate_forum",
        "Discussions - moderate",
        INSTRUCTORS,
        ALL_ROLES,
    ),
    // Groups
    PermissionDefinition::new(
        "view_group_pages",
        "Groups - view all student groups",
        ALL_BUT_OBSERVERS,
        ALL_ROLES,
    ),
    PermissionDefinition::new(
        "manage_groups",
        "Groups - add / edit / delete",
        INSTRUCTORS,
        STAFF,
    ),
    // Conversations
    PermissionDefinition::new(
        "send_messages",
        "Conversations - send messages to individual course members",
        ALL_ENROLLED,
        ALL_ROLES,
    ),
    PermissionDefinition::new(
        "send_messages_all",
        "Conversations - send messages to entire class",
        INSTRUCTORS,
        ALL_ROLES,
    ),
    PermissionDefinition::new(
        "read_roster",
        "Users - view list",
        ALL_BUT_OBSERVERS,
        ALL_ROLES,
    ),
];

/// Lookup over the registered definitions, keyed by permission key.
#[derive(Debug)]
pub struct PermissionRegistry {
    definitions: BTreeMap<&'static str, &'static PermissionDefinition>,
}

impl PermissionRegistry {
    /// Index a set of static definitions. Later duplicates replace earlier ones.
    pub fn from_definitions(definitions: &'static [PermissionDefinition]) -> Self {
        Self {
            definitions: definitions.iter().map(|d| (d.key, d)).collect(),
        }
    }

    /// The built-in catalog.
    pub fn builtin() -> Self {
        Self::from_definitions(DEFINITIONS)
    }

    /// Process-wide registry over the built-in catalog.
    pub fn global() -> &'static PermissionRegistry {
        static REGISTRY: OnceLock<PermissionRegistry> = OnceLock::new();
        REGISTRY.get_or_init(PermissionRegistry::builtin)
    }

    pub fn definition_for(&self, key: &str) -> Result<&'static PermissionDefinition> {
        self.definitions
            .get(key)
            .copied()
            .ok_or_else(|| Error::UnknownPermission(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.definitions.contains_key(key)
    }

    /// Definitions in key order.
    pub fn iter(&self) -> impl Iterator<Item = &'static PermissionDefinition> + '_ {
        self.definitions.values().copied()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
