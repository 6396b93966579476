//! Rolegate library
//!
//! Resolve effective role permissions over a tree of accounts, sub-accounts and
//! courses from registry defaults and sparse, lockable role overrides.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod fixture;
pub mod model;
pub mod plugins;
pub mod registry;
pub mod resolution;
pub mod scope;
pub mod store;
pub mod tree;

pub use config::EngineConfig;
pub use engine::{Collaborators, OverrideChange, PermissionEngine, ResolveOptions};
pub use error::{Error, Result};
pub use model::{
    Account, AccountId, BaseRoleType, Context, Course, CourseId, Group, GroupId, Role, RoleId,
    RoleOverride, ShardId,
};
pub use plugins::PluginRegistry;
pub use registry::{PermissionDefinition, PermissionRegistry};
pub use resolution::ResolvedPermission;
pub use scope::AppliesTo;
pub use store::MemoryStore;
