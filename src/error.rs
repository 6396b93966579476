use crate::model::{AccountId, RoleId, ShardId};

/// Errors returned by the resolution engine and its collaborators.
///
/// `Clone` so a single failed cache load can be handed to every caller that was
/// waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The permission key is not in the registry.
    #[error("unknown permission: {0}")]
    UnknownPermission(String),

    /// A referenced record does not exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: u64 },

    /// The account tree has a cycle or exceeds the configured depth.
    #[error("invalid account tree at account {account}: {reason}")]
    InvalidTree { account: AccountId, reason: String },

    /// The partition holding the data could not be reached.
    #[error("shard {shard} unavailable: {message}")]
    ShardUnavailable { shard: ShardId, message: String },

    /// An override already exists for this (account, permission, role).
    #[error("role override for {permission} on account {account} (role {role}) already exists")]
    Conflict {
        account: AccountId,
        permission: String,
        role: RoleId,
    },

    /// Any other storage failure.
    #[error("store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<u64>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }
}
