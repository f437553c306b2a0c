//! Error taxonomy shared across crates (spec §7).
//!
//! Every command handler, sync engine, and retriever translates its failures
//! into one of these variants before it crosses a public boundary. Unexpected
//! storage/filesystem failures are carried in `StorageError` and always roll
//! back the enclosing transaction.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
pub enum EngineError {
    #[error("a remote-id or hierarchical-rid operation needs a resource or collection context")]
    ContextRequired,

    #[error("scope resolved to zero entities")]
    NotFound,

    #[error("hierarchical remote id resolved to more than one entity")]
    Ambiguous,

    #[error("a sibling collection named {name:?} already exists under this parent")]
    NameConflict { name: String },

    #[error("illegal move: {reason}")]
    IllegalMove { reason: String },

    #[error("old_revision did not match the stored revision")]
    RevisionConflict,

    #[error("owning resource's dirty local payload would be overwritten")]
    DirtyPayloadConflict,

    #[error("only the owning resource may perform this modification")]
    NotOwnerResource,

    #[error("collection sync finished with unresolvable parents")]
    OrphanCollections,

    #[error("commit or rollback requested with no open transaction")]
    NoTransaction,

    #[error("external provider could not deliver requested parts: {reason}")]
    RetrievalFailed { reason: String },

    #[error("operation was canceled by the caller")]
    UserCanceled,

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("this operation does not accept a {kind} scope: {reason}")]
    UnsupportedScope { kind: String, reason: String },
}

impl EngineError {
    /// Machine-readable ASCII kind, as carried on the wire per spec §6
    /// ("Error records carry an ASCII error kind plus a human-readable message").
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::ContextRequired => "ContextRequired",
            EngineError::NotFound => "NotFound",
            EngineError::Ambiguous => "Ambiguous",
            EngineError::NameConflict { .. } => "NameConflict",
            EngineError::IllegalMove { .. } => "IllegalMove",
            EngineError::RevisionConflict => "RevisionConflict",
            EngineError::DirtyPayloadConflict => "DirtyPayloadConflict",
            EngineError::NotOwnerResource => "NotOwnerResource",
            EngineError::OrphanCollections => "OrphanCollections",
            EngineError::NoTransaction => "NoTransaction",
            EngineError::RetrievalFailed { .. } => "RetrievalFailed",
            EngineError::UserCanceled => "UserCanceled",
            EngineError::StorageError(_) => "StorageError",
            EngineError::UnsupportedScope { .. } => "UnsupportedScope",
        }
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        EngineError::StorageError(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
