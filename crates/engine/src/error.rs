use std::path::PathBuf;

use pantry_core::{CollectionKey, CoreError, EntityId, MutationKind};
use pantry_storage::StorageError;
use thiserror::Error;

/// Failure reported by the remote document store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("document not found: {collection}/{entity_id}")]
    NotFound {
        collection: CollectionKey,
        entity_id: EntityId,
    },

    #[error("write rejected: {0}")]
    Rejected(String),
}

/// A chunked batch stopped at its first failing chunk. Earlier chunks stay committed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("batch stopped after {committed_chunks}/{total_chunks} chunks: {source}")]
pub struct BatchError {
    pub committed_chunks: usize,
    pub total_chunks: usize,
    pub source: RemoteError,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MutationError {
    /// Rejected before anything was applied locally or sent.
    #[error("invalid mutation: {0}")]
    Validation(String),

    /// The remote write failed; the optimistic change has been rolled back.
    #[error("{} failed and was rolled back: {source}", .kind.as_str())]
    Write {
        kind: MutationKind,
        source: RemoteError,
        /// Batch ops that committed before the failure.
        committed_ops: usize,
    },

    #[error("no async runtime available to run the remote write")]
    NoRuntime,

    #[error("mutation task aborted: {0}")]
    Aborted(String),
}

impl MutationError {
    pub fn is_validation(&self) -> bool {
        matches!(self, MutationError::Validation(_))
    }
}

impl From<CoreError> for MutationError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::InvalidOperation(msg)
            | CoreError::InvalidData(msg)
            | CoreError::Serialization(msg) => MutationError::Validation(msg),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("mutation error: {0}")]
    Mutation(#[from] MutationError),
}
