use pantry_core::{CollectionKey, Entity};

use crate::error::StorageError;

/// Last-known-good snapshot of one collection, as persisted locally.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedSnapshot {
    pub entities: Vec<Entity>,
    pub saved_at_ms: i64,
}

/// Local persistence for snapshots across restarts.
///
/// Caching is best-effort: callers log failures and carry on.
pub trait SnapshotCache: Send {
    fn load(&self, key: &CollectionKey) -> Result<Option<CachedSnapshot>, StorageError>;

    fn store(
        &mut self,
        key: &CollectionKey,
        entities: &[Entity],
        saved_at_ms: i64,
    ) -> Result<(), StorageError>;

    /// Remove one entry. Returns whether it existed.
    fn evict(&mut self, key: &CollectionKey) -> Result<bool, StorageError>;

    fn keys(&self) -> Result<Vec<CollectionKey>, StorageError>;
}
