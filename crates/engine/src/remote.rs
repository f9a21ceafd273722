use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use pantry_core::{BatchOp, CollectionKey, Entity, EntityId, Patch};

use crate::error::RemoteError;

/// Callback receiving every full snapshot of a subscribed collection.
pub type SnapshotListener = Arc<dyn Fn(Vec<Entity>) + Send + Sync>;

/// Live listener registration. Unsubscribing is idempotent and also happens on drop.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to tear down.
    pub fn inert() -> Self {
        Self { cancel: None }
    }

    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Hosted document database holding the household collections.
///
/// Every write future resolves only once the backend has durably accepted
/// (or refused) it. Listeners receive the initial snapshot and then every
/// change, including echoes of this client's own writes.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    fn subscribe(
        &self,
        collection: &CollectionKey,
        listener: SnapshotListener,
    ) -> Result<Subscription, RemoteError>;

    /// Allocate a fresh document id without writing anything.
    fn new_document_id(&self, collection: &CollectionKey) -> EntityId;

    /// Merge `patch` into one document. Without `upsert` the document must
    /// already exist.
    async fn write(
        &self,
        collection: &CollectionKey,
        id: &EntityId,
        patch: &Patch,
        upsert: bool,
    ) -> Result<(), RemoteError>;

    /// Add a document and return its server-assigned id.
    async fn create(&self, collection: &CollectionKey, fields: &Patch)
    -> Result<EntityId, RemoteError>;

    async fn remove(&self, collection: &CollectionKey, id: &EntityId) -> Result<(), RemoteError>;

    /// Commit one chunk atomically.
    async fn commit_batch(&self, ops: &[BatchOp]) -> Result<(), RemoteError>;
}
