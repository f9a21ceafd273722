use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use pantry_core::{BatchOp, Clock, CollectionKey, Entity, EntityId, Patch, Snapshot};
use pantry_storage::SnapshotCache;

use crate::error::{BatchError, RemoteError};
use crate::remote::{RemoteStore, SnapshotListener, Subscription};
use crate::scheduler::RenderScheduler;
use crate::snapshot_store::SnapshotStore;

/// Optional local persistence shared between the listener and the engine.
pub type SharedCache = Arc<Mutex<dyn SnapshotCache>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub uid: String,
    pub collection: CollectionKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Subscribed,
    /// Same user and collection were already live; nothing changed.
    AlreadySubscribed,
    /// A listener for another user was torn down first.
    Resubscribed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub chunks: usize,
    pub ops: usize,
}

struct ActiveListener {
    uid: String,
    subscription: Subscription,
}

struct SyncInner {
    remote: Arc<dyn RemoteStore>,
    store: SnapshotStore,
    scheduler: Arc<RenderScheduler>,
    cache: Option<SharedCache>,
    clock: Arc<dyn Clock>,
    batch_limit: usize,
    active: Mutex<HashMap<CollectionKey, ActiveListener>>,
}

/// Keeps the local snapshots in step with the remote store and funnels every
/// remote write.
#[derive(Clone)]
pub struct SyncAdapter {
    inner: Arc<SyncInner>,
}

impl SyncAdapter {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        store: SnapshotStore,
        scheduler: Arc<RenderScheduler>,
        cache: Option<SharedCache>,
        clock: Arc<dyn Clock>,
        batch_limit: usize,
    ) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                remote,
                store,
                scheduler,
                cache,
                clock,
                batch_limit: batch_limit.max(1),
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn active(&self) -> MutexGuard<'_, HashMap<CollectionKey, ActiveListener>> {
        self.inner.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn batch_limit(&self) -> usize {
        self.inner.batch_limit
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Start listening to `collection` on behalf of `uid`.
    ///
    /// Repeating a live `(uid, collection)` pair is a no-op; a different uid
    /// replaces the previous listener.
    pub fn subscribe(
        &self,
        uid: &str,
        collection: &CollectionKey,
    ) -> Result<SubscribeOutcome, RemoteError> {
        let mut active = self.active();
        let mut outcome = SubscribeOutcome::Subscribed;
        if let Some(mut current) = active.remove(collection) {
            if current.uid == uid && current.subscription.is_active() {
                active.insert(collection.clone(), current);
                tracing::debug!(uid, collection = %collection, "already subscribed");
                return Ok(SubscribeOutcome::AlreadySubscribed);
            }
            current.subscription.unsubscribe();
            outcome = SubscribeOutcome::Resubscribed;
        }

        let subscription = self
            .inner
            .remote
            .subscribe(collection, self.listener(collection))?;
        active.insert(
            collection.clone(),
            ActiveListener {
                uid: uid.to_string(),
                subscription,
            },
        );
        tracing::info!(uid, collection = %collection, ?outcome, "subscribed");
        Ok(outcome)
    }

    pub fn unsubscribe(&self, collection: &CollectionKey) -> bool {
        let removed = self.active().remove(collection);
        match removed {
            Some(mut listener) => {
                listener.subscription.unsubscribe();
                tracing::info!(collection = %collection, "unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Tear down every listener, e.g. on sign-out. Returns how many were live.
    pub fn unsubscribe_all(&self) -> usize {
        let drained: Vec<_> = self.active().drain().collect();
        let count = drained.len();
        for (_, mut listener) in drained {
            listener.subscription.unsubscribe();
        }
        if count > 0 {
            tracing::info!(count, "unsubscribed all");
        }
        count
    }

    pub fn is_subscribed(&self, collection: &CollectionKey) -> bool {
        self.active()
            .get(collection)
            .is_some_and(|l| l.subscription.is_active())
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<_> = self
            .active()
            .iter()
            .map(|(collection, l)| SubscriptionKey {
                uid: l.uid.clone(),
                collection: collection.clone(),
            })
            .collect();
        keys.sort_by(|a, b| a.collection.cmp(&b.collection));
        keys
    }

    /// Every remote snapshot replaces local state wholesale, then renders and
    /// caches it.
    fn listener(&self, collection: &CollectionKey) -> SnapshotListener {
        let key = collection.clone();
        let store = self.inner.store.clone();
        let scheduler = self.inner.scheduler.clone();
        let cache = self.inner.cache.clone();
        let clock = self.inner.clock.clone();
        Arc::new(move |entities: Vec<Entity>| {
            let snapshot = Snapshot::from(entities);
            tracing::debug!(collection = %key, entities = snapshot.len(), "remote snapshot");
            store.replace(&key, snapshot.clone());
            if let Some(cache) = &cache {
                persist(cache, &key, &snapshot, clock.now_ms());
            }
            scheduler.schedule(&key, snapshot);
        })
    }

    /// Seed an empty collection from the local cache for a first paint.
    pub fn warm_from_cache(&self, collection: &CollectionKey) -> bool {
        let Some(cache) = &self.inner.cache else {
            return false;
        };
        if !self.inner.store.get(collection).is_empty() {
            return false;
        }
        let loaded = cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .load(collection);
        match loaded {
            Ok(Some(cached)) => {
                let snapshot = Snapshot::from(cached.entities);
                tracing::debug!(
                    collection = %collection,
                    entities = snapshot.len(),
                    saved_at_ms = cached.saved_at_ms,
                    "warmed from cache"
                );
                self.inner.store.replace(collection, snapshot.clone());
                self.inner.scheduler.schedule(collection, snapshot);
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(collection = %collection, error = %e, "cache read failed");
                false
            }
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    pub async fn write(
        &self,
        collection: &CollectionKey,
        id: &EntityId,
        patch: &Patch,
        upsert: bool,
    ) -> Result<(), RemoteError> {
        tracing::debug!(collection = %collection, id = %id, fields = patch.len(), upsert, "remote write");
        self.inner.remote.write(collection, id, patch, upsert).await
    }

    pub async fn create(
        &self,
        collection: &CollectionKey,
        fields: &Patch,
    ) -> Result<EntityId, RemoteError> {
        tracing::debug!(collection = %collection, fields = fields.len(), "remote create");
        self.inner.remote.create(collection, fields).await
    }

    pub async fn remove(&self, collection: &CollectionKey, id: &EntityId) -> Result<(), RemoteError> {
        tracing::debug!(collection = %collection, id = %id, "remote remove");
        self.inner.remote.remove(collection, id).await
    }

    pub fn new_document_id(&self, collection: &CollectionKey) -> EntityId {
        self.inner.remote.new_document_id(collection)
    }

    /// Commit `ops` in chunks of at most `batch_limit`, in order, stopping at
    /// the first failing chunk. Chunks already committed stay committed.
    pub async fn batch_write(&self, ops: &[BatchOp]) -> Result<BatchReport, BatchError> {
        let limit = self.inner.batch_limit;
        let total_chunks = ops.len().div_ceil(limit);
        for (index, chunk) in ops.chunks(limit).enumerate() {
            if let Err(source) = self.inner.remote.commit_batch(chunk).await {
                tracing::warn!(
                    chunk = index + 1,
                    total_chunks,
                    error = %source,
                    "batch chunk failed"
                );
                return Err(BatchError {
                    committed_chunks: index,
                    total_chunks,
                    source,
                });
            }
            tracing::debug!(chunk = index + 1, total_chunks, ops = chunk.len(), "batch chunk committed");
        }
        Ok(BatchReport {
            chunks: total_chunks,
            ops: ops.len(),
        })
    }
}

fn persist(cache: &SharedCache, key: &CollectionKey, snapshot: &Snapshot, now_ms: i64) {
    let mut cache = cache.lock().unwrap_or_else(PoisonError::into_inner);
    if let Err(e) = cache.store(key, snapshot, now_ms) {
        tracing::warn!(collection = %key, error = %e, "cache write failed");
    }
}
