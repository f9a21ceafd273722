use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use pantry_core::{
    BatchOp, Clock, CollectionKey, Entity, EntityId, Mutation, MutationId, MutationKind, Patch,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{EngineConfig, RetryPolicy, WritePolicy};
use crate::error::{MutationError, RemoteError};
use crate::notify::{Notice, Notifier, Phase};
use crate::pending::{
    Capture, LocalChange, MutationStatus, PendingLedger, PendingMutation, SettledMutation,
};
use crate::scheduler::RenderScheduler;
use crate::snapshot_store::SnapshotStore;
use crate::sync::SyncAdapter;

const SETTLED_HISTORY: usize = 100;

type EntityKey = (CollectionKey, EntityId);

// ============================================================================
// Remote half of a mutation
// ============================================================================

enum RemoteWrite {
    Write {
        collection: CollectionKey,
        entity_id: EntityId,
        patch: Patch,
        upsert: bool,
    },
    Create {
        collection: CollectionKey,
        temporary: EntityId,
        fields: Patch,
    },
    Remove {
        collection: CollectionKey,
        entity_id: EntityId,
    },
    Batch {
        ops: Vec<BatchOp>,
    },
}

impl RemoteWrite {
    fn keys(&self) -> Vec<EntityKey> {
        match self {
            RemoteWrite::Write {
                collection,
                entity_id,
                ..
            }
            | RemoteWrite::Remove {
                collection,
                entity_id,
            } => vec![(collection.clone(), entity_id.clone())],
            RemoteWrite::Create {
                collection,
                temporary,
                ..
            } => vec![(collection.clone(), temporary.clone())],
            RemoteWrite::Batch { ops } => {
                let mut keys: Vec<EntityKey> = Vec::with_capacity(ops.len());
                for op in ops {
                    let key = (op.collection().clone(), op.entity_id().clone());
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
                keys
            }
        }
    }

    fn temporary_id(&self) -> Option<&EntityId> {
        match self {
            RemoteWrite::Create { temporary, .. } => Some(temporary),
            _ => None,
        }
    }
}

struct Sent {
    permanent: Option<EntityId>,
    attempts: u32,
}

struct Failure {
    source: RemoteError,
    committed_ops: usize,
    attempts: u32,
}

// ============================================================================
// Per-entity write ordering
// ============================================================================

/// Position of one mutation in the per-entity write queues.
struct Turn {
    mutation_id: MutationId,
    keys: Vec<EntityKey>,
    predecessors: Vec<watch::Receiver<bool>>,
    done: watch::Sender<bool>,
}

impl Turn {
    async fn wait(&mut self) {
        for predecessor in &mut self.predecessors {
            // A dropped sender means the predecessor's task is gone; proceed.
            let _ = predecessor.wait_for(|done| *done).await;
        }
    }
}

#[derive(Default)]
struct WriteQueue {
    tails: HashMap<EntityKey, (MutationId, watch::Receiver<bool>)>,
}

impl WriteQueue {
    fn enqueue(&mut self, mutation_id: MutationId, keys: Vec<EntityKey>) -> Turn {
        let (done, finished) = watch::channel(false);
        let mut predecessors = Vec::new();
        for key in &keys {
            if let Some((_, tail)) = self.tails.insert(key.clone(), (mutation_id, finished.clone()))
            {
                predecessors.push(tail);
            }
        }
        Turn {
            mutation_id,
            keys,
            predecessors,
            done,
        }
    }

    fn is_queued(&self, key: &EntityKey) -> bool {
        self.tails.contains_key(key)
    }

    fn release(&mut self, turn: Turn) {
        turn.done.send_replace(true);
        for key in &turn.keys {
            if self
                .tails
                .get(key)
                .is_some_and(|(owner, _)| *owner == turn.mutation_id)
            {
                self.tails.remove(key);
            }
        }
    }
}

fn inserts(captures: &[Capture], key: &EntityKey) -> bool {
    captures.iter().any(|c| {
        c.change == LocalChange::Inserted && c.collection == key.0 && c.entity_id == key.1
    })
}

// ============================================================================
// Handles
// ============================================================================

/// Result of a mutation whose remote write was accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub mutation_id: MutationId,
    pub kind: MutationKind,
    /// Target entity; for creates, the permanent id assigned by the remote.
    pub entity_id: Option<EntityId>,
    pub attempts: u32,
}

/// An applied mutation whose remote write may still be running.
pub struct MutationHandle {
    mutation_id: MutationId,
    kind: MutationKind,
    temporary_id: Option<EntityId>,
    task: JoinHandle<Result<Committed, MutationError>>,
}

impl MutationHandle {
    pub fn mutation_id(&self) -> MutationId {
        self.mutation_id
    }

    pub fn kind(&self) -> MutationKind {
        self.kind
    }

    /// Synthetic id of the entity staged by a create.
    pub fn temporary_id(&self) -> Option<&EntityId> {
        self.temporary_id.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the remote write and the commit or rollback that follows it.
    pub async fn outcome(self) -> Result<Committed, MutationError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(MutationError::Aborted(e.to_string())),
        }
    }
}

// ============================================================================
// Executor
// ============================================================================

struct ExecutorInner {
    store: SnapshotStore,
    scheduler: Arc<RenderScheduler>,
    sync: SyncAdapter,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    write_policy: WritePolicy,
    retry: RetryPolicy,
    ledger: Mutex<PendingLedger>,
    queue: Mutex<WriteQueue>,
    // Synthetic id -> permanent id, for writes issued before a create committed.
    aliases: Mutex<HashMap<EntityId, EntityId>>,
}

/// Applies mutations locally at once, writes them to the remote in the
/// background, and rolls the local change back if the write fails.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Executor {
    pub fn new(
        store: SnapshotStore,
        scheduler: Arc<RenderScheduler>,
        sync: SyncAdapter,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                store,
                scheduler,
                sync,
                notifier,
                clock,
                write_policy: config.write_policy,
                retry: config.retry,
                ledger: Mutex::new(PendingLedger::new(SETTLED_HISTORY)),
                queue: Mutex::new(WriteQueue::default()),
                aliases: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.inner.store
    }

    pub fn sync(&self) -> &SyncAdapter {
        &self.inner.sync
    }

    pub fn write_policy(&self) -> WritePolicy {
        self.inner.write_policy
    }

    pub fn now_ms(&self) -> i64 {
        self.inner.clock.now_ms()
    }

    pub fn in_flight(&self) -> Vec<PendingMutation> {
        lock(&self.inner.ledger).in_flight()
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.inner.ledger).in_flight_count()
    }

    pub fn in_flight_for(&self, collection: &CollectionKey, id: &EntityId) -> usize {
        lock(&self.inner.ledger).in_flight_for(collection, id)
    }

    pub fn status(&self, id: &MutationId) -> Option<MutationStatus> {
        lock(&self.inner.ledger).status(id)
    }

    pub fn recent(&self) -> Vec<SettledMutation> {
        lock(&self.inner.ledger).recent()
    }

    /// Apply `mutation` to the local snapshot now and start its remote write.
    ///
    /// Invalid mutations are refused before anything changes. Must be called
    /// from within a tokio runtime.
    pub fn apply(&self, mutation: Mutation) -> Result<MutationHandle, MutationError> {
        let kind = mutation.kind();
        let collection = mutation.collection().cloned();
        let entity_id = mutation.entity_id().cloned();

        if let Err(e) = mutation.validate() {
            return Err(self.reject(kind, collection.as_ref(), entity_id.as_ref(), e.into()));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| MutationError::NoRuntime)?;

        let mutation_id = MutationId::new();
        let (captures, write) = self.stage(mutation);
        self.publish(&captures);
        self.notify(Notice::new(
            kind,
            Phase::Started,
            collection.as_ref(),
            entity_id.as_ref(),
        ));

        lock(&self.inner.ledger).begin(PendingMutation {
            mutation_id,
            kind,
            collection,
            entity_id,
            captures: captures.clone(),
            status: MutationStatus::InFlight,
            started_at_ms: self.now_ms(),
        });

        let turn = {
            let mut queue = lock(&self.inner.queue);
            let keys = match self.inner.write_policy {
                WritePolicy::PerEntityFifo => write.keys(),
                // Writes still wait for the creation of the entity they target.
                WritePolicy::Parallel => write
                    .keys()
                    .into_iter()
                    .filter(|key| inserts(&captures, key) || queue.is_queued(key))
                    .collect(),
            };
            (!keys.is_empty()).then(|| queue.enqueue(mutation_id, keys))
        };
        let temporary_id = write.temporary_id().cloned();
        tracing::debug!(mutation = %mutation_id, kind = kind.as_str(), "mutation applied");

        let executor = self.clone();
        let task = runtime.spawn(async move {
            executor
                .settle(mutation_id, kind, write, captures, turn)
                .await
        });
        Ok(MutationHandle {
            mutation_id,
            kind,
            temporary_id,
            task,
        })
    }

    /// Apply and wait for the outcome.
    pub async fn execute(&self, mutation: Mutation) -> Result<Committed, MutationError> {
        self.apply(mutation)?.outcome().await
    }

    /// Emit a rejection notice and hand the error back.
    pub fn reject(
        &self,
        kind: MutationKind,
        collection: Option<&CollectionKey>,
        entity_id: Option<&EntityId>,
        error: MutationError,
    ) -> MutationError {
        if let MutationError::Validation(reason) = &error {
            tracing::debug!(kind = kind.as_str(), reason = %reason, "mutation rejected");
            self.notify(Notice::rejected(kind, collection, entity_id, reason));
        }
        error
    }

    pub fn new_document_id(&self, collection: &CollectionKey) -> EntityId {
        self.inner.sync.new_document_id(collection)
    }

    // ========================================================================
    // Local half
    // ========================================================================

    fn stage(&self, mutation: Mutation) -> (Vec<Capture>, RemoteWrite) {
        let store = &self.inner.store;
        match mutation {
            Mutation::Create {
                collection,
                entity_id: Some(entity_id),
                fields,
            } => {
                let entity = Entity::from_patch(entity_id.clone(), &fields, self.now_ms());
                store.insert_front(&collection, entity);
                let capture = Capture {
                    collection: collection.clone(),
                    entity_id: entity_id.clone(),
                    change: LocalChange::Inserted,
                    previous: None,
                    position: None,
                };
                let write = RemoteWrite::Write {
                    collection,
                    entity_id,
                    patch: fields,
                    upsert: true,
                };
                (vec![capture], write)
            }
            Mutation::Create {
                collection,
                entity_id: None,
                fields,
            } => {
                let temporary = EntityId::temporary();
                let entity = Entity::from_patch(temporary.clone(), &fields, self.now_ms());
                store.insert_front(&collection, entity);
                let capture = Capture {
                    collection: collection.clone(),
                    entity_id: temporary.clone(),
                    change: LocalChange::Inserted,
                    previous: None,
                    position: None,
                };
                let write = RemoteWrite::Create {
                    collection,
                    temporary,
                    fields,
                };
                (vec![capture], write)
            }
            Mutation::Update {
                collection,
                entity_id,
                patch,
                insert_if_missing,
            } => {
                let capture = self.stage_patch(&collection, &entity_id, &patch, insert_if_missing);
                let write = RemoteWrite::Write {
                    collection,
                    entity_id,
                    patch,
                    upsert: insert_if_missing,
                };
                (vec![capture], write)
            }
            Mutation::Delete {
                collection,
                entity_id,
            } => {
                let capture = self.stage_remove(&collection, &entity_id);
                (
                    vec![capture],
                    RemoteWrite::Remove {
                        collection,
                        entity_id,
                    },
                )
            }
            Mutation::Batch { ops } => {
                let captures = ops
                    .iter()
                    .map(|op| match op {
                        BatchOp::Set {
                            collection,
                            entity_id,
                            patch,
                        } => self.stage_patch(collection, entity_id, patch, true),
                        BatchOp::Delete {
                            collection,
                            entity_id,
                        } => self.stage_remove(collection, entity_id),
                    })
                    .collect();
                (captures, RemoteWrite::Batch { ops })
            }
        }
    }

    fn stage_patch(
        &self,
        collection: &CollectionKey,
        entity_id: &EntityId,
        patch: &Patch,
        insert_if_missing: bool,
    ) -> Capture {
        let previous = self
            .inner
            .store
            .patch_by_id(collection, entity_id, patch, insert_if_missing);
        let change = match (&previous, insert_if_missing) {
            (Some(_), _) => LocalChange::Patched,
            (None, true) => LocalChange::Inserted,
            (None, false) => LocalChange::Untouched,
        };
        Capture {
            collection: collection.clone(),
            entity_id: entity_id.clone(),
            change,
            previous,
            position: None,
        }
    }

    fn stage_remove(&self, collection: &CollectionKey, entity_id: &EntityId) -> Capture {
        let removed = self.inner.store.remove_with_position(collection, entity_id);
        let (change, position, previous) = match removed {
            Some((position, entity)) => (LocalChange::Removed, Some(position), Some(entity)),
            None => (LocalChange::Untouched, None, None),
        };
        Capture {
            collection: collection.clone(),
            entity_id: entity_id.clone(),
            change,
            previous,
            position,
        }
    }

    /// Undo one captured change.
    ///
    /// A patch is only reverted while the entity still exists, so a failed
    /// update never brings back an entity a later delete removed.
    fn undo(&self, capture: &Capture) {
        let store = &self.inner.store;
        match (capture.change, &capture.previous) {
            (LocalChange::Patched, Some(previous)) => {
                store.substitute(&capture.collection, previous.clone());
            }
            (LocalChange::Inserted, _) => {
                store.remove_by_id(&capture.collection, &capture.entity_id);
            }
            (LocalChange::Removed, Some(previous)) => {
                store.restore(
                    &capture.collection,
                    previous.clone(),
                    capture.position.unwrap_or(0),
                );
            }
            _ => {}
        }
    }

    fn publish(&self, captures: &[Capture]) {
        let mut seen: Vec<&CollectionKey> = Vec::new();
        for capture in captures {
            if !seen.contains(&&capture.collection) {
                seen.push(&capture.collection);
                self.publish_collection(&capture.collection);
            }
        }
    }

    fn publish_collection(&self, collection: &CollectionKey) {
        self.inner
            .scheduler
            .schedule(collection, self.inner.store.get(collection));
    }

    fn notify(&self, notice: Notice) {
        self.inner.notifier.notify(&notice);
    }

    // ========================================================================
    // Remote half
    // ========================================================================

    async fn settle(
        self,
        mutation_id: MutationId,
        kind: MutationKind,
        write: RemoteWrite,
        captures: Vec<Capture>,
        mut turn: Option<Turn>,
    ) -> Result<Committed, MutationError> {
        if let Some(turn) = turn.as_mut() {
            turn.wait().await;
        }
        let result = self.send(&write).await;
        let outcome = match result {
            Ok(sent) => Ok(self.commit(mutation_id, kind, &write, sent)),
            Err(failure) => Err(self.roll_back(mutation_id, kind, &write, &captures, failure)),
        };
        if let Some(turn) = turn {
            lock(&self.inner.queue).release(turn);
        }
        outcome
    }

    async fn send(&self, write: &RemoteWrite) -> Result<Sent, Failure> {
        let max_attempts = self.inner.retry.attempts();
        let mut committed_ops = 0;
        let mut attempt = 1;
        loop {
            match self.send_once(write, committed_ops).await {
                Ok(permanent) => {
                    return Ok(Sent {
                        permanent,
                        attempts: attempt,
                    });
                }
                Err((source, newly_committed)) => {
                    committed_ops += newly_committed;
                    if attempt >= max_attempts {
                        return Err(Failure {
                            source,
                            committed_ops,
                            attempts: attempt,
                        });
                    }
                    let delay = self.inner.retry.delay_for(attempt);
                    tracing::warn!(attempt, ?delay, error = %source, "remote write failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// One attempt. Batches resume after the `skip` ops an earlier attempt committed.
    async fn send_once(
        &self,
        write: &RemoteWrite,
        skip: usize,
    ) -> Result<Option<EntityId>, (RemoteError, usize)> {
        let sync = &self.inner.sync;
        match write {
            RemoteWrite::Write {
                collection,
                entity_id,
                patch,
                upsert,
            } => {
                let target = self.resolve(entity_id);
                sync.write(collection, &target, patch, *upsert)
                    .await
                    .map(|()| None)
                    .map_err(|e| (e, 0))
            }
            RemoteWrite::Create {
                collection, fields, ..
            } => sync.create(collection, fields).await.map(Some).map_err(|e| (e, 0)),
            RemoteWrite::Remove {
                collection,
                entity_id,
            } => {
                let target = self.resolve(entity_id);
                sync.remove(collection, &target)
                    .await
                    .map(|()| None)
                    .map_err(|e| (e, 0))
            }
            RemoteWrite::Batch { ops } => {
                let remaining: Vec<BatchOp> = ops
                    .iter()
                    .skip(skip)
                    .map(|op| self.resolve_op(op))
                    .collect();
                sync.batch_write(&remaining)
                    .await
                    .map(|_| None)
                    .map_err(|e| (e.source, e.committed_chunks * sync.batch_limit()))
            }
        }
    }

    fn resolve(&self, id: &EntityId) -> EntityId {
        if !id.is_temporary() {
            return id.clone();
        }
        lock(&self.inner.aliases)
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.clone())
    }

    fn resolve_op(&self, op: &BatchOp) -> BatchOp {
        match op {
            BatchOp::Set {
                collection,
                entity_id,
                patch,
            } => BatchOp::set(collection, &self.resolve(entity_id), patch.clone()),
            BatchOp::Delete {
                collection,
                entity_id,
            } => BatchOp::delete(collection, &self.resolve(entity_id)),
        }
    }

    fn commit(
        &self,
        mutation_id: MutationId,
        kind: MutationKind,
        write: &RemoteWrite,
        sent: Sent,
    ) -> Committed {
        let pending = lock(&self.inner.ledger).settle(&mutation_id, MutationStatus::Committed);
        let collection = pending.as_ref().and_then(|p| p.collection.clone());
        let mut entity_id = pending.and_then(|p| p.entity_id);

        if let (
            RemoteWrite::Create {
                collection,
                temporary,
                ..
            },
            Some(permanent),
        ) = (write, &sent.permanent)
        {
            lock(&self.inner.aliases).insert(temporary.clone(), permanent.clone());
            if self.inner.store.swap_id(collection, temporary, permanent) {
                self.publish_collection(collection);
            }
            entity_id = Some(permanent.clone());
        }

        self.notify(Notice::new(
            kind,
            Phase::Succeeded,
            collection.as_ref(),
            entity_id.as_ref(),
        ));
        tracing::info!(
            mutation = %mutation_id,
            kind = kind.as_str(),
            attempts = sent.attempts,
            "mutation committed"
        );
        Committed {
            mutation_id,
            kind,
            entity_id,
            attempts: sent.attempts,
        }
    }

    fn roll_back(
        &self,
        mutation_id: MutationId,
        kind: MutationKind,
        write: &RemoteWrite,
        captures: &[Capture],
        failure: Failure,
    ) -> MutationError {
        // Captures line up with batch ops; committed ops keep their local state.
        let undone = match write {
            RemoteWrite::Batch { .. } => &captures[failure.committed_ops.min(captures.len())..],
            _ => captures,
        };
        for capture in undone.iter().rev() {
            self.undo(capture);
        }
        self.publish(undone);

        let pending = lock(&self.inner.ledger).settle(&mutation_id, MutationStatus::RolledBack);
        let collection = pending.as_ref().and_then(|p| p.collection.clone());
        let entity_id = pending.and_then(|p| p.entity_id);
        self.notify(Notice::new(
            kind,
            Phase::Failed,
            collection.as_ref(),
            entity_id.as_ref(),
        ));
        tracing::warn!(
            mutation = %mutation_id,
            kind = kind.as_str(),
            attempts = failure.attempts,
            committed_ops = failure.committed_ops,
            error = %failure.source,
            "mutation rolled back"
        );
        MutationError::Write {
            kind,
            source: failure.source,
            committed_ops: failure.committed_ops,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use pantry_core::{ManualClock, Snapshot};

    use super::*;
    use crate::notify::LogNotifier;
    use crate::remote::{RemoteStore, SnapshotListener, Subscription};
    use crate::scheduler::Renderer;

    struct NullRenderer;

    impl Renderer for NullRenderer {
        fn render(&self, _: &CollectionKey, _: &Snapshot) {}
    }

    /// Accepts everything unless `failing` is set. Never echoes.
    #[derive(Default)]
    struct SwitchRemote {
        failing: AtomicBool,
    }

    impl SwitchRemote {
        fn check(&self) -> Result<(), RemoteError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(RemoteError::Unavailable("offline".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RemoteStore for SwitchRemote {
        fn subscribe(&self, _: &CollectionKey, _: SnapshotListener) -> Result<Subscription, RemoteError> {
            Ok(Subscription::inert())
        }

        fn new_document_id(&self, _: &CollectionKey) -> EntityId {
            EntityId::new("fresh")
        }

        async fn write(&self, _: &CollectionKey, _: &EntityId, _: &Patch, _: bool) -> Result<(), RemoteError> {
            self.check()
        }

        async fn create(&self, _: &CollectionKey, _: &Patch) -> Result<EntityId, RemoteError> {
            self.check().map(|()| EntityId::new("perm-1"))
        }

        async fn remove(&self, _: &CollectionKey, _: &EntityId) -> Result<(), RemoteError> {
            self.check()
        }

        async fn commit_batch(&self, _: &[BatchOp]) -> Result<(), RemoteError> {
            self.check()
        }
    }

    fn executor(remote: Arc<SwitchRemote>) -> Executor {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(5));
        let store = SnapshotStore::new(clock.clone());
        let scheduler = Arc::new(RenderScheduler::new(Arc::new(NullRenderer)));
        let sync = SyncAdapter::new(remote, store.clone(), scheduler.clone(), None, clock.clone(), 500);
        store.replace(
            &items(),
            vec![Entity::new("a").with_field("qty", "1"), Entity::new("b")],
        );
        Executor::new(store, scheduler, sync, Arc::new(LogNotifier), clock, &EngineConfig::default())
    }

    fn items() -> CollectionKey {
        CollectionKey::items("hh")
    }

    #[tokio::test]
    async fn invalid_mutation_changes_nothing() {
        let exec = executor(Arc::new(SwitchRemote::default()));
        let before = exec.store().get(&items());
        let err = exec
            .apply(Mutation::update(&items(), &"a".into(), Patch::new()))
            .err();
        assert!(err.is_some_and(|e| e.is_validation()));
        assert!(exec.store().get(&items()).ptr_eq(&before));
        assert_eq!(exec.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn failed_update_restores_previous() {
        let remote = Arc::new(SwitchRemote::default());
        remote.failing.store(true, Ordering::SeqCst);
        let exec = executor(remote);
        let before = exec.store().get(&items());

        let handle = exec
            .apply(Mutation::update(&items(), &"a".into(), Patch::new().set("qty", "2")))
            .unwrap();
        assert_eq!(
            exec.store().entity(&items(), &"a".into()).and_then(|e| e.text("qty").map(String::from)),
            Some("2".into())
        );

        let id = handle.mutation_id();
        assert!(matches!(handle.outcome().await, Err(MutationError::Write { .. })));
        assert_eq!(exec.store().get(&items()), before);
        assert_eq!(exec.status(&id), Some(MutationStatus::RolledBack));
    }

    #[tokio::test]
    async fn create_swaps_synthetic_id() {
        let exec = executor(Arc::new(SwitchRemote::default()));
        let handle = exec
            .apply(Mutation::create(&items(), Patch::new().set("name", "Milk")))
            .unwrap();
        let temporary = handle.temporary_id().cloned().unwrap();
        assert_eq!(exec.store().get(&items())[0].id, temporary);

        let committed = handle.outcome().await.unwrap();
        assert_eq!(committed.entity_id, Some(EntityId::new("perm-1")));
        let snapshot = exec.store().get(&items());
        assert_eq!(snapshot[0].id.as_str(), "perm-1");
        assert_eq!(snapshot[0].text("name"), Some("Milk"));
        assert!(!snapshot.contains(&temporary));
    }

    #[test]
    fn apply_outside_runtime_is_refused_before_staging() {
        let exec = executor(Arc::new(SwitchRemote::default()));
        let result = exec.apply(Mutation::delete(&items(), &"a".into()));
        assert!(matches!(result, Err(MutationError::NoRuntime)));
        assert!(exec.store().get(&items()).contains(&"a".into()));
    }

    #[test]
    fn queue_chains_same_entity_only() {
        let mut queue = WriteQueue::default();
        let a = (items(), EntityId::new("a"));
        let b = (items(), EntityId::new("b"));
        let first = queue.enqueue(MutationId::new(), vec![a.clone()]);
        let second = queue.enqueue(MutationId::new(), vec![a.clone(), b.clone()]);
        let third = queue.enqueue(MutationId::new(), vec![b.clone()]);

        assert!(first.predecessors.is_empty());
        assert_eq!(second.predecessors.len(), 1);
        assert_eq!(third.predecessors.len(), 1);

        queue.release(first);
        assert!(queue.tails.contains_key(&a));
        queue.release(second);
        assert!(!queue.tails.contains_key(&a));
        queue.release(third);
        assert!(queue.tails.is_empty());
    }
}
