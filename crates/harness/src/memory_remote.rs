use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use pantry_core::{BatchOp, CollectionKey, Entity, EntityId, Patch};
use pantry_engine::{RemoteError, RemoteStore, SnapshotListener, Subscription};
use tokio::sync::watch;

const SERVER_EPOCH_MS: i64 = 1_700_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOp {
    Write,
    Create,
    Remove,
    Batch,
}

/// One-shot failure injected into the next matching remote call.
#[derive(Debug, Clone)]
pub struct Fault {
    op: RemoteOp,
    collection: Option<CollectionKey>,
    entity_id: Option<EntityId>,
    /// 1-based count of batch commits since the remote was created.
    chunk: Option<usize>,
    error: RemoteError,
}

impl Fault {
    pub fn on(op: RemoteOp) -> Self {
        Self {
            op,
            collection: None,
            entity_id: None,
            chunk: None,
            error: RemoteError::Unavailable("injected fault".into()),
        }
    }

    pub fn collection(mut self, collection: &CollectionKey) -> Self {
        self.collection = Some(collection.clone());
        self
    }

    pub fn entity(mut self, id: &EntityId) -> Self {
        self.entity_id = Some(id.clone());
        self
    }

    /// Fail the `n`-th batch chunk committed (1-based).
    pub fn chunk(mut self, n: usize) -> Self {
        self.chunk = Some(n);
        self
    }

    pub fn error(mut self, error: RemoteError) -> Self {
        self.error = error;
        self
    }

    fn matches(
        &self,
        op: RemoteOp,
        collection: Option<&CollectionKey>,
        id: Option<&EntityId>,
        chunk: Option<usize>,
    ) -> bool {
        self.op == op
            && self.collection.as_ref().is_none_or(|c| Some(c) == collection)
            && self.entity_id.as_ref().is_none_or(|e| Some(e) == id)
            && self.chunk.is_none_or(|n| Some(n) == chunk)
    }
}

/// Durably accepted remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitRecord {
    Write {
        collection: CollectionKey,
        entity_id: EntityId,
    },
    Create {
        collection: CollectionKey,
        entity_id: EntityId,
    },
    Remove {
        collection: CollectionKey,
        entity_id: EntityId,
    },
    Batch {
        ops: usize,
    },
}

struct Listener {
    id: u64,
    collection: CollectionKey,
    callback: SnapshotListener,
}

#[derive(Default)]
struct RemoteState {
    collections: HashMap<CollectionKey, Vec<Entity>>,
    listeners: Vec<Listener>,
    next_listener: u64,
    next_document: u64,
    faults: Vec<Fault>,
    log: Vec<CommitRecord>,
    batch_commits: usize,
    server_ms: i64,
}

impl RemoteState {
    fn take_fault(
        &mut self,
        op: RemoteOp,
        collection: Option<&CollectionKey>,
        id: Option<&EntityId>,
        chunk: Option<usize>,
    ) -> Result<(), RemoteError> {
        match self
            .faults
            .iter()
            .position(|f| f.matches(op, collection, id, chunk))
        {
            Some(index) => {
                let fault = self.faults.remove(index);
                tracing::debug!(?op, error = %fault.error, "injected remote fault");
                Err(fault.error)
            }
            None => Ok(()),
        }
    }

    fn tick(&mut self) -> i64 {
        self.server_ms += 1;
        SERVER_EPOCH_MS + self.server_ms
    }

    fn mint_id(&mut self) -> EntityId {
        self.next_document += 1;
        EntityId::new(format!("doc-{}", self.next_document))
    }

    fn upsert(&mut self, collection: &CollectionKey, id: &EntityId, patch: &Patch, server_ms: i64) {
        let docs = self.collections.entry(collection.clone()).or_default();
        match docs.iter_mut().find(|e| &e.id == id) {
            Some(doc) => patch.apply_committed(&mut doc.fields, server_ms),
            None => {
                let mut doc = Entity::new(id.clone());
                patch.apply_committed(&mut doc.fields, server_ms);
                docs.push(doc);
            }
        }
    }

    fn delete(&mut self, collection: &CollectionKey, id: &EntityId) {
        if let Some(docs) = self.collections.get_mut(collection) {
            docs.retain(|e| &e.id != id);
        }
    }

    /// Listener callbacks and the snapshots to hand them, for delivery after unlocking.
    fn echoes(&self, collections: &[&CollectionKey]) -> Vec<(SnapshotListener, Vec<Entity>)> {
        self.listeners
            .iter()
            .filter(|l| collections.contains(&&l.collection))
            .map(|l| {
                let docs = self.collections.get(&l.collection).cloned().unwrap_or_default();
                (l.callback.clone(), docs)
            })
            .collect()
    }
}

fn deliver(echoes: Vec<(SnapshotListener, Vec<Entity>)>) {
    for (listener, docs) in echoes {
        listener(docs);
    }
}

/// In-process stand-in for the hosted document store.
///
/// Writes apply immediately and echo full snapshots to listeners, like the
/// real backend does. `pause` holds every write until `resume`, and faults
/// fail the next matching call once.
#[derive(Clone)]
pub struct MemoryRemote {
    state: Arc<Mutex<RemoteState>>,
    gate: Arc<watch::Sender<bool>>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            state: Arc::new(Mutex::new(RemoteState::default())),
            gate: Arc::new(gate),
        }
    }

    fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn wait_open(&self) {
        let mut open = self.gate.subscribe();
        let _ = open.wait_for(|open| *open).await;
    }

    pub fn pause(&self) {
        self.gate.send_replace(false);
    }

    pub fn resume(&self) {
        self.gate.send_replace(true);
    }

    pub fn is_paused(&self) -> bool {
        !*self.gate.borrow()
    }

    pub fn fail_next(&self, fault: Fault) {
        self.state().faults.push(fault);
    }

    pub fn pending_faults(&self) -> usize {
        self.state().faults.len()
    }

    /// Put documents on the server, echoing to listeners.
    pub fn seed(&self, collection: &CollectionKey, docs: Vec<Entity>) {
        let echoes = {
            let mut state = self.state();
            state.collections.insert(collection.clone(), docs);
            state.echoes(&[collection])
        };
        deliver(echoes);
    }

    pub fn documents(&self, collection: &CollectionKey) -> Vec<Entity> {
        self.state()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn document(&self, collection: &CollectionKey, id: &EntityId) -> Option<Entity> {
        self.state()
            .collections
            .get(collection)
            .and_then(|docs| docs.iter().find(|e| &e.id == id).cloned())
    }

    pub fn commit_log(&self) -> Vec<CommitRecord> {
        self.state().log.clone()
    }

    pub fn batch_commits(&self) -> usize {
        self.state().batch_commits
    }

    pub fn listener_count(&self, collection: &CollectionKey) -> usize {
        self.state()
            .listeners
            .iter()
            .filter(|l| &l.collection == collection)
            .count()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    fn subscribe(
        &self,
        collection: &CollectionKey,
        listener: SnapshotListener,
    ) -> Result<Subscription, RemoteError> {
        let (id, initial) = {
            let mut state = self.state();
            state.next_listener += 1;
            let id = state.next_listener;
            state.listeners.push(Listener {
                id,
                collection: collection.clone(),
                callback: listener.clone(),
            });
            let docs = state.collections.get(collection).cloned().unwrap_or_default();
            (id, docs)
        };
        listener(initial);

        let state = Arc::clone(&self.state);
        Ok(Subscription::new(move || {
            state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .listeners
                .retain(|l| l.id != id);
        }))
    }

    fn new_document_id(&self, _collection: &CollectionKey) -> EntityId {
        self.state().mint_id()
    }

    async fn write(
        &self,
        collection: &CollectionKey,
        id: &EntityId,
        patch: &Patch,
        upsert: bool,
    ) -> Result<(), RemoteError> {
        self.wait_open().await;
        let echoes = {
            let mut state = self.state();
            state.take_fault(RemoteOp::Write, Some(collection), Some(id), None)?;
            let exists = state
                .collections
                .get(collection)
                .is_some_and(|docs| docs.iter().any(|e| &e.id == id));
            if !exists && !upsert {
                return Err(RemoteError::NotFound {
                    collection: collection.clone(),
                    entity_id: id.clone(),
                });
            }
            let now = state.tick();
            state.upsert(collection, id, patch, now);
            state.log.push(CommitRecord::Write {
                collection: collection.clone(),
                entity_id: id.clone(),
            });
            state.echoes(&[collection])
        };
        deliver(echoes);
        Ok(())
    }

    async fn create(&self, collection: &CollectionKey, fields: &Patch) -> Result<EntityId, RemoteError> {
        self.wait_open().await;
        let (id, echoes) = {
            let mut state = self.state();
            state.take_fault(RemoteOp::Create, Some(collection), None, None)?;
            let id = state.mint_id();
            let now = state.tick();
            state.upsert(collection, &id, fields, now);
            state.log.push(CommitRecord::Create {
                collection: collection.clone(),
                entity_id: id.clone(),
            });
            (id, state.echoes(&[collection]))
        };
        deliver(echoes);
        Ok(id)
    }

    async fn remove(&self, collection: &CollectionKey, id: &EntityId) -> Result<(), RemoteError> {
        self.wait_open().await;
        let echoes = {
            let mut state = self.state();
            state.take_fault(RemoteOp::Remove, Some(collection), Some(id), None)?;
            state.delete(collection, id);
            state.log.push(CommitRecord::Remove {
                collection: collection.clone(),
                entity_id: id.clone(),
            });
            state.echoes(&[collection])
        };
        deliver(echoes);
        Ok(())
    }

    async fn commit_batch(&self, ops: &[BatchOp]) -> Result<(), RemoteError> {
        self.wait_open().await;
        let echoes = {
            let mut state = self.state();
            state.batch_commits += 1;
            let chunk = state.batch_commits;
            let first = ops.first();
            state.take_fault(
                RemoteOp::Batch,
                first.map(BatchOp::collection),
                None,
                Some(chunk),
            )?;
            let now = state.tick();
            let mut touched: Vec<&CollectionKey> = Vec::new();
            for op in ops {
                match op {
                    BatchOp::Set {
                        collection,
                        entity_id,
                        patch,
                    } => state.upsert(collection, entity_id, patch, now),
                    BatchOp::Delete {
                        collection,
                        entity_id,
                    } => state.delete(collection, entity_id),
                }
                if !touched.contains(&op.collection()) {
                    touched.push(op.collection());
                }
            }
            state.log.push(CommitRecord::Batch { ops: ops.len() });
            state.echoes(&touched)
        };
        deliver(echoes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn items() -> CollectionKey {
        CollectionKey::items("hh")
    }

    #[tokio::test]
    async fn writes_echo_to_listeners() -> Result<(), Box<dyn std::error::Error>> {
        let remote = MemoryRemote::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let _sub = remote.subscribe(
            &items(),
            Arc::new(move |docs: Vec<Entity>| {
                counter.store(docs.len(), Ordering::SeqCst);
            }),
        )?;

        let id = remote.create(&items(), &Patch::new().set("name", "Milk")).await?;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        remote.remove(&items(), &id).await?;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(remote.commit_log().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn faults_fire_once() -> Result<(), Box<dyn std::error::Error>> {
        let remote = MemoryRemote::new();
        remote.seed(&items(), vec![Entity::new("a")]);
        remote.fail_next(Fault::on(RemoteOp::Write).entity(&"a".into()));

        let patch = Patch::new().set("qty", "1");
        assert!(remote.write(&items(), &"a".into(), &patch, false).await.is_err());
        remote.write(&items(), &"a".into(), &patch, false).await?;
        assert_eq!(remote.pending_faults(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn update_of_missing_document_is_not_found() {
        let remote = MemoryRemote::new();
        let result = remote
            .write(&items(), &"ghost".into(), &Patch::new().set("qty", "1"), false)
            .await;
        assert!(matches!(result, Err(RemoteError::NotFound { .. })));
    }

    #[test]
    fn dropping_subscription_removes_listener() -> Result<(), Box<dyn std::error::Error>> {
        let remote = MemoryRemote::new();
        let sub = remote.subscribe(&items(), Arc::new(|_: Vec<Entity>| {}))?;
        assert_eq!(remote.listener_count(&items()), 1);
        drop(sub);
        assert_eq!(remote.listener_count(&items()), 0);
        Ok(())
    }
}
