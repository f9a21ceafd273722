use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use pantry_core::{Clock, CollectionKey, Entity, EntityId, Patch, Snapshot, SystemClock};

#[derive(Default)]
struct StoreState {
    collections: HashMap<CollectionKey, Snapshot>,
    dirty: BTreeSet<CollectionKey>,
}

/// Latest known snapshot per collection, shared by every component that reads
/// or patches local state. Clone-friendly via Arc.
///
/// Every call takes the lock once and releases it before returning, so no
/// caller can hold it across an await point.
#[derive(Clone)]
pub struct SnapshotStore {
    state: Arc<Mutex<StoreState>>,
    clock: Arc<dyn Clock>,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl SnapshotStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            clock,
        }
    }

    // Mutations leave the state consistent between statements, so a panic in
    // another holder cannot leave anything half-written.
    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, collection: &CollectionKey) -> Snapshot {
        self.lock()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn entity(&self, collection: &CollectionKey, id: &EntityId) -> Option<Entity> {
        self.lock()
            .collections
            .get(collection)
            .and_then(|s| s.get(id).cloned())
    }

    pub fn position_of(&self, collection: &CollectionKey, id: &EntityId) -> Option<usize> {
        self.lock()
            .collections
            .get(collection)
            .and_then(|s| s.position(id))
    }

    pub fn find_by(
        &self,
        collection: &CollectionKey,
        predicate: impl Fn(&Entity) -> bool,
    ) -> Option<Entity> {
        self.lock()
            .collections
            .get(collection)
            .and_then(|s| s.iter().find(|e| predicate(e)).cloned())
    }

    pub fn filter_by(
        &self,
        collection: &CollectionKey,
        predicate: impl Fn(&Entity) -> bool,
    ) -> Vec<Entity> {
        self.get(collection)
            .iter()
            .filter(|e| predicate(e))
            .cloned()
            .collect()
    }

    pub fn replace(&self, collection: &CollectionKey, snapshot: impl Into<Snapshot>) {
        let mut state = self.lock();
        state.collections.insert(collection.clone(), snapshot.into());
        state.dirty.insert(collection.clone());
    }

    /// Shallow-merge `patch` over the entity with `id`, in place.
    ///
    /// A missing entity is prepended when `insert_if_missing` is set and
    /// ignored otherwise. Returns the entity as it was before the patch.
    pub fn patch_by_id(
        &self,
        collection: &CollectionKey,
        id: &EntityId,
        patch: &Patch,
        insert_if_missing: bool,
    ) -> Option<Entity> {
        let now = self.clock.now_ms();
        self.edit(collection, |entities| {
            match entities.iter().position(|e| &e.id == id) {
                Some(index) => {
                    let previous = entities[index].clone();
                    entities[index] = previous.patched(patch, now);
                    Some(previous)
                }
                None => {
                    if insert_if_missing {
                        entities.insert(0, Entity::from_patch(id.clone(), patch, now));
                    }
                    None
                }
            }
        })
    }

    /// Prepend a brand-new entity, as a staged create does.
    pub fn insert_front(&self, collection: &CollectionKey, entity: Entity) {
        self.edit(collection, |entities| {
            entities.retain(|e| e.id != entity.id);
            entities.insert(0, entity);
        });
    }

    pub fn remove_by_id(&self, collection: &CollectionKey, id: &EntityId) -> Option<Entity> {
        self.remove_with_position(collection, id).map(|(_, e)| e)
    }

    /// Remove an entity and report where it stood.
    pub fn remove_with_position(
        &self,
        collection: &CollectionKey,
        id: &EntityId,
    ) -> Option<(usize, Entity)> {
        self.edit(collection, |entities| {
            let index = entities.iter().position(|e| &e.id == id)?;
            Some((index, entities.remove(index)))
        })
    }

    /// Put `entity` back: in place when its id is present, otherwise at
    /// `position` clamped to the current length.
    pub fn restore(&self, collection: &CollectionKey, entity: Entity, position: usize) {
        self.edit(collection, |entities| {
            match entities.iter().position(|e| e.id == entity.id) {
                Some(index) => entities[index] = entity,
                None => {
                    let at = position.min(entities.len());
                    entities.insert(at, entity);
                }
            }
        });
    }

    /// Overwrite an entity only if it is still present. Returns whether it was.
    pub fn substitute(&self, collection: &CollectionKey, entity: Entity) -> bool {
        self.edit(collection, |entities| {
            match entities.iter().position(|e| e.id == entity.id) {
                Some(index) => {
                    entities[index] = entity;
                    true
                }
                None => false,
            }
        })
    }

    /// Replace the synthetic entity `from` with `to`, keeping its position.
    ///
    /// If `to` already arrived through a remote snapshot the synthetic entity
    /// is only dropped. Returns whether anything changed.
    pub fn swap_id(&self, collection: &CollectionKey, from: &EntityId, to: &EntityId) -> bool {
        self.edit(collection, |entities| {
            let Some(index) = entities.iter().position(|e| &e.id == from) else {
                return false;
            };
            if entities.iter().any(|e| &e.id == to) {
                entities.remove(index);
            } else {
                entities[index] = entities[index].with_id(to.clone());
            }
            true
        })
    }

    /// Collections changed since the last call, in key order.
    pub fn take_dirty(&self) -> Vec<CollectionKey> {
        std::mem::take(&mut self.lock().dirty).into_iter().collect()
    }

    pub fn collections(&self) -> Vec<CollectionKey> {
        let mut keys: Vec<_> = self.lock().collections.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Copy-on-write edit of one collection. Marks it dirty only if the contents changed.
    fn edit<R>(&self, collection: &CollectionKey, f: impl FnOnce(&mut Vec<Entity>) -> R) -> R {
        let mut state = self.lock();
        let current = state.collections.get(collection).cloned().unwrap_or_default();
        let mut entities = current.to_vec();
        let result = f(&mut entities);
        if entities.as_slice() != &current[..] {
            state
                .collections
                .insert(collection.clone(), Snapshot::from(entities));
            state.dirty.insert(collection.clone());
        }
        result
    }
}
