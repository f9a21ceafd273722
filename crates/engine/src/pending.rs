use std::collections::{BTreeMap, VecDeque};

use pantry_core::{CollectionKey, Entity, EntityId, MutationId, MutationKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    InFlight,
    Committed,
    RolledBack,
}

impl MutationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InFlight => "in_flight",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        }
    }
}

/// What the optimistic step did to one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalChange {
    /// An existing entity was patched.
    Patched,
    /// A new entity was inserted (staged create or upsert of a missing id).
    Inserted,
    /// The entity was removed.
    Removed,
    /// Target was absent; nothing changed locally.
    Untouched,
}

/// Pre-mutation state of one entity, captured at apply time.
#[derive(Debug, Clone)]
pub struct Capture {
    pub collection: CollectionKey,
    pub entity_id: EntityId,
    pub change: LocalChange,
    pub previous: Option<Entity>,
    /// Index the entity occupied before a removal.
    pub position: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct PendingMutation {
    pub mutation_id: MutationId,
    pub kind: MutationKind,
    pub collection: Option<CollectionKey>,
    pub entity_id: Option<EntityId>,
    pub captures: Vec<Capture>,
    pub status: MutationStatus,
    pub started_at_ms: i64,
}

impl PendingMutation {
    pub fn touches(&self, collection: &CollectionKey, id: &EntityId) -> bool {
        self.captures
            .iter()
            .any(|c| &c.collection == collection && &c.entity_id == id)
    }
}

/// Outcome record kept after a mutation leaves the in-flight set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettledMutation {
    pub mutation_id: MutationId,
    pub kind: MutationKind,
    pub entity_id: Option<EntityId>,
    pub status: MutationStatus,
}

/// In-flight mutations plus a bounded history of settled ones.
pub struct PendingLedger {
    in_flight: BTreeMap<MutationId, PendingMutation>,
    settled: VecDeque<SettledMutation>,
    max_history: usize,
}

impl PendingLedger {
    pub fn new(max_history: usize) -> Self {
        Self {
            in_flight: BTreeMap::new(),
            settled: VecDeque::new(),
            max_history,
        }
    }

    pub fn begin(&mut self, pending: PendingMutation) {
        self.in_flight.insert(pending.mutation_id, pending);
    }

    /// Move a mutation out of the in-flight set. `None` if it was not in flight.
    pub fn settle(&mut self, id: &MutationId, status: MutationStatus) -> Option<PendingMutation> {
        let mut pending = self.in_flight.remove(id)?;
        pending.status = status;
        self.settled.push_back(SettledMutation {
            mutation_id: pending.mutation_id,
            kind: pending.kind,
            entity_id: pending.entity_id.clone(),
            status,
        });
        while self.settled.len() > self.max_history {
            self.settled.pop_front();
        }
        Some(pending)
    }

    /// Mutation ids are v7 uuids, so this is apply order.
    pub fn in_flight(&self) -> Vec<PendingMutation> {
        self.in_flight.values().cloned().collect()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn in_flight_for(&self, collection: &CollectionKey, id: &EntityId) -> usize {
        self.in_flight
            .values()
            .filter(|p| p.touches(collection, id))
            .count()
    }

    pub fn status(&self, id: &MutationId) -> Option<MutationStatus> {
        if self.in_flight.contains_key(id) {
            return Some(MutationStatus::InFlight);
        }
        self.settled
            .iter()
            .rev()
            .find(|s| &s.mutation_id == id)
            .map(|s| s.status)
    }

    pub fn recent(&self) -> Vec<SettledMutation> {
        self.settled.iter().cloned().collect()
    }
}
