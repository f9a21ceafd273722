use std::collections::{BTreeMap, HashSet};
use std::ops::Deref;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::field_value::FieldValue;
use crate::ids::EntityId;
use crate::patch::{Patch, UPDATED_AT_FIELD};

/// State of an entity's `updatedAt` marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatedAt {
    Confirmed(i64),
    Pending(i64),
    Unknown,
}

/// One document of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Entity {
    pub fn new(id: impl Into<EntityId>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Build an entity from a patch, as an insert-if-missing would.
    pub fn from_patch(id: EntityId, patch: &Patch, now_ms: i64) -> Self {
        let mut fields = BTreeMap::new();
        patch.apply_local(&mut fields, now_ms);
        Self { id, fields }
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(FieldValue::as_text)
    }

    /// Flag lookup; absent fields read as `false`.
    pub fn flag(&self, key: &str) -> bool {
        self.fields.get(key).is_some_and(FieldValue::is_truthy)
    }

    pub fn updated_at(&self) -> UpdatedAt {
        match self.fields.get(UPDATED_AT_FIELD) {
            Some(FieldValue::Timestamp(ms)) => UpdatedAt::Confirmed(*ms),
            Some(FieldValue::PendingTimestamp(ms)) => UpdatedAt::Pending(*ms),
            _ => UpdatedAt::Unknown,
        }
    }

    /// New entity with `patch` shallow-merged over this one.
    pub fn patched(&self, patch: &Patch, now_ms: i64) -> Self {
        let mut fields = self.fields.clone();
        patch.apply_local(&mut fields, now_ms);
        Self {
            id: self.id.clone(),
            fields,
        }
    }

    /// Same fields under a different id.
    pub fn with_id(&self, id: EntityId) -> Self {
        Self {
            id,
            fields: self.fields.clone(),
        }
    }
}

/// Immutable ordered view of one collection. Cloning is cheap.
///
/// Holds at most one entity per id; construction keeps the first occurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    entities: Arc<Vec<Entity>>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, id: &EntityId) -> Option<&Entity> {
        self.entities.iter().find(|e| &e.id == id)
    }

    pub fn position(&self, id: &EntityId) -> Option<usize> {
        self.entities.iter().position(|e| &e.id == id)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.position(id).is_some()
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.entities.iter().map(|e| e.id.clone()).collect()
    }

    pub fn to_vec(&self) -> Vec<Entity> {
        self.entities.as_ref().clone()
    }

    /// True when both snapshots share the same allocation.
    pub fn ptr_eq(&self, other: &Snapshot) -> bool {
        Arc::ptr_eq(&self.entities, &other.entities)
    }
}

impl From<Vec<Entity>> for Snapshot {
    fn from(entities: Vec<Entity>) -> Self {
        let mut seen = HashSet::with_capacity(entities.len());
        let deduped: Vec<Entity> = entities
            .into_iter()
            .filter(|e| seen.insert(e.id.clone()))
            .collect();
        Self {
            entities: Arc::new(deduped),
        }
    }
}

impl FromIterator<Entity> for Snapshot {
    fn from_iter<I: IntoIterator<Item = Entity>>(iter: I) -> Self {
        Self::from(iter.into_iter().collect::<Vec<_>>())
    }
}

impl Deref for Snapshot {
    type Target = [Entity];

    fn deref(&self) -> &[Entity] {
        &self.entities
    }
}
