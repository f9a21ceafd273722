use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::{CollectionKey, EntityId};
use crate::patch::{ID_FIELD, Patch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
    Batch,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Batch => "batch",
        }
    }
}

/// One write inside a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOp {
    /// Merge-upsert: patches the entity, inserting it when missing.
    Set {
        collection: CollectionKey,
        entity_id: EntityId,
        patch: Patch,
    },
    Delete {
        collection: CollectionKey,
        entity_id: EntityId,
    },
}

impl BatchOp {
    pub fn set(collection: &CollectionKey, entity_id: &EntityId, patch: Patch) -> Self {
        BatchOp::Set {
            collection: collection.clone(),
            entity_id: entity_id.clone(),
            patch,
        }
    }

    pub fn delete(collection: &CollectionKey, entity_id: &EntityId) -> Self {
        BatchOp::Delete {
            collection: collection.clone(),
            entity_id: entity_id.clone(),
        }
    }

    pub fn collection(&self) -> &CollectionKey {
        match self {
            BatchOp::Set { collection, .. } | BatchOp::Delete { collection, .. } => collection,
        }
    }

    pub fn entity_id(&self) -> &EntityId {
        match self {
            BatchOp::Set { entity_id, .. } | BatchOp::Delete { entity_id, .. } => entity_id,
        }
    }

    fn validate(&self) -> Result<(), CoreError> {
        require_target(self.collection(), self.entity_id())?;
        if let BatchOp::Set { patch, .. } = self {
            require_patch(patch)?;
        }
        Ok(())
    }
}

/// A user-initiated change to one or more entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    /// Stage a new entity. Without an id it lives under a synthetic one until
    /// the backend assigns the permanent id; with one, it is written under it.
    Create {
        collection: CollectionKey,
        entity_id: Option<EntityId>,
        fields: Patch,
    },
    /// Merge `patch` into an entity. With `insert_if_missing` it is an upsert.
    Update {
        collection: CollectionKey,
        entity_id: EntityId,
        patch: Patch,
        insert_if_missing: bool,
    },
    Delete {
        collection: CollectionKey,
        entity_id: EntityId,
    },
    Batch {
        ops: Vec<BatchOp>,
    },
}

impl Mutation {
    pub fn create(collection: &CollectionKey, fields: Patch) -> Self {
        Mutation::Create {
            collection: collection.clone(),
            entity_id: None,
            fields,
        }
    }

    /// Create under an id the backend allocated up front.
    pub fn create_with_id(collection: &CollectionKey, entity_id: &EntityId, fields: Patch) -> Self {
        Mutation::Create {
            collection: collection.clone(),
            entity_id: Some(entity_id.clone()),
            fields,
        }
    }

    pub fn update(collection: &CollectionKey, entity_id: &EntityId, patch: Patch) -> Self {
        Mutation::Update {
            collection: collection.clone(),
            entity_id: entity_id.clone(),
            patch,
            insert_if_missing: false,
        }
    }

    pub fn upsert(collection: &CollectionKey, entity_id: &EntityId, patch: Patch) -> Self {
        Mutation::Update {
            collection: collection.clone(),
            entity_id: entity_id.clone(),
            patch,
            insert_if_missing: true,
        }
    }

    pub fn delete(collection: &CollectionKey, entity_id: &EntityId) -> Self {
        Mutation::Delete {
            collection: collection.clone(),
            entity_id: entity_id.clone(),
        }
    }

    pub fn batch(ops: Vec<BatchOp>) -> Self {
        Mutation::Batch { ops }
    }

    pub fn kind(&self) -> MutationKind {
        match self {
            Mutation::Create { .. } => MutationKind::Create,
            Mutation::Update { .. } => MutationKind::Update,
            Mutation::Delete { .. } => MutationKind::Delete,
            Mutation::Batch { .. } => MutationKind::Batch,
        }
    }

    /// Collection of a single-entity mutation; batches report their first op.
    pub fn collection(&self) -> Option<&CollectionKey> {
        match self {
            Mutation::Create { collection, .. }
            | Mutation::Update { collection, .. }
            | Mutation::Delete { collection, .. } => Some(collection),
            Mutation::Batch { ops } => ops.first().map(BatchOp::collection),
        }
    }

    /// Target entity, for mutations that name one.
    pub fn entity_id(&self) -> Option<&EntityId> {
        match self {
            Mutation::Update { entity_id, .. } | Mutation::Delete { entity_id, .. } => {
                Some(entity_id)
            }
            Mutation::Create { entity_id, .. } => entity_id.as_ref(),
            Mutation::Batch { .. } => None,
        }
    }

    /// Reject mutations that must never reach the local store or the backend.
    pub fn validate(&self) -> Result<(), CoreError> {
        match self {
            Mutation::Create {
                collection,
                entity_id,
                fields,
            } => {
                match entity_id {
                    Some(id) => require_target(collection, id)?,
                    None if collection.is_blank() => {
                        return Err(CoreError::InvalidOperation("missing collection".into()));
                    }
                    None => {}
                }
                require_patch(fields)
            }
            Mutation::Update {
                collection,
                entity_id,
                patch,
                ..
            } => {
                require_target(collection, entity_id)?;
                require_patch(patch)
            }
            Mutation::Delete {
                collection,
                entity_id,
            } => require_target(collection, entity_id),
            Mutation::Batch { ops } => {
                if ops.is_empty() {
                    return Err(CoreError::InvalidOperation("empty batch".into()));
                }
                ops.iter().try_for_each(BatchOp::validate)
            }
        }
    }
}

fn require_target(collection: &CollectionKey, entity_id: &EntityId) -> Result<(), CoreError> {
    if collection.is_blank() {
        return Err(CoreError::InvalidOperation("missing collection".into()));
    }
    if entity_id.is_blank() {
        return Err(CoreError::InvalidOperation("missing id".into()));
    }
    Ok(())
}

fn require_patch(patch: &Patch) -> Result<(), CoreError> {
    if patch.is_empty() {
        return Err(CoreError::InvalidOperation("empty patch".into()));
    }
    if patch.contains(ID_FIELD) {
        return Err(CoreError::InvalidOperation("the id field is immutable".into()));
    }
    Ok(())
}
