use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::field_value::FieldValue;

/// Field name of the entity id. Patches may never touch it.
pub const ID_FIELD: &str = "id";

/// Field name of the update marker stamped on every write.
pub const UPDATED_AT_FIELD: &str = "updatedAt";

/// One field of a partial update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldPatch {
    Set(FieldValue),
    /// Resolved to the server's commit time by the backend; a local
    /// `PendingTimestamp` stands in until the echo arrives.
    ServerTimestamp,
    Delete,
}

impl FieldPatch {
    /// Value to store locally for this patch, `None` when the field is removed.
    pub fn local_value(&self, now_ms: i64) -> Option<FieldValue> {
        match self {
            FieldPatch::Set(v) => Some(v.clone()),
            FieldPatch::ServerTimestamp => Some(FieldValue::PendingTimestamp(now_ms)),
            FieldPatch::Delete => None,
        }
    }

    /// Value a backend commits for this patch, `None` when the field is removed.
    pub fn committed_value(&self, server_ms: i64) -> Option<FieldValue> {
        match self {
            FieldPatch::Set(v) => Some(v.clone()),
            FieldPatch::ServerTimestamp => Some(FieldValue::Timestamp(server_ms)),
            FieldPatch::Delete => None,
        }
    }
}

/// A partial update: field name to [`FieldPatch`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    fields: BTreeMap<String, FieldPatch>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.to_string(), FieldPatch::Set(value.into()));
        self
    }

    pub fn server_timestamp(mut self, key: &str) -> Self {
        self.fields.insert(key.to_string(), FieldPatch::ServerTimestamp);
        self
    }

    pub fn delete(mut self, key: &str) -> Self {
        self.fields.insert(key.to_string(), FieldPatch::Delete);
        self
    }

    /// Stamp `updatedAt` with a server timestamp, as every write does.
    pub fn touched(self) -> Self {
        self.server_timestamp(UPDATED_AT_FIELD)
    }

    pub fn insert(&mut self, key: impl Into<String>, patch: FieldPatch) {
        self.fields.insert(key.into(), patch);
    }

    pub fn get(&self, key: &str) -> Option<&FieldPatch> {
        self.fields.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldPatch)> {
        self.fields.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Shallow-merge into a field map using local placeholder semantics.
    pub fn apply_local(&self, fields: &mut BTreeMap<String, FieldValue>, now_ms: i64) {
        for (key, patch) in &self.fields {
            match patch.local_value(now_ms) {
                Some(value) => {
                    fields.insert(key.clone(), value);
                }
                None => {
                    fields.remove(key);
                }
            }
        }
    }

    /// Shallow-merge into a field map the way a backend commits it.
    pub fn apply_committed(&self, fields: &mut BTreeMap<String, FieldValue>, server_ms: i64) {
        for (key, patch) in &self.fields {
            match patch.committed_value(server_ms) {
                Some(value) => {
                    fields.insert(key.clone(), value);
                }
                None => {
                    fields.remove(key);
                }
            }
        }
    }
}

impl FromIterator<(String, FieldPatch)> for Patch {
    fn from_iter<I: IntoIterator<Item = (String, FieldPatch)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}
