use rusqlite::{Connection, OptionalExtension};

use pantry_core::{CollectionKey, Entity};

use crate::error::StorageError;
use crate::traits::{CachedSnapshot, SnapshotCache};

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

/// SQLite-backed snapshot cache. Payloads are msgpack, guarded by a blake3 checksum.
pub struct SqliteSnapshotCache {
    conn: Connection,
}

impl SqliteSnapshotCache {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}

fn encode(entities: &[Entity]) -> Result<Vec<u8>, StorageError> {
    rmp_serde::to_vec(entities).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode(payload: &[u8]) -> Result<Vec<Entity>, StorageError> {
    rmp_serde::from_slice(payload).map_err(|e| StorageError::Serialization(e.to_string()))
}

impl SnapshotCache for SqliteSnapshotCache {
    fn load(&self, key: &CollectionKey) -> Result<Option<CachedSnapshot>, StorageError> {
        let row: Option<(Vec<u8>, Vec<u8>, i64)> = self
            .conn
            .query_row(
                "SELECT payload, checksum, saved_at FROM snapshot_cache WHERE cache_key = ?1",
                rusqlite::params![key.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((payload, checksum, saved_at_ms)) = row else {
            return Ok(None);
        };

        let checksum = to_array::<32>(checksum, "checksum")?;
        if blake3::hash(&payload).as_bytes() != &checksum {
            tracing::warn!(collection = %key, "snapshot cache checksum mismatch; ignoring entry");
            return Ok(None);
        }

        match decode(&payload) {
            Ok(entities) => Ok(Some(CachedSnapshot {
                entities,
                saved_at_ms,
            })),
            Err(e) => {
                tracing::warn!(collection = %key, error = %e, "undecodable snapshot cache entry");
                Ok(None)
            }
        }
    }

    fn store(
        &mut self,
        key: &CollectionKey,
        entities: &[Entity],
        saved_at_ms: i64,
    ) -> Result<(), StorageError> {
        let payload = encode(entities)?;
        let checksum = blake3::hash(&payload);
        self.conn.execute(
            "INSERT INTO snapshot_cache (cache_key, payload, checksum, entity_count, saved_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(cache_key) DO UPDATE SET
                payload = excluded.payload,
                checksum = excluded.checksum,
                entity_count = excluded.entity_count,
                saved_at = excluded.saved_at",
            rusqlite::params![
                key.as_str(),
                payload,
                checksum.as_bytes().as_slice(),
                entities.len() as i64,
                saved_at_ms,
            ],
        )?;
        Ok(())
    }

    fn evict(&mut self, key: &CollectionKey) -> Result<bool, StorageError> {
        let removed = self.conn.execute(
            "DELETE FROM snapshot_cache WHERE cache_key = ?1",
            rusqlite::params![key.as_str()],
        )?;
        Ok(removed > 0)
    }

    fn keys(&self) -> Result<Vec<CollectionKey>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT cache_key FROM snapshot_cache ORDER BY cache_key")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(CollectionKey::new(row?));
        }
        Ok(keys)
    }
}
