use chrono::DateTime;
use memory_weave_schemas::{Backend, ConversationId, EntryId, StoreHealth};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

/// One embedding per ingested unit, keyed by the same entry id the
/// relational store uses. Nearest-neighbor queries run a flat cosine scan,
/// the same FLAT/COSINE layout the collection was designed around.
pub struct VectorStore {
    conn: Mutex<Connection>,
    dimension: usize,
}

/// Metadata filter applied before similarity scoring.
#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    pub conversation_id: Option<ConversationId>,
    /// RFC3339 lower bound on `created_at`.
    pub since: Option<String>,
}

impl VectorStore {
    pub fn open<P: AsRef<Path>>(path: P, dimension: usize) -> StoreResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| StoreError::unavailable(Backend::Vector, e.to_string()))?;
        let store = Self {
            conn: Mutex::new(conn),
            dimension,
        };
        store.initialize()?;
        info!("Vector store opened ({}d)", dimension);
        Ok(store)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::unavailable(Backend::Vector, "connection lock poisoned"))
    }

    /// Create the namespace. Safe to call when already initialized.
    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS embeddings (
                entry_id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                vector BLOB NOT NULL,
                dim INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_embeddings_conversation
             ON embeddings(conversation_id)",
            [],
        )?;
        Ok(())
    }

    pub fn upsert_embedding(
        &self,
        entry_id: &EntryId,
        vector: &[f32],
        conversation_id: &ConversationId,
        created_at: &str,
    ) -> StoreResult<()> {
        if vector.len() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO embeddings (entry_id, conversation_id, vector, dim, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(entry_id) DO UPDATE SET
                conversation_id = excluded.conversation_id,
                vector = excluded.vector,
                dim = excluded.dim,
                created_at = excluded.created_at",
            params![
                entry_id.0,
                conversation_id.0,
                encode_vector(vector),
                vector.len() as i64,
                created_at,
            ],
        )?;
        debug!("Upserted embedding for {}", entry_id);
        Ok(())
    }

    pub fn get_embedding(&self, entry_id: &EntryId) -> StoreResult<Option<Vec<f32>>> {
        let conn = self.lock()?;
        let blob = conn
            .query_row(
                "SELECT vector FROM embeddings WHERE entry_id = ?1",
                params![entry_id.0],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(blob.map(|b| decode_vector(&b)))
    }

    pub fn contains(&self, entry_id: &EntryId) -> StoreResult<bool> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM embeddings WHERE entry_id = ?1",
            params![entry_id.0],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Top-k nearest neighbors by cosine similarity, descending. Ties break
    /// toward the most recent `created_at`.
    pub fn nearest(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&VectorFilter>,
    ) -> StoreResult<Vec<(EntryId, f32)>> {
        if query.len() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT entry_id, conversation_id, vector, created_at FROM embeddings")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut scored: Vec<(EntryId, f32, i64)> = Vec::new();
        for row in rows {
            let (entry_id, conversation_id, blob, created_at) = row?;

            if let Some(filter) = filter {
                if let Some(ref conv) = filter.conversation_id {
                    if conv.0 != conversation_id {
                        continue;
                    }
                }
                if let Some(ref since) = filter.since {
                    if created_at.as_str() < since.as_str() {
                        continue;
                    }
                }
            }

            let vector = decode_vector(&blob);
            let score = cosine_similarity(query, &vector);
            scored.push((EntryId(entry_id), score, parse_timestamp(&created_at)));
        }

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.2.cmp(&a.2))
        });
        scored.truncate(k);

        debug!("Nearest query returned {} candidates", scored.len());
        Ok(scored.into_iter().map(|(id, score, _)| (id, score)).collect())
    }

    pub fn all_entry_ids(&self) -> StoreResult<Vec<EntryId>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT entry_id FROM embeddings")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids.into_iter().map(EntryId).collect())
    }

    pub fn delete(&self, entry_id: &EntryId) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM embeddings WHERE entry_id = ?1",
            params![entry_id.0],
        )?;
        Ok(())
    }

    pub fn count_records(&self) -> StoreResult<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn health(&self) -> StoreHealth {
        match self.count_records() {
            Ok(count) => StoreHealth {
                backend: Backend::Vector,
                reachable: true,
                record_count: count,
                last_error: None,
            },
            Err(e) => StoreHealth {
                backend: Backend::Vector,
                reachable: false,
                record_count: 0,
                last_error: Some(e.to_string()),
            },
        }
    }

    /// Drop and recreate the namespace. Lifecycle-only.
    pub fn reset(&self) -> StoreResult<()> {
        {
            let conn = self.lock()?;
            conn.execute("DROP TABLE IF EXISTS embeddings", [])?;
        }
        self.initialize()?;
        info!("Vector store reset");
        Ok(())
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn parse_timestamp(raw: &str) -> i64 {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(0)
}
