use chrono::Utc;
use memory_weave_schemas::{
    Backend, ConversationId, EntryId, IngestedEntry, Sender, StoreHealth, TurnId,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

/// Durable store of turns keyed by entry id. This backend is the source of
/// truth for existence and ordering: an entry exists once (and only once)
/// its row is committed here.
pub struct RelationalStore {
    conn: Mutex<Connection>,
}

/// A row as persisted, including the projection bookkeeping the pipeline
/// uses for idempotent catch-up of the derived stores.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub entry_id: EntryId,
    pub conversation_id: ConversationId,
    pub turn_id: TurnId,
    pub sender: Sender,
    pub text: String,
    pub content_hash: String,
    pub created_at: String,
    pub source_ref: Option<String>,
    pub vector_synced: bool,
    pub graph_synced: bool,
}

/// Outcome of the idempotence check for one incoming turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// No row with this entry id.
    Absent,
    /// A row exists but the content hash differs; the turn must be rewritten.
    Stale,
    /// A row exists with identical content. The flags say which derived
    /// projections are still missing from a previous partial run.
    Current {
        vector_synced: bool,
        graph_synced: bool,
    },
}

impl RelationalStore {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| StoreError::unavailable(Backend::Relational, e.to_string()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize()?;
        info!("Relational store opened");
        Ok(store)
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::unavailable(Backend::Relational, "connection lock poisoned"))
    }

    /// Create the schema. Safe to call on an already-initialized store.
    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS entries (
                entry_id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                turn_id TEXT NOT NULL,
                sender TEXT NOT NULL,
                text TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                created_at TEXT NOT NULL,
                source_ref TEXT,
                vector_synced INTEGER NOT NULL DEFAULT 0,
                graph_synced INTEGER NOT NULL DEFAULT 0,
                ingested_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_entries_conversation
             ON entries(conversation_id, created_at)",
            [],
        )?;
        Ok(())
    }

    /// Write or rewrite an entry row. Rewriting resets the projection flags
    /// so the derived stores get refreshed on the same pass.
    pub fn upsert_entry(&self, entry: &IngestedEntry) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO entries
                (entry_id, conversation_id, turn_id, sender, text, content_hash,
                 created_at, source_ref, vector_synced, graph_synced, ingested_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, 0, ?9)
             ON CONFLICT(entry_id) DO UPDATE SET
                sender = excluded.sender,
                text = excluded.text,
                content_hash = excluded.content_hash,
                created_at = excluded.created_at,
                source_ref = excluded.source_ref,
                vector_synced = 0,
                graph_synced = 0,
                ingested_at = excluded.ingested_at",
            params![
                entry.entry_id.0,
                entry.conversation_id.0,
                entry.turn_id.0,
                entry.sender.as_str(),
                entry.text,
                entry.content_hash,
                entry.created_at,
                entry.source_ref,
                Utc::now().to_rfc3339(),
            ],
        )?;
        debug!("Upserted entry {}", entry.entry_id);
        Ok(())
    }

    pub fn get_entry(&self, entry_id: &EntryId) -> StoreResult<Option<StoredEntry>> {
        let conn = self.lock()?;
        let entry = conn
            .query_row(
                "SELECT entry_id, conversation_id, turn_id, sender, text, content_hash,
                        created_at, source_ref, vector_synced, graph_synced
                 FROM entries WHERE entry_id = ?1",
                params![entry_id.0],
                Self::row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn contains(&self, entry_id: &EntryId) -> StoreResult<bool> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entries WHERE entry_id = ?1",
            params![entry_id.0],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Existence and content-hash check driving the ingestion idempotence
    /// decision.
    pub fn entry_state(&self, entry_id: &EntryId, content_hash: &str) -> StoreResult<EntryState> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT content_hash, vector_synced, graph_synced
                 FROM entries WHERE entry_id = ?1",
                params![entry_id.0],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)? != 0,
                        row.get::<_, i64>(2)? != 0,
                    ))
                },
            )
            .optional()?;

        Ok(match row {
            None => EntryState::Absent,
            Some((hash, _, _)) if hash != content_hash => EntryState::Stale,
            Some((_, vector_synced, graph_synced)) => EntryState::Current {
                vector_synced,
                graph_synced,
            },
        })
    }

    /// Record that a derived projection of this entry has been written.
    pub fn mark_synced(&self, entry_id: &EntryId, backend: Backend) -> StoreResult<()> {
        let column = match backend {
            Backend::Vector => "vector_synced",
            Backend::Graph => "graph_synced",
            Backend::Relational => return Ok(()),
        };
        let conn = self.lock()?;
        conn.execute(
            &format!("UPDATE entries SET {} = 1 WHERE entry_id = ?1", column),
            params![entry_id.0],
        )?;
        Ok(())
    }

    /// Ordered retrieval of a conversation's turns, oldest first.
    pub fn conversation_turns(
        &self,
        conversation_id: &ConversationId,
    ) -> StoreResult<Vec<StoredEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT entry_id, conversation_id, turn_id, sender, text, content_hash,
                    created_at, source_ref, vector_synced, graph_synced
             FROM entries
             WHERE conversation_id = ?1
             ORDER BY created_at, turn_id",
        )?;
        let entries = stmt
            .query_map(params![conversation_id.0], Self::row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn delete(&self, entry_id: &EntryId) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM entries WHERE entry_id = ?1", params![entry_id.0])?;
        Ok(())
    }

    pub fn count_entries(&self) -> StoreResult<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn health(&self) -> StoreHealth {
        match self.count_entries() {
            Ok(count) => StoreHealth {
                backend: Backend::Relational,
                reachable: true,
                record_count: count,
                last_error: None,
            },
            Err(e) => StoreHealth {
                backend: Backend::Relational,
                reachable: false,
                record_count: 0,
                last_error: Some(e.to_string()),
            },
        }
    }

    /// Drop and recreate the schema. Destructive; only the lifecycle manager
    /// calls this, never ingestion.
    pub fn reset(&self) -> StoreResult<()> {
        {
            let conn = self.lock()?;
            conn.execute("DROP TABLE IF EXISTS entries", [])?;
        }
        self.initialize()?;
        info!("Relational store reset");
        Ok(())
    }

    fn row_to_entry(row: &Row) -> rusqlite::Result<StoredEntry> {
        let sender: String = row.get(3)?;
        Ok(StoredEntry {
            entry_id: EntryId(row.get(0)?),
            conversation_id: ConversationId(row.get(1)?),
            turn_id: TurnId(row.get(2)?),
            sender: Sender::parse(&sender),
            text: row.get(4)?,
            content_hash: row.get(5)?,
            created_at: row.get(6)?,
            source_ref: row.get(7)?,
            vector_synced: row.get::<_, i64>(8)? != 0,
            graph_synced: row.get::<_, i64>(9)? != 0,
        })
    }
}
