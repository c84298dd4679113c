use memory_weave_schemas::{
    combine_confidence, Backend, EdgeTarget, EntityId, EntityMention, EntityType, EntryId,
    GraphEdge, GraphEntity, StoreHealth,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

/// Entities and confidence-weighted relationships between entities and
/// between entities and entries. Nodes are deduplicated on normalized
/// label+type; edges merge confidence and accumulate evidence instead of
/// duplicating.
pub struct GraphStore {
    conn: Mutex<Connection>,
}

/// Result of a bounded traversal from a start entity.
#[derive(Debug, Clone, Default)]
pub struct GraphNeighborhood {
    pub entities: Vec<GraphEntity>,
    pub edges: Vec<GraphEdge>,
}

impl GraphStore {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| StoreError::unavailable(Backend::Graph, e.to_string()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize()?;
        info!("Graph store opened");
        Ok(store)
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::unavailable(Backend::Graph, "connection lock poisoned"))
    }

    /// Create the schema. Safe to call when already initialized.
    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS entities (
                id TEXT PRIMARY KEY,
                label TEXT NOT NULL,
                label_norm TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                mention_count INTEGER NOT NULL DEFAULT 1
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_entities_label ON entities(label_norm)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS edges (
                id TEXT PRIMARY KEY,
                subject_id TEXT NOT NULL,
                predicate TEXT NOT NULL,
                object_id TEXT NOT NULL,
                object_kind TEXT NOT NULL,
                confidence REAL NOT NULL,
                evidence TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_edges_subject ON edges(subject_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_edges_object ON edges(object_kind, object_id)",
            [],
        )?;
        Ok(())
    }

    /// Case/type-normalized lookup-or-insert. The first mention creates the
    /// canonical node; later mentions bump `last_seen` and the mention count.
    pub fn upsert_entity(&self, mention: &EntityMention, seen_at: &str) -> StoreResult<EntityId> {
        let id = mention.entity_id();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO entities (id, label, label_norm, entity_type, first_seen, last_seen, mention_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, 1)
             ON CONFLICT(id) DO UPDATE SET
                last_seen = excluded.last_seen,
                mention_count = mention_count + 1",
            params![
                id.0,
                mention.label.trim(),
                memory_weave_schemas::normalize_label(&mention.label),
                mention.entity_type.as_str(),
                seen_at,
            ],
        )?;
        debug!("Upserted entity {} ({})", mention.label, id);
        Ok(id)
    }

    /// Upsert a relationship. Re-deriving an edge from an entry already in
    /// its evidence list is a no-op, so replays never inflate confidence;
    /// genuinely new evidence merges via independent combination.
    pub fn upsert_edge(
        &self,
        subject: &EntityId,
        predicate: &str,
        object: &EdgeTarget,
        confidence: f32,
        evidence: &EntryId,
    ) -> StoreResult<GraphEdge> {
        let predicate = normalize_predicate(predicate)?;

        if self.get_entity(subject)?.is_none() {
            return Err(StoreError::Consistency(format!(
                "edge subject {} is not a known entity",
                subject
            )));
        }
        if let EdgeTarget::Entity(object_id) = object {
            if self.get_entity(object_id)?.is_none() {
                return Err(StoreError::Consistency(format!(
                    "edge object {} is not a known entity",
                    object_id
                )));
            }
        }

        let edge_id = edge_id(subject, &predicate, object);
        let conn = self.lock()?;

        let existing = conn
            .query_row(
                "SELECT confidence, evidence FROM edges WHERE id = ?1",
                params![edge_id],
                |row| Ok((row.get::<_, f64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        let (merged_confidence, evidence_ids) = match existing {
            Some((old_confidence, evidence_json)) => {
                let mut ids: Vec<String> =
                    serde_json::from_str(&evidence_json).unwrap_or_default();
                if ids.iter().any(|id| id == &evidence.0) {
                    // Same evidence seen before, nothing to adjust
                    let edge = GraphEdge {
                        subject: subject.clone(),
                        predicate,
                        object: object.clone(),
                        confidence: old_confidence as f32,
                        evidence: ids.into_iter().map(EntryId).collect(),
                    };
                    return Ok(edge);
                }
                ids.push(evidence.0.clone());
                (
                    combine_confidence(old_confidence as f32, confidence),
                    ids,
                )
            }
            None => (confidence, vec![evidence.0.clone()]),
        };

        let evidence_json = serde_json::to_string(&evidence_ids)
            .map_err(|e| StoreError::Consistency(e.to_string()))?;
        let (object_id, object_kind) = object_columns(object);
        conn.execute(
            "INSERT INTO edges (id, subject_id, predicate, object_id, object_kind, confidence, evidence, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                confidence = excluded.confidence,
                evidence = excluded.evidence,
                updated_at = excluded.updated_at",
            params![
                edge_id,
                subject.0,
                predicate,
                object_id,
                object_kind,
                merged_confidence as f64,
                evidence_json,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        debug!(
            "Upserted edge {} -[{}]-> {} (confidence {:.3})",
            subject,
            predicate,
            object.key(),
            merged_confidence
        );

        Ok(GraphEdge {
            subject: subject.clone(),
            predicate,
            object: object.clone(),
            confidence: merged_confidence,
            evidence: evidence_ids.into_iter().map(EntryId).collect(),
        })
    }

    pub fn get_entity(&self, id: &EntityId) -> StoreResult<Option<GraphEntity>> {
        let conn = self.lock()?;
        let entity = conn
            .query_row(
                "SELECT id, label, entity_type, first_seen, last_seen, mention_count
                 FROM entities WHERE id = ?1",
                params![id.0],
                row_to_entity,
            )
            .optional()?;
        Ok(entity)
    }

    pub fn find_entity(
        &self,
        label: &str,
        entity_type: &EntityType,
    ) -> StoreResult<Option<GraphEntity>> {
        self.get_entity(&EntityId::for_label(label, entity_type))
    }

    /// All canonical entities sharing a normalized label, across types.
    /// Used at query time when the caller knows a label but not its type.
    pub fn entities_by_label(&self, label: &str) -> StoreResult<Vec<GraphEntity>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, label, entity_type, first_seen, last_seen, mention_count
             FROM entities WHERE label_norm = ?1",
        )?;
        let entities = stmt
            .query_map(
                params![memory_weave_schemas::normalize_label(label)],
                row_to_entity,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entities)
    }

    /// Edges whose object is the given entry.
    pub fn edges_for_entry(&self, entry_id: &EntryId) -> StoreResult<Vec<GraphEdge>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT subject_id, predicate, object_id, object_kind, confidence, evidence
             FROM edges WHERE object_kind = 'entry' AND object_id = ?1",
        )?;
        let edges = stmt
            .query_map(params![entry_id.0], row_to_edge)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(edges)
    }

    /// Edges touching the given entity in either direction.
    pub fn edges_touching(&self, entity_id: &EntityId) -> StoreResult<Vec<GraphEdge>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT subject_id, predicate, object_id, object_kind, confidence, evidence
             FROM edges
             WHERE subject_id = ?1 OR (object_kind = 'entity' AND object_id = ?1)",
        )?;
        let edges = stmt
            .query_map(params![entity_id.0], row_to_edge)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(edges)
    }

    /// Breadth-first traversal over both edge directions, bounded by
    /// `max_hops`. Entity-to-entry edges are reported but entries are not
    /// expanded further.
    pub fn traverse(
        &self,
        start: &EntityId,
        max_hops: usize,
        predicate_filter: Option<&str>,
    ) -> StoreResult<GraphNeighborhood> {
        let mut neighborhood = GraphNeighborhood::default();
        let Some(start_entity) = self.get_entity(start)? else {
            return Ok(neighborhood);
        };

        let predicate_filter = match predicate_filter {
            Some(p) => Some(normalize_predicate(p)?),
            None => None,
        };

        let mut visited: HashSet<String> = HashSet::new();
        let mut seen_edges: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(EntityId, usize)> = VecDeque::new();

        visited.insert(start.0.clone());
        neighborhood.entities.push(start_entity);
        queue.push_back((start.clone(), 0));

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_hops {
                continue;
            }
            for edge in self.edges_touching(&current)? {
                if let Some(ref wanted) = predicate_filter {
                    if &edge.predicate != wanted {
                        continue;
                    }
                }
                let key = edge_id(&edge.subject, &edge.predicate, &edge.object);
                if !seen_edges.insert(key) {
                    continue;
                }

                let neighbor = if edge.subject == current {
                    match &edge.object {
                        EdgeTarget::Entity(id) => Some(id.clone()),
                        EdgeTarget::Entry(_) => None,
                    }
                } else {
                    Some(edge.subject.clone())
                };
                neighborhood.edges.push(edge);

                if let Some(neighbor) = neighbor {
                    if visited.insert(neighbor.0.clone()) {
                        if let Some(entity) = self.get_entity(&neighbor)? {
                            neighborhood.entities.push(entity);
                        }
                        queue.push_back((neighbor, depth + 1));
                    }
                }
            }
        }

        Ok(neighborhood)
    }

    /// Edge ids whose subject or entity-object no longer resolves to a node.
    /// Detection only; repair is an explicit re-ingestion.
    pub fn dangling_edges(&self) -> StoreResult<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM edges
             WHERE subject_id NOT IN (SELECT id FROM entities)
                OR (object_kind = 'entity' AND object_id NOT IN (SELECT id FROM entities))",
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Remove the edges evidencing an entry's presence in the graph.
    pub fn delete(&self, entry_id: &EntryId) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM edges WHERE object_kind = 'entry' AND object_id = ?1",
            params![entry_id.0],
        )?;
        Ok(())
    }

    pub fn count_entities(&self) -> StoreResult<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn count_edges(&self) -> StoreResult<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM edges", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn health(&self) -> StoreHealth {
        match (self.count_entities(), self.count_edges()) {
            (Ok(entities), Ok(edges)) => StoreHealth {
                backend: Backend::Graph,
                reachable: true,
                record_count: entities + edges,
                last_error: None,
            },
            (Err(e), _) | (_, Err(e)) => StoreHealth {
                backend: Backend::Graph,
                reachable: false,
                record_count: 0,
                last_error: Some(e.to_string()),
            },
        }
    }

    /// Drop and recreate the schema. Lifecycle-only.
    pub fn reset(&self) -> StoreResult<()> {
        {
            let conn = self.lock()?;
            conn.execute("DROP TABLE IF EXISTS edges", [])?;
            conn.execute("DROP TABLE IF EXISTS entities", [])?;
        }
        self.initialize()?;
        info!("Graph store reset");
        Ok(())
    }
}

/// Predicates are validated at the adapter boundary: lowercased, spaces
/// collapsed to underscores, and never empty.
pub fn normalize_predicate(predicate: &str) -> StoreResult<String> {
    let normalized: String = predicate
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect();
    if normalized.is_empty() {
        return Err(StoreError::InvalidPredicate(predicate.to_string()));
    }
    Ok(normalized)
}

fn edge_id(subject: &EntityId, predicate: &str, object: &EdgeTarget) -> String {
    let (object_id, object_kind) = object_columns(object);
    let input = format!("{}\x1f{}\x1f{}\x1f{}", subject.0, predicate, object_kind, object_id);
    let digest = Sha256::digest(input.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("edge_{}", &hex[..32])
}

fn object_columns(object: &EdgeTarget) -> (&str, &'static str) {
    match object {
        EdgeTarget::Entity(id) => (id.0.as_str(), "entity"),
        EdgeTarget::Entry(id) => (id.0.as_str(), "entry"),
    }
}

fn row_to_entity(row: &Row) -> rusqlite::Result<GraphEntity> {
    let entity_type: String = row.get(2)?;
    Ok(GraphEntity {
        id: EntityId(row.get(0)?),
        label: row.get(1)?,
        entity_type: EntityType::parse(&entity_type),
        first_seen: row.get(3)?,
        last_seen: row.get(4)?,
        mention_count: row.get::<_, i64>(5)? as u64,
    })
}

fn row_to_edge(row: &Row) -> rusqlite::Result<GraphEdge> {
    let object_id: String = row.get(2)?;
    let object_kind: String = row.get(3)?;
    let evidence_json: String = row.get(5)?;
    let evidence: Vec<String> = serde_json::from_str(&evidence_json).unwrap_or_default();

    let object = if object_kind == "entry" {
        EdgeTarget::Entry(EntryId(object_id))
    } else {
        EdgeTarget::Entity(EntityId(object_id))
    };

    Ok(GraphEdge {
        subject: EntityId(row.get(0)?),
        predicate: row.get(1)?,
        object,
        confidence: row.get::<_, f64>(4)? as f32,
        evidence: evidence.into_iter().map(EntryId).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, GraphStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = GraphStore::open(dir.path().join("graph.db")).unwrap();
        (dir, store)
    }

    fn mention(label: &str, entity_type: EntityType, confidence: f32) -> EntityMention {
        EntityMention {
            label: label.to_string(),
            entity_type,
            confidence,
            span: None,
        }
    }

    #[test]
    fn test_entity_dedup_across_mentions() {
        let (_dir, store) = store();
        let first = store
            .upsert_entity(
                &mention("Alice", EntityType::Person, 0.9),
                "2025-01-01T00:00:00Z",
            )
            .unwrap();
        let second = store
            .upsert_entity(
                &mention("alice", EntityType::Person, 0.8),
                "2025-02-01T00:00:00Z",
            )
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(store.count_entities().unwrap(), 1);

        let entity = store.get_entity(&first).unwrap().unwrap();
        assert_eq!(entity.mention_count, 2);
        assert_eq!(entity.first_seen, "2025-01-01T00:00:00Z");
        assert_eq!(entity.last_seen, "2025-02-01T00:00:00Z");
    }

    #[test]
    fn test_same_label_different_type_stays_distinct() {
        let (_dir, store) = store();
        store
            .upsert_entity(
                &mention("Apple", EntityType::Organization, 0.9),
                "2025-01-01T00:00:00Z",
            )
            .unwrap();
        store
            .upsert_entity(
                &mention("apple", EntityType::Topic, 0.7),
                "2025-01-01T00:00:00Z",
            )
            .unwrap();

        assert_eq!(store.count_entities().unwrap(), 2);
        assert_eq!(store.entities_by_label("APPLE").unwrap().len(), 2);
    }

    #[test]
    fn test_edge_confidence_merges() {
        let (_dir, store) = store();
        let alice = store
            .upsert_entity(
                &mention("Alice", EntityType::Person, 0.9),
                "2025-01-01T00:00:00Z",
            )
            .unwrap();
        let bob = store
            .upsert_entity(
                &mention("Bob", EntityType::Person, 0.9),
                "2025-01-01T00:00:00Z",
            )
            .unwrap();

        let first = store
            .upsert_edge(
                &alice,
                "knows",
                &EdgeTarget::Entity(bob.clone()),
                0.7,
                &EntryId("ent_1".to_string()),
            )
            .unwrap();
        assert!((first.confidence - 0.7).abs() < 1e-6);

        let merged = store
            .upsert_edge(
                &alice,
                "knows",
                &EdgeTarget::Entity(bob.clone()),
                0.4,
                &EntryId("ent_2".to_string()),
            )
            .unwrap();
        // 1 - (0.3 * 0.6) = 0.82
        assert!((merged.confidence - 0.82).abs() < 1e-6);
        assert_eq!(merged.evidence.len(), 2);
        assert_eq!(store.count_edges().unwrap(), 1);
    }

    #[test]
    fn test_edge_replay_is_noop() {
        let (_dir, store) = store();
        let alice = store
            .upsert_entity(
                &mention("Alice", EntityType::Person, 0.9),
                "2025-01-01T00:00:00Z",
            )
            .unwrap();
        let bob = store
            .upsert_entity(
                &mention("Bob", EntityType::Person, 0.9),
                "2025-01-01T00:00:00Z",
            )
            .unwrap();

        let evidence = EntryId("ent_1".to_string());
        store
            .upsert_edge(&alice, "knows", &EdgeTarget::Entity(bob.clone()), 0.7, &evidence)
            .unwrap();
        let replayed = store
            .upsert_edge(&alice, "knows", &EdgeTarget::Entity(bob), 0.7, &evidence)
            .unwrap();

        // Identical evidence must not inflate confidence
        assert!((replayed.confidence - 0.7).abs() < 1e-6);
        assert_eq!(replayed.evidence.len(), 1);
    }

    #[test]
    fn test_edge_requires_known_endpoints() {
        let (_dir, store) = store();
        let ghost = EntityId("node_missing".to_string());
        let err = store.upsert_edge(
            &ghost,
            "knows",
            &EdgeTarget::Entry(EntryId("ent_1".to_string())),
            0.5,
            &EntryId("ent_1".to_string()),
        );
        assert!(matches!(err, Err(StoreError::Consistency(_))));
    }

    #[test]
    fn test_predicate_validation() {
        assert_eq!(normalize_predicate("Works With").unwrap(), "works_with");
        assert!(matches!(
            normalize_predicate("   "),
            Err(StoreError::InvalidPredicate(_))
        ));
    }

    #[test]
    fn test_traverse_bounded_by_hops() {
        let (_dir, store) = store();
        let a = store
            .upsert_entity(&mention("A", EntityType::Topic, 0.9), "2025-01-01T00:00:00Z")
            .unwrap();
        let b = store
            .upsert_entity(&mention("B", EntityType::Topic, 0.9), "2025-01-01T00:00:00Z")
            .unwrap();
        let c = store
            .upsert_entity(&mention("C", EntityType::Topic, 0.9), "2025-01-01T00:00:00Z")
            .unwrap();

        let evidence = EntryId("ent_1".to_string());
        store
            .upsert_edge(&a, "relates_to", &EdgeTarget::Entity(b.clone()), 0.9, &evidence)
            .unwrap();
        store
            .upsert_edge(&b, "relates_to", &EdgeTarget::Entity(c.clone()), 0.9, &evidence)
            .unwrap();

        let one_hop = store.traverse(&a, 1, None).unwrap();
        assert_eq!(one_hop.entities.len(), 2); // a, b
        assert_eq!(one_hop.edges.len(), 1);

        let two_hops = store.traverse(&a, 2, None).unwrap();
        assert_eq!(two_hops.entities.len(), 3); // a, b, c
        assert_eq!(two_hops.edges.len(), 2);

        // Traversal follows incoming edges too
        let reverse = store.traverse(&c, 2, None).unwrap();
        assert_eq!(reverse.entities.len(), 3);
    }

    #[test]
    fn test_traverse_predicate_filter() {
        let (_dir, store) = store();
        let a = store
            .upsert_entity(&mention("A", EntityType::Topic, 0.9), "2025-01-01T00:00:00Z")
            .unwrap();
        let b = store
            .upsert_entity(&mention("B", EntityType::Topic, 0.9), "2025-01-01T00:00:00Z")
            .unwrap();

        let evidence = EntryId("ent_1".to_string());
        store
            .upsert_edge(&a, "knows", &EdgeTarget::Entity(b.clone()), 0.9, &evidence)
            .unwrap();
        store
            .upsert_edge(&a, "works_with", &EdgeTarget::Entity(b), 0.9, &evidence)
            .unwrap();

        let filtered = store.traverse(&a, 1, Some("knows")).unwrap();
        assert_eq!(filtered.edges.len(), 1);
        assert_eq!(filtered.edges[0].predicate, "knows");
    }

    #[test]
    fn test_edges_for_entry() {
        let (_dir, store) = store();
        let alice = store
            .upsert_entity(
                &mention("Alice", EntityType::Person, 0.9),
                "2025-01-01T00:00:00Z",
            )
            .unwrap();
        let entry = EntryId("ent_1".to_string());
        store
            .upsert_edge(
                &alice,
                "mentioned_in",
                &EdgeTarget::Entry(entry.clone()),
                0.9,
                &entry,
            )
            .unwrap();

        let edges = store.edges_for_entry(&entry).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].subject, alice);
    }
}
