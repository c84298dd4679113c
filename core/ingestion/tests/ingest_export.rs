use async_trait::async_trait;
use memory_weave_ingestion::{ExportDocument, IngestionPipeline, PipelineConfig};
use memory_weave_schemas::{
    Backend, ConversationId, EntityId, EntityMention, EntityRelation, EntityType, EntryId,
    Extraction, TurnId,
};
use memory_weave_stores::{
    EntityExtractor, GraphStore, HashEmbedding, HeuristicEntityExtractor, ProviderError,
    RelationalStore, VectorStore,
};
use std::sync::Arc;

const DIMENSION: usize = 8;

struct Harness {
    dir: tempfile::TempDir,
    relational: Arc<RelationalStore>,
    vector: Arc<VectorStore>,
    graph: Arc<GraphStore>,
    pipeline: IngestionPipeline,
}

fn harness_with(extractor: Arc<dyn EntityExtractor>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let relational = Arc::new(RelationalStore::open(dir.path().join("relational.db")).unwrap());
    let vector = Arc::new(VectorStore::open(dir.path().join("vector.db"), DIMENSION).unwrap());
    let graph = Arc::new(GraphStore::open(dir.path().join("graph.db")).unwrap());
    let pipeline = IngestionPipeline::new(
        relational.clone(),
        vector.clone(),
        graph.clone(),
        Arc::new(HashEmbedding::new(DIMENSION)),
        extractor,
        PipelineConfig::default(),
    );
    Harness {
        dir,
        relational,
        vector,
        graph,
        pipeline,
    }
}

fn harness() -> Harness {
    harness_with(Arc::new(HeuristicEntityExtractor::new()))
}

fn trip_export() -> ExportDocument {
    let raw = serde_json::json!([{
        "uuid": "conv-1",
        "name": "Trip planning",
        "chat_messages": [
            {
                "uuid": "m1",
                "sender": "human",
                "text": "Alice suggested hiking in Yosemite",
                "created_at": "2025-03-01T10:00:00Z"
            },
            {
                "uuid": "m2",
                "sender": "assistant",
                "text": "Yosemite sounds great, ask Bob too",
                "created_at": "2025-03-01T10:00:05Z"
            }
        ]
    }])
    .to_string();
    ExportDocument::parse(&raw).unwrap()
}

fn entry_id(conv: &str, turn: &str) -> EntryId {
    EntryId::for_turn(
        &ConversationId(conv.to_string()),
        &TurnId(turn.to_string()),
    )
}

#[tokio::test]
async fn test_export_lands_in_all_three_backends() {
    let h = harness();
    let report = h.pipeline.ingest(&trip_export()).await;

    assert_eq!(report.ingested, 2);
    assert_eq!(report.skipped_duplicate, 0);
    assert!(report.partial.is_empty());
    assert!(report.failed.is_empty());

    assert_eq!(h.relational.count_entries().unwrap(), 2);
    assert_eq!(h.vector.count_records().unwrap(), 2);
    assert!(h.graph.count_entities().unwrap() > 0);

    let row = h
        .relational
        .get_entry(&entry_id("conv-1", "m1"))
        .unwrap()
        .unwrap();
    assert!(row.vector_synced);
    assert!(row.graph_synced);
    assert_eq!(row.source_ref.as_deref(), Some("Trip planning"));
}

#[tokio::test]
async fn test_reingest_is_a_noop() {
    let h = harness();
    let document = trip_export();
    h.pipeline.ingest(&document).await;

    let entities_before = h.graph.count_entities().unwrap();
    let edges_before = h.graph.count_edges().unwrap();

    let second = h.pipeline.ingest(&document).await;
    assert_eq!(second.ingested, 0);
    assert_eq!(second.skipped_duplicate, 2);
    assert!(second.partial.is_empty());
    assert!(second.failed.is_empty());

    assert_eq!(h.relational.count_entries().unwrap(), 2);
    assert_eq!(h.vector.count_records().unwrap(), 2);
    assert_eq!(h.graph.count_entities().unwrap(), entities_before);
    assert_eq!(h.graph.count_edges().unwrap(), edges_before);
}

#[tokio::test]
async fn test_vector_outage_reported_then_caught_up() {
    let h = harness();
    let document = trip_export();

    // Break the vector namespace underneath the pipeline
    let conn = rusqlite::Connection::open(h.dir.path().join("vector.db")).unwrap();
    conn.execute("DROP TABLE embeddings", []).unwrap();
    drop(conn);

    let report = h.pipeline.ingest(&document).await;
    assert_eq!(report.ingested, 0);
    assert_eq!(report.partial.len(), 2);
    for partial in &report.partial {
        assert_eq!(partial.missing, vec![Backend::Vector]);
    }

    // Relational commit and graph projection still landed
    assert_eq!(h.relational.count_entries().unwrap(), 2);
    assert!(h.graph.count_entities().unwrap() > 0);
    let row = h
        .relational
        .get_entry(&entry_id("conv-1", "m1"))
        .unwrap()
        .unwrap();
    assert!(!row.vector_synced);
    assert!(row.graph_synced);

    // Same document again once the store is back: only the missing
    // projection is rebuilt, nothing is duplicated
    h.vector.initialize().unwrap();
    let entities_before = h.graph.count_entities().unwrap();

    let catchup = h.pipeline.ingest(&document).await;
    assert_eq!(catchup.ingested, 2);
    assert!(catchup.partial.is_empty());

    assert_eq!(h.relational.count_entries().unwrap(), 2);
    assert_eq!(h.vector.count_records().unwrap(), 2);
    assert_eq!(h.graph.count_entities().unwrap(), entities_before);

    let row = h
        .relational
        .get_entry(&entry_id("conv-1", "m1"))
        .unwrap()
        .unwrap();
    assert!(row.vector_synced);
    assert!(row.graph_synced);
}

#[tokio::test]
async fn test_malformed_record_does_not_poison_batch() {
    let h = harness();
    let raw = serde_json::json!([
        { "name": "conversation without a uuid" },
        {
            "uuid": "conv-2",
            "chat_messages": [
                { "uuid": "m1", "sender": "human", "text": "hello there", "created_at": "2025-03-01T10:00:00Z" }
            ]
        }
    ])
    .to_string();
    let document = ExportDocument::parse(&raw).unwrap();

    let report = h.pipeline.ingest(&document).await;
    assert_eq!(report.ingested, 1);
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].conversation_id.is_none());
    assert_eq!(h.relational.count_entries().unwrap(), 1);
}

#[tokio::test]
async fn test_edited_turn_is_rewritten_not_duplicated() {
    let h = harness();
    h.pipeline.ingest(&trip_export()).await;

    let edited = serde_json::json!([{
        "uuid": "conv-1",
        "name": "Trip planning",
        "chat_messages": [
            {
                "uuid": "m1",
                "sender": "human",
                "text": "Alice suggested climbing instead",
                "created_at": "2025-03-01T10:00:00Z"
            },
            {
                "uuid": "m2",
                "sender": "assistant",
                "text": "Yosemite sounds great, ask Bob too",
                "created_at": "2025-03-01T10:00:05Z"
            }
        ]
    }])
    .to_string();
    let document = ExportDocument::parse(&edited).unwrap();

    let report = h.pipeline.ingest(&document).await;
    assert_eq!(report.ingested, 1); // the edited turn
    assert_eq!(report.skipped_duplicate, 1); // the untouched one

    assert_eq!(h.relational.count_entries().unwrap(), 2);
    let row = h
        .relational
        .get_entry(&entry_id("conv-1", "m1"))
        .unwrap()
        .unwrap();
    assert_eq!(row.text, "Alice suggested climbing instead");
    assert!(row.vector_synced);
    assert!(row.graph_synced);
}

/// Extractor that reports Alice-knows-Bob from every turn, with a
/// per-sighting confidence keyed off the text.
struct ScriptedExtractor;

#[async_trait]
impl EntityExtractor for ScriptedExtractor {
    async fn extract_entities(&self, text: &str) -> Result<Extraction, ProviderError> {
        let confidence = if text.contains("first") { 0.7 } else { 0.4 };
        let alice = EntityMention {
            label: "Alice".to_string(),
            entity_type: EntityType::Person,
            confidence: 0.9,
            span: None,
        };
        let bob = EntityMention {
            label: "Bob".to_string(),
            entity_type: EntityType::Person,
            confidence: 0.9,
            span: None,
        };
        Ok(Extraction {
            mentions: vec![alice.clone(), bob.clone()],
            relations: vec![EntityRelation {
                subject: alice,
                predicate: "knows".to_string(),
                object: bob,
                confidence,
            }],
        })
    }
}

#[tokio::test]
async fn test_relation_evidence_accumulates_across_conversations() {
    let h = harness_with(Arc::new(ScriptedExtractor));
    let raw = serde_json::json!([
        {
            "uuid": "conv-1",
            "chat_messages": [
                {
                    "uuid": "m1",
                    "sender": "human",
                    "text": "first sighting",
                    "created_at": "2025-03-01T10:00:00Z"
                }
            ]
        },
        {
            "uuid": "conv-2",
            "chat_messages": [
                {
                    "uuid": "m2",
                    "sender": "human",
                    "text": "second sighting",
                    "created_at": "2025-03-02T10:00:00Z"
                }
            ]
        }
    ])
    .to_string();
    let document = ExportDocument::parse(&raw).unwrap();

    let report = h.pipeline.ingest(&document).await;
    assert_eq!(report.ingested, 2);
    assert!(report.partial.is_empty());

    // One canonical node per person even though the sightings came from
    // different conversations
    assert_eq!(h.graph.count_entities().unwrap(), 2);
    let alice = h
        .graph
        .find_entity("Alice", &EntityType::Person)
        .unwrap()
        .unwrap();
    assert_eq!(alice.mention_count, 2);

    // Two sightings merge into one edge: 1 - (0.3 * 0.6) = 0.82
    let alice_id = EntityId::for_label("Alice", &EntityType::Person);
    let knows: Vec<_> = h
        .graph
        .edges_touching(&alice_id)
        .unwrap()
        .into_iter()
        .filter(|edge| edge.predicate == "knows")
        .collect();
    assert_eq!(knows.len(), 1);
    assert!((knows[0].confidence - 0.82).abs() < 1e-4);
    assert_eq!(knows[0].evidence.len(), 2);

    // Replaying the export leaves the merged edge untouched
    h.pipeline.ingest(&document).await;
    let replayed: Vec<_> = h
        .graph
        .edges_touching(&alice_id)
        .unwrap()
        .into_iter()
        .filter(|edge| edge.predicate == "knows")
        .collect();
    assert!((replayed[0].confidence - 0.82).abs() < 1e-4);
    assert_eq!(replayed[0].evidence.len(), 2);
}
