use async_trait::async_trait;
use memory_weave_recall::{MemoryCoordinator, RecallConfig};
use memory_weave_schemas::{
    ConversationId, EdgeTarget, EntityMention, EntityType, EntryId, Extraction, IngestedEntry,
    RawTurn, Sender, TurnId,
};
use memory_weave_stores::{
    EmbeddingProvider, EntityExtractor, GraphStore, HeuristicEntityExtractor, ProviderError,
    RelationalStore, VectorStore,
};
use std::sync::Arc;

const DIMENSION: usize = 3;

/// Embeds every query to the same axis so candidate ordering is fully
/// controlled by the vectors seeded into the store.
struct FixedQueryEmbedder;

#[async_trait]
impl EmbeddingProvider for FixedQueryEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(vec![1.0, 0.0, 0.0])
    }

    fn dimension(&self) -> usize {
        DIMENSION
    }
}

struct FailingExtractor;

#[async_trait]
impl EntityExtractor for FailingExtractor {
    async fn extract_entities(&self, _text: &str) -> Result<Extraction, ProviderError> {
        Err(ProviderError::Unavailable("extractor offline".to_string()))
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    relational: Arc<RelationalStore>,
    vector: Arc<VectorStore>,
    graph: Arc<GraphStore>,
    coordinator: MemoryCoordinator,
}

fn harness_with(extractor: Arc<dyn EntityExtractor>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let relational = Arc::new(RelationalStore::open(dir.path().join("relational.db")).unwrap());
    let vector = Arc::new(VectorStore::open(dir.path().join("vector.db"), DIMENSION).unwrap());
    let graph = Arc::new(GraphStore::open(dir.path().join("graph.db")).unwrap());
    let coordinator = MemoryCoordinator::new(
        relational.clone(),
        vector.clone(),
        graph.clone(),
        Arc::new(FixedQueryEmbedder),
        extractor,
        RecallConfig::default(),
    );
    Harness {
        _dir: dir,
        relational,
        vector,
        graph,
        coordinator,
    }
}

fn harness() -> Harness {
    harness_with(Arc::new(HeuristicEntityExtractor::new()))
}

fn seed_entry(
    h: &Harness,
    turn_id: &str,
    text: &str,
    created_at: &str,
    embedding: &[f32],
) -> EntryId {
    let raw = RawTurn {
        conversation_id: ConversationId("conv-1".to_string()),
        turn_id: TurnId(turn_id.to_string()),
        sender: Sender::Human,
        text: text.to_string(),
        attachments: vec![],
        created_at: created_at.to_string(),
    };
    let entry = IngestedEntry::from_turn(&raw, None);
    h.relational.upsert_entry(&entry).unwrap();
    h.vector
        .upsert_embedding(&entry.entry_id, embedding, &entry.conversation_id, &entry.created_at)
        .unwrap();
    entry.entry_id
}

fn mention(label: &str, entity_type: EntityType, confidence: f32) -> EntityMention {
    EntityMention {
        label: label.to_string(),
        entity_type,
        confidence,
        span: None,
    }
}

#[tokio::test]
async fn test_vector_similarity_orders_results() {
    let h = harness();
    let close = seed_entry(&h, "t1", "on-topic memory", "2025-01-01T00:00:00Z", &[1.0, 0.0, 0.0]);
    let far = seed_entry(&h, "t2", "off-topic memory", "2025-01-02T00:00:00Z", &[0.0, 1.0, 0.0]);

    let results = h.coordinator.recall("anything lowercase", 2, None).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].entry_id, close);
    assert_eq!(results[1].entry_id, far);
    assert!(results[0].score > results[1].score);
    assert!((results[0].vector_score - 1.0).abs() < 1e-5);
    // No query entities resolved, so the graph term is zero
    assert_eq!(results[0].graph_relevance, 0.0);
}

#[tokio::test]
async fn test_graph_relevance_reorders_equal_vectors() {
    let h = harness();
    let plain = seed_entry(&h, "t1", "generic note", "2025-01-05T00:00:00Z", &[1.0, 0.0, 0.0]);
    let about_alice = seed_entry(&h, "t2", "met with her", "2025-01-01T00:00:00Z", &[1.0, 0.0, 0.0]);

    let alice = h
        .graph
        .upsert_entity(&mention("Alice", EntityType::Person, 0.9), "2025-01-01T00:00:00Z")
        .unwrap();
    h.graph
        .upsert_edge(
            &alice,
            "mentioned_in",
            &EdgeTarget::Entry(about_alice.clone()),
            0.9,
            &about_alice,
        )
        .unwrap();

    let results = h.coordinator.recall("what did Alice say", 2, None).await.unwrap();
    // Equal cosine, but the graph tie to Alice outranks recency
    assert_eq!(results[0].entry_id, about_alice);
    assert_eq!(results[1].entry_id, plain);
    assert!((results[0].graph_relevance - 0.9).abs() < 1e-5);
    assert_eq!(results[0].entities.len(), 1);
    assert_eq!(results[0].entities[0].label, "Alice");
}

#[tokio::test]
async fn test_one_hop_relation_contributes_relevance() {
    let h = harness();
    let about_bob = seed_entry(&h, "t1", "talked to him", "2025-01-01T00:00:00Z", &[1.0, 0.0, 0.0]);

    let alice = h
        .graph
        .upsert_entity(&mention("Alice", EntityType::Person, 0.9), "2025-01-01T00:00:00Z")
        .unwrap();
    let bob = h
        .graph
        .upsert_entity(&mention("Bob", EntityType::Person, 0.9), "2025-01-01T00:00:00Z")
        .unwrap();
    h.graph
        .upsert_edge(
            &bob,
            "mentioned_in",
            &EdgeTarget::Entry(about_bob.clone()),
            0.8,
            &about_bob,
        )
        .unwrap();
    h.graph
        .upsert_edge(&bob, "knows", &EdgeTarget::Entity(alice), 0.5, &about_bob)
        .unwrap();

    let results = h.coordinator.recall("news about Alice", 1, None).await.unwrap();
    assert_eq!(results[0].entry_id, about_bob);
    // Mention edge times relation edge: 0.8 * 0.5
    assert!((results[0].graph_relevance - 0.4).abs() < 1e-5);
}

#[tokio::test]
async fn test_equal_scores_break_toward_recency() {
    let h = harness();
    let oldest = seed_entry(&h, "t1", "oldest", "2025-01-01T00:00:00Z", &[1.0, 0.0, 0.0]);
    let newest = seed_entry(&h, "t2", "newest", "2025-01-03T00:00:00Z", &[1.0, 0.0, 0.0]);
    let middle = seed_entry(&h, "t3", "middle", "2025-01-02T00:00:00Z", &[1.0, 0.0, 0.0]);

    let results = h.coordinator.recall("no entities here", 2, None).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].entry_id, newest);
    assert_eq!(results[1].entry_id, middle);
    assert!(!results.iter().any(|r| r.entry_id == oldest));
}

#[tokio::test]
async fn test_orphaned_vector_record_is_skipped() {
    let h = harness();
    let kept = seed_entry(&h, "t1", "kept", "2025-01-01T00:00:00Z", &[1.0, 0.0, 0.0]);

    // A vector record with no relational row must not surface
    h.vector
        .upsert_embedding(
            &EntryId("ent_orphan".to_string()),
            &[1.0, 0.0, 0.0],
            &ConversationId("conv-1".to_string()),
            "2025-01-01T00:00:00Z",
        )
        .unwrap();

    let results = h.coordinator.recall("whatever", 5, None).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].entry_id, kept);
}

#[tokio::test]
async fn test_extractor_outage_degrades_to_vector_only() {
    let h = harness_with(Arc::new(FailingExtractor));
    let entry = seed_entry(&h, "t1", "still reachable", "2025-01-01T00:00:00Z", &[1.0, 0.0, 0.0]);

    let alice = h
        .graph
        .upsert_entity(&mention("Alice", EntityType::Person, 0.9), "2025-01-01T00:00:00Z")
        .unwrap();
    h.graph
        .upsert_edge(
            &alice,
            "mentioned_in",
            &EdgeTarget::Entry(entry.clone()),
            0.9,
            &entry,
        )
        .unwrap();

    let results = h.coordinator.recall("Alice", 1, None).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].graph_relevance, 0.0);
    // The neighborhood still decorates the result even without a graph score
    assert_eq!(results[0].entities.len(), 1);
}
