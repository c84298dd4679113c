use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

// ============================================================================
// ID Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnId(pub String);

/// Stable identity of an ingested unit across all three backends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(pub String);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn short_sha256(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..32].to_string()
}

impl EntryId {
    /// Deterministic id for a turn. Re-ingesting the same export always maps
    /// a turn back to the same entry across all three backends.
    pub fn for_turn(conversation_id: &ConversationId, turn_id: &TurnId) -> Self {
        let input = format!("{}\x1f{}", conversation_id.0, turn_id.0);
        EntryId(format!("ent_{}", short_sha256(&input)))
    }
}

impl EntityId {
    /// Deterministic id for a canonical graph entity. The dedup key is the
    /// case-normalized label plus the entity type, so "Apple" the
    /// organization and "apple" the topic stay distinct nodes.
    pub fn for_label(label: &str, entity_type: &EntityType) -> Self {
        let input = format!("{}\x1f{}", normalize_label(label), entity_type.as_str());
        EntityId(format!("node_{}", short_sha256(&input)))
    }
}

/// Canonical form used for entity deduplication.
pub fn normalize_label(label: &str) -> String {
    label.trim().to_lowercase()
}

/// Content hash of a turn's text, used by the ingestion idempotence check.
pub fn content_hash(text: &str) -> String {
    short_sha256(text)
}

// ============================================================================
// Turn Schema
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sender {
    #[serde(rename = "human")]
    Human,
    #[serde(rename = "assistant")]
    Assistant,
    #[serde(untagged)]
    Other(String),
}

impl Sender {
    pub fn as_str(&self) -> &str {
        match self {
            Sender::Human => "human",
            Sender::Assistant => "assistant",
            Sender::Other(s) => s,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "human" | "user" => Sender::Human,
            "assistant" => Sender::Assistant,
            _ => Sender::Other(raw.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub file_name: String,
    pub media_type: Option<String>,
    pub extracted_text: Option<String>,
}

/// One normalized message from an export document. Immutable once produced;
/// identity is `(conversation_id, turn_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTurn {
    pub conversation_id: ConversationId,
    pub turn_id: TurnId,
    pub sender: Sender,
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub created_at: String, // RFC3339
}

impl RawTurn {
    pub fn entry_id(&self) -> EntryId {
        EntryId::for_turn(&self.conversation_id, &self.turn_id)
    }
}

// ============================================================================
// Ingested Entry Schema
// ============================================================================

/// The store-agnostic unit written across the backends. Each adapter
/// persists a projection of it: the relational store owns existence and
/// text, the vector store owns the embedding, the graph store owns the
/// entity links.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestedEntry {
    pub entry_id: EntryId,
    pub conversation_id: ConversationId,
    pub turn_id: TurnId,
    pub sender: Sender,
    pub text: String,
    pub content_hash: String,
    pub embedding: Option<Vec<f32>>,
    pub entities: Vec<EntityMention>,
    pub created_at: String, // RFC3339
    pub source_ref: Option<String>,
}

impl IngestedEntry {
    pub fn from_turn(turn: &RawTurn, source_ref: Option<String>) -> Self {
        Self {
            entry_id: turn.entry_id(),
            conversation_id: turn.conversation_id.clone(),
            turn_id: turn.turn_id.clone(),
            sender: turn.sender.clone(),
            text: turn.text.clone(),
            content_hash: content_hash(&turn.text),
            embedding: None,
            entities: Vec::new(),
            created_at: turn.created_at.clone(),
            source_ref,
        }
    }
}

// ============================================================================
// Entity Schema
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    #[serde(rename = "person")]
    Person,
    #[serde(rename = "organization")]
    Organization,
    #[serde(rename = "technology")]
    Technology,
    #[serde(rename = "tool")]
    Tool,
    #[serde(rename = "project")]
    Project,
    #[serde(rename = "topic")]
    Topic,
    #[serde(untagged)]
    Other(String),
}

impl EntityType {
    pub fn as_str(&self) -> &str {
        match self {
            EntityType::Person => "person",
            EntityType::Organization => "organization",
            EntityType::Technology => "technology",
            EntityType::Tool => "tool",
            EntityType::Project => "project",
            EntityType::Topic => "topic",
            EntityType::Other(s) => s,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "person" => EntityType::Person,
            "organization" => EntityType::Organization,
            "technology" => EntityType::Technology,
            "tool" => EntityType::Tool,
            "project" => EntityType::Project,
            "topic" => EntityType::Topic,
            other => EntityType::Other(other.to_string()),
        }
    }
}

/// A typed entity mention inside one turn. Transient: consumed to produce
/// graph nodes and edges, never persisted as a top-level record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityMention {
    pub label: String,
    pub entity_type: EntityType,
    pub confidence: f32,
    pub span: Option<(usize, usize)>,
}

impl EntityMention {
    pub fn entity_id(&self) -> EntityId {
        EntityId::for_label(&self.label, &self.entity_type)
    }
}

/// Extractor-reported relation between two mentioned labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRelation {
    pub subject: EntityMention,
    pub predicate: String,
    pub object: EntityMention,
    pub confidence: f32,
}

/// Full extractor output for one turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Extraction {
    pub mentions: Vec<EntityMention>,
    pub relations: Vec<EntityRelation>,
}

// ============================================================================
// Graph Schema
// ============================================================================

/// Canonical graph node. Created on first mention, reused on every
/// subsequent mention of the same normalized label+type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEntity {
    pub id: EntityId,
    pub label: String,
    pub entity_type: EntityType,
    pub first_seen: String, // RFC3339
    pub last_seen: String,  // RFC3339
    pub mention_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeTarget {
    #[serde(rename = "entity")]
    Entity(EntityId),
    #[serde(rename = "entry")]
    Entry(EntryId),
}

impl EdgeTarget {
    pub fn key(&self) -> &str {
        match self {
            EdgeTarget::Entity(id) => &id.0,
            EdgeTarget::Entry(id) => &id.0,
        }
    }
}

/// Confidence-weighted, evidence-backed relationship. Re-deriving the same
/// edge from new evidence merges confidence and accumulates the evidence
/// list; it never duplicates the edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub subject: EntityId,
    pub predicate: String,
    pub object: EdgeTarget,
    pub confidence: f32,
    pub evidence: Vec<EntryId>,
}

/// Independent-evidence combination. Two derivations with confidences 0.6
/// and 0.5 merge to 1 - (0.4 * 0.5) = 0.8.
pub fn combine_confidence(old: f32, new: f32) -> f32 {
    1.0 - (1.0 - old) * (1.0 - new)
}

// ============================================================================
// Backend Status Schema
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Backend {
    #[serde(rename = "relational")]
    Relational,
    #[serde(rename = "vector")]
    Vector,
    #[serde(rename = "graph")]
    Graph,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Relational => "relational",
            Backend::Vector => "vector",
            Backend::Graph => "graph",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-backend health, recomputed on demand and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreHealth {
    pub backend: Backend,
    pub reachable: bool,
    pub record_count: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub relational_entries: u64,
    pub vector_records: u64,
    pub graph_entities: u64,
    pub graph_edges: u64,
}

/// Read-time invariant violations. Reported only; repair is an explicit
/// re-ingestion, never an automatic side effect of detection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub orphaned_vectors: Vec<EntryId>,
    pub dangling_edges: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_clean(&self) -> bool {
        self.orphaned_vectors.is_empty() && self.dangling_edges.is_empty()
    }
}

// ============================================================================
// Ingestion Report Schema
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialEntry {
    pub entry_id: EntryId,
    pub missing: Vec<Backend>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedEntry {
    pub conversation_id: Option<ConversationId>,
    pub turn_id: Option<TurnId>,
    pub error: String,
}

/// Aggregated outcome of one ingestion batch. The pipeline always returns a
/// report; per-entry failures are recorded here, never escalated to a batch
/// abort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionReport {
    pub batch_id: String,
    pub ingested: u64,
    pub skipped_duplicate: u64,
    pub partial: Vec<PartialEntry>,
    pub failed: Vec<FailedEntry>,
}

impl IngestionReport {
    pub fn new() -> Self {
        Self {
            batch_id: format!("batch_{}", ulid::Ulid::new()),
            ingested: 0,
            skipped_duplicate: 0,
            partial: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn total_seen(&self) -> u64 {
        self.ingested + self.skipped_duplicate + self.partial.len() as u64 + self.failed.len() as u64
    }
}

impl Default for IngestionReport {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Recall Schema
// ============================================================================

/// One ranked recall result, fused from the three backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryResult {
    pub entry_id: EntryId,
    pub conversation_id: ConversationId,
    pub text: String,
    pub created_at: String, // RFC3339
    pub vector_score: f32,
    pub graph_relevance: f32,
    pub score: f32,
    pub entities: Vec<GraphEntity>,
}
