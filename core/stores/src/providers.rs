use async_trait::async_trait;
use memory_weave_schemas::{EntityMention, EntityType, Extraction};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

/// Errors from the black-box model capabilities. The ingestion pipeline
/// treats every variant as a per-entry failure, retryable on the next run.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Http(String),

    #[error("provider returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("provider call timed out after {0}ms")]
    Timeout(u64),

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Http(e.to_string())
    }
}

/// Black-box embedding capability: text in, fixed-length vector out.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
    fn dimension(&self) -> usize;
}

/// Black-box entity extraction capability: text in, typed mentions and
/// optional relations out.
#[async_trait]
pub trait EntityExtractor: Send + Sync {
    async fn extract_entities(&self, text: &str) -> Result<Extraction, ProviderError>;
}

// ============================================================================
// HTTP Providers
// ============================================================================

/// Embedding provider backed by a local model endpoint.
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    endpoint: String,
    dimension: usize,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

impl HttpEmbeddingProvider {
    pub fn new(endpoint: String, dimension: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            dimension,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "text": text }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::Http(format!(
                "embedding endpoint returned {}",
                response.status()
            )));
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        if body.embedding.len() != self.dimension {
            return Err(ProviderError::InvalidResponse(format!(
                "expected {}-dim embedding, got {}",
                self.dimension,
                body.embedding.len()
            )));
        }
        Ok(body.embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Entity extractor backed by a local model endpoint.
pub struct HttpEntityExtractor {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct WireMention {
    label: String,
    #[serde(rename = "type")]
    entity_type: String,
    confidence: f32,
    start: Option<usize>,
    end: Option<usize>,
}

#[derive(Deserialize)]
struct WireRelation {
    subject: WireMention,
    predicate: String,
    object: WireMention,
    confidence: f32,
}

#[derive(Deserialize)]
struct ExtractionResponse {
    #[serde(default)]
    entities: Vec<WireMention>,
    #[serde(default)]
    relations: Vec<WireRelation>,
}

impl HttpEntityExtractor {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

fn mention_from_wire(wire: WireMention) -> EntityMention {
    let span = match (wire.start, wire.end) {
        (Some(start), Some(end)) => Some((start, end)),
        _ => None,
    };
    EntityMention {
        label: wire.label,
        entity_type: EntityType::parse(&wire.entity_type),
        confidence: wire.confidence.clamp(0.0, 1.0),
        span,
    }
}

#[async_trait]
impl EntityExtractor for HttpEntityExtractor {
    async fn extract_entities(&self, text: &str) -> Result<Extraction, ProviderError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "text": text }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::Http(format!(
                "extraction endpoint returned {}",
                response.status()
            )));
        }

        let body: ExtractionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let mentions = body.entities.into_iter().map(mention_from_wire).collect();
        let relations = body
            .relations
            .into_iter()
            .map(|r| memory_weave_schemas::EntityRelation {
                subject: mention_from_wire(r.subject),
                predicate: r.predicate,
                object: mention_from_wire(r.object),
                confidence: r.confidence.clamp(0.0, 1.0),
            })
            .collect();

        Ok(Extraction { mentions, relations })
    }
}

// ============================================================================
// Local Fallbacks
// ============================================================================

/// Deterministic character-based embedding. A stand-in when no model
/// endpoint is configured; the real model runs behind
/// `HttpEmbeddingProvider`.
pub struct HashEmbedding {
    dimension: usize,
}

impl HashEmbedding {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for HashEmbedding {
    fn default() -> Self {
        // Matches the all-MiniLM family the vector namespace was sized for
        Self::new(384)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut embedding = vec![0.0; self.dimension];
        for (i, ch) in text.chars().take(self.dimension).enumerate() {
            embedding[i] = (ch as u32 % 256) as f32 / 256.0;
        }
        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Heuristic extractor that treats capitalized terms as topic mentions.
/// Fast and model-free; a stand-in for the real extractor endpoint.
pub struct HeuristicEntityExtractor {
    pattern: Regex,
    confidence: f32,
}

impl HeuristicEntityExtractor {
    pub fn new() -> Self {
        Self {
            pattern: Regex::new(r"\b[A-Z][A-Za-z0-9_-]{2,}\b").expect("static pattern"),
            confidence: 0.5,
        }
    }
}

impl Default for HeuristicEntityExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityExtractor for HeuristicEntityExtractor {
    async fn extract_entities(&self, text: &str) -> Result<Extraction, ProviderError> {
        let mut seen = std::collections::HashSet::new();
        let mut mentions = Vec::new();

        for found in self.pattern.find_iter(text) {
            let label = found.as_str();
            if !seen.insert(memory_weave_schemas::normalize_label(label)) {
                continue;
            }
            mentions.push(EntityMention {
                label: label.to_string(),
                entity_type: EntityType::Topic,
                confidence: self.confidence,
                span: Some((found.start(), found.end())),
            });
        }

        debug!("Heuristic extractor found {} mentions", mentions.len());
        Ok(Extraction {
            mentions,
            relations: Vec::new(),
        })
    }
}
