use memory_weave_schemas::{EdgeTarget, EntityId, EntryId, GraphEntity, MemoryResult};
use memory_weave_stores::{
    EmbeddingProvider, EntityExtractor, GraphStore, ProviderError, RelationalStore, StoreError,
    VectorFilter, VectorStore,
};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RecallError {
    /// The query could not be embedded. Unlike the graph side there is no
    /// degraded mode without a query vector, so this fails the request.
    #[error("embedding the query failed: {0}")]
    Embedding(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct RecallConfig {
    /// How many vector candidates to pull per requested result, so graph
    /// scoring has room to reorder beyond the raw similarity cut.
    pub oversample_factor: usize,
    pub vector_weight: f32,
    pub graph_weight: f32,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            oversample_factor: 3,
            vector_weight: 0.5,
            graph_weight: 0.5,
        }
    }
}

/// Query-time fusion across the three backends: the vector store proposes
/// candidates, the relational store supplies the authoritative text, and the
/// graph store reweights by how strongly each candidate ties back to the
/// entities named in the query. Graph trouble degrades recall to vector-only
/// scoring; it never fails the request.
pub struct MemoryCoordinator {
    relational: Arc<RelationalStore>,
    vector: Arc<VectorStore>,
    graph: Arc<GraphStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    extractor: Arc<dyn EntityExtractor>,
    config: RecallConfig,
}

impl MemoryCoordinator {
    pub fn new(
        relational: Arc<RelationalStore>,
        vector: Arc<VectorStore>,
        graph: Arc<GraphStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        extractor: Arc<dyn EntityExtractor>,
        config: RecallConfig,
    ) -> Self {
        Self {
            relational,
            vector,
            graph,
            embedder,
            extractor,
            config,
        }
    }

    /// Top-k memories for a free-text query, best first. Ties in the fused
    /// score break toward the most recent entry.
    pub async fn recall(
        &self,
        query: &str,
        k: usize,
        filter: Option<&VectorFilter>,
    ) -> Result<Vec<MemoryResult>, RecallError> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let embedding = self.embedder.embed(query).await?;
        let oversampled = k.saturating_mul(self.config.oversample_factor.max(1));
        let candidates = self.vector.nearest(&embedding, oversampled, filter)?;
        debug!("Query matched {} vector candidates", candidates.len());

        let query_entities = self.query_entities(query).await;

        let mut results = Vec::with_capacity(candidates.len());
        for (entry_id, vector_score) in candidates {
            let Some(row) = self.relational.get_entry(&entry_id)? else {
                // The vector record outlived its relational row; surfaced by
                // the consistency check, skipped here
                warn!("Vector match {} has no relational row, skipping", entry_id);
                continue;
            };

            let (entities, graph_relevance) = self.graph_context(&entry_id, &query_entities);
            let score = self.config.vector_weight * vector_score
                + self.config.graph_weight * graph_relevance;

            results.push(MemoryResult {
                entry_id,
                conversation_id: row.conversation_id,
                text: row.text,
                created_at: row.created_at,
                vector_score,
                graph_relevance,
                score,
                entities,
            });
        }

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        results.truncate(k);
        Ok(results)
    }

    /// Resolve the query text to known graph entities, across all types
    /// sharing each mentioned label. Extraction or lookup trouble leaves the
    /// set empty and recall runs vector-only.
    async fn query_entities(&self, query: &str) -> HashSet<EntityId> {
        let extraction = match self.extractor.extract_entities(query).await {
            Ok(extraction) => extraction,
            Err(e) => {
                warn!("Query entity extraction failed, vector-only recall: {}", e);
                return HashSet::new();
            }
        };

        let mut ids = HashSet::new();
        for mention in &extraction.mentions {
            match self.graph.entities_by_label(&mention.label) {
                Ok(entities) => ids.extend(entities.into_iter().map(|entity| entity.id)),
                Err(e) => warn!("Entity lookup for '{}' failed: {}", mention.label, e),
            }
        }
        debug!("Query resolved to {} graph entities", ids.len());
        ids
    }

    /// The entities attached to an entry, and the strongest graph path tying
    /// the entry back to the query entities: a direct mention scores the
    /// mention edge's confidence, a one-hop relation scores the product of
    /// the two edges.
    fn graph_context(
        &self,
        entry_id: &EntryId,
        query_entities: &HashSet<EntityId>,
    ) -> (Vec<GraphEntity>, f32) {
        let edges = match self.graph.edges_for_entry(entry_id) {
            Ok(edges) => edges,
            Err(e) => {
                warn!("Graph lookup for {} failed, vector-only scoring: {}", entry_id, e);
                return (Vec::new(), 0.0);
            }
        };

        let mut entities = Vec::new();
        let mut seen: HashSet<EntityId> = HashSet::new();
        let mut relevance: f32 = 0.0;

        for edge in &edges {
            let subject = edge.subject.clone();
            if seen.insert(subject.clone()) {
                match self.graph.get_entity(&subject) {
                    Ok(Some(entity)) => entities.push(entity),
                    Ok(None) => {
                        warn!("Edge on {} references missing entity {}", entry_id, subject)
                    }
                    Err(e) => warn!("Entity fetch for {} failed: {}", subject, e),
                }
            }

            if query_entities.is_empty() {
                continue;
            }

            if query_entities.contains(&subject) {
                relevance = relevance.max(edge.confidence);
                continue;
            }

            let Ok(related) = self.graph.edges_touching(&subject) else {
                continue;
            };
            for relation in related {
                let other = if relation.subject == subject {
                    match &relation.object {
                        EdgeTarget::Entity(id) => id.clone(),
                        EdgeTarget::Entry(_) => continue,
                    }
                } else {
                    relation.subject.clone()
                };
                if query_entities.contains(&other) {
                    relevance = relevance.max(edge.confidence * relation.confidence);
                }
            }
        }

        (entities, relevance)
    }
}
