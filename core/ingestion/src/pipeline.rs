use memory_weave_schemas::{
    content_hash, Backend, EdgeTarget, EntryId, Extraction, FailedEntry, IngestedEntry,
    IngestionReport, PartialEntry, RawTurn,
};
use memory_weave_stores::{
    EmbeddingProvider, EntityExtractor, EntryState, GraphStore, ProviderError, RelationalStore,
    StoreResult, VectorStore,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::export::{ExportDocument, ExportTurn};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Upper bound on turns processed at once.
    pub max_concurrency: usize,
    /// Per-call budget for the embedding and extraction capabilities.
    pub provider_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            provider_timeout: Duration::from_secs(30),
        }
    }
}

/// Fans each turn of an export out across the three backends. The relational
/// row is the commit point; the vector and graph projections follow, each
/// flagged on the row once written so an interrupted run can be caught up by
/// re-ingesting the same document. Failures stay scoped to their entry and
/// are reported, never escalated to a batch abort.
#[derive(Clone)]
pub struct IngestionPipeline {
    inner: Arc<Inner>,
}

struct Inner {
    relational: Arc<RelationalStore>,
    vector: Arc<VectorStore>,
    graph: Arc<GraphStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    extractor: Arc<dyn EntityExtractor>,
    config: PipelineConfig,
    // Serializes concurrent work on the same entry id within this process
    entry_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

enum EntryOutcome {
    Ingested,
    SkippedDuplicate,
    Partial(PartialEntry),
    Failed(FailedEntry),
}

impl IngestionPipeline {
    pub fn new(
        relational: Arc<RelationalStore>,
        vector: Arc<VectorStore>,
        graph: Arc<GraphStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        extractor: Arc<dyn EntityExtractor>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                relational,
                vector,
                graph,
                embedder,
                extractor,
                config,
                entry_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Ingest every turn of a parsed export document and report the outcome.
    pub async fn ingest(&self, document: &ExportDocument) -> IngestionReport {
        let mut report = IngestionReport::new();
        info!(
            "Ingesting batch {} ({} conversations)",
            report.batch_id,
            document.conversation_count()
        );

        let semaphore = Arc::new(Semaphore::new(self.inner.config.max_concurrency));
        let mut tasks = JoinSet::new();

        for item in document.turns() {
            match item {
                Ok(export_turn) => {
                    let inner = Arc::clone(&self.inner);
                    let semaphore = Arc::clone(&semaphore);
                    tasks.spawn(async move {
                        let _permit = match semaphore.acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => {
                                return EntryOutcome::Failed(FailedEntry {
                                    conversation_id: Some(export_turn.turn.conversation_id),
                                    turn_id: Some(export_turn.turn.turn_id),
                                    error: "ingestion pool shut down".to_string(),
                                })
                            }
                        };
                        process_turn(inner, export_turn).await
                    });
                }
                Err(e) => report.failed.push(FailedEntry {
                    conversation_id: None,
                    turn_id: None,
                    error: e.to_string(),
                }),
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(EntryOutcome::Ingested) => report.ingested += 1,
                Ok(EntryOutcome::SkippedDuplicate) => report.skipped_duplicate += 1,
                Ok(EntryOutcome::Partial(partial)) => report.partial.push(partial),
                Ok(EntryOutcome::Failed(failure)) => report.failed.push(failure),
                Err(e) => report.failed.push(FailedEntry {
                    conversation_id: None,
                    turn_id: None,
                    error: format!("ingestion task panicked: {}", e),
                }),
            }
        }

        info!(
            "Batch {} done: {} ingested, {} skipped, {} partial, {} failed",
            report.batch_id,
            report.ingested,
            report.skipped_duplicate,
            report.partial.len(),
            report.failed.len()
        );
        report
    }
}

impl Inner {
    async fn entry_lock(&self, entry_id: &EntryId) -> Arc<Mutex<()>> {
        let mut locks = self.entry_locks.lock().await;
        locks.entry(entry_id.0.clone()).or_default().clone()
    }

    /// Drop this holder's clone and prune the slot once nobody else holds
    /// it, so the map stays bounded by in-flight turns rather than every
    /// entry id ever seen.
    async fn release_entry_lock(&self, entry_id: &EntryId, lock: Arc<Mutex<()>>) {
        let mut locks = self.entry_locks.lock().await;
        drop(lock);
        if locks
            .get(&entry_id.0)
            .map_or(false, |slot| Arc::strong_count(slot) == 1)
        {
            locks.remove(&entry_id.0);
        }
    }
}

async fn process_turn(inner: Arc<Inner>, export_turn: ExportTurn) -> EntryOutcome {
    let entry_id = export_turn.turn.entry_id();
    let lock = inner.entry_lock(&entry_id).await;
    let outcome = {
        let _guard = lock.lock().await;
        ingest_turn(&inner, export_turn).await
    };
    inner.release_entry_lock(&entry_id, lock).await;
    outcome
}

async fn ingest_turn(inner: &Inner, export_turn: ExportTurn) -> EntryOutcome {
    let ExportTurn {
        turn,
        conversation_name,
    } = export_turn;
    let entry_id = turn.entry_id();
    let hash = content_hash(&turn.text);

    let state = match inner.relational.entry_state(&entry_id, &hash) {
        Ok(state) => state,
        Err(e) => return EntryOutcome::Failed(failed(&turn, e.to_string())),
    };

    let (need_row, need_vector, need_graph) = match state {
        EntryState::Absent | EntryState::Stale => (true, true, true),
        EntryState::Current {
            vector_synced: true,
            graph_synced: true,
        } => {
            debug!("Entry {} already ingested, skipping", entry_id);
            return EntryOutcome::SkippedDuplicate;
        }
        EntryState::Current {
            vector_synced,
            graph_synced,
        } => {
            debug!("Entry {} partially ingested, catching up", entry_id);
            (false, !vector_synced, !graph_synced)
        }
    };

    // Providers run first; nothing is committed until every capability this
    // entry still needs has produced output.
    let budget = inner.config.provider_timeout;
    let embed_needed = async {
        if need_vector {
            run_provider(budget, inner.embedder.embed(&turn.text))
                .await
                .map(Some)
        } else {
            Ok(None)
        }
    };
    let extract_needed = async {
        if need_graph {
            run_provider(budget, inner.extractor.extract_entities(&turn.text))
                .await
                .map(Some)
        } else {
            Ok(None)
        }
    };

    let (embedding, extraction) = match tokio::try_join!(embed_needed, extract_needed) {
        Ok(outputs) => outputs,
        Err(e) => {
            if need_row {
                return EntryOutcome::Failed(failed(&turn, e));
            }
            // The row is already committed; only projections are outstanding
            let mut missing = Vec::new();
            if need_vector {
                missing.push(Backend::Vector);
            }
            if need_graph {
                missing.push(Backend::Graph);
            }
            return EntryOutcome::Partial(PartialEntry {
                entry_id,
                missing,
                error: e,
            });
        }
    };

    if need_row {
        let mut entry = IngestedEntry::from_turn(&turn, conversation_name);
        entry.embedding = embedding.clone();
        if let Some(ref extraction) = extraction {
            entry.entities = extraction.mentions.clone();
        }
        if let Err(e) = inner.relational.upsert_entry(&entry) {
            return EntryOutcome::Failed(failed(&turn, format!("relational write failed: {}", e)));
        }
    }

    // Derived writes are independent; one backend going down must not block
    // the other's projection.
    let mut missing = Vec::new();
    let mut errors = Vec::new();

    if let Some(ref vector) = embedding {
        let written = inner
            .vector
            .upsert_embedding(&entry_id, vector, &turn.conversation_id, &turn.created_at)
            .and_then(|_| inner.relational.mark_synced(&entry_id, Backend::Vector));
        if let Err(e) = written {
            warn!("Vector projection of {} failed: {}", entry_id, e);
            missing.push(Backend::Vector);
            errors.push(format!("vector: {}", e));
        }
    }

    if let Some(ref extraction) = extraction {
        let written = write_graph(inner, &entry_id, &turn, extraction)
            .and_then(|_| inner.relational.mark_synced(&entry_id, Backend::Graph));
        if let Err(e) = written {
            warn!("Graph projection of {} failed: {}", entry_id, e);
            missing.push(Backend::Graph);
            errors.push(format!("graph: {}", e));
        }
    }

    if missing.is_empty() {
        EntryOutcome::Ingested
    } else {
        EntryOutcome::Partial(PartialEntry {
            entry_id,
            missing,
            error: errors.join("; "),
        })
    }
}

/// Canonicalize the extractor output into graph writes: one node per
/// mention, a `mentioned_in` edge tying each node to the entry, and one edge
/// per reported relation, all evidenced by this entry.
fn write_graph(
    inner: &Inner,
    entry_id: &EntryId,
    turn: &RawTurn,
    extraction: &Extraction,
) -> StoreResult<()> {
    for mention in &extraction.mentions {
        let entity_id = inner.graph.upsert_entity(mention, &turn.created_at)?;
        inner.graph.upsert_edge(
            &entity_id,
            "mentioned_in",
            &EdgeTarget::Entry(entry_id.clone()),
            mention.confidence,
            entry_id,
        )?;
    }

    for relation in &extraction.relations {
        let subject = inner.graph.upsert_entity(&relation.subject, &turn.created_at)?;
        let object = inner.graph.upsert_entity(&relation.object, &turn.created_at)?;
        inner.graph.upsert_edge(
            &subject,
            &relation.predicate,
            &EdgeTarget::Entity(object),
            relation.confidence,
            entry_id,
        )?;
    }

    Ok(())
}

async fn run_provider<T>(
    budget: Duration,
    call: impl Future<Output = Result<T, ProviderError>>,
) -> Result<T, String> {
    match timeout(budget, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(ProviderError::Timeout(budget.as_millis() as u64).to_string()),
    }
}

fn failed(turn: &RawTurn, error: String) -> FailedEntry {
    FailedEntry {
        conversation_id: Some(turn.conversation_id.clone()),
        turn_id: Some(turn.turn_id.clone()),
        error,
    }
}
