use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use memory_weave_recall::{MemoryCoordinator, RecallConfig, RecallError};
use memory_weave_schemas::ConversationId;
use memory_weave_stores::{
    EmbeddingProvider, EntityExtractor, GraphStore, HashEmbedding, HeuristicEntityExtractor,
    HttpEmbeddingProvider, HttpEntityExtractor, LifecycleManager, RelationalStore, VectorFilter,
    VectorStore,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "memory-weave-recall")]
#[command(about = "Recall service: fuses the backends into ranked memory results")]
struct Args {
    /// Directory holding the three backend databases
    #[arg(long, env = "MEMORY_WEAVE_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Embedding dimension of the vector namespace
    #[arg(long, env = "MEMORY_WEAVE_DIMENSION", default_value_t = 384)]
    dimension: usize,

    /// Embedding model endpoint; falls back to the hash embedder when unset
    #[arg(long, env = "MEMORY_WEAVE_EMBED_ENDPOINT")]
    embed_endpoint: Option<String>,

    /// Entity extraction endpoint; falls back to the heuristic extractor when unset
    #[arg(long, env = "MEMORY_WEAVE_EXTRACT_ENDPOINT")]
    extract_endpoint: Option<String>,

    /// Weight of the cosine similarity term in the fused score
    #[arg(long, default_value_t = 0.5)]
    vector_weight: f32,

    /// Weight of the graph relevance term in the fused score
    #[arg(long, default_value_t = 0.5)]
    graph_weight: f32,

    /// Listen address
    #[arg(long, env = "MEMORY_WEAVE_RECALL_ADDR", default_value = "127.0.0.1:21971")]
    addr: String,
}

#[derive(Clone)]
struct AppState {
    coordinator: Arc<MemoryCoordinator>,
    lifecycle: Arc<LifecycleManager>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!("Memory Weave Recall Service v0.1.0");

    let relational = Arc::new(RelationalStore::open(args.data_dir.join("relational.db"))?);
    let vector = Arc::new(VectorStore::open(
        args.data_dir.join("vector.db"),
        args.dimension,
    )?);
    let graph = Arc::new(GraphStore::open(args.data_dir.join("graph.db"))?);
    let lifecycle = Arc::new(LifecycleManager::new(
        relational.clone(),
        vector.clone(),
        graph.clone(),
    ));

    let embedder: Arc<dyn EmbeddingProvider> = match &args.embed_endpoint {
        Some(endpoint) => {
            info!("Using embedding endpoint {}", endpoint);
            Arc::new(HttpEmbeddingProvider::new(endpoint.clone(), args.dimension))
        }
        None => Arc::new(HashEmbedding::new(args.dimension)),
    };
    let extractor: Arc<dyn EntityExtractor> = match &args.extract_endpoint {
        Some(endpoint) => {
            info!("Using extraction endpoint {}", endpoint);
            Arc::new(HttpEntityExtractor::new(endpoint.clone()))
        }
        None => Arc::new(HeuristicEntityExtractor::new()),
    };

    let coordinator = Arc::new(MemoryCoordinator::new(
        relational,
        vector,
        graph,
        embedder,
        extractor,
        RecallConfig {
            vector_weight: args.vector_weight,
            graph_weight: args.graph_weight,
            ..RecallConfig::default()
        },
    ));

    let state = AppState {
        coordinator,
        lifecycle,
    };

    // CORS for browser-side clients
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/recall", get(recall))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("Starting HTTP server on {}", args.addr);
    let listener = tokio::net::TcpListener::bind(&args.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let stores = state.lifecycle.health_check();
    let healthy = stores.iter().all(|h| h.reachable);
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "service": "recall",
            "healthy": healthy,
            "stores": stores
        })),
    )
}

#[derive(Debug, Deserialize)]
struct RecallQuery {
    q: String,
    k: Option<usize>,
    conversation_id: Option<String>,
    since: Option<String>,
}

async fn recall(
    State(state): State<AppState>,
    Query(params): Query<RecallQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let k = params.k.unwrap_or(10).clamp(1, 100);
    let filter = if params.conversation_id.is_some() || params.since.is_some() {
        Some(VectorFilter {
            conversation_id: params.conversation_id.map(ConversationId),
            since: params.since,
        })
    } else {
        None
    };

    let results = state
        .coordinator
        .recall(&params.q, k, filter.as_ref())
        .await
        .map_err(|e| {
            error!("Recall failed: {}", e);
            let status = match e {
                RecallError::Embedding(_) => StatusCode::BAD_GATEWAY,
                RecallError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, e.to_string())
        })?;

    Ok(Json(serde_json::json!({
        "query": params.q,
        "count": results.len(),
        "results": results
    })))
}
