use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use memory_weave_ingestion::{ExportDocument, IngestionPipeline, PipelineConfig};
use memory_weave_stores::{
    EmbeddingProvider, EntityExtractor, GraphStore, HashEmbedding, HeuristicEntityExtractor,
    HttpEmbeddingProvider, HttpEntityExtractor, LifecycleManager, RelationalStore, VectorStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "memory-weave-ingestion")]
#[command(about = "Ingestion service: parses exports and fans turns out across the backends")]
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

    /// Upper bound on turns processed concurrently
    #[arg(long, default_value_t = 4)]
    max_concurrency: usize,

    /// Per-provider call budget in seconds
    #[arg(long, default_value_t = 30)]
    provider_timeout_secs: u64,

    /// Listen address
    #[arg(long, env = "MEMORY_WEAVE_INGEST_ADDR", default_value = "127.0.0.1:21970")]
    addr: String,
}

#[derive(Clone)]
struct AppState {
    pipeline: IngestionPipeline,
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
    info!("Memory Weave Ingestion Service v0.1.0");

    std::fs::create_dir_all(&args.data_dir)?;
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
    lifecycle.initialize_all()?;
    info!("Stores ready under {}", args.data_dir.display());

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

    let pipeline = IngestionPipeline::new(
        relational,
        vector,
        graph,
        embedder,
        extractor,
        PipelineConfig {
            max_concurrency: args.max_concurrency,
            provider_timeout: Duration::from_secs(args.provider_timeout_secs),
        },
    );

    let state = AppState {
        pipeline,
        lifecycle,
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(get_stats))
        .route("/consistency", get(check_consistency))
        .route("/ingest/export", post(ingest_export))
        .route("/lifecycle/initialize", post(initialize_stores))
        .route("/lifecycle/reset", post(reset_stores))
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
            "service": "ingestion",
            "healthy": healthy,
            "stores": stores
        })),
    )
}

async fn ingest_export(
    State(state): State<AppState>,
    body: String,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let document = ExportDocument::parse(&body).map_err(|e| {
        error!("Rejected export document: {}", e);
        (StatusCode::BAD_REQUEST, e.to_string())
    })?;

    let report = state.pipeline.ingest(&document).await;
    Ok(Json(report))
}

async fn get_stats(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let stats = state.lifecycle.get_stats().map_err(internal)?;
    Ok(Json(stats))
}

async fn check_consistency(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let report = state.lifecycle.check_consistency().map_err(internal)?;
    Ok(Json(serde_json::json!({
        "clean": report.is_clean(),
        "orphaned_vectors": report.orphaned_vectors,
        "dangling_edges": report.dangling_edges
    })))
}

async fn initialize_stores(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    state.lifecycle.initialize_all().map_err(internal)?;
    Ok(Json(serde_json::json!({ "status": "initialized" })))
}

async fn reset_stores(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    state.lifecycle.reset_all().map_err(internal)?;
    Ok(Json(serde_json::json!({ "status": "reset" })))
}

fn internal<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    error!("Request failed: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
