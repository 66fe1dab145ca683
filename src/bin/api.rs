use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use statrag::config::{EmbedderArgs, GeneratorArgs, RetrievalArgs};
use statrag::telemetry::init_tracing;
use statrag::{
    embedder, generator, Answer, IndexHandle, LoadOptions, MetadataFilter, PipelineConfig,
    PromptAssembler, RagError, RagPipeline, RetrievedChunk, Retriever, VectorIndex,
};
use tokio::runtime::Runtime;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "statrag-api",
    about = "HTTP API for retrieval and grounded answers over statistical documents"
)]
struct ApiCli {
    /// Address to bind the HTTP server to (host:port)
    #[arg(long, env = "STATRAG_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    /// Index artifact directory, re-read on /v1/reload
    #[arg(long, env = "STATRAG_INDEX_DIR", default_value = "statrag_index")]
    index: PathBuf,

    /// Default top-k when the client does not override it
    #[arg(long, default_value_t = 5)]
    default_top_k: usize,

    /// Maximum top-k allowed per request
    #[arg(long, default_value_t = 12)]
    max_top_k: usize,

    #[command(flatten)]
    retrieval: RetrievalArgs,

    #[command(flatten)]
    embedder: EmbedderArgs,

    #[command(flatten)]
    generator: GeneratorArgs,
}

#[derive(Clone)]
struct AppState {
    pipeline: Arc<RagPipeline>,
    index_dir: Arc<PathBuf>,
    load_options: LoadOptions,
    default_top_k: usize,
    max_top_k: usize,
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    filter: Option<MetadataFilter>,
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    chunks: Vec<RetrievedChunk>,
    meta: ResponseMeta,
}

#[derive(Debug, Serialize)]
struct AnswerResponse {
    #[serde(flatten)]
    answer: Answer,
    meta: ResponseMeta,
}

#[derive(Debug, Serialize)]
struct ResponseMeta {
    top_k: usize,
    latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    candidates_scanned: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ReloadResponse {
    rows: usize,
    previous_rows: usize,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn main() -> Result<()> {
    init_tracing();
    let cli = ApiCli::parse();
    let embedder_config = cli.embedder.build_config();
    let embedder = embedder::from_config(&embedder_config)?;
    // Reloads are checked against the same measured dimension and model.
    let load_options = LoadOptions::for_embedder(embedder.as_ref(), &embedder_config.retry)
        .context("failed to reach the embedding service")?;
    let index = VectorIndex::load(&cli.index, load_options.clone())
        .with_context(|| format!("failed to load index at {:?}", cli.index))?;
    let retriever = Retriever::new(
        embedder,
        IndexHandle::new(index),
        cli.retrieval.retrieval_config(),
    )
    .with_retry(embedder_config.retry);
    let generator_config = cli.generator.build_config();
    // Blocking HTTP clients are built and dropped outside the async runtime.
    let pipeline = Arc::new(RagPipeline::new(
        retriever,
        PromptAssembler::new(cli.retrieval.prompt_config()),
        generator::from_config(&generator_config)?,
        PipelineConfig::from_generator(&generator_config),
    ));
    let state = AppState {
        pipeline: pipeline.clone(),
        index_dir: Arc::new(cli.index.clone()),
        load_options,
        default_top_k: cli.default_top_k.max(1),
        max_top_k: cli.max_top_k.max(1),
    };
    let addr: SocketAddr = cli
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cli.bind))?;
    let runtime = Runtime::new().context("failed to start tokio runtime")?;
    runtime.block_on(serve(addr, state))?;
    drop(runtime);
    drop(pipeline);
    Ok(())
}

async fn serve(addr: SocketAddr, state: AppState) -> Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/query", post(query_handler))
        .route("/v1/answer", post(answer_handler))
        .route("/v1/reload", post(reload_handler))
        .with_state(state);
    info!(%addr, "statrag-api listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await.context("server shutdown")?;
    Ok(())
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn query_handler(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    if request.query.trim().is_empty() {
        return Err(bad_request("query text must not be empty"));
    }
    let top_k = clamp_top_k(&state, request.top_k);
    let start = Instant::now();
    let pipeline = state.pipeline.clone();
    let result = tokio::task::spawn_blocking(move || {
        let filter = request.filter.filter(|f| !f.is_empty());
        pipeline.retrieve(
            &request.query,
            top_k,
            filter.as_ref().map(|f| f as &dyn statrag::ChunkFilter),
        )
    })
    .await
    .map_err(join_error)?;
    let (chunks, scanned) = match result {
        Ok(result) => (result.hits, Some(result.candidates_scanned)),
        Err(RagError::EmptyIndex) => (Vec::new(), None),
        Err(err) => return Err(rag_error(err)),
    };
    Ok(Json(QueryResponse {
        chunks,
        meta: ResponseMeta {
            top_k,
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
            candidates_scanned: scanned,
        },
    }))
}

async fn answer_handler(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<AnswerResponse>, ApiError> {
    if request.query.trim().is_empty() {
        return Err(bad_request("query text must not be empty"));
    }
    let top_k = clamp_top_k(&state, request.top_k);
    let start = Instant::now();
    let pipeline = state.pipeline.clone();
    let answer = tokio::task::spawn_blocking(move || {
        let filter = request.filter.filter(|f| !f.is_empty());
        pipeline.answer_with_filter(
            &request.query,
            top_k,
            filter.as_ref().map(|f| f as &dyn statrag::ChunkFilter),
        )
    })
    .await
    .map_err(join_error)?
    .map_err(rag_error)?;
    Ok(Json(AnswerResponse {
        answer,
        meta: ResponseMeta {
            top_k,
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
            candidates_scanned: None,
        },
    }))
}

async fn reload_handler(State(state): State<AppState>) -> Result<Json<ReloadResponse>, ApiError> {
    let dir = state.index_dir.clone();
    let options = state.load_options.clone();
    let index = tokio::task::spawn_blocking(move || VectorIndex::load(&dir, options))
        .await
        .map_err(join_error)?
        .map_err(rag_error)?;
    let rows = index.len();
    let previous = state.pipeline.index().swap(index);
    Ok(Json(ReloadResponse {
        rows,
        previous_rows: previous.len(),
    }))
}

fn clamp_top_k(state: &AppState, requested: Option<usize>) -> usize {
    requested
        .unwrap_or(state.default_top_k)
        .clamp(1, state.max_top_k)
}

fn rag_error(err: RagError) -> ApiError {
    let status = match &err {
        RagError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        RagError::EmbeddingUnavailable { .. } | RagError::GenerationFailed { .. } => {
            StatusCode::BAD_GATEWAY
        }
        RagError::GenerationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        RagError::EmptyIndex => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!(status = status.as_u16(), error = %err, "request failed");
    (
        status,
        Json(ErrorBody {
            message: err.to_string(),
        }),
    )
}

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
}

fn join_error(err: tokio::task::JoinError) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            message: format!("worker task failed: {err}"),
        }),
    )
}
