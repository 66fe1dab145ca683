//! Component configuration plus the clap argument groups binaries share.
//!
//! Every component receives its config struct explicitly in its constructor;
//! nothing in the library reads the environment on its own.

use std::time::Duration;

use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};
use crate::retry::RetryPolicy;

/// Default local Ollama endpoint.
pub const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";

/// Which chunking policy splits document text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ChunkingStrategyKind {
    /// Fixed-size character windows, snapped to whitespace when possible.
    Fixed,
    /// Paragraph packing with paragraph-granular overlap.
    Paragraph,
}

/// Chunk sizing knobs (all sizes in characters).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    /// Strategy used to split text.
    pub strategy: ChunkingStrategyKind,
    /// Maximum characters per chunk.
    pub chunk_size: usize,
    /// Characters shared between consecutive chunks.
    pub overlap: usize,
    /// Trailing fragments shorter than this are folded into the previous chunk.
    pub min_chunk_size: usize,
    /// Append rendered tables to the document text before chunking.
    pub include_tables: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: ChunkingStrategyKind::Fixed,
            chunk_size: 1200,
            overlap: 200,
            min_chunk_size: 120,
            include_tables: true,
        }
    }
}

impl ChunkingConfig {
    /// Rejects sizes that cannot make forward progress.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(RagError::InvalidConfig("chunk_size must be positive".into()));
        }
        if self.overlap >= self.chunk_size {
            return Err(RagError::InvalidConfig(format!(
                "overlap ({}) must be smaller than chunk_size ({})",
                self.overlap, self.chunk_size
            )));
        }
        if self.min_chunk_size > self.chunk_size {
            return Err(RagError::InvalidConfig(format!(
                "min_chunk_size ({}) must not exceed chunk_size ({})",
                self.min_chunk_size, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// Embedding service flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EmbedderBackend {
    /// Local Ollama runtime (`/api/embed`).
    Ollama,
    /// Any OpenAI-compatible `/embeddings` endpoint.
    #[value(name = "openai")]
    OpenAi,
}

/// Embedding client settings.
#[derive(Debug, Clone)]
pub struct EmbedderConfig {
    /// Service flavour.
    pub backend: EmbedderBackend,
    /// Base URL of the service.
    pub base_url: String,
    /// Model identifier.
    pub model: String,
    /// Bearer token for hosted endpoints.
    pub api_key: Option<String>,
    /// Optional output dimension override (OpenAI-compatible only).
    pub dimensions: Option<usize>,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Max inputs per request.
    pub batch_size: usize,
    /// Concurrent embedding workers during index builds.
    pub workers: usize,
    /// Retry policy for transient failures.
    pub retry: RetryPolicy,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            backend: EmbedderBackend::Ollama,
            base_url: DEFAULT_OLLAMA_URL.to_string(),
            model: "all-minilm".to_string(),
            api_key: None,
            dimensions: None,
            timeout: Duration::from_secs(30),
            batch_size: 32,
            workers: 2,
            retry: RetryPolicy::default(),
        }
    }
}

/// Similarity function used by the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Cosine similarity; vectors are L2-normalised on insert.
    Cosine,
    /// Raw inner product; vectors are stored untouched.
    InnerProduct,
}

/// Space-partitioning settings for approximate search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IvfConfig {
    /// Number of partitions (k-means centroids).
    pub lists: usize,
    /// Partitions scanned per query.
    pub probes: usize,
}

/// Vector index settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexConfig {
    /// Similarity metric.
    pub metric: Metric,
    /// Dimension the index must hold; `None` adopts the first vector's dimension.
    pub dimension: Option<usize>,
    /// Approximate search partitioning; `None` keeps exact flat search.
    pub ivf: Option<IvfConfig>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            metric: Metric::Cosine,
            dimension: None,
            ivf: None,
        }
    }
}

/// Retrieval post-processing settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrievalConfig {
    /// Candidates fetched per requested result before filtering.
    pub overfetch_factor: usize,
    /// Keep at most this many chunks per document.
    pub max_chunks_per_document: Option<usize>,
    /// Drop hits scoring below this similarity.
    pub min_score: Option<f32>,
    /// Cached query embeddings (0 disables).
    pub query_cache_size: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            overfetch_factor: 3,
            max_chunks_per_document: None,
            min_score: None,
            query_cache_size: 256,
        }
    }
}

/// Prompt construction settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptConfig {
    /// Default context budget in estimated tokens.
    pub max_context_tokens: usize,
    /// Sentence the model must emit when the context lacks the answer.
    pub not_found_message: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 2048,
            not_found_message: "Not found in provided documents.".to_string(),
        }
    }
}

/// Generation service flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GeneratorBackend {
    /// Local Ollama runtime (`/api/chat`).
    Ollama,
    /// Any OpenAI-compatible chat completions endpoint.
    #[value(name = "openai")]
    OpenAi,
}

/// Generation client settings.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Service flavour.
    pub backend: GeneratorBackend,
    /// Base URL of the service.
    pub base_url: String,
    /// Model name passed with each request.
    pub model: String,
    /// Bearer token for hosted endpoints.
    pub api_key: Option<String>,
    /// Sampling temperature.
    pub temperature: f32,
    /// Maximum tokens to generate.
    pub max_tokens: usize,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            backend: GeneratorBackend::Ollama,
            base_url: DEFAULT_OLLAMA_URL.to_string(),
            model: "llama3".to_string(),
            api_key: None,
            temperature: 0.1,
            max_tokens: 512,
            timeout: Duration::from_secs(120),
        }
    }
}

/// Chunking flags shared by binaries that build indexes.
#[derive(Args, Debug, Clone)]
pub struct ChunkingArgs {
    /// Chunking strategy
    #[arg(long, env = "STATRAG_CHUNK_STRATEGY", value_enum, default_value = "fixed")]
    pub chunk_strategy: ChunkingStrategyKind,

    /// Maximum characters per chunk
    #[arg(long, env = "STATRAG_CHUNK_SIZE", default_value_t = 1200)]
    pub chunk_size: usize,

    /// Characters shared between consecutive chunks
    #[arg(long, env = "STATRAG_CHUNK_OVERLAP", default_value_t = 200)]
    pub chunk_overlap: usize,

    /// Trailing fragments below this size merge into the previous chunk
    #[arg(long, env = "STATRAG_MIN_CHUNK", default_value_t = 120)]
    pub min_chunk_size: usize,

    /// Skip rendering extracted tables into the chunked text
    #[arg(long, default_value_t = false)]
    pub skip_tables: bool,
}

impl ChunkingArgs {
    /// Converts the parsed flags into a validated `ChunkingConfig`.
    pub fn build_config(&self) -> Result<ChunkingConfig> {
        let config = ChunkingConfig {
            strategy: self.chunk_strategy,
            chunk_size: self.chunk_size,
            overlap: self.chunk_overlap,
            min_chunk_size: self.min_chunk_size,
            include_tables: !self.skip_tables,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Embedding service flags.
#[derive(Args, Debug, Clone)]
pub struct EmbedderArgs {
    /// Embedding backend
    #[arg(long, env = "STATRAG_EMBED_BACKEND", value_enum, default_value = "ollama")]
    pub embed_backend: EmbedderBackend,

    /// Base URL of the embedding service
    #[arg(long, env = "STATRAG_EMBED_URL", default_value = DEFAULT_OLLAMA_URL)]
    pub embed_url: String,

    /// Embedding model identifier
    #[arg(long, env = "STATRAG_EMBED_MODEL", default_value = "all-minilm")]
    pub embed_model: String,

    /// API key for hosted OpenAI-compatible endpoints
    #[arg(long, env = "STATRAG_EMBED_API_KEY")]
    pub embed_api_key: Option<String>,

    /// Optional dimension override when supported by the model
    #[arg(long, env = "STATRAG_EMBED_DIMENSIONS")]
    pub embed_dimensions: Option<usize>,

    /// Max inputs per embedding request
    #[arg(long, env = "STATRAG_EMBED_BATCH", default_value_t = 32)]
    pub embed_batch: usize,

    /// Seconds before an embedding request times out
    #[arg(long, env = "STATRAG_EMBED_TIMEOUT_SECS", default_value_t = 30)]
    pub embed_timeout_secs: u64,

    /// Attempts per embedding request (including the first)
    #[arg(long, env = "STATRAG_EMBED_MAX_ATTEMPTS", default_value_t = 4)]
    pub embed_max_attempts: usize,

    /// Concurrent embedding workers during builds
    #[arg(long, env = "STATRAG_EMBED_WORKERS", default_value_t = 2)]
    pub embed_workers: usize,
}

impl EmbedderArgs {
    /// Converts the parsed flags into an `EmbedderConfig`.
    pub fn build_config(&self) -> EmbedderConfig {
        EmbedderConfig {
            backend: self.embed_backend,
            base_url: self.embed_url.clone(),
            model: self.embed_model.clone(),
            api_key: self.embed_api_key.clone(),
            dimensions: self.embed_dimensions,
            timeout: Duration::from_secs(self.embed_timeout_secs.max(1)),
            batch_size: self.embed_batch.max(1),
            workers: self.embed_workers.max(1),
            retry: RetryPolicy {
                max_attempts: self.embed_max_attempts.max(1),
                ..RetryPolicy::default()
            },
        }
    }
}

/// Generation service flags.
#[derive(Args, Debug, Clone)]
pub struct GeneratorArgs {
    /// Generation backend
    #[arg(long, env = "STATRAG_LLM_BACKEND", value_enum, default_value = "ollama")]
    pub llm_backend: GeneratorBackend,

    /// Base URL of the generation service
    #[arg(long, env = "STATRAG_LLM_URL", default_value = DEFAULT_OLLAMA_URL)]
    pub llm_url: String,

    /// Model used for answer synthesis
    #[arg(long, env = "STATRAG_LLM_MODEL", default_value = "llama3")]
    pub llm_model: String,

    /// API key for hosted OpenAI-compatible endpoints
    #[arg(long, env = "STATRAG_LLM_API_KEY")]
    pub llm_api_key: Option<String>,

    /// Sampling temperature
    #[arg(long, default_value_t = 0.1)]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[arg(long, default_value_t = 512)]
    pub max_completion_tokens: usize,

    /// Seconds before a generation request times out
    #[arg(long, env = "STATRAG_LLM_TIMEOUT_SECS", default_value_t = 120)]
    pub llm_timeout_secs: u64,
}

impl GeneratorArgs {
    /// Converts the parsed flags into a `GeneratorConfig`.
    pub fn build_config(&self) -> GeneratorConfig {
        GeneratorConfig {
            backend: self.llm_backend,
            base_url: self.llm_url.clone(),
            model: self.llm_model.clone(),
            api_key: self.llm_api_key.clone(),
            temperature: self.temperature,
            max_tokens: self.max_completion_tokens,
            timeout: Duration::from_secs(self.llm_timeout_secs.max(1)),
        }
    }
}

/// Retrieval and prompt flags shared by query-time binaries.
#[derive(Args, Debug, Clone)]
pub struct RetrievalArgs {
    /// Candidates fetched per requested chunk before filtering
    #[arg(long, env = "STATRAG_OVERFETCH", default_value_t = 3)]
    pub overfetch: usize,

    /// Keep at most this many chunks from one document
    #[arg(long, env = "STATRAG_MAX_PER_DOCUMENT")]
    pub max_per_document: Option<usize>,

    /// Drop chunks scoring below this similarity
    #[arg(long)]
    pub min_score: Option<f32>,

    /// Max cached query embeddings (0 disables caching)
    #[arg(long, default_value_t = 256)]
    pub query_cache_size: usize,

    /// Context budget in estimated tokens
    #[arg(long, env = "STATRAG_MAX_CONTEXT_TOKENS", default_value_t = 2048)]
    pub max_context_tokens: usize,
}

impl RetrievalArgs {
    /// Converts the parsed flags into a `RetrievalConfig`.
    pub fn retrieval_config(&self) -> RetrievalConfig {
        RetrievalConfig {
            overfetch_factor: self.overfetch.max(1),
            max_chunks_per_document: self.max_per_document.filter(|cap| *cap > 0),
            min_score: self.min_score,
            query_cache_size: self.query_cache_size,
        }
    }

    /// Converts the parsed flags into a `PromptConfig`.
    pub fn prompt_config(&self) -> PromptConfig {
        PromptConfig {
            max_context_tokens: self.max_context_tokens,
            ..PromptConfig::default()
        }
    }
}
