#![warn(missing_docs)]
//! Retrieval-augmented question answering over scraped statistical documents.
//!
//! Build time: [`document`] records are split by the [`chunker`], embedded in
//! parallel batches by the [`builder`] and stored in a [`index::VectorIndex`].
//! Query time: the [`retriever`] embeds the question and selects chunks, the
//! [`prompt`] assembler packs them into a budget, a [`generator`] answers and
//! [`answer`] keeps only citations that point at supplied chunks.
//! [`pipeline::RagPipeline::answer`] ties the query path together.

pub mod answer;
pub mod builder;
pub mod chunker;
pub mod config;
pub mod document;
pub mod embedder;
pub mod error;
pub mod eval;
pub mod generator;
pub mod index;
pub mod pipeline;
pub mod prompt;
pub mod retriever;
pub mod retry;
pub mod telemetry;

pub use answer::{Answer, AnswerStatus};
pub use builder::{BuildConfig, BuildOutput, BuildReport, IndexBuilder, SkippedDocument};
pub use chunker::{Chunk, Chunker, ChunkingStrategy};
pub use config::{
    ChunkingConfig, EmbedderConfig, GeneratorConfig, IndexConfig, Metric, PromptConfig,
    RetrievalConfig,
};
pub use document::{Document, DocumentTable};
pub use embedder::Embedder;
pub use error::{RagError, Result};
pub use generator::{GenerationRequest, Generator};
pub use index::{ChunkMetadata, IndexEntry, IndexHandle, LoadOptions, RetrievedChunk, VectorIndex};
pub use pipeline::{PipelineConfig, RagPipeline};
pub use prompt::{Prompt, PromptAssembler, PromptSource};
pub use retriever::{ChunkFilter, MetadataFilter, RetrievalResult, Retriever};
pub use retry::RetryPolicy;
