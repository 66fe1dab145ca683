//! Query-time orchestration: retrieve, assemble, generate, cite.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::answer::{Answer, AnswerStatus};
use crate::config::GeneratorConfig;
use crate::error::{RagError, Result};
use crate::generator::{GenerationRequest, Generator};
use crate::index::IndexHandle;
use crate::prompt::{Prompt, PromptAssembler};
use crate::retriever::{ChunkFilter, RetrievalResult, Retriever};
use crate::retry::RetryPolicy;

/// Generation parameters used by the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Model name passed to the generator.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion token cap.
    pub max_tokens: usize,
    /// Attempts per prompt when generation times out.
    pub generation_attempts: usize,
}

impl PipelineConfig {
    /// Takes model settings from a generator config; timeouts get one retry.
    pub fn from_generator(config: &GeneratorConfig) -> Self {
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            generation_attempts: 2,
        }
    }
}

/// Turns a question into a cited answer.
pub struct RagPipeline {
    retriever: Retriever,
    assembler: PromptAssembler,
    generator: Arc<dyn Generator>,
    config: PipelineConfig,
}

impl RagPipeline {
    /// Wires the query-time stages together.
    pub fn new(
        retriever: Retriever,
        assembler: PromptAssembler,
        generator: Arc<dyn Generator>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            retriever,
            assembler,
            generator,
            config,
        }
    }

    /// Handle to the index serving queries, for swapping in rebuilds.
    pub fn index(&self) -> &IndexHandle {
        self.retriever.index()
    }

    /// The retrieval stage.
    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    /// Answers `question` from the top `k` chunks.
    pub fn answer(&self, question: &str, k: usize) -> Result<Answer> {
        self.answer_with_filter(question, k, None)
    }

    /// Answers `question` considering only chunks accepted by `filter`.
    ///
    /// An empty index yields a `NoDataIndexed` answer and a generation
    /// timeout that persists through the retry yields `ModelUnavailable`;
    /// other failures propagate.
    pub fn answer_with_filter(
        &self,
        question: &str,
        k: usize,
        filter: Option<&dyn ChunkFilter>,
    ) -> Result<Answer> {
        let started = Instant::now();
        let retrieval = match self.retriever.retrieve(question, k, filter) {
            Ok(result) => result,
            Err(RagError::EmptyIndex) => {
                info!(k, "index is empty, answering without the model");
                return Ok(Answer::no_data_indexed());
            }
            Err(err) => return Err(err),
        };
        let prompt = self.assembler.assemble_default(question, &retrieval);
        let answer = match self.generate(&prompt) {
            Ok(raw) => Answer::from_model_output(&raw, &prompt),
            Err(RagError::GenerationTimeout { timeout }) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "generation timed out after retry"
                );
                Answer::model_unavailable()
            }
            Err(err) => return Err(err),
        };
        info!(
            k,
            hits = retrieval.hits.len(),
            packed = prompt.sources.len(),
            citations = answer.cited_chunk_ids.len(),
            grounded = answer.status == AnswerStatus::Grounded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "answered question"
        );
        Ok(answer)
    }

    /// Retrieval only, as served by the query endpoint.
    pub fn retrieve(
        &self,
        question: &str,
        k: usize,
        filter: Option<&dyn ChunkFilter>,
    ) -> Result<RetrievalResult> {
        self.retriever.retrieve(question, k, filter)
    }

    /// Builds the prompt `answer` would send, without calling the model.
    pub fn assemble_prompt(
        &self,
        question: &str,
        k: usize,
        filter: Option<&dyn ChunkFilter>,
    ) -> Result<Prompt> {
        let retrieval = self.retriever.retrieve(question, k, filter)?;
        Ok(self.assembler.assemble_default(question, &retrieval))
    }

    fn generate(&self, prompt: &Prompt) -> Result<String> {
        let request = GenerationRequest {
            prompt: &prompt.text,
            model: &self.config.model,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };
        let policy = RetryPolicy::immediate(self.config.generation_attempts);
        let (raw, _) = policy.run("generate", || self.generator.generate(&request))?;
        Ok(raw)
    }
}
