//! Language-model clients used for answer synthesis.

pub mod ollama;
pub mod openai;

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;

use crate::config::{GeneratorBackend, GeneratorConfig};
use crate::error::{RagError, Result};

pub use ollama::OllamaGenerator;
pub use openai::OpenAiCompatGenerator;

/// System message sent by chat backends alongside the prompt.
pub const SYSTEM_MESSAGE: &str = "You answer questions using only the provided source excerpts. \
Cite sources as [^chunk_id] and never invent references.";

/// Request envelope shared by the generator backends.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    /// Full prompt text.
    pub prompt: &'a str,
    /// Model name.
    pub model: &'a str,
    /// Sampling temperature.
    pub temperature: f32,
    /// Maximum tokens to generate.
    pub max_tokens: usize,
}

/// Turns a prompt into text.
///
/// Implementations fail with `GenerationTimeout` when the configured timeout
/// elapses and `GenerationFailed` for everything else.
pub trait Generator: Send + Sync {
    /// Generates a completion for `request`.
    fn generate(&self, request: &GenerationRequest<'_>) -> Result<String>;
}

/// Builds the configured backend.
pub fn from_config(config: &GeneratorConfig) -> Result<Arc<dyn Generator>> {
    Ok(match config.backend {
        GeneratorBackend::Ollama => Arc::new(OllamaGenerator::new(config)?),
        GeneratorBackend::OpenAi => Arc::new(OpenAiCompatGenerator::new(config)?),
    })
}

pub(crate) fn transport_error(service: &str, timeout: Duration, err: reqwest::Error) -> RagError {
    if err.is_timeout() {
        RagError::GenerationTimeout { timeout }
    } else {
        RagError::GenerationFailed {
            reason: format!("{service} request failed: {err}"),
        }
    }
}

pub(crate) fn status_error(service: &str, timeout: Duration, status: StatusCode, body: &str) -> RagError {
    if status == StatusCode::GATEWAY_TIMEOUT || status == StatusCode::REQUEST_TIMEOUT {
        RagError::GenerationTimeout { timeout }
    } else {
        RagError::GenerationFailed {
            reason: format!("{service} returned {status}: {body}"),
        }
    }
}
