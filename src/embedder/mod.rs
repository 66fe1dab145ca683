//! Embedding service clients.
//!
//! Every backend is a blocking `reqwest` client with a request timeout. Clients
//! make exactly one request per call and report transient failures as
//! `EmbeddingUnavailable`; callers decide how often to retry via `RetryPolicy`.

pub mod ollama;
pub mod openai;

use std::sync::Arc;

use reqwest::StatusCode;

use crate::config::{EmbedderBackend, EmbedderConfig};
use crate::error::{RagError, Result};
use crate::retry::RetryPolicy;

pub use ollama::OllamaEmbedder;
pub use openai::OpenAiEmbedder;

/// Maps texts to fixed-dimension dense vectors.
pub trait Embedder: Send + Sync {
    /// Identifier of the model, recorded in index manifests.
    fn model_id(&self) -> &str;

    /// Embeds `texts`, returning one vector per input in the same order.
    fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;
}

/// Builds the configured backend.
pub fn from_config(config: &EmbedderConfig) -> Result<Arc<dyn Embedder>> {
    Ok(match config.backend {
        EmbedderBackend::Ollama => Arc::new(OllamaEmbedder::new(config)?),
        EmbedderBackend::OpenAi => Arc::new(OpenAiEmbedder::new(config)?),
    })
}

/// Embeds one short text to learn the dimension `embedder` produces.
pub fn measure_dimension(embedder: &dyn Embedder, retry: &RetryPolicy) -> Result<usize> {
    let (vectors, _) = retry.run("measure embedding dimension", || {
        embed_checked(embedder, &["dimension check"])
    })?;
    match vectors.first() {
        Some(vector) if !vector.is_empty() => Ok(vector.len()),
        _ => Err(RagError::embedding_unavailable(
            "service returned an empty embedding",
        )),
    }
}

/// Calls the embedder and checks count and dimension consistency of the reply.
pub fn embed_checked(embedder: &dyn Embedder, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }
    let vectors = embedder.embed(texts)?;
    if vectors.len() != texts.len() {
        return Err(RagError::embedding_unavailable(format!(
            "service returned {} embeddings for {} inputs",
            vectors.len(),
            texts.len()
        )));
    }
    if let Some(first) = vectors.first() {
        let expected = first.len();
        if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
            return Err(RagError::DimensionMismatch {
                expected,
                actual: bad.len(),
            });
        }
    }
    Ok(vectors)
}

pub(crate) fn transport_error(service: &str, err: reqwest::Error) -> RagError {
    if err.is_timeout() {
        RagError::embedding_unavailable(format!("{service} request timed out: {err}"))
    } else {
        RagError::embedding_unavailable(format!("{service} request failed: {err}"))
    }
}

pub(crate) fn status_error(service: &str, status: StatusCode, body: &str) -> RagError {
    if should_retry(status) {
        RagError::embedding_unavailable(format!("{service} responded {status}: {body}"))
    } else {
        RagError::InvalidConfig(format!("{service} rejected embedding request ({status}): {body}"))
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}
