//! Local Ollama embedding client (`POST {base}/api/embed`).

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use super::{status_error, transport_error, Embedder};
use crate::config::EmbedderConfig;
use crate::error::{RagError, Result};

/// Blocking client for a local Ollama runtime.
#[derive(Clone)]
pub struct OllamaEmbedder {
    client: Client,
    endpoint: String,
    model: String,
}

impl OllamaEmbedder {
    /// Builds a client from the embedder config.
    pub fn new(config: &EmbedderConfig) -> Result<Self> {
        if config.model.trim().is_empty() {
            return Err(RagError::InvalidConfig("missing embedding model name".into()));
        }
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| RagError::InvalidConfig(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/embed", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
        })
    }
}

impl Embedder for OllamaEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = EmbedRequest {
            model: &self.model,
            input: texts,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .map_err(|err| transport_error("ollama embed", err))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(status_error("ollama embed", status, &body));
        }
        let parsed: EmbedResponse = resp
            .json()
            .map_err(|err| transport_error("ollama embed", err))?;
        Ok(parsed.embeddings)
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}
