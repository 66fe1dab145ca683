//! OpenAI-compatible chat completions client (`POST {base}/chat/completions`).

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::{status_error, transport_error, GenerationRequest, Generator, SYSTEM_MESSAGE};
use crate::config::GeneratorConfig;
use crate::error::{RagError, Result};

/// Blocking chat completions client for hosted or local OpenAI-style servers.
pub struct OpenAiCompatGenerator {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl OpenAiCompatGenerator {
    /// Builds a client; the API key is sent as a bearer token when present.
    pub fn new(config: &GeneratorConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(key) = config.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
            let auth = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|_| RagError::InvalidConfig("invalid generation API key".into()))?;
            headers.insert(AUTHORIZATION, auth);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| RagError::InvalidConfig(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            timeout: config.timeout,
        })
    }
}

impl Generator for OpenAiCompatGenerator {
    fn generate(&self, request: &GenerationRequest<'_>) -> Result<String> {
        let body = ChatRequest {
            model: request.model,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_MESSAGE,
                },
                ChatMessage {
                    role: "user",
                    content: request.prompt,
                },
            ],
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .map_err(|err| transport_error("chat completions", self.timeout, err))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(status_error("chat completions", self.timeout, status, &text));
        }
        let parsed: ChatResponse = resp
            .json()
            .map_err(|err| transport_error("chat completions", self.timeout, err))?;
        parsed
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .ok_or_else(|| RagError::GenerationFailed {
                reason: "chat completions returned no content".into(),
            })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: usize,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}
