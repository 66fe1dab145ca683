//! Local Ollama chat client (`POST {base}/api/chat`, non-streaming).

use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use super::{status_error, transport_error, GenerationRequest, Generator, SYSTEM_MESSAGE};
use crate::config::GeneratorConfig;
use crate::error::{RagError, Result};

/// Blocking client for a local Ollama runtime.
pub struct OllamaGenerator {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl OllamaGenerator {
    /// Builds a client with the configured timeout.
    pub fn new(config: &GeneratorConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| RagError::InvalidConfig(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/chat", config.base_url.trim_end_matches('/')),
            timeout: config.timeout,
        })
    }
}

impl Generator for OllamaGenerator {
    fn generate(&self, request: &GenerationRequest<'_>) -> Result<String> {
        let body = ChatRequest {
            model: request.model,
            stream: false,
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
            options: ChatOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .map_err(|err| transport_error("ollama chat", self.timeout, err))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(status_error("ollama chat", self.timeout, status, &text));
        }
        let parsed: ChatResponse = resp
            .json()
            .map_err(|err| transport_error("ollama chat", self.timeout, err))?;
        Ok(parsed.message.content)
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    stream: bool,
    messages: Vec<ChatMessage<'a>>,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
    num_predict: usize,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_disables_streaming_and_sets_options() {
        let body = ChatRequest {
            model: "llama3",
            stream: false,
            messages: vec![ChatMessage {
                role: "user",
                content: "hi",
            }],
            options: ChatOptions {
                temperature: 0.5,
                num_predict: 64,
            },
        };
        assert_eq!(
            serde_json::to_value(&body).expect("serialises"),
            json!({
                "model": "llama3",
                "stream": false,
                "messages": [{"role": "user", "content": "hi"}],
                "options": {"temperature": 0.5, "num_predict": 64}
            })
        );
    }

    #[test]
    fn parses_chat_reply() {
        let parsed: ChatResponse = serde_json::from_str(
            r#"{"model":"llama3","message":{"role":"assistant","content":"4.8 percent [^cpi#00000000]"},"done":true}"#,
        )
        .expect("parses");
        assert_eq!(parsed.message.content, "4.8 percent [^cpi#00000000]");
    }
}
