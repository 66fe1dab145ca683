//! Citation extraction and validation for generated answers.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::prompt::{Prompt, PromptSource};

/// How an answer came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStatus {
    /// The model answered from the supplied context.
    Grounded,
    /// The context did not contain the answer.
    NotFound,
    /// Nothing has been indexed yet.
    NoDataIndexed,
    /// The generation service timed out.
    ModelUnavailable,
}

/// Final answer returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    /// Answer text with unverifiable citation markers removed.
    pub text: String,
    /// Verified citations in order of first appearance.
    pub cited_chunk_ids: Vec<String>,
    /// Metadata for each verified citation, same order.
    pub citations: Vec<PromptSource>,
    /// Untouched generator output.
    pub raw_model_output: String,
    /// Outcome classification.
    pub status: AnswerStatus,
}

fn citation_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[\^([^\]]+)\]").expect("citation pattern"))
}

fn dangling_space_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[ \t]+([.,;:!?)])|([ \t]){2,}").expect("spacing pattern"))
}

impl Answer {
    /// Validates the model's citations against the prompt's sources.
    ///
    /// Markers naming chunks that were not in the prompt are stripped from the
    /// text; only verified ids are reported.
    pub fn from_model_output(raw: &str, prompt: &Prompt) -> Self {
        let mut cited_chunk_ids: Vec<String> = Vec::new();
        let mut stripped_any = false;
        let text = citation_pattern().replace_all(raw, |caps: &regex::Captures<'_>| {
            let id = caps[1].trim();
            if prompt.source(id).is_some() {
                if !cited_chunk_ids.iter().any(|c| c == id) {
                    cited_chunk_ids.push(id.to_string());
                }
                format!("[^{id}]")
            } else {
                stripped_any = true;
                String::new()
            }
        });
        let mut text = if stripped_any {
            dangling_space_pattern()
                .replace_all(&text, |caps: &regex::Captures<'_>| match caps.get(1) {
                    Some(punct) => punct.as_str().to_string(),
                    None => " ".to_string(),
                })
                .trim()
                .to_string()
        } else {
            text.trim().to_string()
        };

        let says_not_found = text
            .to_lowercase()
            .contains(&prompt.not_found_message.to_lowercase());
        let status = if text.is_empty() || !prompt.has_context() || (says_not_found && cited_chunk_ids.is_empty()) {
            AnswerStatus::NotFound
        } else {
            AnswerStatus::Grounded
        };
        if text.is_empty() {
            text = prompt.not_found_message.clone();
        }

        let citations = cited_chunk_ids
            .iter()
            .filter_map(|id| prompt.source(id).cloned())
            .collect();
        Self {
            text,
            cited_chunk_ids,
            citations,
            raw_model_output: raw.to_string(),
            status,
        }
    }

    /// Answer for an index with no entries; the model is not consulted.
    pub fn no_data_indexed() -> Self {
        Self::without_model(
            "No documents have been indexed yet, so this question cannot be answered.",
            AnswerStatus::NoDataIndexed,
        )
    }

    /// Answer used when generation timed out after its retry.
    pub fn model_unavailable() -> Self {
        Self::without_model(
            "The language model is currently unavailable. Please try again later.",
            AnswerStatus::ModelUnavailable,
        )
    }

    fn without_model(text: &str, status: AnswerStatus) -> Self {
        Self {
            text: text.to_string(),
            cited_chunk_ids: Vec::new(),
            citations: Vec::new(),
            raw_model_output: String::new(),
            status,
        }
    }
}
