//! Grounded prompt construction with a context token budget.

use chrono::NaiveDate;
use serde::Serialize;
use tracing::debug;

use crate::chunker::estimate_tokens;
use crate::config::PromptConfig;
use crate::index::RetrievedChunk;
use crate::retriever::RetrievalResult;

const PREAMBLE: &str =
    "You are a careful assistant answering questions about official statistical publications.";

/// A chunk that made it into the prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptSource {
    /// Identifier the model cites as `[^chunk_id]`.
    pub chunk_id: String,
    /// Owning document.
    pub document_id: String,
    /// Document title.
    pub title: String,
    /// Document URL.
    pub source_url: String,
    /// Publication date, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_on: Option<NaiveDate>,
    /// Retrieval similarity.
    pub score: f32,
    /// Estimated tokens of the rendered source block.
    pub tokens: usize,
}

/// Prompt text plus the sources it was built from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prompt {
    /// The question as asked.
    pub question: String,
    /// Full text sent to the generator.
    pub text: String,
    /// Packed sources in prompt order.
    pub sources: Vec<PromptSource>,
    /// Estimated tokens used by the source blocks.
    pub used_tokens: usize,
    /// Retrieved chunks left out because of the budget.
    pub dropped_chunks: usize,
    /// Sentence the model was told to use when it cannot answer.
    pub not_found_message: String,
}

impl Prompt {
    /// True when at least one source was packed.
    pub fn has_context(&self) -> bool {
        !self.sources.is_empty()
    }

    /// Looks up a packed source by chunk id.
    pub fn source(&self, chunk_id: &str) -> Option<&PromptSource> {
        self.sources.iter().find(|s| s.chunk_id == chunk_id)
    }
}

/// Packs retrieved chunks into a grounded prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptAssembler {
    config: PromptConfig,
}

impl PromptAssembler {
    /// Creates an assembler.
    pub fn new(config: PromptConfig) -> Self {
        Self { config }
    }

    /// Assembler settings.
    pub fn config(&self) -> &PromptConfig {
        &self.config
    }

    /// Assembles with the configured default budget.
    pub fn assemble_default(&self, query: &str, retrieval: &RetrievalResult) -> Prompt {
        self.assemble(query, retrieval, self.config.max_context_tokens)
    }

    /// Packs hits in order until the next block would exceed `max_context_tokens`.
    pub fn assemble(&self, query: &str, retrieval: &RetrievalResult, max_context_tokens: usize) -> Prompt {
        let question = query.trim();
        let mut blocks = Vec::new();
        let mut sources = Vec::new();
        let mut used_tokens = 0usize;

        for hit in &retrieval.hits {
            let block = render_block(hit);
            let cost = estimate_tokens(&block);
            if used_tokens + cost > max_context_tokens {
                break;
            }
            used_tokens += cost;
            blocks.push(block);
            sources.push(PromptSource {
                chunk_id: hit.metadata.chunk_id.clone(),
                document_id: hit.metadata.document_id.clone(),
                title: hit.metadata.title.clone(),
                source_url: hit.metadata.source_url.clone(),
                published_on: hit.metadata.published_on,
                score: hit.score,
                tokens: cost,
            });
        }
        let dropped_chunks = retrieval.hits.len() - sources.len();
        let not_found = self.config.not_found_message.as_str();

        let mut text = String::new();
        text.push_str(PREAMBLE);
        text.push('\n');
        if blocks.is_empty() {
            text.push_str("No source documents were found for this question.\n");
            text.push_str("Reply with exactly this sentence and nothing else: ");
            text.push_str(not_found);
            text.push_str("\n\nQuestion:\n");
            text.push_str(question);
            text.push('\n');
        } else {
            text.push_str("Answer only from the sources below; do not use outside knowledge.\n");
            text.push_str("Cite each fact with its source identifier in the form [^chunk_id].\n");
            text.push_str("If the sources do not contain the answer, reply exactly: ");
            text.push_str(not_found);
            text.push_str("\n\nSources:\n");
            text.push_str(&blocks.join("\n\n"));
            text.push_str("\n\nQuestion:\n");
            text.push_str(question);
            text.push_str("\n\nAnswer:\n");
        }

        debug!(
            packed = sources.len(),
            dropped = dropped_chunks,
            used_tokens,
            max_context_tokens,
            "assembled prompt"
        );
        Prompt {
            question: question.to_string(),
            text,
            sources,
            used_tokens,
            dropped_chunks,
            not_found_message: self.config.not_found_message.clone(),
        }
    }
}

fn render_block(hit: &RetrievedChunk) -> String {
    let meta = &hit.metadata;
    let origin = match meta.published_on {
        Some(date) => format!("{}, published {}", meta.source_url, date.format("%Y-%m-%d")),
        None => meta.source_url.clone(),
    };
    format!(
        "[^{}] \"{}\" ({})\n{}",
        meta.chunk_id,
        meta.title,
        origin,
        meta.chunk_text.trim()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::ChunkMetadata;
    use pretty_assertions::assert_eq;

    fn hit(id: &str, title: &str, text: &str, score: f32) -> RetrievedChunk {
        RetrievedChunk {
            score,
            metadata: ChunkMetadata {
                chunk_id: id.to_string(),
                document_id: id.split('#').next().unwrap_or(id).to_string(),
                title: title.to_string(),
                source_url: format!("https://mospi.gov.in/{title}"),
                published_on: NaiveDate::from_ymd_opt(2024, 6, 12),
                chunk_text: text.to_string(),
                start_offset: 0,
                end_offset: text.len(),
                token_count: estimate_tokens(text),
            },
        }
    }

    fn result(hits: Vec<RetrievedChunk>) -> RetrievalResult {
        RetrievalResult {
            requested_k: hits.len(),
            candidates_scanned: hits.len(),
            hits,
        }
    }

    #[test]
    fn renders_sources_with_citation_metadata() {
        let prompt = PromptAssembler::default().assemble(
            "What was CPI inflation?",
            &result(vec![hit("cpi#00000000", "CPI", "CPI inflation was 4.8 percent.", 0.9)]),
            100,
        );
        assert!(prompt
            .text
            .contains("[^cpi#00000000] \"CPI\" (https://mospi.gov.in/CPI, published 2024-06-12)\nCPI inflation was 4.8 percent."));
        assert!(prompt.text.contains("Not found in provided documents."));
        assert!(prompt.text.ends_with("Question:\nWhat was CPI inflation?\n\nAnswer:\n"));
        assert_eq!(prompt.sources.len(), 1);
        assert_eq!(prompt.dropped_chunks, 0);
    }

    #[test]
    fn packing_stops_at_first_block_over_budget() {
        let hits = vec![
            hit("a#0", "A", "one two three", 0.9),
            hit("b#0", "B", &"word ".repeat(50), 0.8),
            hit("c#0", "C", "short", 0.7),
        ];
        let first_cost = estimate_tokens(&render_block(&hits[0]));
        let prompt = PromptAssembler::default().assemble("q", &result(hits), first_cost + 10);
        let ids: Vec<&str> = prompt.sources.iter().map(|s| s.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a#0"]);
        assert_eq!(prompt.used_tokens, first_cost);
        assert_eq!(prompt.dropped_chunks, 2);
        assert!(!prompt.text.contains("[^c#0]"));
    }

    #[test]
    fn zero_chunks_instruct_model_to_decline() {
        let prompt = PromptAssembler::default().assemble("Who won?", &result(Vec::new()), 2048);
        assert!(!prompt.has_context());
        assert!(!prompt.text.contains("Sources:"));
        assert!(prompt
            .text
            .contains("Reply with exactly this sentence and nothing else: Not found in provided documents."));
    }

    #[test]
    fn budget_too_small_for_first_chunk_yields_no_context() {
        let prompt = PromptAssembler::default().assemble(
            "q",
            &result(vec![hit("a#0", "A", "some text here", 0.9)]),
            2,
        );
        assert!(!prompt.has_context());
        assert_eq!(prompt.dropped_chunks, 1);
    }
}
