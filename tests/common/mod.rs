//! Deterministic stand-ins for the embedding and generation services.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use statrag::config::{ChunkingConfig, ChunkingStrategyKind};
use statrag::{Document, Embedder, GenerationRequest, Generator, RagError, Result};

/// Phrases that each own one axis of the stub embedding space.
pub const KEYWORDS: [&str; 6] = [
    "base year",
    "unemployment",
    "labour",
    "inflation",
    "gdp",
    "population",
];

/// One axis per keyword plus a small shared bias axis so no vector is zero.
pub struct KeywordEmbedder {
    pub calls: AtomicUsize,
}

impl KeywordEmbedder {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    pub fn vector(text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        let mut vector: Vec<f32> = KEYWORDS
            .iter()
            .map(|kw| if lower.contains(kw) { 1.0 } else { 0.0 })
            .collect();
        vector.push(0.1);
        vector
    }
}

impl Embedder for KeywordEmbedder {
    fn model_id(&self) -> &str {
        "keyword-stub"
    }

    fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

/// Fails the first `failures` calls with `EmbeddingUnavailable`.
pub struct FlakyEmbedder {
    pub failures: usize,
    pub calls: AtomicUsize,
}

impl FlakyEmbedder {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }
}

impl Embedder for FlakyEmbedder {
    fn model_id(&self) -> &str {
        "flaky-stub"
    }

    fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(RagError::EmbeddingUnavailable {
                reason: format!("stub outage on call {call}"),
            });
        }
        Ok(texts.iter().map(|t| KeywordEmbedder::vector(t)).collect())
    }
}

/// Times out `timeouts` times, then cites the first source in the prompt
/// along with one invented chunk id.
pub struct CitingGenerator {
    pub timeouts: usize,
    pub calls: AtomicUsize,
    pub prompts: Mutex<Vec<String>>,
}

pub const INVENTED_CHUNK: &str = "invented#00000000";

impl CitingGenerator {
    pub fn new(timeouts: usize) -> Self {
        Self {
            timeouts,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Generator for CitingGenerator {
    fn generate(&self, request: &GenerationRequest<'_>) -> Result<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .expect("prompt log")
            .push(request.prompt.to_string());
        if call < self.timeouts {
            return Err(RagError::GenerationTimeout {
                timeout: Duration::from_millis(5),
            });
        }
        let first_source = request
            .prompt
            .split_once("Sources:")
            .and_then(|(_, rest)| rest.split_once("[^"))
            .and_then(|(_, rest)| rest.split_once(']'))
            .map(|(id, _)| id.to_string());
        Ok(match first_source {
            Some(id) => format!("The answer is in the context [^{id}] and elsewhere [^{INVENTED_CHUNK}]."),
            None => "Not found in provided documents.".to_string(),
        })
    }
}

/// Paragraph chunking sized so every corpus document yields two chunks.
pub fn two_paragraph_chunking() -> ChunkingConfig {
    ChunkingConfig {
        strategy: ChunkingStrategyKind::Paragraph,
        chunk_size: 80,
        overlap: 0,
        min_chunk_size: 0,
        include_tables: false,
    }
}

fn document(id: &str, title: &str, first: &str, second: &str) -> Document {
    Document {
        id: id.to_string(),
        source_url: format!("https://stats.example.gov/{id}"),
        title: title.to_string(),
        published_on: None,
        retrieved_at: None,
        raw_text: format!("{first}\n\n{second}"),
        tables: Vec::new(),
    }
}

/// Three documents, two paragraphs each; only `doc-2`'s first paragraph
/// mentions the base year.
pub fn corpus() -> Vec<Document> {
    vec![
        document(
            "doc-1",
            "Periodic Labour Force Survey",
            "Unemployment in urban areas fell to 6.6 percent last quarter.",
            "Labour force participation rose among women in rural districts.",
        ),
        document(
            "doc-2",
            "Consumer Price Index Revision",
            "The base year for the revised consumer price index is 2012.",
            "Inflation in food items eased to 4.1 percent during the month.",
        ),
        document(
            "doc-3",
            "National Accounts Statistics",
            "GDP grew by 7.2 percent in the fiscal year ending March.",
            "Population estimates are projected from the decennial census.",
        ),
    ]
}
