//! Splits normalized document text into overlapping, addressable passages.
//!
//! Strategies only decide span boundaries (byte ranges on char boundaries);
//! `Chunker` turns spans into `Chunk`s, folds short tails, and assigns ids.
//! Sizes are measured in characters, offsets in bytes of the normalized text.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::config::{ChunkingConfig, ChunkingStrategyKind};
use crate::document::Document;
use crate::error::Result;

/// Passage of a document used as the unit of retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// `"{document_id}#{start_offset:08}"`.
    pub chunk_id: String,
    /// Owning document.
    pub document_id: String,
    /// Text of `start_offset..end_offset`.
    pub text: String,
    /// Inclusive byte offset within the normalized text.
    pub start_offset: usize,
    /// Exclusive byte offset within the normalized text.
    pub end_offset: usize,
    /// Estimated tokens (same estimator as the prompt budget).
    pub token_count: usize,
}

/// Deterministic identifier for a chunk starting at `start_offset`.
pub fn chunk_id(document_id: &str, start_offset: usize) -> String {
    format!("{document_id}#{start_offset:08}")
}

/// Rough token estimate (whitespace word count heuristic).
pub fn estimate_tokens(text: &str) -> usize {
    let tokens = text.split_whitespace().count();
    tokens.max(1)
}

/// Decides where chunk boundaries fall.
///
/// Returned ranges must start at 0, end at `text.len()`, be sorted, and each
/// start no later than the previous end.
pub trait ChunkingStrategy: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Byte ranges of the chunks for `text`.
    fn spans(&self, text: &str) -> Vec<Range<usize>>;
}

/// Character windows snapped back to whitespace where possible.
#[derive(Debug, Clone, Copy)]
pub struct FixedSizeChunker {
    chunk_size: usize,
    overlap: usize,
}

impl FixedSizeChunker {
    /// Builds a fixed-window strategy; sizes are in characters.
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            overlap: overlap.min(chunk_size - 1),
        }
    }
}

impl ChunkingStrategy for FixedSizeChunker {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn spans(&self, text: &str) -> Vec<Range<usize>> {
        window_spans(text, 0, self.chunk_size, self.overlap)
    }
}

/// Packs blank-line separated paragraphs up to the size limit.
#[derive(Debug, Clone, Copy)]
pub struct ParagraphChunker {
    chunk_size: usize,
    overlap: usize,
}

impl ParagraphChunker {
    /// Builds a paragraph-packing strategy; sizes are in characters.
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            overlap: overlap.min(chunk_size - 1),
        }
    }
}

#[derive(Debug, Clone)]
struct Unit {
    range: Range<usize>,
    chars: usize,
}

impl ChunkingStrategy for ParagraphChunker {
    fn name(&self) -> &'static str {
        "paragraph"
    }

    fn spans(&self, text: &str) -> Vec<Range<usize>> {
        if text.is_empty() {
            return Vec::new();
        }

        let mut units = Vec::new();
        for para in paragraph_ranges(text) {
            let chars = text[para.clone()].chars().count();
            if chars <= self.chunk_size {
                units.push(Unit { range: para, chars });
                continue;
            }
            // Oversized paragraphs become fixed windows that tile the paragraph.
            for window in window_spans(&text[para.clone()], para.start, self.chunk_size, 0) {
                let chars = text[window.clone()].chars().count();
                units.push(Unit {
                    range: window,
                    chars,
                });
            }
        }

        let mut spans = Vec::new();
        let mut buffer: Vec<usize> = Vec::new();
        let mut total = 0usize;

        for (idx, unit) in units.iter().enumerate() {
            if !buffer.is_empty() && total + unit.chars > self.chunk_size {
                flush_span(&mut spans, &buffer, &units);
                buffer = retain_overlap(&buffer, &units, self.overlap);
                total = buffer.iter().map(|&i| units[i].chars).sum();
                while !buffer.is_empty() && total + unit.chars > self.chunk_size {
                    let dropped = buffer.remove(0);
                    total -= units[dropped].chars;
                }
            }
            buffer.push(idx);
            total += unit.chars;
        }
        flush_span(&mut spans, &buffer, &units);
        spans
    }
}

fn flush_span(spans: &mut Vec<Range<usize>>, buffer: &[usize], units: &[Unit]) {
    let (Some(&first), Some(&last)) = (buffer.first(), buffer.last()) else {
        return;
    };
    spans.push(units[first].range.start..units[last].range.end);
}

/// Trailing units totalling at least `overlap` characters, never the whole buffer.
fn retain_overlap(buffer: &[usize], units: &[Unit], overlap: usize) -> Vec<usize> {
    if overlap == 0 || buffer.len() < 2 {
        return Vec::new();
    }
    let mut retained = Vec::new();
    let mut chars = 0usize;
    for &idx in buffer[1..].iter().rev() {
        retained.push(idx);
        chars += units[idx].chars;
        if chars >= overlap {
            break;
        }
    }
    retained.reverse();
    retained
}

/// Paragraph ranges tiling `text`; each paragraph owns its trailing separator.
fn paragraph_ranges(text: &str) -> Vec<Range<usize>> {
    let bytes = text.as_bytes();
    let mut ranges = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] != b'\n' {
            i += 1;
            continue;
        }
        let mut j = i + 1;
        while j < bytes.len() && matches!(bytes[j], b' ' | b'\t' | b'\r') {
            j += 1;
        }
        if j < bytes.len() && bytes[j] == b'\n' {
            while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                j += 1;
            }
            ranges.push(start..j);
            start = j;
            i = j;
        } else {
            i += 1;
        }
    }
    if start < bytes.len() {
        ranges.push(start..bytes.len());
    }
    ranges
}

/// Fixed character windows over `text`, offset by `base` bytes.
fn window_spans(text: &str, base: usize, chunk_size: usize, overlap: usize) -> Vec<Range<usize>> {
    if text.is_empty() {
        return Vec::new();
    }
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let n = chars.len();
    let byte_at = |idx: usize| if idx >= n { text.len() } else { chars[idx].0 };

    let mut spans = Vec::new();
    let mut start = 0usize;
    loop {
        let mut end = (start + chunk_size).min(n);
        if end < n {
            let floor = start + chunk_size / 2;
            if let Some(ws) = (floor..end).rev().find(|&j| chars[j].1.is_whitespace()) {
                end = ws + 1;
            }
        }
        spans.push(base + byte_at(start)..base + byte_at(end));
        if end >= n {
            break;
        }
        start = end.saturating_sub(overlap).max(start + 1);
    }
    spans
}

/// Folds a trailing span whose new content is shorter than `min_chars` into its predecessor.
fn fold_short_tail(text: &str, mut spans: Vec<Range<usize>>, min_chars: usize) -> Vec<Range<usize>> {
    if spans.len() < 2 || min_chars == 0 {
        return spans;
    }
    let last = spans.len() - 1;
    let fresh_from = spans[last - 1].end.max(spans[last].start);
    let fresh = text[fresh_from..spans[last].end].chars().count();
    if fresh < min_chars {
        let end = spans[last].end;
        spans.pop();
        spans[last - 1].end = end;
    }
    spans
}

/// Splits documents into chunks with a pluggable boundary strategy.
pub struct Chunker {
    config: ChunkingConfig,
    strategy: Box<dyn ChunkingStrategy>,
}

impl Chunker {
    /// Validates the config and picks the configured strategy.
    pub fn new(config: ChunkingConfig) -> Result<Self> {
        config.validate()?;
        let strategy: Box<dyn ChunkingStrategy> = match config.strategy {
            ChunkingStrategyKind::Fixed => {
                Box::new(FixedSizeChunker::new(config.chunk_size, config.overlap))
            }
            ChunkingStrategyKind::Paragraph => {
                Box::new(ParagraphChunker::new(config.chunk_size, config.overlap))
            }
        };
        Ok(Self { config, strategy })
    }

    /// Uses a caller-supplied strategy with the config's size limits.
    pub fn with_strategy(config: ChunkingConfig, strategy: Box<dyn ChunkingStrategy>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, strategy })
    }

    /// Active configuration.
    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Name of the active strategy.
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Chunks a document's normalized text.
    pub fn chunk(&self, document: &Document) -> Vec<Chunk> {
        let text = document.normalized_text(self.config.include_tables);
        self.chunk_text(&document.id, &text)
    }

    /// Chunks raw text on behalf of `document_id`. Blank text yields no chunks.
    pub fn chunk_text(&self, document_id: &str, text: &str) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        let spans = fold_short_tail(text, self.strategy.spans(text), self.config.min_chunk_size);
        spans
            .into_iter()
            .filter(|span| span.start < span.end)
            .map(|span| {
                let body = &text[span.clone()];
                Chunk {
                    chunk_id: chunk_id(document_id, span.start),
                    document_id: document_id.to_string(),
                    text: body.to_string(),
                    start_offset: span.start,
                    end_offset: span.end,
                    token_count: estimate_tokens(body),
                }
            })
            .collect()
    }
}

/// Rebuilds the source text from ordered chunks, dropping overlapped prefixes.
///
/// Returns `None` when the chunks leave a gap or do not start at offset 0.
pub fn reconstruct(chunks: &[Chunk]) -> Option<String> {
    let mut out = String::new();
    let mut covered = 0usize;
    for chunk in chunks {
        if chunk.start_offset > covered || chunk.end_offset < covered {
            return None;
        }
        let skip = covered - chunk.start_offset;
        out.push_str(chunk.text.get(skip..)?);
        covered = chunk.end_offset;
    }
    Some(out)
}
