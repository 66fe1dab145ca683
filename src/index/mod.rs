//! In-memory vector index over chunk embeddings.
//!
//! Rows live in one `Vec` (row id = position) with a side map from chunk id to
//! row id. Search is exact unless IVF partitioning is configured and the index
//! is large enough to use it. Ordering is always descending score, then
//! ascending chunk id.

mod handle;
mod ivf;
mod store;

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chunker::Chunk;
use crate::config::{IndexConfig, IvfConfig, Metric};
use crate::document::Document;
use crate::error::{RagError, Result};

pub use handle::IndexHandle;
pub use store::{read_manifest, IndexManifest, LoadOptions, FORMAT_VERSION};

use ivf::IvfPartitions;

/// Schema version of `ChunkMetadata` rows.
pub const METADATA_SCHEMA_VERSION: u32 = 1;

/// Fixed per-chunk metadata stored beside each vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Chunk identifier (unique within the index).
    pub chunk_id: String,
    /// Owning document.
    pub document_id: String,
    /// Document title.
    pub title: String,
    /// Document source URL.
    pub source_url: String,
    /// Publication date of the document, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_on: Option<NaiveDate>,
    /// Chunk text.
    pub chunk_text: String,
    /// Byte offset where the chunk starts in the normalized text.
    pub start_offset: usize,
    /// Byte offset where the chunk ends.
    pub end_offset: usize,
    /// Estimated tokens in `chunk_text`.
    pub token_count: usize,
}

impl ChunkMetadata {
    /// Combines a chunk with its document's citation fields.
    pub fn from_chunk(document: &Document, chunk: &Chunk) -> Self {
        Self {
            chunk_id: chunk.chunk_id.clone(),
            document_id: chunk.document_id.clone(),
            title: document.title.clone(),
            source_url: document.source_url.clone(),
            published_on: document.published_on,
            chunk_text: chunk.text.clone(),
            start_offset: chunk.start_offset,
            end_offset: chunk.end_offset,
            token_count: chunk.token_count,
        }
    }
}

/// Vector plus metadata handed to `build`/`add`.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    /// Embedding of `metadata.chunk_text`.
    pub vector: Vec<f32>,
    /// Metadata; its `chunk_id` keys the entry.
    pub metadata: ChunkMetadata,
}

impl IndexEntry {
    /// Pairs a vector with its metadata.
    pub fn new(vector: Vec<f32>, metadata: ChunkMetadata) -> Self {
        Self { vector, metadata }
    }

    /// Key of the entry.
    pub fn chunk_id(&self) -> &str {
        &self.metadata.chunk_id
    }
}

/// A search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    /// Similarity to the query (higher is closer).
    pub score: f32,
    /// Metadata of the matched chunk.
    pub metadata: ChunkMetadata,
}

impl RetrievedChunk {
    /// Shorthand for `metadata.chunk_id`.
    pub fn chunk_id(&self) -> &str {
        &self.metadata.chunk_id
    }
}

/// Counts from an `add` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddStats {
    /// New rows appended.
    pub inserted: usize,
    /// Existing rows whose vector and metadata were replaced.
    pub replaced: usize,
}

#[derive(Debug, Clone)]
struct Row {
    vector: Vec<f32>,
    metadata: ChunkMetadata,
}

/// Similarity index with stable row ids and a metadata side table.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    config: IndexConfig,
    dimension: Option<usize>,
    embedding_model: Option<String>,
    rows: Vec<Row>,
    by_id: HashMap<String, usize>,
    ivf: Option<IvfPartitions>,
}

impl VectorIndex {
    /// Creates an empty index.
    pub fn new(config: IndexConfig) -> Self {
        Self {
            config,
            dimension: config.dimension,
            embedding_model: None,
            rows: Vec::new(),
            by_id: HashMap::new(),
            ivf: None,
        }
    }

    /// Replaces the contents with `entries`; on error the index is left untouched.
    pub fn build(&mut self, entries: Vec<IndexEntry>) -> Result<()> {
        let mut fresh = Self::new(self.config);
        fresh.embedding_model = self.embedding_model.take();
        let outcome = fresh.add(entries);
        match outcome {
            Ok(_) => {
                *self = fresh;
                Ok(())
            }
            Err(err) => {
                self.embedding_model = fresh.embedding_model;
                Err(err)
            }
        }
    }

    /// Inserts or replaces entries by chunk id.
    ///
    /// The whole batch is validated before any row changes, so a dimension
    /// error leaves the index exactly as it was. Replaced chunks keep their row id.
    pub fn add(&mut self, entries: Vec<IndexEntry>) -> Result<AddStats> {
        let expected = match self.dimension.or_else(|| entries.first().map(|e| e.vector.len())) {
            Some(dim) => dim,
            None => return Ok(AddStats::default()),
        };
        if expected == 0 {
            return Err(RagError::InvalidConfig("embedding vectors must not be empty".into()));
        }
        if let Some(bad) = entries.iter().find(|e| e.vector.len() != expected) {
            return Err(RagError::DimensionMismatch {
                expected,
                actual: bad.vector.len(),
            });
        }
        if let Some(bad) = entries.iter().find(|e| e.chunk_id().is_empty()) {
            return Err(RagError::InvalidConfig(format!(
                "entry for document {} has an empty chunk id",
                bad.metadata.document_id
            )));
        }

        self.dimension = Some(expected);
        let mut stats = AddStats::default();
        for entry in entries {
            let vector = match self.config.metric {
                Metric::Cosine => l2_normalized(entry.vector),
                Metric::InnerProduct => entry.vector,
            };
            let row = Row {
                vector,
                metadata: entry.metadata,
            };
            match self.by_id.get(&row.metadata.chunk_id) {
                Some(&row_id) => {
                    self.rows[row_id] = row;
                    stats.replaced += 1;
                }
                None => {
                    self.by_id
                        .insert(row.metadata.chunk_id.clone(), self.rows.len());
                    self.rows.push(row);
                    stats.inserted += 1;
                }
            }
        }
        self.refresh_partitions();
        Ok(stats)
    }

    /// Drops every row owned by one of `document_ids` and returns how many went.
    ///
    /// Remaining rows keep their relative order; row ids are compacted.
    pub fn remove_documents(&mut self, document_ids: &HashSet<String>) -> usize {
        let before = self.rows.len();
        self.rows
            .retain(|row| !document_ids.contains(&row.metadata.document_id));
        let removed = before - self.rows.len();
        if removed > 0 {
            self.by_id = self
                .rows
                .iter()
                .enumerate()
                .map(|(row_id, row)| (row.metadata.chunk_id.clone(), row_id))
                .collect();
            self.refresh_partitions();
        }
        removed
    }

    /// Top-`k` rows by similarity to `query`.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<RetrievedChunk>> {
        if self.rows.is_empty() {
            return Err(RagError::EmptyIndex);
        }
        let dimension = self.dimension.unwrap_or(query.len());
        if query.len() != dimension {
            return Err(RagError::DimensionMismatch {
                expected: dimension,
                actual: query.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let query = match self.config.metric {
            Metric::Cosine => l2_normalized(query.to_vec()),
            Metric::InnerProduct => query.to_vec(),
        };

        let mut scored: Vec<(usize, f32)> = match self.probe_rows(&query) {
            Some(candidates) => candidates
                .into_iter()
                .map(|row_id| (row_id, dot(&self.rows[row_id].vector, &query)))
                .collect(),
            None => self
                .rows
                .iter()
                .enumerate()
                .map(|(row_id, row)| (row_id, dot(&row.vector, &query)))
                .collect(),
        };

        let cmp = |a: &(usize, f32), b: &(usize, f32)| self.rank_order(a, b);
        if scored.len() > k {
            scored.select_nth_unstable_by(k - 1, cmp);
            scored.truncate(k);
        }
        scored.sort_by(cmp);

        Ok(scored
            .into_iter()
            .map(|(row_id, score)| RetrievedChunk {
                score,
                metadata: self.rows[row_id].metadata.clone(),
            })
            .collect())
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when no rows are stored.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Vector dimension, once known.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Similarity metric.
    pub fn metric(&self) -> Metric {
        self.config.metric
    }

    /// Index configuration.
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Embedding model recorded for the stored vectors.
    pub fn embedding_model(&self) -> Option<&str> {
        self.embedding_model.as_deref()
    }

    /// Records which embedding model produced the vectors.
    pub fn set_embedding_model(&mut self, model: impl Into<String>) {
        self.embedding_model = Some(model.into());
    }

    /// Metadata for `chunk_id`.
    pub fn entry(&self, chunk_id: &str) -> Option<&ChunkMetadata> {
        self.by_id.get(chunk_id).map(|&row| &self.rows[row].metadata)
    }

    /// Row id for `chunk_id`.
    pub fn row_id(&self, chunk_id: &str) -> Option<usize> {
        self.by_id.get(chunk_id).copied()
    }

    /// Stored (possibly normalised) vector for `chunk_id`.
    pub fn vector(&self, chunk_id: &str) -> Option<&[f32]> {
        self.by_id
            .get(chunk_id)
            .map(|&row| self.rows[row].vector.as_slice())
    }

    /// Metadata in row order.
    pub fn metadata(&self) -> impl Iterator<Item = &ChunkMetadata> {
        self.rows.iter().map(|row| &row.metadata)
    }

    /// True when searches go through IVF partitions.
    pub fn is_partitioned(&self) -> bool {
        self.ivf.is_some()
    }

    fn rank_order(&self, a: &(usize, f32), b: &(usize, f32)) -> Ordering {
        b.1.total_cmp(&a.1).then_with(|| {
            self.rows[a.0]
                .metadata
                .chunk_id
                .cmp(&self.rows[b.0].metadata.chunk_id)
        })
    }

    fn probe_rows(&self, query: &[f32]) -> Option<Vec<usize>> {
        let ivf = self.ivf.as_ref()?;
        let probes = self.config.ivf.map(|c| c.probes).unwrap_or(0);
        if probes >= ivf.list_count() {
            return None;
        }
        Some(ivf.candidates(query, probes.max(1)))
    }

    fn refresh_partitions(&mut self) {
        self.ivf = match self.config.ivf {
            Some(IvfConfig { lists, .. }) if lists > 0 && self.rows.len() >= lists * 4 => {
                let vectors: Vec<&[f32]> = self.rows.iter().map(|r| r.vector.as_slice()).collect();
                let partitions = IvfPartitions::train(&vectors, lists);
                debug!(rows = self.rows.len(), lists, "trained ivf partitions");
                Some(partitions)
            }
            _ => None,
        };
    }

    fn from_parts(
        config: IndexConfig,
        dimension: Option<usize>,
        embedding_model: Option<String>,
        rows: Vec<(Vec<f32>, ChunkMetadata)>,
    ) -> Result<Self> {
        let mut by_id = HashMap::with_capacity(rows.len());
        let mut stored = Vec::with_capacity(rows.len());
        for (row_id, (vector, metadata)) in rows.into_iter().enumerate() {
            if by_id.insert(metadata.chunk_id.clone(), row_id).is_some() {
                return Err(RagError::IndexFormat(format!(
                    "duplicate chunk id {} in side table",
                    metadata.chunk_id
                )));
            }
            stored.push(Row { vector, metadata });
        }
        let mut index = Self {
            config,
            dimension,
            embedding_model,
            rows: stored,
            by_id,
            ivf: None,
        };
        index.refresh_partitions();
        Ok(index)
    }

    fn raw_rows(&self) -> impl Iterator<Item = (&[f32], &ChunkMetadata)> {
        self.rows
            .iter()
            .map(|row| (row.vector.as_slice(), &row.metadata))
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Unit-length copy of `vector`; zero vectors are returned unchanged.
pub fn l2_normalized(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}
