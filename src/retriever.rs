//! Query-time retrieval: embed, over-fetch, filter, diversify, truncate.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::NaiveDate;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::config::RetrievalConfig;
use crate::embedder::{embed_checked, Embedder};
use crate::error::{RagError, Result};
use crate::index::{ChunkMetadata, IndexHandle, RetrievedChunk};
use crate::retry::RetryPolicy;

/// Predicate over chunk metadata applied after the similarity search.
pub trait ChunkFilter: Send + Sync {
    /// True when the chunk may be returned.
    fn matches(&self, chunk: &ChunkMetadata) -> bool;
}

impl<F> ChunkFilter for F
where
    F: Fn(&ChunkMetadata) -> bool + Send + Sync,
{
    fn matches(&self, chunk: &ChunkMetadata) -> bool {
        self(chunk)
    }
}

/// Declarative filter over the fixed metadata fields.
///
/// Unset fields match everything. Date bounds are inclusive and exclude
/// chunks whose document has no publication date.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataFilter {
    /// Earliest publication date.
    #[serde(default)]
    pub published_from: Option<NaiveDate>,
    /// Latest publication date.
    #[serde(default)]
    pub published_to: Option<NaiveDate>,
    /// Restrict to these documents.
    #[serde(default)]
    pub document_ids: Option<HashSet<String>>,
    /// Restrict to sources served from this host.
    #[serde(default)]
    pub source_host: Option<String>,
}

impl MetadataFilter {
    /// True when no constraint is set.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

impl ChunkFilter for MetadataFilter {
    fn matches(&self, chunk: &ChunkMetadata) -> bool {
        if self.published_from.is_some() || self.published_to.is_some() {
            let Some(date) = chunk.published_on else {
                return false;
            };
            if self.published_from.is_some_and(|from| date < from) {
                return false;
            }
            if self.published_to.is_some_and(|to| date > to) {
                return false;
            }
        }
        if let Some(ids) = &self.document_ids {
            if !ids.contains(&chunk.document_id) {
                return false;
            }
        }
        if let Some(host) = &self.source_host {
            let chunk_host = Url::parse(&chunk.source_url)
                .ok()
                .and_then(|url| url.host_str().map(str::to_ascii_lowercase));
            if chunk_host.as_deref() != Some(host.to_ascii_lowercase().as_str()) {
                return false;
            }
        }
        true
    }
}

/// Ordered retrieval outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    /// Hits by descending score, ties by ascending chunk id.
    pub hits: Vec<RetrievedChunk>,
    /// The `k` that was asked for.
    pub requested_k: usize,
    /// Candidates pulled from the index before filtering.
    pub candidates_scanned: usize,
}

impl RetrievalResult {
    /// Fewer hits than requested; a valid outcome, not an error.
    pub fn is_insufficient(&self) -> bool {
        self.hits.len() < self.requested_k
    }

    /// No hits at all.
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

/// Embeds queries and searches the live index.
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: IndexHandle,
    config: RetrievalConfig,
    retry: RetryPolicy,
    cache: Option<Mutex<LruCache<String, Vec<f32>>>>,
}

impl Retriever {
    /// Creates a retriever over `index`.
    pub fn new(embedder: Arc<dyn Embedder>, index: IndexHandle, config: RetrievalConfig) -> Self {
        let cache = NonZeroUsize::new(config.query_cache_size).map(|cap| Mutex::new(LruCache::new(cap)));
        Self {
            embedder,
            index,
            config,
            retry: RetryPolicy::default(),
            cache,
        }
    }

    /// Overrides the retry policy for query embeddings.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Handle to the index being searched.
    pub fn index(&self) -> &IndexHandle {
        &self.index
    }

    /// Retrieval settings.
    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Top-`k` chunks for `query` after filtering and diversity.
    pub fn retrieve(
        &self,
        query: &str,
        k: usize,
        filter: Option<&dyn ChunkFilter>,
    ) -> Result<RetrievalResult> {
        let query = query.trim();
        if query.is_empty() {
            return Err(RagError::InvalidConfig("query must not be empty".into()));
        }
        if k == 0 {
            return Err(RagError::InvalidConfig("k must be positive".into()));
        }

        let index = self.index.snapshot();
        if index.is_empty() {
            return Err(RagError::EmptyIndex);
        }
        let vector = self.embed_query(query)?;

        let total = index.len();
        let mut fetch = k
            .saturating_mul(self.config.overfetch_factor.max(1))
            .min(total);
        loop {
            let candidates = index.search(&vector, fetch)?;
            let scanned = candidates.len();
            let hits = self.select(candidates, k, filter);
            if hits.len() >= k || scanned < fetch || fetch >= total {
                debug!(
                    k,
                    hits = hits.len(),
                    candidates = scanned,
                    "retrieval complete"
                );
                return Ok(RetrievalResult {
                    hits,
                    requested_k: k,
                    candidates_scanned: scanned,
                });
            }
            fetch = fetch.saturating_mul(2).min(total);
        }
    }

    fn select(
        &self,
        candidates: Vec<RetrievedChunk>,
        k: usize,
        filter: Option<&dyn ChunkFilter>,
    ) -> Vec<RetrievedChunk> {
        let mut per_document: HashMap<String, usize> = HashMap::new();
        let mut hits = Vec::with_capacity(k);
        for candidate in candidates {
            if hits.len() == k {
                break;
            }
            if self.config.min_score.is_some_and(|min| candidate.score < min) {
                continue;
            }
            if filter.is_some_and(|f| !f.matches(&candidate.metadata)) {
                continue;
            }
            if let Some(cap) = self.config.max_chunks_per_document {
                let seen = per_document
                    .entry(candidate.metadata.document_id.clone())
                    .or_insert(0);
                if *seen >= cap {
                    continue;
                }
                *seen += 1;
            }
            hits.push(candidate);
        }
        hits
    }

    fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        if let Some(cache) = &self.cache {
            let mut guard = cache.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(vector) = guard.get(query) {
                return Ok(vector.clone());
            }
        }
        let (mut vectors, _) = self
            .retry
            .run("embed query", || embed_checked(self.embedder.as_ref(), &[query]))?;
        let vector = vectors
            .pop()
            .ok_or_else(|| RagError::embedding_unavailable("no embedding returned for query"))?;
        if let Some(cache) = &self.cache {
            let mut guard = cache.lock().unwrap_or_else(PoisonError::into_inner);
            guard.put(query.to_string(), vector.clone());
        }
        Ok(vector)
    }
}
