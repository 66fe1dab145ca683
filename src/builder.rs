//! Batch index construction: chunk, embed on a bounded worker pool, index.
//!
//! Documents are chunked on the calling thread and chunk batches are sent to
//! `workers` embedding threads over bounded `crossbeam-channel` queues. Results
//! come back in any order and are re-sequenced by batch id, so row order in the
//! finished index only depends on the input order.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::chunker::Chunker;
use crate::config::{EmbedderConfig, IndexConfig};
use crate::document::Document;
use crate::embedder::{embed_checked, Embedder};
use crate::error::{RagError, Result};
use crate::index::{ChunkMetadata, IndexEntry, VectorIndex};
use crate::retry::RetryPolicy;

/// Knobs for one build.
#[derive(Debug, Clone, Copy)]
pub struct BuildConfig {
    /// Chunks per embedding request.
    pub batch_size: usize,
    /// Concurrent embedding workers.
    pub workers: usize,
    /// Retry policy applied to each batch.
    pub retry: RetryPolicy,
    /// Configuration of the index being built.
    pub index: IndexConfig,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self::from_embedder(&EmbedderConfig::default(), IndexConfig::default())
    }
}

impl BuildConfig {
    /// Takes batching, concurrency and retries from the embedder settings.
    pub fn from_embedder(embedder: &EmbedderConfig, index: IndexConfig) -> Self {
        Self {
            batch_size: embedder.batch_size,
            workers: embedder.workers,
            retry: embedder.retry,
            index,
        }
    }
}

/// Document that was not indexed, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedDocument {
    /// Document id, or a positional label when the record had none.
    pub document_id: String,
    /// Why it was skipped.
    pub reason: String,
}

/// Counts describing what a build did, including partial progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildReport {
    /// Records read from the input.
    pub documents_seen: usize,
    /// Documents that produced at least one chunk.
    pub documents_processed: usize,
    /// Chunks whose embeddings came back.
    pub chunks_embedded: usize,
    /// Documents skipped with reasons.
    pub skipped: Vec<SkippedDocument>,
    /// Embedding batches dispatched.
    pub batches: usize,
    /// Retries spent across all batches.
    pub retries: usize,
    /// Wall-clock duration.
    pub elapsed_ms: u64,
}

/// Finished index plus its report.
#[derive(Debug)]
pub struct BuildOutput {
    /// The new index, ready to save or swap in.
    pub index: VectorIndex,
    /// What happened.
    pub report: BuildReport,
}

/// Builds vector indexes from documents.
pub struct IndexBuilder {
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    config: BuildConfig,
}

struct EmbeddingTask {
    id: usize,
    texts: Vec<String>,
}

struct EmbeddedBatch {
    id: usize,
    vectors: Vec<Vec<f32>>,
    retries: usize,
}

type EmbeddingResult = std::result::Result<EmbeddedBatch, (usize, RagError)>;

impl IndexBuilder {
    /// Creates a builder; rejects a zero batch size.
    pub fn new(chunker: Chunker, embedder: Arc<dyn Embedder>, config: BuildConfig) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(RagError::InvalidConfig("batch_size must be positive".into()));
        }
        Ok(Self {
            chunker,
            embedder,
            config,
        })
    }

    /// Builds a fresh index from `documents`.
    pub fn build<I>(&self, documents: I) -> Result<BuildOutput>
    where
        I: IntoIterator<Item = Result<Document>>,
    {
        self.build_onto(VectorIndex::new(self.config.index), documents)
    }

    /// Adds `documents` to `base`.
    ///
    /// Every document that produces chunks replaces all of its previous rows,
    /// so chunks from an older, longer version do not survive.
    pub fn build_onto<I>(&self, base: VectorIndex, documents: I) -> Result<BuildOutput>
    where
        I: IntoIterator<Item = Result<Document>>,
    {
        let started = Instant::now();
        let workers = self.config.workers.max(1);
        let max_inflight = workers * 2;
        info!(
            strategy = self.chunker.strategy_name(),
            batch_size = self.config.batch_size,
            workers,
            model = self.embedder.model_id(),
            "starting index build"
        );

        let (task_tx, task_rx) = bounded::<EmbeddingTask>(max_inflight);
        let (result_tx, result_rx) = bounded::<EmbeddingResult>(max_inflight);
        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let embedder = Arc::clone(&self.embedder);
            let retry = self.config.retry;
            let rx = task_rx.clone();
            let tx = result_tx.clone();
            handles.push(thread::spawn(move || {
                worker_loop(worker_id, rx, tx, embedder, retry)
            }));
        }
        drop(task_rx);
        drop(result_tx);

        let mut run = BuildRun {
            report: BuildReport::default(),
            pending: Vec::with_capacity(self.config.batch_size),
            queued: Vec::new(),
            out_of_order: BTreeMap::new(),
            entries: Vec::new(),
            rebuilt: HashSet::new(),
            next_batch_id: 0,
            next_result_id: 0,
            inflight: 0,
            max_inflight,
        };

        let outcome = self.feed(&mut run, documents, &task_tx, &result_rx);
        drop(task_tx);
        let outcome = outcome.and_then(|_| {
            while run.inflight > 0 {
                run.receive(&result_rx)?;
            }
            Ok(())
        });
        shutdown(result_rx, handles);
        run.report.elapsed_ms = started.elapsed().as_millis() as u64;

        if let Err(err) = outcome {
            warn!(
                error = %err,
                chunks_embedded = run.report.chunks_embedded,
                documents_processed = run.report.documents_processed,
                "index build aborted"
            );
            return Err(RagError::BuildAborted {
                report: Box::new(run.report),
                source: Box::new(err),
            });
        }

        let mut index = base;
        index.set_embedding_model(self.embedder.model_id());
        let removed = index.remove_documents(&run.rebuilt);
        if removed > 0 {
            debug!(rows = removed, documents = run.rebuilt.len(), "dropped rows of re-indexed documents");
        }
        if let Err(err) = index.add(std::mem::take(&mut run.entries)) {
            return Err(RagError::BuildAborted {
                report: Box::new(run.report),
                source: Box::new(err),
            });
        }

        let report = run.report;
        info!(
            documents_seen = report.documents_seen,
            documents_processed = report.documents_processed,
            skipped = report.skipped.len(),
            chunks = report.chunks_embedded,
            batches = report.batches,
            retries = report.retries,
            elapsed_ms = report.elapsed_ms,
            "index build complete"
        );
        Ok(BuildOutput { index, report })
    }

    fn feed<I>(
        &self,
        run: &mut BuildRun,
        documents: I,
        tasks: &Sender<EmbeddingTask>,
        results: &Receiver<EmbeddingResult>,
    ) -> Result<()>
    where
        I: IntoIterator<Item = Result<Document>>,
    {
        for document in documents {
            run.report.documents_seen += 1;
            let document = match document {
                Ok(document) => document,
                Err(RagError::MalformedDocument {
                    document_id,
                    reason,
                }) => {
                    warn!(document_id = %document_id, reason = %reason, "skipping malformed document");
                    run.report.skipped.push(SkippedDocument {
                        document_id,
                        reason,
                    });
                    continue;
                }
                Err(err) => return Err(err),
            };

            let chunks = self.chunker.chunk(&document);
            if chunks.is_empty() {
                warn!(document_id = %document.id, "skipping document without text");
                run.report.skipped.push(SkippedDocument {
                    document_id: document.id.clone(),
                    reason: "no text to chunk".to_string(),
                });
                continue;
            }
            debug!(document_id = %document.id, chunks = chunks.len(), "chunked document");
            run.report.documents_processed += 1;
            run.rebuilt.insert(document.id.clone());
            for chunk in &chunks {
                run.pending.push(ChunkMetadata::from_chunk(&document, chunk));
                if run.pending.len() >= self.config.batch_size {
                    run.dispatch(tasks, results)?;
                }
            }
        }
        run.dispatch(tasks, results)
    }
}

struct BuildRun {
    report: BuildReport,
    pending: Vec<ChunkMetadata>,
    queued: Vec<Vec<ChunkMetadata>>,
    out_of_order: BTreeMap<usize, EmbeddedBatch>,
    entries: Vec<IndexEntry>,
    rebuilt: HashSet<String>,
    next_batch_id: usize,
    next_result_id: usize,
    inflight: usize,
    max_inflight: usize,
}

impl BuildRun {
    fn dispatch(
        &mut self,
        tasks: &Sender<EmbeddingTask>,
        results: &Receiver<EmbeddingResult>,
    ) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        // Keeps every in-flight result within the result queue's capacity.
        while self.inflight >= self.max_inflight {
            self.receive(results)?;
        }
        let batch = std::mem::take(&mut self.pending);
        let texts = batch.iter().map(|m| m.chunk_text.clone()).collect();
        let task = EmbeddingTask {
            id: self.next_batch_id,
            texts,
        };
        debug!(batch = task.id, chunks = batch.len(), "queued embedding batch");
        self.queued.push(batch);
        self.next_batch_id += 1;
        self.inflight += 1;
        self.report.batches += 1;
        tasks
            .send(task)
            .map_err(|_| RagError::embedding_unavailable("embedding workers exited"))
    }

    fn receive(&mut self, results: &Receiver<EmbeddingResult>) -> Result<()> {
        let result = results
            .recv()
            .map_err(|_| RagError::embedding_unavailable("embedding workers exited unexpectedly"))?;
        self.inflight = self.inflight.saturating_sub(1);
        let batch = match result {
            Ok(batch) => batch,
            Err((batch_id, err)) => {
                warn!(batch = batch_id, error = %err, "embedding batch failed");
                return Err(err);
            }
        };
        self.report.retries += batch.retries;
        self.report.chunks_embedded += batch.vectors.len();
        self.out_of_order.insert(batch.id, batch);
        while let Some(ready) = self.out_of_order.remove(&self.next_result_id) {
            let metadata = std::mem::take(&mut self.queued[ready.id]);
            self.entries.extend(
                ready
                    .vectors
                    .into_iter()
                    .zip(metadata)
                    .map(|(vector, metadata)| IndexEntry::new(vector, metadata)),
            );
            self.next_result_id += 1;
        }
        Ok(())
    }
}

fn worker_loop(
    worker_id: usize,
    receiver: Receiver<EmbeddingTask>,
    sender: Sender<EmbeddingResult>,
    embedder: Arc<dyn Embedder>,
    retry: RetryPolicy,
) {
    for task in receiver.iter() {
        let inputs: Vec<&str> = task.texts.iter().map(String::as_str).collect();
        let result = retry
            .run("embed batch", || embed_checked(embedder.as_ref(), &inputs))
            .map(|(vectors, retries)| {
                debug!(worker = worker_id, batch = task.id, chunks = vectors.len(), "embedded batch");
                EmbeddedBatch {
                    id: task.id,
                    vectors,
                    retries,
                }
            })
            .map_err(|err| (task.id, err));
        if sender.send(result).is_err() {
            break;
        }
    }
}

fn shutdown(results: Receiver<EmbeddingResult>, handles: Vec<JoinHandle<()>>) {
    // Unblocks any worker still sending so the joins below cannot hang.
    drop(results);
    for handle in handles {
        if handle.join().is_err() {
            warn!("embedding worker panicked");
        }
    }
}
