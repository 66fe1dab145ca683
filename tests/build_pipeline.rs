mod common;

use std::io::Cursor;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{corpus, two_paragraph_chunking, FlakyEmbedder, KeywordEmbedder};
use pretty_assertions::assert_eq;
use statrag::document::read_documents_jsonl;
use statrag::{
    BuildConfig, Chunker, Embedder, IndexBuilder, IndexConfig, IndexHandle, RagError,
    RetrievalConfig, Retriever, RetryPolicy,
};

fn builder(embedder: Arc<dyn Embedder>, retry: RetryPolicy) -> IndexBuilder {
    IndexBuilder::new(
        Chunker::new(two_paragraph_chunking()).expect("chunker"),
        embedder,
        BuildConfig {
            batch_size: 4,
            workers: 1,
            retry,
            index: IndexConfig::default(),
        },
    )
    .expect("builder")
}

#[test]
fn malformed_document_is_skipped_and_reported() {
    let input = concat!(
        r#"{"id":"cpi-2024","source_url":"https://mospi.gov.in/cpi","title":"CPI Bulletin","raw_text":"Inflation eased to 4.1 percent.\n\nThe base year is 2012."}"#,
        "\n",
        r#"{"id":"broken","source_url":"https://mospi.gov.in/x","raw_text":"No title on this one."}"#,
        "\n",
        r#"{"id":"gdp-2024","url":"https://mospi.gov.in/gdp","title":"GDP Estimates","text_content":"GDP grew by 7.2 percent."}"#,
        "\n",
    );
    let output = builder(Arc::new(KeywordEmbedder::new()), RetryPolicy::none())
        .build(read_documents_jsonl(Cursor::new(input)))
        .expect("build");

    let report = output.report;
    assert_eq!(report.documents_seen, 3);
    assert_eq!(report.documents_processed, 2);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].document_id, "broken");
    assert!(report.skipped[0].reason.contains("title"));
    assert_eq!(report.chunks_embedded, output.index.len());
    assert!(output.index.metadata().all(|m| m.document_id != "broken"));
    assert_eq!(output.index.embedding_model(), Some("keyword-stub"));
}

#[test]
fn blank_document_is_skipped_with_reason() {
    let mut documents = corpus();
    documents[1].raw_text = "   \n\n  ".to_string();
    let output = builder(Arc::new(KeywordEmbedder::new()), RetryPolicy::none())
        .build(documents.into_iter().map(Ok))
        .expect("build");
    assert_eq!(output.report.documents_processed, 2);
    assert_eq!(output.report.skipped[0].document_id, "doc-2");
    assert_eq!(output.report.skipped[0].reason, "no text to chunk");
    assert_eq!(output.index.len(), 4);
}

#[test]
fn transient_embedding_failures_are_retried() {
    let embedder = Arc::new(FlakyEmbedder::new(2));
    let output = builder(embedder.clone(), RetryPolicy::immediate(4))
        .build(corpus().into_iter().map(Ok))
        .expect("build");
    assert_eq!(output.report.retries, 2);
    assert_eq!(output.report.chunks_embedded, 6);
    assert_eq!(output.index.len(), 6);
    assert_eq!(
        embedder.calls.load(Ordering::SeqCst),
        output.report.batches + 2
    );
}

#[test]
fn persistent_outage_aborts_with_partial_report() {
    let embedder = Arc::new(FlakyEmbedder::new(usize::MAX));
    let err = builder(embedder, RetryPolicy::immediate(3))
        .build(corpus().into_iter().map(Ok))
        .unwrap_err();
    match err {
        RagError::BuildAborted { report, source } => {
            assert!(matches!(*source, RagError::EmbeddingUnavailable { .. }));
            assert_eq!(report.chunks_embedded, 0);
            assert!(report.documents_seen >= 1);
            assert!(report.batches >= 1);
        }
        other => panic!("expected BuildAborted, got {other}"),
    }
}

#[test]
fn chunks_arrive_in_document_order_across_workers() {
    let builder = IndexBuilder::new(
        Chunker::new(two_paragraph_chunking()).expect("chunker"),
        Arc::new(KeywordEmbedder::new()),
        BuildConfig {
            batch_size: 1,
            workers: 3,
            retry: RetryPolicy::none(),
            index: IndexConfig::default(),
        },
    )
    .expect("builder");
    let output = builder.build(corpus().into_iter().map(Ok)).expect("build");
    let order: Vec<String> = output.index.metadata().map(|m| m.chunk_id.clone()).collect();
    assert_eq!(
        order,
        vec![
            "doc-1#00000000",
            "doc-1#00000063",
            "doc-2#00000000",
            "doc-2#00000061",
            "doc-3#00000000",
            "doc-3#00000058",
        ]
    );
}

#[test]
fn diversity_cap_returns_distinct_documents() {
    let output = builder(Arc::new(KeywordEmbedder::new()), RetryPolicy::none())
        .build(corpus().into_iter().map(Ok))
        .expect("build");
    let retriever = Retriever::new(
        Arc::new(KeywordEmbedder::new()),
        IndexHandle::new(output.index),
        RetrievalConfig {
            max_chunks_per_document: Some(1),
            ..RetrievalConfig::default()
        },
    );
    let result = retriever
        .retrieve("labour and unemployment trends", 3, None)
        .expect("retrieve");
    let mut documents: Vec<&str> = result
        .hits
        .iter()
        .map(|h| h.metadata.document_id.as_str())
        .collect();
    assert_eq!(result.hits.len(), 3);
    assert_eq!(documents[0], "doc-1");
    documents.sort();
    documents.dedup();
    assert_eq!(documents.len(), 3);
}

#[test]
fn rebuild_onto_replaces_reindexed_chunks() {
    let builder = builder(Arc::new(KeywordEmbedder::new()), RetryPolicy::none());
    let first = builder.build(corpus().into_iter().map(Ok)).expect("first build");
    let mut revised = corpus();
    revised.truncate(1);
    revised[0].title = "Periodic Labour Force Survey (revised)".into();
    let second = builder
        .build_onto(first.index.clone(), revised.into_iter().map(Ok))
        .expect("second build");

    assert_eq!(second.index.len(), first.index.len());
    assert_eq!(
        second.index.entry("doc-1#00000000").map(|m| m.title.as_str()),
        Some("Periodic Labour Force Survey (revised)")
    );
    assert_eq!(
        first.index.entry("doc-1#00000000").map(|m| m.title.as_str()),
        Some("Periodic Labour Force Survey")
    );
}
