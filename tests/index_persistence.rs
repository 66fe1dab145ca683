use std::fs;

use pretty_assertions::assert_eq;
use statrag::config::IvfConfig;
use statrag::index::read_manifest;
use statrag::{
    ChunkMetadata, Embedder, IndexConfig, IndexEntry, LoadOptions, RagError, RetryPolicy, VectorIndex,
};

/// Embedder answering with constant vectors of a fixed width.
struct FixedWidthEmbedder {
    model: &'static str,
    dimension: usize,
}

impl Embedder for FixedWidthEmbedder {
    fn model_id(&self) -> &str {
        self.model
    }

    fn embed(&self, texts: &[&str]) -> statrag::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![0.5; self.dimension]).collect())
    }
}

fn metadata(document_id: &str, start: usize) -> ChunkMetadata {
    ChunkMetadata {
        chunk_id: format!("{document_id}#{start:08}"),
        document_id: document_id.to_string(),
        title: format!("Bulletin {document_id}"),
        source_url: format!("https://stats.example.gov/{document_id}"),
        published_on: None,
        chunk_text: format!("passage {start} of {document_id}"),
        start_offset: start,
        end_offset: start + 40,
        token_count: 4,
    }
}

/// Deterministic spread of vectors in `dimension` dimensions.
fn vector(seed: usize, dimension: usize) -> Vec<f32> {
    (0..dimension)
        .map(|i| (((seed * 31 + i * 17) % 13) as f32 - 6.0) / 6.0)
        .collect()
}

fn populated(dimension: usize, rows: usize, config: IndexConfig) -> VectorIndex {
    let mut index = VectorIndex::new(config);
    let entries = (0..rows)
        .map(|i| IndexEntry::new(vector(i, dimension), metadata(&format!("doc-{}", i % 7), i * 100)))
        .collect();
    index.build(entries).expect("build");
    index
}

#[test]
fn saved_index_answers_like_the_original() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("index");
    let index = populated(8, 40, IndexConfig::default());
    let manifest = index.save(&path).expect("save");
    assert_eq!(manifest.row_count, 40);
    assert_eq!(manifest.dimension, Some(8));

    let loaded = VectorIndex::load(&path, LoadOptions::default()).expect("load");
    assert_eq!(loaded.len(), index.len());
    for seed in [3usize, 11, 27] {
        let query = vector(seed + 1000, 8);
        let original = index.search(&query, 5).expect("search original");
        let reloaded = loaded.search(&query, 5).expect("search loaded");
        let original_ids: Vec<&str> = original.iter().map(|h| h.chunk_id()).collect();
        let reloaded_ids: Vec<&str> = reloaded.iter().map(|h| h.chunk_id()).collect();
        assert_eq!(original_ids, reloaded_ids);
        for (a, b) in original.iter().zip(&reloaded) {
            assert!((a.score - b.score).abs() < 1e-6);
            assert_eq!(a.metadata, b.metadata);
        }
    }
}

#[test]
fn saving_over_an_existing_artifact_replaces_it() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("index");
    populated(4, 10, IndexConfig::default()).save(&path).expect("first save");
    populated(4, 3, IndexConfig::default()).save(&path).expect("second save");

    assert_eq!(read_manifest(&path).expect("manifest").row_count, 3);
    let leftovers: Vec<_> = fs::read_dir(dir.path())
        .expect("list")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name != "index")
        .collect();
    assert!(leftovers.is_empty(), "staging dirs left behind: {leftovers:?}");
}

#[test]
fn loading_with_another_dimension_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("index");
    populated(384, 4, IndexConfig::default()).save(&path).expect("save");

    let err = VectorIndex::load(
        &path,
        LoadOptions {
            expected_dimension: Some(768),
            ..LoadOptions::default()
        },
    )
    .unwrap_err();
    assert!(matches!(
        err,
        RagError::DimensionMismatch {
            expected: 768,
            actual: 384
        }
    ));
}

#[test]
fn corrupted_vectors_are_detected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("index");
    populated(8, 6, IndexConfig::default()).save(&path).expect("save");

    let vectors = path.join("vectors.f32");
    let mut bytes = fs::read(&vectors).expect("read vectors");
    bytes[5] ^= 0xff;
    fs::write(&vectors, &bytes).expect("corrupt");
    let err = VectorIndex::load(&path, LoadOptions::default()).unwrap_err();
    assert!(matches!(err, RagError::IndexFormat(_)), "got {err}");

    bytes.truncate(bytes.len() - 4);
    fs::write(&vectors, &bytes).expect("truncate");
    let err = VectorIndex::load(&path, LoadOptions::default()).unwrap_err();
    assert!(matches!(err, RagError::IndexFormat(_)), "got {err}");
}

#[test]
fn missing_artifact_is_a_format_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = VectorIndex::load(&dir.path().join("absent"), LoadOptions::default()).unwrap_err();
    assert!(matches!(err, RagError::IndexFormat(_)));
}

#[test]
fn mismatched_add_leaves_the_index_untouched() {
    let mut index = populated(384, 5, IndexConfig::default());
    let query = vector(42, 384);
    let before: Vec<String> = index
        .search(&query, 3)
        .expect("search")
        .iter()
        .map(|h| h.chunk_id().to_string())
        .collect();

    let err = index
        .add(vec![
            IndexEntry::new(vector(90, 384), metadata("fresh", 0)),
            IndexEntry::new(vector(91, 768), metadata("fresh", 100)),
        ])
        .unwrap_err();
    assert!(matches!(
        err,
        RagError::DimensionMismatch {
            expected: 384,
            actual: 768
        }
    ));
    assert_eq!(index.len(), 5);
    assert!(index.entry("fresh#00000000").is_none());
    let after: Vec<String> = index
        .search(&query, 3)
        .expect("search")
        .iter()
        .map(|h| h.chunk_id().to_string())
        .collect();
    assert_eq!(before, after);
}

#[test]
fn partitioned_index_round_trips_its_ivf_settings() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("index");
    let config = IndexConfig {
        ivf: Some(IvfConfig { lists: 4, probes: 4 }),
        ..IndexConfig::default()
    };
    let index = populated(8, 64, config);
    assert!(index.is_partitioned());
    index.save(&path).expect("save");

    let loaded = VectorIndex::load(&path, LoadOptions::default()).expect("load");
    assert!(loaded.is_partitioned());
    let query = vector(7, 8);
    let hits = loaded.search(&query, 3).expect("search");
    assert_eq!(hits.len(), 3);
    // Probing every list is exhaustive, so results match flat search.
    let flat = VectorIndex::load(
        &path,
        LoadOptions {
            ivf: Some(IvfConfig { lists: 1, probes: 1 }),
            ..LoadOptions::default()
        },
    )
    .expect("flat load")
    .search(&query, 3)
    .expect("flat search");
    let ids = |hits: &[statrag::RetrievedChunk]| hits.iter().map(|h| h.chunk_id().to_string()).collect::<Vec<_>>();
    assert_eq!(ids(&hits), ids(&flat));
}

#[test]
fn live_embedder_dimension_is_checked_at_load() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("index");
    let mut index = populated(384, 4, IndexConfig::default());
    index.set_embedding_model("all-minilm");
    index.save(&path).expect("save");

    let wider = FixedWidthEmbedder {
        model: "all-minilm",
        dimension: 768,
    };
    let options = LoadOptions::for_embedder(&wider, &RetryPolicy::none()).expect("measures");
    assert_eq!(options.expected_dimension, Some(768));
    let err = VectorIndex::load(&path, options).unwrap_err();
    assert!(matches!(
        err,
        RagError::DimensionMismatch {
            expected: 768,
            actual: 384
        }
    ));

    let other_model = FixedWidthEmbedder {
        model: "nomic-embed-text",
        dimension: 384,
    };
    let options = LoadOptions::for_embedder(&other_model, &RetryPolicy::none()).expect("measures");
    let err = VectorIndex::load(&path, options).unwrap_err();
    assert!(matches!(err, RagError::InvalidConfig(_)), "got {err}");

    let matching = FixedWidthEmbedder {
        model: "all-minilm",
        dimension: 384,
    };
    let options = LoadOptions::for_embedder(&matching, &RetryPolicy::none()).expect("measures");
    assert_eq!(VectorIndex::load(&path, options).expect("loads").len(), 4);
}
