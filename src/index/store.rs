//! On-disk index artifact.
//!
//! An artifact is a directory with three files:
//! - `manifest.json`: format version, dimension, metric, model, counts, checksum
//! - `vectors.f32`: row-major little-endian `f32` values
//! - `chunks.jsonl`: one `ChunkMetadata` per row, in row order
//!
//! Saves are written to a sibling temporary directory and renamed into place,
//! so readers never see a half-written artifact.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ChunkMetadata, VectorIndex, METADATA_SCHEMA_VERSION};
use crate::config::{IndexConfig, IvfConfig, Metric};
use crate::embedder::{measure_dimension, Embedder};
use crate::error::{RagError, Result};
use crate::retry::RetryPolicy;

/// Artifact layout version understood by this build.
pub const FORMAT_VERSION: u32 = 1;

const MANIFEST_FILE: &str = "manifest.json";
const VECTORS_FILE: &str = "vectors.f32";
const CHUNKS_FILE: &str = "chunks.jsonl";

/// Self-describing header of an index artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexManifest {
    /// Artifact layout version.
    pub format_version: u32,
    /// `ChunkMetadata` schema version.
    pub metadata_schema: u32,
    /// Vector dimension (absent for an empty index).
    pub dimension: Option<usize>,
    /// Similarity metric.
    pub metric: Metric,
    /// Model that produced the vectors.
    #[serde(default)]
    pub embedding_model: Option<String>,
    /// Rows in both data files.
    pub row_count: usize,
    /// CRC32 of `vectors.f32`.
    pub vectors_crc32: u32,
    /// IVF settings in effect when saved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ivf: Option<IvfConfig>,
    /// Save timestamp.
    pub created_at: DateTime<Utc>,
}

/// Checks applied when loading an artifact.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Dimension of the embedder that will query the index.
    pub expected_dimension: Option<usize>,
    /// Model id of the embedder that will query the index.
    pub expected_model: Option<String>,
    /// Overrides the saved IVF settings.
    pub ivf: Option<IvfConfig>,
}

impl LoadOptions {
    /// Options that reject artifacts `embedder` cannot query.
    ///
    /// Makes one embedding request to learn the live dimension.
    pub fn for_embedder(embedder: &dyn Embedder, retry: &RetryPolicy) -> Result<Self> {
        Ok(Self {
            expected_dimension: Some(measure_dimension(embedder, retry)?),
            expected_model: Some(embedder.model_id().to_string()),
            ivf: None,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct ChunkLine {
    row_id: usize,
    #[serde(flatten)]
    metadata: ChunkMetadata,
}

impl VectorIndex {
    /// Writes the index to `dir`, replacing any artifact already there.
    pub fn save(&self, dir: &Path) -> Result<IndexManifest> {
        let staging = sibling_path(dir, "tmp")?;
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        let manifest = match self.write_files(&staging) {
            Ok(manifest) => manifest,
            Err(err) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(err);
            }
        };

        if dir.exists() {
            let retired = sibling_path(dir, "old")?;
            if retired.exists() {
                fs::remove_dir_all(&retired)?;
            }
            fs::rename(dir, &retired)?;
            fs::rename(&staging, dir)?;
            fs::remove_dir_all(&retired)?;
        } else {
            fs::rename(&staging, dir)?;
        }
        info!(
            path = %dir.display(),
            rows = manifest.row_count,
            dimension = ?manifest.dimension,
            "index artifact saved"
        );
        Ok(manifest)
    }

    fn write_files(&self, dir: &Path) -> Result<IndexManifest> {
        let mut hasher = Crc32::new();
        let mut vectors = BufWriter::new(File::create(dir.join(VECTORS_FILE))?);
        let mut chunks = BufWriter::new(File::create(dir.join(CHUNKS_FILE))?);
        for (row_id, (vector, metadata)) in self.raw_rows().enumerate() {
            for value in vector {
                let bytes = value.to_le_bytes();
                hasher.update(&bytes);
                vectors.write_all(&bytes)?;
            }
            serde_json::to_writer(
                &mut chunks,
                &ChunkLine {
                    row_id,
                    metadata: metadata.clone(),
                },
            )?;
            chunks.write_all(b"\n")?;
        }
        vectors.into_inner().map_err(|err| err.into_error())?.sync_all()?;
        chunks.into_inner().map_err(|err| err.into_error())?.sync_all()?;

        let manifest = IndexManifest {
            format_version: FORMAT_VERSION,
            metadata_schema: METADATA_SCHEMA_VERSION,
            dimension: self.dimension,
            metric: self.config.metric,
            embedding_model: self.embedding_model.clone(),
            row_count: self.len(),
            vectors_crc32: hasher.finalize(),
            ivf: self.config.ivf,
            created_at: Utc::now(),
        };
        let file = File::create(dir.join(MANIFEST_FILE))?;
        serde_json::to_writer_pretty(&file, &manifest)?;
        file.sync_all()?;
        Ok(manifest)
    }

    /// Loads and verifies an artifact written by `save`.
    pub fn load(dir: &Path, options: LoadOptions) -> Result<Self> {
        let manifest = read_manifest(dir)?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(RagError::IndexFormat(format!(
                "unsupported format version {} (expected {FORMAT_VERSION})",
                manifest.format_version
            )));
        }
        if manifest.metadata_schema != METADATA_SCHEMA_VERSION {
            return Err(RagError::IndexFormat(format!(
                "unsupported metadata schema {}",
                manifest.metadata_schema
            )));
        }
        if let (Some(expected), Some(actual)) = (options.expected_dimension, manifest.dimension) {
            if expected != actual {
                return Err(RagError::DimensionMismatch { expected, actual });
            }
        }
        if let (Some(expected), Some(actual)) = (
            options.expected_model.as_deref(),
            manifest.embedding_model.as_deref(),
        ) {
            if expected != actual {
                return Err(RagError::InvalidConfig(format!(
                    "index was embedded with model {actual}, but queries use {expected}"
                )));
            }
        }

        let dimension = manifest.dimension.unwrap_or(0);
        if manifest.row_count > 0 && dimension == 0 {
            return Err(RagError::IndexFormat("manifest has rows but no dimension".into()));
        }
        let vectors = read_vectors(dir, &manifest, dimension)?;
        let metadata = read_chunks(dir, manifest.row_count)?;

        let config = IndexConfig {
            metric: manifest.metric,
            dimension: manifest.dimension,
            ivf: options.ivf.or(manifest.ivf),
        };
        let rows = vectors.into_iter().zip(metadata).collect();
        let index = Self::from_parts(config, manifest.dimension, manifest.embedding_model, rows)?;
        info!(
            path = %dir.display(),
            rows = index.len(),
            dimension = ?index.dimension(),
            "index artifact loaded"
        );
        Ok(index)
    }
}

/// Reads only the manifest of an artifact.
pub fn read_manifest(dir: &Path) -> Result<IndexManifest> {
    let path = dir.join(MANIFEST_FILE);
    let file = File::open(&path).map_err(|err| {
        RagError::IndexFormat(format!("cannot open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|err| RagError::IndexFormat(format!("invalid manifest: {err}")))
}

fn read_vectors(dir: &Path, manifest: &IndexManifest, dimension: usize) -> Result<Vec<Vec<f32>>> {
    let path = dir.join(VECTORS_FILE);
    let mut bytes = Vec::new();
    File::open(&path)
        .map_err(|err| RagError::IndexFormat(format!("cannot open {}: {err}", path.display())))?
        .read_to_end(&mut bytes)?;

    let expected_len = manifest
        .row_count
        .checked_mul(dimension)
        .and_then(|values| values.checked_mul(4))
        .ok_or_else(|| {
            RagError::IndexFormat(format!(
                "manifest row count {} with dimension {dimension} is too large",
                manifest.row_count
            ))
        })?;
    if bytes.len() != expected_len {
        return Err(RagError::IndexFormat(format!(
            "{VECTORS_FILE} holds {} bytes, expected {expected_len}",
            bytes.len()
        )));
    }
    let mut hasher = Crc32::new();
    hasher.update(&bytes);
    let checksum = hasher.finalize();
    if checksum != manifest.vectors_crc32 {
        return Err(RagError::IndexFormat(format!(
            "{VECTORS_FILE} checksum {checksum:08x} does not match manifest {:08x}",
            manifest.vectors_crc32
        )));
    }

    if dimension == 0 {
        return Ok(Vec::new());
    }
    Ok(bytes
        .chunks_exact(dimension * 4)
        .map(|row| {
            row.chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect()
        })
        .collect())
}

fn read_chunks(dir: &Path, row_count: usize) -> Result<Vec<ChunkMetadata>> {
    let path = dir.join(CHUNKS_FILE);
    let file = File::open(&path)
        .map_err(|err| RagError::IndexFormat(format!("cannot open {}: {err}", path.display())))?;
    let mut out = Vec::with_capacity(row_count);
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: ChunkLine = serde_json::from_str(&line).map_err(|err| {
            RagError::IndexFormat(format!("{CHUNKS_FILE} line {}: {err}", idx + 1))
        })?;
        if parsed.row_id != out.len() {
            return Err(RagError::IndexFormat(format!(
                "{CHUNKS_FILE} line {} has row_id {}, expected {}",
                idx + 1,
                parsed.row_id,
                out.len()
            )));
        }
        out.push(parsed.metadata);
    }
    if out.len() != row_count {
        return Err(RagError::IndexFormat(format!(
            "{CHUNKS_FILE} holds {} rows, manifest says {row_count}",
            out.len()
        )));
    }
    Ok(out)
}

fn sibling_path(dir: &Path, suffix: &str) -> Result<PathBuf> {
    let name = dir
        .file_name()
        .ok_or_else(|| RagError::InvalidConfig(format!("invalid index path {}", dir.display())))?
        .to_string_lossy();
    let sibling = format!(".{name}.{suffix}-{}", std::process::id());
    Ok(match dir.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(sibling),
        _ => PathBuf::from(sibling),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::tests::meta;
    use crate::index::IndexEntry;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn sample_index() -> VectorIndex {
        let mut index = VectorIndex::new(IndexConfig::default());
        index.set_embedding_model("all-minilm");
        index
            .build(vec![
                IndexEntry::new(vec![0.1, 0.7, 0.2], meta("a#00000000", "a")),
                IndexEntry::new(vec![0.9, 0.1, 0.3], meta("b#00000000", "b")),
                IndexEntry::new(vec![0.4, 0.4, 0.4], meta("c#00000000", "c")),
            ])
            .expect("builds");
        index
    }

    #[test]
    fn save_then_load_searches_identically() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("index");
        let index = sample_index();
        let manifest = index.save(&path).expect("saves");
        assert_eq!(manifest.row_count, 3);

        let loaded = VectorIndex::load(&path, LoadOptions::default()).expect("loads");
        assert_eq!(loaded.embedding_model(), Some("all-minilm"));
        for query in [[1.0, 0.0, 0.0], [0.0, 1.0, 0.5], [-0.3, 0.2, 0.9]] {
            assert_eq!(
                index.search(&query, 3).expect("original"),
                loaded.search(&query, 3).expect("loaded")
            );
        }
    }

    #[test]
    fn save_replaces_existing_artifact() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("index");
        sample_index().save(&path).expect("first save");
        let mut smaller = VectorIndex::new(IndexConfig::default());
        smaller
            .add(vec![IndexEntry::new(vec![1.0, 0.0, 0.0], meta("z#00000000", "z"))])
            .expect("adds");
        smaller.save(&path).expect("second save");
        let loaded = VectorIndex::load(&path, LoadOptions::default()).expect("loads");
        assert_eq!(loaded.len(), 1);
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .expect("lists")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(leftovers, vec!["index".to_string()]);
    }

    #[test]
    fn wrong_expected_dimension_fails_fast() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("index");
        sample_index().save(&path).expect("saves");
        let err = VectorIndex::load(
            &path,
            LoadOptions {
                expected_dimension: Some(384),
                ..LoadOptions::default()
            },
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RagError::DimensionMismatch {
                expected: 384,
                actual: 3
            }
        ));
    }

    #[test]
    fn other_embedding_model_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("index");
        sample_index().save(&path).expect("saves");
        let err = VectorIndex::load(
            &path,
            LoadOptions {
                expected_model: Some("nomic-embed-text".into()),
                ..LoadOptions::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, RagError::InvalidConfig(_)), "got {err}");
        let loaded = VectorIndex::load(
            &path,
            LoadOptions {
                expected_model: Some("all-minilm".into()),
                ..LoadOptions::default()
            },
        )
        .expect("same model loads");
        assert_eq!(loaded.embedding_model(), Some("all-minilm"));
    }

    #[test]
    fn oversized_manifest_counts_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("index");
        sample_index().save(&path).expect("saves");
        let mut manifest = read_manifest(&path).expect("manifest");
        manifest.row_count = usize::MAX / 2;
        fs::write(
            path.join(MANIFEST_FILE),
            serde_json::to_vec(&manifest).expect("encodes"),
        )
        .expect("writes");
        assert!(matches!(
            VectorIndex::load(&path, LoadOptions::default()),
            Err(RagError::IndexFormat(_))
        ));
    }

    #[test]
    fn corrupted_vectors_are_detected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("index");
        sample_index().save(&path).expect("saves");
        let vectors = path.join(VECTORS_FILE);
        let mut bytes = fs::read(&vectors).expect("reads");
        bytes[5] ^= 0xff;
        fs::write(&vectors, &bytes).expect("writes");
        assert!(matches!(
            VectorIndex::load(&path, LoadOptions::default()),
            Err(RagError::IndexFormat(_))
        ));

        bytes.truncate(8);
        fs::write(&vectors, &bytes).expect("writes");
        assert!(matches!(
            VectorIndex::load(&path, LoadOptions::default()),
            Err(RagError::IndexFormat(_))
        ));
    }

    #[test]
    fn missing_side_table_rows_are_detected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("index");
        sample_index().save(&path).expect("saves");
        let chunks = path.join(CHUNKS_FILE);
        let text = fs::read_to_string(&chunks).expect("reads");
        let first_two: Vec<&str> = text.lines().take(2).collect();
        fs::write(&chunks, first_two.join("\n")).expect("writes");
        assert!(matches!(
            VectorIndex::load(&path, LoadOptions::default()),
            Err(RagError::IndexFormat(_))
        ));
    }

    #[test]
    fn missing_artifact_is_a_format_error() {
        let dir = tempdir().expect("tempdir");
        assert!(matches!(
            VectorIndex::load(&dir.path().join("absent"), LoadOptions::default()),
            Err(RagError::IndexFormat(_))
        ));
    }
}
