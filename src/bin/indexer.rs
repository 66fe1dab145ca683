use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use statrag::config::{ChunkingArgs, EmbedderArgs, IndexConfig, IvfConfig, Metric};
use statrag::document::{read_documents_json, read_documents_jsonl};
use statrag::telemetry::init_tracing;
use statrag::{embedder, BuildConfig, Chunker, IndexBuilder, LoadOptions, RagError, VectorIndex};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "statrag-indexer",
    about = "Chunk, embed and index processed statistical documents"
)]
struct IndexerCli {
    /// Processed documents, one JSON object per line
    #[arg(long, env = "STATRAG_INDEX_INPUT", default_value = "processed_documents.jsonl")]
    input: PathBuf,

    /// Treat the input as the extractor's single JSON document (`processed_files`)
    #[arg(long, default_value_t = false)]
    json_array: bool,

    /// Directory the index artifact is written to
    #[arg(long, env = "STATRAG_INDEX_DIR", default_value = "statrag_index")]
    output: PathBuf,

    /// Add to the artifact already at --output instead of starting empty
    #[arg(long, default_value_t = false)]
    incremental: bool,

    /// Similarity metric
    #[arg(long, value_enum, default_value_t = Metric::Cosine)]
    metric: Metric,

    /// Expected embedding dimension (defaults to the first vector's)
    #[arg(long)]
    dimension: Option<usize>,

    /// IVF partitions for approximate search (0 keeps flat search)
    #[arg(long, default_value_t = 0)]
    ivf_lists: usize,

    /// IVF partitions probed per query
    #[arg(long, default_value_t = 4)]
    ivf_probes: usize,

    /// Optional path for the JSON build report (always printed to stdout)
    #[arg(long)]
    report_json: Option<PathBuf>,

    #[command(flatten)]
    chunking: ChunkingArgs,

    #[command(flatten)]
    embedder: EmbedderArgs,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = IndexerCli::parse();
    let chunker = Chunker::new(cli.chunking.build_config()?)?;
    let embedder_config = cli.embedder.build_config();
    let embedder = embedder::from_config(&embedder_config)?;
    let index_config = IndexConfig {
        metric: cli.metric,
        dimension: cli.dimension,
        ivf: (cli.ivf_lists > 0).then_some(IvfConfig {
            lists: cli.ivf_lists,
            probes: cli.ivf_probes.max(1),
        }),
    };
    let builder = IndexBuilder::new(
        chunker,
        embedder.clone(),
        BuildConfig::from_embedder(&embedder_config, index_config),
    )?;

    let documents = if cli.json_array {
        let raw = fs::read_to_string(&cli.input)
            .with_context(|| format!("failed to read {:?}", cli.input))?;
        read_documents_json(&raw).context("input is not an extractor JSON document")?
    } else {
        let file = File::open(&cli.input).with_context(|| format!("failed to open {:?}", cli.input))?;
        read_documents_jsonl(BufReader::new(file)).collect()
    };

    let outcome = if cli.incremental && cli.output.join("manifest.json").exists() {
        let load_options = LoadOptions {
            ivf: index_config.ivf,
            ..LoadOptions::for_embedder(embedder.as_ref(), &embedder_config.retry)
                .context("failed to reach the embedding service")?
        };
        let base = VectorIndex::load(&cli.output, load_options)
            .with_context(|| format!("failed to load existing index at {:?}", cli.output))?;
        info!(rows = base.len(), "extending existing index");
        builder.build_onto(base, documents)
    } else {
        builder.build(documents)
    };

    let output = match outcome {
        Ok(output) => output,
        Err(RagError::BuildAborted { report, source }) => {
            write_report(&report, cli.report_json.as_ref())?;
            return Err(anyhow::Error::new(*source).context("index build aborted; nothing was saved"));
        }
        Err(err) => return Err(err.into()),
    };

    for skipped in &output.report.skipped {
        warn!(document_id = %skipped.document_id, reason = %skipped.reason, "document skipped");
    }
    let manifest = output
        .index
        .save(&cli.output)
        .with_context(|| format!("failed to save index to {:?}", cli.output))?;
    info!(
        rows = manifest.row_count,
        dimension = ?manifest.dimension,
        path = %cli.output.display(),
        "index saved"
    );
    write_report(&output.report, cli.report_json.as_ref())
}

fn write_report(report: &statrag::BuildReport, path: Option<&PathBuf>) -> Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, report).context("failed to print build report")?;
    writeln!(stdout)?;
    if let Some(path) = path {
        let file = File::create(path).with_context(|| format!("failed to create {:?}", path))?;
        serde_json::to_writer_pretty(file, report).context("failed to write JSON report")?;
    }
    Ok(())
}
