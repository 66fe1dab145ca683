use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use statrag::config::{EmbedderArgs, RetrievalArgs};
use statrag::eval::{evaluate, load_cases, EvalReport, EvalSummary};
use statrag::telemetry::init_tracing;
use statrag::{embedder, IndexHandle, LoadOptions, Retriever, VectorIndex};

#[derive(Parser, Debug)]
#[command(
    name = "statrag-eval",
    about = "Evaluate retrieval quality against a labeled query set"
)]
struct EvalCli {
    /// Path to the evaluation JSONL file
    #[arg(long, env = "STATRAG_EVAL_DATA", default_value = "data/eval.jsonl")]
    cases: PathBuf,

    /// Index artifact directory written by statrag-indexer
    #[arg(long, env = "STATRAG_INDEX_DIR", default_value = "statrag_index")]
    index: PathBuf,

    /// Top-K chunks retrieved per query
    #[arg(long, default_value_t = 5)]
    top_k: usize,

    /// Optional JSON report output path
    #[arg(long, env = "STATRAG_EVAL_REPORT")]
    report_json: Option<PathBuf>,

    #[command(flatten)]
    retrieval: RetrievalArgs,

    #[command(flatten)]
    embedder: EmbedderArgs,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = EvalCli::parse();
    let file = File::open(&cli.cases).with_context(|| format!("failed to open {:?}", cli.cases))?;
    let cases = load_cases(BufReader::new(file))?;
    anyhow::ensure!(!cases.is_empty(), "evaluation file contains no cases");

    let embedder_config = cli.embedder.build_config();
    let embedder = embedder::from_config(&embedder_config)?;
    let load_options = LoadOptions::for_embedder(embedder.as_ref(), &embedder_config.retry)
        .context("failed to reach the embedding service")?;
    let index = VectorIndex::load(&cli.index, load_options)
        .with_context(|| format!("failed to load index at {:?}", cli.index))?;
    let retriever = Retriever::new(
        embedder,
        IndexHandle::new(index),
        cli.retrieval.retrieval_config(),
    )
    .with_retry(embedder_config.retry);

    let report = evaluate(&retriever, cases, cli.top_k.max(1))?;
    render_summary(&report.summary);
    if let Some(path) = cli.report_json {
        write_report(&report, &path)?;
        println!("wrote JSON report to {:?}", path);
    }
    Ok(())
}

fn render_summary(summary: &EvalSummary) {
    println!("--- Retrieval Evaluation Summary ---");
    println!("cases: {}", summary.total_cases);
    println!("top_k: {}", summary.top_k);
    println!("hit rate: {:.3}", summary.hit_rate);
    if let Some(recall) = summary.mean_recall {
        println!("mean recall: {:.3}", recall);
    } else {
        println!("mean recall: n/a");
    }
    println!("mean reciprocal rank: {:.3}", summary.mean_reciprocal_rank);
    println!("avg retrieval latency (ms): {:.2}", summary.avg_latency_ms);
}

fn write_report(report: &EvalReport, path: &PathBuf) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {:?}", path))?;
    serde_json::to_writer_pretty(file, report).context("failed to write JSON report")?;
    Ok(())
}
