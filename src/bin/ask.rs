use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use statrag::config::{EmbedderArgs, GeneratorArgs, RetrievalArgs};
use statrag::telemetry::init_tracing;
use statrag::{
    embedder, generator, AnswerStatus, IndexHandle, LoadOptions, PipelineConfig, PromptAssembler,
    RagPipeline, Retriever, VectorIndex,
};

#[derive(Parser, Debug)]
#[command(
    name = "statrag-ask",
    about = "Answer a question from an index of statistical documents"
)]
struct AskCli {
    /// Question to answer
    #[arg(long)]
    question: String,

    /// Index artifact directory written by statrag-indexer
    #[arg(long, env = "STATRAG_INDEX_DIR", default_value = "statrag_index")]
    index: PathBuf,

    /// Number of chunks retrieved as context
    #[arg(long, default_value_t = 5)]
    top_k: usize,

    /// Print the assembled prompt and skip the model call
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Print the answer as JSON
    #[arg(long, default_value_t = false)]
    json: bool,

    #[command(flatten)]
    retrieval: RetrievalArgs,

    #[command(flatten)]
    embedder: EmbedderArgs,

    #[command(flatten)]
    generator: GeneratorArgs,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = AskCli::parse();
    if cli.question.trim().is_empty() {
        bail!("question must not be empty");
    }
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
    let assembler = PromptAssembler::new(cli.retrieval.prompt_config());
    let generator_config = cli.generator.build_config();
    let pipeline = RagPipeline::new(
        retriever,
        assembler,
        generator::from_config(&generator_config)?,
        PipelineConfig::from_generator(&generator_config),
    );
    let top_k = cli.top_k.max(1);

    if cli.dry_run {
        let prompt = pipeline.assemble_prompt(&cli.question, top_k, None)?;
        println!("--- Prompt ({} tokens of context) ---\n{}", prompt.used_tokens, prompt.text);
        println!("dry-run enabled; skipping LLM call.");
        return Ok(());
    }

    let answer = pipeline.answer(&cli.question, top_k)?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&answer)?);
        return Ok(());
    }
    println!("--- Answer ---\n{}", answer.text);
    if answer.status == AnswerStatus::Grounded && !answer.citations.is_empty() {
        println!("\n--- Sources ---");
        for source in &answer.citations {
            let published = source
                .published_on
                .map(|d| format!(", published {d}"))
                .unwrap_or_default();
            println!("[^{}] {} ({}{published})", source.chunk_id, source.title, source.source_url);
        }
    }
    Ok(())
}
