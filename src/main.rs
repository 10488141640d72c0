use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use rag_eval::{
    knowledge, report, EngineConfig, Evaluator, EvaluatorOptions, GeneratorOptions, HttpAgent,
    KnowledgeBase, OpenAiModel, Testset, TestsetGenerator,
};

/// RAG chatbot evaluation harness - synthesize grounded testsets and judge
/// candidate answers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a testset from a pre-chunked corpus
    Generate {
        /// Path to the TOML engine configuration
        #[arg(short, long)]
        config: PathBuf,
        /// JSONL corpus: one {id?, text, metadata?} record per line
        #[arg(long)]
        corpus: PathBuf,
        /// Number of questions to synthesize
        #[arg(short, long)]
        num_questions: usize,
        /// Description of the chatbot the questions target
        #[arg(short, long)]
        description: String,
        /// Output testset path (JSONL)
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Evaluate an agent endpoint against a saved testset
    Evaluate {
        /// Path to the TOML engine configuration
        #[arg(short, long)]
        config: PathBuf,
        /// Testset produced by `generate`
        #[arg(short, long)]
        testset: PathBuf,
        /// JSONL corpus the testset was generated from
        #[arg(long)]
        corpus: PathBuf,
        /// HTTP endpoint of the answering agent
        #[arg(long)]
        agent_url: String,
        /// Optional path to store the report as JSON
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// Console output format
        #[arg(long, default_value = "plain")]
        output: OutputFormat,
    },
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Plain,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    match args.command {
        Command::Generate {
            config,
            corpus,
            num_questions,
            description,
            out,
        } => generate(config, corpus, num_questions, &description, out).await,
        Command::Evaluate {
            config,
            testset,
            corpus,
            agent_url,
            out,
            output,
        } => evaluate(config, testset, corpus, &agent_url, out, output).await,
    }
}

fn load_knowledge_base(path: &PathBuf) -> Result<KnowledgeBase> {
    let chunks = knowledge::read_chunks(path)
        .with_context(|| format!("failed to read corpus: {}", path.display()))?;
    KnowledgeBase::load(chunks).context("failed to build knowledge base")
}

async fn generate(
    config: PathBuf,
    corpus: PathBuf,
    num_questions: usize,
    description: &str,
    out: PathBuf,
) -> Result<()> {
    let config = EngineConfig::from_file(&config)?;
    let kb = load_knowledge_base(&corpus)?;
    let api_key = config.api_key()?;
    let model = Arc::new(OpenAiModel::new(
        &config.api_endpoint,
        &api_key,
        &config.model,
        config.temperature as f32,
        config.max_tokens,
        config.request_timeout_secs,
    ));

    let generator = TestsetGenerator::new(model, GeneratorOptions::from_config(&config));
    let testset = generator
        .generate(&kb, num_questions, description, CancellationToken::new())
        .await?;

    testset.save(&out)?;
    println!(
        "Generated {} test cases ({} skipped) -> {}",
        testset.len(),
        testset.skipped_count,
        out.display()
    );
    Ok(())
}

async fn evaluate(
    config: PathBuf,
    testset: PathBuf,
    corpus: PathBuf,
    agent_url: &str,
    out: Option<PathBuf>,
    output: OutputFormat,
) -> Result<()> {
    let config = EngineConfig::from_file(&config)?;
    let kb = load_knowledge_base(&corpus)?;
    let testset = Testset::load(&testset)?;
    testset
        .check_integrity(&kb)
        .context("testset references chunks missing from this corpus")?;

    let api_key = config.api_key()?;
    // The judge runs cold regardless of the synthesis temperature.
    let judge = Arc::new(OpenAiModel::new(
        &config.api_endpoint,
        &api_key,
        config.judge_model(),
        0.0,
        config.max_tokens,
        config.request_timeout_secs,
    ));
    let agent = HttpAgent::new(
        agent_url,
        Duration::from_secs(config.request_timeout_secs),
    )?;

    let evaluator = Evaluator::new(judge, EvaluatorOptions::from_config(&config));
    let eval_report = evaluator
        .evaluate(&agent, &testset, &kb, CancellationToken::new())
        .await?;

    if let Some(path) = out {
        std::fs::write(&path, eval_report.to_json()?)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        println!("Report stored to: {}", path.display());
    }
    match output {
        OutputFormat::Plain => report::print_plain(&eval_report),
        OutputFormat::Json => report::print_json(&eval_report),
    }
    Ok(())
}
