use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use docqa_core::{
    ask, embedder_from_config, expand_inputs, ingest_paths, retrieve, AnswerGenerator, ChatSession,
    CorruptionPolicy, Embedder, ExtractiveGenerator, GeminiGenerator, RetrievalConfig,
    RetrievalManager, SearchResult, DEFAULT_DATA_DIR, DEFAULT_EMBEDDING_MODEL,
};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Ask questions about a folder of PDF and DOCX documents.
///
/// Run one instance per data directory at a time; the persisted files are
/// not locked against concurrent writers.
#[derive(Parser)]
#[command(name = "docqa", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    retrieval: RetrievalArgs,
}

#[derive(Args)]
struct RetrievalArgs {
    /// Directory holding the chunk store and the vector index.
    #[arg(long, global = true, env = "DOCQA_DATA_DIR", default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    /// fastembed model id, or `hashing-trigram[-N]` for the offline embedder.
    #[arg(long, global = true, env = "DOCQA_EMBEDDING_MODEL", default_value = DEFAULT_EMBEDDING_MODEL)]
    embedding_model: String,

    /// Maximum chunk length in characters.
    #[arg(long, global = true, env = "DOCQA_CHUNK_SIZE", default_value_t = 1_000)]
    chunk_size: usize,

    /// Characters shared by consecutive chunks.
    #[arg(long, global = true, env = "DOCQA_CHUNK_OVERLAP", default_value_t = 200)]
    chunk_overlap: usize,

    /// Number of passages retrieved per question.
    #[arg(long, global = true, env = "DOCQA_TOP_K", default_value_t = 5)]
    top_k: usize,

    #[arg(long, global = true, env = "DOCQA_EMBED_BATCH_SIZE", default_value_t = 32)]
    embed_batch_size: usize,

    /// Refuse to start on unreadable or misaligned persisted state instead
    /// of moving it aside.
    #[arg(long, global = true, env = "DOCQA_FAIL_FAST", default_value_t = false)]
    fail_fast: bool,

    /// Where downloaded embedding models are cached.
    #[arg(long, global = true, env = "DOCQA_MODEL_CACHE_DIR")]
    model_cache_dir: Option<PathBuf>,
}

impl RetrievalArgs {
    fn into_config(self) -> RetrievalConfig {
        RetrievalConfig {
            embedding_model: self.embedding_model,
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            top_k: self.top_k,
            data_dir: self.data_dir,
            embed_batch_size: self.embed_batch_size,
            corruption_policy: if self.fail_fast {
                CorruptionPolicy::FailFast
            } else {
                CorruptionPolicy::FailSoft
            },
            model_cache_dir: self.model_cache_dir,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Ingest documents; folders are walked recursively.
    Ingest {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Print the passages closest to a question.
    Query {
        #[arg(long)]
        question: String,
    },
    /// Answer a single question from the ingested documents.
    Ask {
        #[arg(long)]
        question: String,
    },
    /// Interactive question loop over stdin. Empty line or `exit` quits.
    Chat,
    /// Show what is stored.
    Status,
    /// Delete all ingested chunks and vectors.
    Reset,
}

type Manager = RetrievalManager<Box<dyn Embedder>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = cli.retrieval.into_config();

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        data_dir = %config.data_dir.display(),
        model = %config.embedding_model,
        "docqa boot"
    );

    let embedder = embedder_from_config(&config).context("loading the embedding model")?;
    let mut manager = RetrievalManager::open(config, embedder).context("opening the data directory")?;
    for notice in manager.notices() {
        eprintln!("warning: {notice}");
    }

    match cli.command {
        Command::Ingest { paths } => run_ingest(&mut manager, &paths),
        Command::Query { question } => {
            let k = manager.config().top_k;
            let found = retrieve(&mut manager, &question, k);
            if let Some(notice) = &found.notice {
                eprintln!("warning: {notice}");
            }
            if found.results.is_empty() {
                println!("no results");
            }
            print_results(&found.results);
        }
        Command::Ask { question } => {
            let generator = answer_generator();
            let mut session = ChatSession::new();
            let k = manager.config().top_k;
            let answer = ask(&mut manager, generator.as_ref(), &mut session, &question, k).await;
            if let Some(notice) = &answer.notice {
                eprintln!("warning: {notice}");
            }
            println!("{}", answer.text);
            print_sources(&answer.sources);
        }
        Command::Chat => run_chat(&mut manager).await?,
        Command::Status => print_status(&manager),
        Command::Reset => {
            manager.reset()?;
            println!("cleared {}", manager.config().data_dir.display());
        }
    }

    Ok(())
}

fn answer_generator() -> Box<dyn AnswerGenerator> {
    match GeminiGenerator::from_env() {
        Ok(generator) => Box::new(generator),
        Err(error) => {
            warn!(%error, "gemini unavailable, answering with retrieved passages");
            Box::new(ExtractiveGenerator::default())
        }
    }
}

fn run_ingest(manager: &mut Manager, inputs: &[PathBuf]) {
    let paths = expand_inputs(inputs);
    let report = ingest_paths(manager, &paths);

    for file in &report.ingested {
        println!("ingested {} ({} chunks)", file.path.display(), file.chunks);
    }
    for file in &report.skipped {
        println!("skipped {}: {}", file.path.display(), file.reason);
    }
    println!(
        "{} chunks from {} file(s), {} skipped, at {}",
        report.total_chunks(),
        report.ingested.len(),
        report.skipped.len(),
        Utc::now().to_rfc3339()
    );
}

async fn run_chat(manager: &mut Manager) -> anyhow::Result<()> {
    let generator = answer_generator();
    let mut session = ChatSession::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let k = manager.config().top_k;

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let question = line.trim();
        if question.is_empty() || question.eq_ignore_ascii_case("exit") {
            break;
        }

        let answer = ask(manager, generator.as_ref(), &mut session, question, k).await;
        if let Some(notice) = &answer.notice {
            eprintln!("warning: {notice}");
        }
        println!("{}", answer.text);
        print_sources(&answer.sources);
    }

    info!(turns = session.len(), "chat finished");
    Ok(())
}

fn print_results(results: &[SearchResult]) {
    for (position, result) in results.iter().enumerate() {
        println!(
            "{}. {} | page {} | score {:.4}",
            position + 1,
            result.source,
            page_label(result.page),
            result.relevance_score
        );
        println!("   {}", result.text);
    }
}

fn print_sources(sources: &[SearchResult]) {
    if sources.is_empty() {
        return;
    }
    println!("sources:");
    for result in sources {
        println!(
            "  - {} (page {}, score {:.4})",
            result.source,
            page_label(result.page),
            result.relevance_score
        );
    }
}

fn print_status(manager: &Manager) {
    println!("data dir:   {}", manager.config().data_dir.display());
    println!("model:      {}", manager.embedder().model_name());
    println!("dimension:  {}", manager.dimension());
    println!("chunks:     {}", manager.len());
    println!("vectors:    {}", manager.rows());
    for (source, count) in manager.sources() {
        println!("  {source}: {count}");
    }
}

fn page_label(page: Option<u32>) -> String {
    page.map(|page| page.to_string())
        .unwrap_or_else(|| "N/A".to_string())
}
