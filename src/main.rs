//! # rag CLI
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rag extract <path>` | Flatten a source tree into the JSONL corpus |
//! | `rag index` | Embed the corpus and report the index size |
//! | `rag retrieve "<query>"` | Show the closest corpus documents |
//! | `rag generate "<prompt>"` | Stream a completion for a raw prompt |
//! | `rag ask "<query>"` | Retrieve context and generate an answer |
//!
//! Results go to stdout. Logs and progress go to stderr.
//!
//! Exit codes: 0 on success, 2 when the extraction root is not a directory,
//! 130 when a generation is interrupted with Ctrl-C, 1 for anything else.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use repo_rag::config::{resolve_config, Config};
use repo_rag::corpus::{extract_corpus, load_corpus, write_corpus, ExtractError};
use repo_rag::embedding::create_provider;
use repo_rag::generate::{GenerateError, GenerationClient};
use repo_rag::progress::{ProgressEvent, ProgressMode, ProgressReporter};
use repo_rag::retrieve::{build_prompt, Retriever};

/// Retrieval-augmented question answering over a local source tree.
#[derive(Parser)]
#[command(name = "rag", version)]
struct Cli {
    /// Path to a TOML configuration file. Built-in defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Progress output on stderr: human, json, or off. Defaults to human on a TTY.
    #[arg(long, global = true)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Walk a directory and write the corpus file.
    ///
    /// The first line is a tree manifest of the directory; every other line
    /// is one text file. Existing output is overwritten.
    Extract {
        /// Root directory to extract.
        path: PathBuf,

        /// Output file. Defaults to `[extract].output` (`data/corpus.jsonl`).
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Embed the corpus and report the resulting index.
    Index,

    /// Print the documents closest to a query.
    Retrieve {
        query: String,

        /// Number of documents. Defaults to `[retrieval].top_k`.
        #[arg(short, long)]
        k: Option<usize>,
    },

    /// Stream a completion for a prompt, without retrieval.
    Generate { prompt: String },

    /// Answer a question using retrieved context.
    Ask {
        query: String,

        #[arg(short, long)]
        k: Option<usize>,

        /// Wait for the whole answer instead of streaming with progress.
        #[arg(long)]
        no_stream: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_code_for(&e)
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    if err.downcast_ref::<ExtractError>().is_some() {
        return ExitCode::from(2);
    }
    if let Some(GenerateError::Cancelled { .. }) = err.downcast_ref::<GenerateError>() {
        return ExitCode::from(130);
    }
    ExitCode::FAILURE
}

async fn run(cli: Cli) -> Result<()> {
    let mut cfg = resolve_config(cli.config.as_deref())?;
    let mode = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);
    let reporter = mode.reporter();

    match cli.command {
        Commands::Extract { path, out } => {
            if let Some(out) = out {
                cfg.extract.output = out;
            }
            run_extract(&cfg, &path, reporter.as_ref())
        }
        Commands::Index => run_index(&cfg).await,
        Commands::Retrieve { query, k } => {
            let k = k.unwrap_or(cfg.retrieval.top_k);
            run_retrieve(&cfg, &query, k).await
        }
        Commands::Generate { prompt } => {
            let answer = generate_streaming(&cfg, &prompt, reporter.as_ref()).await?;
            println!("{}", answer);
            Ok(())
        }
        Commands::Ask {
            query,
            k,
            no_stream,
        } => {
            let k = k.unwrap_or(cfg.retrieval.top_k);
            run_ask(&cfg, &query, k, no_stream, reporter.as_ref()).await
        }
    }
}

fn run_extract(cfg: &Config, root: &std::path::Path, reporter: &dyn ProgressReporter) -> Result<()> {
    let extraction = extract_corpus(root, &cfg.extract, reporter)?;
    let out = &cfg.extract.output;
    write_corpus(out, &extraction.manifest, &extraction.records)?;

    reporter.report(ProgressEvent::Written {
        path: out.display().to_string(),
        records: extraction.records.len() as u64,
        skipped: extraction.skipped as u64,
    });
    println!(
        "wrote {} with {} files and tree manifest",
        out.display(),
        extraction.records.len()
    );
    Ok(())
}

async fn load_retriever(cfg: &Config) -> Result<Retriever> {
    if !cfg.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding].provider to query the corpus.");
    }
    let corpus = load_corpus(&cfg.extract.output)?;
    let documents = corpus.documents(cfg.retrieval.include_manifest);
    let provider = create_provider(&cfg.embedding)?;
    Retriever::build(provider, documents, cfg.embedding.batch_size).await
}

async fn run_index(cfg: &Config) -> Result<()> {
    let retriever = load_retriever(cfg).await?;
    let index = retriever.index();
    println!(
        "indexed {} documents ({} dims)",
        index.len(),
        index.dims().unwrap_or(0)
    );
    Ok(())
}

async fn run_retrieve(cfg: &Config, query: &str, k: usize) -> Result<()> {
    let retriever = load_retriever(cfg).await?;
    let hits = retriever.retrieve(query, k).await?;
    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, hit) in hits.iter().enumerate() {
        println!("{}. {}  (distance {:.4})", i + 1, hit.id, hit.distance);
    }
    Ok(())
}

async fn run_ask(
    cfg: &Config,
    query: &str,
    k: usize,
    no_stream: bool,
    reporter: &dyn ProgressReporter,
) -> Result<()> {
    let retriever = load_retriever(cfg).await?;
    let hits = retriever.retrieve(query, k).await?;
    if hits.is_empty() {
        warn!("no context retrieved, answering without it");
    }
    for hit in &hits {
        info!(id = %hit.id, distance = hit.distance, "context");
    }
    let prompt = build_prompt(query, &hits);

    let answer = if no_stream {
        GenerationClient::new(&cfg.generation)?
            .complete(&prompt)
            .await?
    } else {
        generate_streaming(cfg, &prompt, reporter).await?
    };
    println!("{}", answer);
    Ok(())
}

/// Stream a completion, cancelling on Ctrl-C. Partial output of a cancelled
/// generation is still printed.
async fn generate_streaming(
    cfg: &Config,
    prompt: &str,
    reporter: &dyn ProgressReporter,
) -> Result<String> {
    let client = GenerationClient::new(&cfg.generation)?;
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });

    let result = client.stream_generate(prompt, reporter, &cancel).await;
    ctrl_c.abort();

    match result {
        Ok(generated) => Ok(generated.text),
        Err(GenerateError::Cancelled { partial, tokens }) => {
            eprintln!();
            if !partial.is_empty() {
                println!("{}", partial);
            }
            Err(GenerateError::Cancelled { partial, tokens }.into())
        }
        Err(e) => Err(e.into()),
    }
}
