//! # claimsqa CLI (`cqa`)
//!
//! Question answering over insurance-claim CSV exports, plus the tooling
//! that builds a French instruction dataset from legal texts.
//!
//! ## Usage
//!
//! ```bash
//! cqa --config ./config/cqa.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cqa init` | Create the vector store and its schema |
//! | `cqa index` | Parse, enrich, embed and store the CSV folder |
//! | `cqa chat` | Index, then answer questions from stdin |
//! | `cqa ask "<q>"` | Answer one question against the existing index |
//! | `cqa extract` | PDF/TXT folder → JSONL corpus |
//! | `cqa instruct` | JSONL corpus → instruction dataset |
//! | `cqa submit` | Run `cqa instruct` as an Azure ML command job |
//!
//! Diagnostics go to stderr through `tracing`; set `RUST_LOG=claimsqa=debug`
//! for per-row detail.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use claimsqa::{cloud_job, config, extract, index, instruct, migrate, query};

/// claimsqa: retrieval-augmented Q&A over insurance claims data.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/cqa.example.toml` for every setting.
#[derive(Parser)]
#[command(name = "cqa", version, about = "Retrieval-augmented Q&A over insurance claims data")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/cqa.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the vector-store database and schema. Safe to re-run.
    Init,

    /// Parse the CSV folder, enrich rows with metadata.json, embed and store.
    ///
    /// Re-indexing replaces existing rows; unchanged chunks keep their
    /// embeddings.
    Index {
        /// Report counts without writing anything.
        #[arg(long)]
        dry_run: bool,

        /// CSV folder; overrides `corpus.folder`.
        #[arg(long)]
        folder: Option<PathBuf>,
    },

    /// Index the corpus, then answer questions interactively.
    Chat {
        /// Use the existing index as is.
        #[arg(long)]
        skip_index: bool,
    },

    /// Answer a single question against the existing index.
    Ask {
        /// The question.
        question: String,
    },

    /// Extract text from every PDF and TXT file in a folder into JSONL.
    Extract {
        /// Source folder; overrides `extract.input`.
        #[arg(long)]
        input: Option<PathBuf>,

        /// Output JSONL file; overrides `extract.output`.
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Generate question/answer pairs from a JSONL corpus.
    Instruct {
        /// Corpus JSONL; overrides `instruct.input`.
        #[arg(long)]
        input: Option<PathBuf>,

        /// Dataset JSONL; overrides `instruct.output`.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Documents per logged batch; overrides `instruct.batch_size`.
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Submit the instruction-generation job to Azure Machine Learning.
    Submit {
        /// Print the job definition without contacting Azure.
        #[arg(long)]
        dry_run: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("claimsqa=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// `extract`, `instruct` and `submit` run inside job containers that may
/// not carry a config file; they fall back to defaults.
fn load_or_default(path: &std::path::Path) -> anyhow::Result<config::Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        Ok(config::Config::minimal())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            let cfg = config::load_config(&cli.config)?;
            migrate::run_migrations(&cfg.store).await?;
            println!(
                "Vector store initialized at {}",
                cfg.store.db_file().display()
            );
        }
        Commands::Index { dry_run, folder } => {
            let cfg = config::load_config(&cli.config)?;
            index::run_index(&cfg, folder.as_deref(), dry_run).await?;
        }
        Commands::Chat { skip_index } => {
            let cfg = config::load_config(&cli.config)?;
            query::run_chat(&cfg, skip_index).await?;
        }
        Commands::Ask { question } => {
            let cfg = config::load_config(&cli.config)?;
            query::run_ask(&cfg, &question).await?;
        }
        Commands::Extract { input, output } => {
            let cfg = load_or_default(&cli.config)?;
            extract::run_extract(
                input.as_deref().unwrap_or(&cfg.extract.input),
                output.as_deref().unwrap_or(&cfg.extract.output),
            )?;
        }
        Commands::Instruct {
            input,
            output,
            batch_size,
        } => {
            let cfg = load_or_default(&cli.config)?;
            instruct::run_instruct(
                &cfg.instruct,
                input.as_deref(),
                output.as_deref(),
                batch_size,
            )
            .await?;
        }
        Commands::Submit { dry_run } => {
            let cfg = load_or_default(&cli.config)?;
            cloud_job::run_submit(&cfg.cloud, dry_run).await?;
        }
    }

    Ok(())
}
