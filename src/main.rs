//! # taxlens CLI
//!
//! ## Usage
//!
//! ```bash
//! taxlens --config ./config/taxlens.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `taxlens init` | Create the database and import the configured facts seed |
//! | `taxlens ingest [DIR]` | Index a directory of tax PDFs |
//! | `taxlens ask "<question>"` | Answer a question with citations |
//! | `taxlens search "<query>"` | Show ranked passages for a query |
//! | `taxlens facts import <file>` | Import a TOML facts seed |
//! | `taxlens facts get <topic> <subkey>` | Look up one structured fact |
//! | `taxlens facts history <topic> <subkey>` | All dated values of a fact |
//! | `taxlens facts tax <income>` | Resident income tax from the bracket facts |
//! | `taxlens ledger` | Print the document version ledger |
//!
//! Logs go to stderr and honour `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use taxlens::progress::ProgressMode;
use taxlens::store::sqlite::SqliteStore;
use taxlens::{answer, batch, config, facts, search, versions};

/// taxlens: versioned ingestion and cited answers for Singapore tax documents.
#[derive(Parser)]
#[command(name = "taxlens", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/taxlens.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and import `[facts] seed_path`.
    ///
    /// Idempotent: re-running only reports unchanged facts.
    Init,

    /// Ingest a directory of PDFs.
    ///
    /// Unchanged files are skipped, changed files replace their previous
    /// version atomically, and files missing since the last run are retired
    /// according to `ingest.removed_policy`.
    Ingest {
        /// Directory to ingest (defaults to `ingest.root`).
        dir: Option<PathBuf>,

        /// Glob overriding `ingest.include_globs`, e.g. "acts/**/*.pdf".
        #[arg(long)]
        pattern: Option<String>,

        /// Progress on stderr (default: human when stderr is a TTY).
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,

        /// Print the processing report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Answer a question.
    Ask {
        question: String,

        /// Tax year for structured facts; overrides any year in the question.
        #[arg(long)]
        as_of: Option<i32>,

        /// Print the full answer result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Rank indexed passages for a query.
    Search {
        query: String,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Structured tax facts.
    Facts {
        #[command(subcommand)]
        action: FactsAction,
    },

    /// Print the document version ledger.
    Ledger,
}

#[derive(Subcommand)]
enum FactsAction {
    /// Import a TOML seed file.
    Import { file: PathBuf },

    /// Look up one fact.
    Get {
        topic: String,
        subkey: String,
        #[arg(long)]
        as_of: Option<i32>,
    },

    /// All dated values of one fact, oldest first.
    History { topic: String, subkey: String },

    /// Resident income tax for a chargeable income.
    Tax {
        income: f64,
        #[arg(long)]
        as_of: Option<i32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let store = SqliteStore::open(&cfg).await?;
            let imported = match &cfg.facts.seed_path {
                Some(seed) => Some(facts::import_seed(&store, seed).await),
                None => None,
            };
            store.close().await;
            println!("Database initialized at {}.", cfg.db.path.display());
            if let Some(summary) = imported.transpose()? {
                println!(
                    "Facts seed: {} inserted, {} unchanged.",
                    summary.inserted, summary.unchanged
                );
            }
        }
        Commands::Ingest {
            dir,
            pattern,
            progress,
            json,
        } => {
            let progress = progress.unwrap_or_else(ProgressMode::default_for_tty);
            batch::run_ingest(&cfg, dir, pattern, progress, json).await?;
        }
        Commands::Ask {
            question,
            as_of,
            json,
        } => {
            answer::run_ask(&cfg, &question, as_of, json).await?;
        }
        Commands::Search { query, limit } => {
            search::run_search(&cfg, &query, limit).await?;
        }
        Commands::Facts { action } => match action {
            FactsAction::Import { file } => facts::run_import(&cfg, &file).await?,
            FactsAction::Get {
                topic,
                subkey,
                as_of,
            } => facts::run_get(&cfg, &topic, &subkey, as_of).await?,
            FactsAction::History { topic, subkey } => {
                facts::run_history(&cfg, &topic, &subkey).await?
            }
            FactsAction::Tax { income, as_of } => facts::run_tax(&cfg, income, as_of).await?,
        },
        Commands::Ledger => {
            versions::run_ledger(&cfg).await?;
        }
    }

    Ok(())
}
