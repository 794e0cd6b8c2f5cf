//! # docwatch CLI
//!
//! ## Usage
//!
//! ```bash
//! docwatch --config ./config/docwatch.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docwatch init` | Create the SQLite database and run schema migrations |
//! | `docwatch sweep` | Reconcile the catalog with the watched folder once |
//! | `docwatch list` | List catalogued documents, newest first |
//! | `docwatch watch` | Reconcile, then index changes live until Ctrl-C |
//!
//! Logging goes to stderr and honours `RUST_LOG` (default `docwatch=info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use docwatch::{app, config, db, migrate, query};

/// docwatch: keeps a thumbnail catalog of a watched document folder.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docwatch.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docwatch",
    about = "Watch a document folder and keep a catalog with thumbnails",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docwatch.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the documents, thumbnails and
    /// conflicts tables. Safe to run repeatedly.
    Init,

    /// Reconcile once: drop documents whose file is gone, regenerate missing
    /// thumbnails, and index files not yet catalogued.
    Sweep,

    /// List documents, newest first.
    List {
        /// Case-insensitive substring matched against filename or title.
        #[arg(long, short)]
        query: Option<String>,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Watch the configured folder until Ctrl-C.
    ///
    /// Runs a startup reconciliation first. Exits non-zero if the OS
    /// notification source fails.
    Watch {
        /// Print every change event to stdout as one JSON line.
        #[arg(long)]
        print_events: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "docwatch=info".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Sweep => {
            app::run_sweep(&cfg).await?;
        }
        Commands::List { query, json } => {
            query::run_list(&cfg, query.as_deref(), json).await?;
        }
        Commands::Watch { print_events } => {
            app::run_watch(&cfg, print_events).await?;
        }
    }

    Ok(())
}
