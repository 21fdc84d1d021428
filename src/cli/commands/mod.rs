//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific modules.

mod dump;
mod index;
mod load;
mod serve;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::sync::watch;

use crate::config::{load_settings, StoreBackend};

#[derive(Parser)]
#[command(name = "notecount")]
#[command(about = "Permission-scoped annotation counts per URL")]
#[command(version)]
pub struct Cli {
    /// Config file path (defaults to ./notecount.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Counter store backend (overrides config)
    #[arg(long, global = true, value_enum)]
    store: Option<StoreBackend>,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Run the count server
    Serve {
        /// Bind address: port, host, or host:port (default from config)
        #[arg(short, long, env = "NOTECOUNT_BIND")]
        bind: Option<String>,
        /// Also run the indexer in this process
        #[arg(long)]
        with_indexer: bool,
    },

    /// Keep the counter index in sync with the annotation store
    Index {
        /// Run a single indexing cycle and exit
        #[arg(long)]
        once: bool,
    },

    /// Index annotations from a dump file
    Load {
        /// Dump file written by `dump`
        path: PathBuf,
    },

    /// Dump search API results to a file for later loading
    Dump {
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Search requests in flight per round
        #[arg(long, default_value = "10")]
        concurrency: usize,
    },
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = load_settings(cli.config.as_deref())?;
    if let Some(store) = cli.store {
        settings.store = store;
    }

    match cli.command {
        Commands::Serve { bind, with_indexer } => {
            if let Some(bind) = bind {
                settings.bind = bind;
            }
            serve::cmd_serve(&settings, with_indexer).await
        }
        Commands::Index { once } => index::cmd_index(&settings, once).await,
        Commands::Load { path } => load::cmd_load(&settings, &path).await,
        Commands::Dump {
            output,
            concurrency,
        } => dump::cmd_dump(&settings, output.as_deref(), concurrency).await,
    }
}

/// Receiver that flips to `true` on Ctrl+C.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
        }
        let _ = tx.send(true);
    });
    rx
}
