//! # File Search Proxy CLI (`fsproxy`)
//!
//! ## Usage
//!
//! ```bash
//! fsproxy --config ./config/proxy.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `fsproxy serve` | Run the HTTP proxy and the scratch sweeper |
//! | `fsproxy sweep` | Remove stale staged uploads once and exit |
//! | `fsproxy state` | Show the active store and the number of recorded uploads |
//!
//! The remote API key is read from the environment variable named by
//! `[remote].api_key_env` (default `GOOGLE_API_KEY`).

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use clap::{Parser, Subcommand};

use filesearch_proxy::config;
use filesearch_proxy::ledger::Ledger;
use filesearch_proxy::logging;
use filesearch_proxy::server;
use filesearch_proxy::staging::ScratchDir;

/// HTTP proxy for the Gemini File Search API with duplicate-aware uploads.
#[derive(Parser)]
#[command(name = "fsproxy", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/proxy.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server.
    ///
    /// Stops gracefully on Ctrl-C or SIGTERM.
    Serve,

    /// Delete staged uploads older than the retention window.
    Sweep {
        /// Override `[sweep].max_age_secs`.
        #[arg(long)]
        max_age_secs: Option<u64>,
    },

    /// Print the persisted proxy state.
    State,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Sweep { max_age_secs } => {
            let scratch = ScratchDir::open(cfg.storage.scratch_dir.clone()).with_context(|| {
                format!(
                    "Failed to open scratch directory: {}",
                    cfg.storage.scratch_dir.display()
                )
            })?;
            let max_age = Duration::from_secs(max_age_secs.unwrap_or(cfg.sweep.max_age_secs));
            let report = scratch.sweep_older_than(max_age, SystemTime::now());
            println!(
                "Removed {} of {} staged files ({} failures)",
                report.removed, report.scanned, report.failed
            );
        }
        Commands::State => {
            let ledger =
                Ledger::load(cfg.storage.state_path.clone(), cfg.upload.persist_policy()).await;
            println!("State file:    {}", ledger.path().display());
            println!(
                "Active store:  {}",
                ledger.active_store().await.as_deref().unwrap_or("(none)")
            );
            println!("Uploads:       {}", ledger.len().await);
        }
    }

    Ok(())
}
