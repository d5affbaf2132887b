//! # Main — CLI Entry Point
//!
//! Loads `.env`, initialises logging, merges configuration, builds the
//! [`AppContext`](channelpulse::context::AppContext), and dispatches to the
//! subcommand handlers in `cli.rs`.
//!
//! ## Subcommands
//!
//! - `serve`: scheduler plus HTTP server (health, metrics, task history).
//! - `run <task>`: run `stats-sync` or `snapshot-prune` once.
//! - `backend`: print the selected storage and KV backends.
//! - `channels add|list|update|remove`: manage tracked channels.
//! - `history`: recent task execution records.
//! - `stats <channel>`: per-day stats for one channel.
//!
//! ## Configuration precedence
//!
//! Command-line flag, then environment variable, then the TOML file given by
//! `--config`, then built-in defaults.

mod cli;

use anyhow::Result;
use channelpulse::config::{Connections, Settings};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "channelpulse", about = "Sync and serve channel metrics", version)]
struct Cli {
    /// TOML settings file
    #[arg(long, env = "CHANNELPULSE_CONFIG")]
    config: Option<PathBuf>,

    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Directory for the filesystem storage backend
    #[arg(long, env = "DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Key-value store URL: https:// (REST), redis:// or rediss:// (TCP).
    /// Unset means a process-local store; locks then only exclude within
    /// this process.
    #[arg(long, env = "KV_URL")]
    kv_url: Option<String>,

    /// Bearer token for the REST key-value store
    #[arg(long, env = "KV_REST_TOKEN", hide_env_values = true)]
    kv_rest_token: Option<String>,

    /// Base URL of the channel metrics provider
    #[arg(long, env = "PROVIDER_URL")]
    provider_url: Option<String>,

    /// API key for the metrics provider
    #[arg(long, env = "PROVIDER_API_KEY", hide_env_values = true)]
    provider_api_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the task scheduler and the HTTP server
    Serve {
        #[arg(long, env = "PORT", default_value_t = 7070)]
        port: u16,
    },
    /// Run one task now (stats-sync or snapshot-prune)
    Run {
        task: String,
    },
    /// Show which storage and key-value backends are in use
    Backend,
    /// Manage tracked channels
    Channels {
        #[command(subcommand)]
        action: ChannelAction,
    },
    /// Show recent task executions
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show per-day stats for a channel
    Stats {
        /// Channel id
        channel: String,
        /// First local day (YYYY-MM-DD)
        #[arg(long)]
        start: Option<chrono::NaiveDate>,
        /// Last local day (YYYY-MM-DD)
        #[arg(long)]
        end: Option<chrono::NaiveDate>,
    },
}

#[derive(Subcommand)]
pub enum ChannelAction {
    /// Track a new channel
    Add {
        #[arg(long)]
        name: String,
        /// Provider-side channel id
        #[arg(long)]
        external_id: String,
        /// IANA timezone for day bucketing
        #[arg(long, default_value = "UTC")]
        timezone: String,
    },
    /// List tracked channels
    List,
    /// Rename a channel or change its timezone
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        /// IANA timezone for day bucketing
        #[arg(long)]
        timezone: Option<String>,
    },
    /// Stop tracking a channel and drop its snapshots
    Remove {
        id: String,
    },
}

impl Cli {
    fn connections(&self) -> Connections {
        let nonempty = |s: &Option<String>| s.clone().filter(|v| !v.trim().is_empty());
        Connections {
            database_url: nonempty(&self.database_url),
            data_dir: self.data_dir.clone().filter(|p| !p.as_os_str().is_empty()),
            kv_url: nonempty(&self.kv_url),
            kv_rest_token: nonempty(&self.kv_rest_token),
            provider_url: nonempty(&self.provider_url),
            provider_api_key: nonempty(&self.provider_api_key),
        }
    }

    fn settings(&self) -> Result<Settings> {
        let mut settings = Settings::load(self.config.as_deref())?;
        settings.connections = settings.connections.overlay(self.connections());
        Ok(settings)
    }
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // LOG_FORMAT=json for log shippers, human-readable otherwise; stdout stays
    // reserved for command output
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();
    let settings = cli.settings()?;
    let rt = tokio::runtime::Runtime::new()?;

    match &cli.command {
        Commands::Serve { port } => rt.block_on(cli::run_serve(settings, *port)),
        Commands::Run { task } => rt.block_on(cli::run_task(settings, task)),
        Commands::Backend => rt.block_on(cli::run_backend(settings)),
        Commands::Channels { action } => rt.block_on(cli::run_channels(settings, action)),
        Commands::History { limit } => rt.block_on(cli::run_history(settings, *limit)),
        Commands::Stats {
            channel,
            start,
            end,
        } => rt.block_on(cli::run_stats(settings, channel, *start, *end)),
    }
}
