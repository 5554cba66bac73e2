//! HBLACKPIX CLI - inspect and operate the client infrastructure state file.
//!
//! Every command opens the SQLite state file shared by the cache, the rate
//! limiter, the security tables and the offline queue, and prints JSON.

mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hblackpix_core::config::StorageDefaults;
use hblackpix_core::RuntimeConfig;
use std::path::PathBuf;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "hblackpix")]
#[command(about = "Operate the HBLACKPIX client cache, rate limits and offline queue")]
struct Args {
    /// State database (defaults to the platform data directory)
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Cache inspection and maintenance
    #[command(subcommand)]
    Cache(CacheCommand),

    /// Server-side rate limits
    #[command(subcommand)]
    Limit(LimitCommand),

    /// Recent security audit events
    Audit {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Offline action queue
    #[command(subcommand)]
    Offline(OfflineCommand),

    /// Parse a payment external reference
    Reference { reference: String },

    /// Storage usage per namespace
    Usage,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    /// Hit/miss counters and entry counts
    Stats,
    /// Read one entry
    Get { key: String },
    /// Store a JSON value
    Set {
        key: String,
        value: String,
        /// TTL in seconds (defaults to the configured TTL)
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
    /// Remove one entry
    Delete { key: String },
    /// Remove entries by key prefix
    Invalidate { prefix: String },
    /// Remove every entry
    Clear,
    /// Purge expired entries
    Sweep {
        /// Keep sweeping on the configured interval until Ctrl-C
        #[arg(long)]
        watch: bool,
    },
}

#[derive(Subcommand, Debug)]
enum LimitCommand {
    /// Count one attempt and report the decision
    Check {
        identifier: String,
        action: String,
        /// Override the configured policy's maximum
        #[arg(long, requires = "window_secs")]
        max: Option<u32>,
        #[arg(long, requires = "max")]
        window_secs: Option<u64>,
    },
    /// Clear a counter
    Reset { identifier: String, action: String },
    /// Show a counter and the identifier's risk level
    Show { identifier: String, action: String },
}

#[derive(Subcommand, Debug)]
enum OfflineCommand {
    /// List pending actions
    List,
    /// Queue an action with a JSON payload
    Queue {
        action_type: String,
        data: String,
    },
    /// Drop every pending action
    Clear,
}

fn default_state_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(StorageDefaults::DATA_DIR_NAME)
        .join(StorageDefaults::DB_FILE_NAME)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout stays machine-readable
    let log_level = if args.debug { Level::DEBUG } else { Level::WARN };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let config = match &args.config {
        Some(path) => RuntimeConfig::from_json_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    let state_path = args.state.unwrap_or_else(default_state_path);
    debug!("State file: {}", state_path.display());

    let state = commands::State::open(&state_path, config)
        .with_context(|| format!("opening state file {}", state_path.display()))?;

    let output = match args.command {
        Command::Cache(cmd) => match cmd {
            CacheCommand::Stats => commands::cache_stats(&state),
            CacheCommand::Get { key } => commands::cache_get(&state, &key),
            CacheCommand::Set {
                key,
                value,
                ttl_secs,
            } => commands::cache_set(&state, &key, &value, ttl_secs)?,
            CacheCommand::Delete { key } => commands::cache_delete(&state, &key),
            CacheCommand::Invalidate { prefix } => commands::cache_invalidate(&state, &prefix),
            CacheCommand::Clear => commands::cache_clear(&state),
            CacheCommand::Sweep { watch: false } => commands::cache_sweep(&state),
            CacheCommand::Sweep { watch: true } => commands::cache_watch(state).await?,
        },
        Command::Limit(cmd) => match cmd {
            LimitCommand::Check {
                identifier,
                action,
                max,
                window_secs,
            } => commands::limit_check(&state, &identifier, &action, max.zip(window_secs))?,
            LimitCommand::Reset { identifier, action } => {
                commands::limit_reset(&state, &identifier, &action)?
            }
            LimitCommand::Show { identifier, action } => {
                commands::limit_show(&state, &identifier, &action)?
            }
        },
        Command::Audit { limit } => commands::audit(&state, limit)?,
        Command::Offline(cmd) => match cmd {
            OfflineCommand::List => commands::offline_list(&state),
            OfflineCommand::Queue { action_type, data } => {
                commands::offline_queue(&state, &action_type, &data)?
            }
            OfflineCommand::Clear => commands::offline_clear(&state),
        },
        Command::Reference { reference } => commands::reference(&reference)?,
        Command::Usage => commands::usage(&state)?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
