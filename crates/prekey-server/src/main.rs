//! Prekey server binary.
//!
//! # Usage
//!
//! ```bash
//! # Watch one-time prekey pools, logging users below 20 unused keys
//! prekey-server --db prekeys.db monitor --threshold 20 --interval-secs 30
//!
//! # Inspect the store, also while a monitor has it open
//! prekey-server --db prekeys.db count --user alice
//! prekey-server --db prekeys.db users
//!
//! # Single-process redb store; a second process gets a "locked" error
//! prekey-server --backend redb --db prekeys.redb users
//!
//! # Validate the envelope key before deploying it
//! PREKEY_ENVELOPE_KEY=<64 hex chars> prekey-server check-key
//! ```

use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand, ValueEnum};
use prekey_crypto::{Envelope, KeyEnvelope};
use prekey_server::{KeyStore, OpkMonitor, RedbStorage, ServiceConfig, SqliteStorage, StorageError};
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// X3DH prekey bundle store
#[derive(Parser)]
#[command(name = "prekey-server")]
#[command(about = "X3DH prekey bundle store maintenance")]
#[command(version)]
struct Args {
    /// Storage backend
    #[arg(
        long,
        env = "PREKEY_BACKEND",
        value_enum,
        default_value_t = Backend::Sqlite,
        global = true
    )]
    backend: Backend,

    /// Path to the database file
    #[arg(long, env = "PREKEY_DB", default_value = "prekeys.db", global = true)]
    db: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Deadline for each store operation, in milliseconds
    #[arg(long, default_value = "5000", global = true)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// SQLite; any number of processes may share the file
    Sqlite,
    /// redb; one process at a time
    Redb,
}

#[derive(Subcommand)]
enum Command {
    /// Log users whose one-time prekey pool is low, until Ctrl-C
    Monitor {
        /// Report users with fewer unused keys than this
        #[arg(long, default_value = "10")]
        threshold: usize,

        /// Seconds between scans
        #[arg(long, default_value = "60", value_parser = clap::value_parser!(u64).range(1..))]
        interval_secs: u64,
    },

    /// Number of unused one-time prekeys for a user
    Count {
        /// User to count
        #[arg(long)]
        user: String,
    },

    /// Users that have uploaded one-time prekeys
    Users,

    /// Check that the envelope key is valid and can seal and open
    CheckKey {
        /// Envelope key, 64 hex characters
        #[arg(long, env = "PREKEY_ENVELOPE_KEY", hide_env_values = true)]
        envelope_key: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let config = ServiceConfig {
        op_timeout: Duration::from_millis(args.timeout_ms),
        ..ServiceConfig::default()
    };

    let db = args.db;
    match args.backend {
        Backend::Sqlite => run(args.command, config, || SqliteStorage::open(&db)).await,
        Backend::Redb => run(args.command, config, || RedbStorage::open(&db)).await,
    }
}

/// Execute `command`, opening the store only for commands that need one.
async fn run<S: KeyStore>(
    command: Command,
    config: ServiceConfig,
    open: impl FnOnce() -> Result<S, StorageError>,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Monitor { threshold, interval_secs } => {
            let storage = open()?;
            tracing::info!("Store opened");

            let config = ServiceConfig {
                low_watermark: threshold,
                monitor_interval: Duration::from_secs(interval_secs),
                ..config
            };

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let monitor = tokio::spawn(OpkMonitor::from_config(storage, &config).run(shutdown_rx));

            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutdown requested");

            shutdown_tx.send(true)?;
            let stats = monitor.await?;
            tracing::info!(scans = stats.scans, failures = stats.failures, "Monitor exited");
        },

        Command::Count { user } => {
            let storage = open()?;
            let available = storage.count_available_opks(&config.op_context(), &user)?;
            tracing::info!(user_id = %user, available, "Unused one-time prekeys");
        },

        Command::Users => {
            let storage = open()?;
            let users = storage.list_users_with_opks(&config.op_context())?;
            for user in &users {
                tracing::info!(user_id = %user, "Has one-time prekeys");
            }
            tracing::info!(total = users.len(), "Users with one-time prekeys");
        },

        Command::CheckKey { envelope_key } => {
            let envelope = KeyEnvelope::from_hex(envelope_key.trim())?;
            let token = envelope.seal(b"prekey-server key check")?;
            envelope.open(&token)?;
            tracing::info!("Envelope key OK");
        },
    }

    Ok(())
}
