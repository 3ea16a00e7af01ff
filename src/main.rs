//! # tabwatch
//!
//! Tab presence telemetry server binary: loads configuration, initialises
//! logging, opens the durable store and write queue, and serves until ctrl-c.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};

use tabwatch_core::Config;
use tabwatch_store::{Database, DurableWriteQueue, RecordStore, SqliteRecordStore};
use tabwatch_telemetry::{init_telemetry, TelemetryConfig};

/// Tab presence telemetry server.
#[derive(Parser, Debug)]
#[command(name = "tabwatch", about = "Tab presence telemetry server")]
struct Cli {
    /// Port to bind (0 for auto-assign). Overrides `TABWATCH_PORT`.
    #[arg(long)]
    port: Option<u16>,

    /// Directory for the SQLite databases and the write-queue log.
    /// Overrides `TABWATCH_DATA_DIR`.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Default log level; `RUST_LOG` still wins.
    #[arg(long, default_value = "info")]
    log_level: Level,
}

fn load_config(cli: &Cli) -> Config {
    let mut config = Config::from_env();
    if let Some(dir) = &cli.data_dir {
        let default_log = config.data_dir.join("hotpath-queue.log");
        if config.queue.log_path == default_log {
            config.queue.log_path = dir.join("hotpath-queue.log");
        }
        config.data_dir = dir.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    config
}

fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))
}

/// Durable mode never falls back to an in-memory queue.
fn open_write_queue(config: &Config) -> Result<DurableWriteQueue> {
    let policy = config.saturation_policy();
    if !config.flags.durable_queue {
        return Ok(DurableWriteQueue::in_memory(&config.queue, policy));
    }
    DurableWriteQueue::open(&config.queue, policy).with_context(|| {
        format!("Failed to open write-queue log: {}", config.queue.log_path.display())
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli);
    ensure_dir(&config.data_dir)?;
    if let Some(parent) = config.queue.log_path.parent() {
        ensure_dir(parent)?;
    }

    let mut telemetry = TelemetryConfig::new(config.log_database_path());
    telemetry.log_level = cli.log_level;
    let guard = init_telemetry(telemetry);

    let db = Database::open(&config.database_path())
        .with_context(|| format!("Failed to open database: {}", config.database_path().display()))?;
    let store: Arc<dyn RecordStore> = Arc::new(SqliteRecordStore::new(db));

    let queue = open_write_queue(&config)?;

    info!(
        data_dir = %config.data_dir.display(),
        flags = ?config.flags,
        "starting tabwatch"
    );
    let handle = tabwatch_server::start(&config, store, Arc::new(queue), guard.logs())
        .await
        .context("Failed to start server")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    info!("shutdown requested");
    handle.shutdown().await;
    info!("tabwatch stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_blocked_log() -> Config {
        let dir = std::env::temp_dir().join(format!("tabwatch-main-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        // The log's parent is a regular file, so the log can never be created.
        let blocker = dir.join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let mut config = Config::with_data_dir(dir);
        config.queue.log_path = blocker.join("hotpath-queue.log");
        config
    }

    #[test]
    fn durable_queue_failure_is_fatal() {
        let config = config_with_blocked_log();
        assert!(config.flags.durable_queue);
        let err = open_write_queue(&config).err().unwrap();
        assert!(err.to_string().contains("Failed to open write-queue log"));
    }

    #[test]
    fn best_effort_mode_uses_memory_queue() {
        let mut config = config_with_blocked_log();
        config.flags.durable_queue = false;
        let queue = open_write_queue(&config).unwrap();
        assert!(!queue.is_durable());
    }
}
