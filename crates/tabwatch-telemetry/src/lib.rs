mod health;
mod logging;

pub use health::{HealthAggregator, HealthSignal, HealthSnapshot, HealthStatus, LatencyStats, Outcome};
pub use logging::{LogKind, LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink, AUDIT_TARGET};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "tabwatch_store" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Whether to persist warn+ and audit logs to SQLite.
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
}

impl TelemetryConfig {
    pub fn new(log_db_path: PathBuf) -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            log_to_sqlite: true,
            log_db_path,
        }
    }
}

/// Keeps the persisted log sink reachable for diagnostics queries.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
}

impl TelemetryGuard {
    /// Access the log sink for querying persisted logs.
    pub fn logs(&self) -> Option<Arc<SqliteLogSink>> {
        self.log_sink.clone()
    }
}

/// Initialize the tracing subscriber. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let (subscriber, log_sink) = build_subscriber(&config);
    subscriber.init();
    TelemetryGuard { log_sink }
}

fn build_subscriber(
    config: &TelemetryConfig,
) -> (impl tracing::Subscriber + Send + Sync + 'static, Option<Arc<SqliteLogSink>>) {
    let mut filter_str = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_span_list(true)
        .with_filter(env_filter);

    let (sqlite_layer, sqlite_sink) = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                (Some(SqliteLogLayer::new(sink.clone())), Some(sink))
            }
            Err(e) => {
                eprintln!("tabwatch-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    let subscriber = tracing_subscriber::registry()
        .with(fmt_layer)
        // Unfiltered: audit events bypass the env filter so the trail stays complete at any level.
        .with(sqlite_layer);
    (subscriber, sqlite_sink)
}
