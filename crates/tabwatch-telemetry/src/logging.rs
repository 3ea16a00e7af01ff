use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

pub use tabwatch_core::AUDIT_TARGET;

/// Whether a persisted row came from an ordinary warn+ event or the audit trail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Log,
    Audit,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Audit => "audit",
        }
    }
}

/// A log record persisted to SQLite.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub kind: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub request_id: Option<String>,
    pub tab_id: Option<String>,
    pub user_id: Option<String>,
}

/// Query parameters for searching persisted logs.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct LogQuery {
    pub kind: Option<LogKind>,
    pub level: Option<String>,
    pub target: Option<String>,
    pub tab_id: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// SQLite sink for warn+ and audit events.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        Self::with_connection(Connection::open(db_path)?)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 kind TEXT NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 fields TEXT,
                 request_id TEXT,
                 tab_id TEXT,
                 user_id TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_logs_kind ON logs(kind, id);
             CREATE INDEX IF NOT EXISTS idx_logs_tab ON logs(tab_id);
             CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, record: &LogInsert) {
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, kind, level, target, message, fields, request_id, tab_id, user_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                record.timestamp,
                record.kind.as_str(),
                record.level,
                record.target,
                record.message,
                record.fields,
                record.request_id,
                record.tab_id,
                record.user_id,
            ],
        );
    }

    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, kind, level, target, message, fields, request_id, tab_id, user_id FROM logs WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(kind) = &q.kind {
            sql.push_str(&format!(" AND kind = ?{}", params.len() + 1));
            params.push(Box::new(kind.as_str()));
        }
        if let Some(level) = &q.level {
            sql.push_str(&format!(" AND level = ?{}", params.len() + 1));
            params.push(Box::new(level.to_uppercase()));
        }
        if let Some(target) = &q.target {
            sql.push_str(&format!(" AND target LIKE ?{}", params.len() + 1));
            params.push(Box::new(format!("%{target}%")));
        }
        if let Some(tab_id) = &q.tab_id {
            sql.push_str(&format!(" AND tab_id = ?{}", params.len() + 1));
            params.push(Box::new(tab_id.clone()));
        }
        if let Some(since) = &q.since {
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len() + 1));
            params.push(Box::new(since.clone()));
        }

        sql.push_str(" ORDER BY id DESC");

        let limit = q.limit.unwrap_or(100).min(1000);
        sql.push_str(&format!(" LIMIT {limit}"));

        let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                kind: row.get(2)?,
                level: row.get(3)?,
                target: row.get(4)?,
                message: row.get(5)?,
                fields: row.get(6)?,
                request_id: row.get(7)?,
                tab_id: row.get(8)?,
                user_id: row.get(9)?,
            })
        })?;

        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

struct LogInsert {
    timestamp: String,
    kind: LogKind,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    request_id: Option<String>,
    tab_id: Option<String>,
    user_id: Option<String>,
}

/// tracing Layer that writes warn+ and audit events to SQLite.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

/// Correlation fields lifted out of an event or span.
#[derive(Clone, Default)]
struct Correlation {
    request_id: Option<String>,
    tab_id: Option<String>,
    user_id: Option<String>,
}

impl Correlation {
    fn fill_from(&mut self, other: &Correlation) {
        if self.request_id.is_none() {
            self.request_id.clone_from(&other.request_id);
        }
        if self.tab_id.is_none() {
            self.tab_id.clone_from(&other.tab_id);
        }
        if self.user_id.is_none() {
            self.user_id.clone_from(&other.user_id);
        }
    }

    fn is_empty(&self) -> bool {
        self.request_id.is_none() && self.tab_id.is_none() && self.user_id.is_none()
    }

    fn is_complete(&self) -> bool {
        self.request_id.is_some() && self.tab_id.is_some() && self.user_id.is_some()
    }
}

struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    correlation: Correlation,
}

impl FieldVisitor {
    fn new() -> Self {
        Self {
            message: None,
            fields: serde_json::Map::new(),
            correlation: Correlation::default(),
        }
    }

    fn record_text(&mut self, name: &str, value: String) {
        match name {
            "message" => self.message = Some(value),
            "request_id" => self.correlation.request_id = Some(value),
            "tab_id" => self.correlation.tab_id = Some(value),
            "user_id" => self.correlation.user_id = Some(value),
            name => {
                self.fields.insert(name.to_string(), serde_json::Value::String(value));
            }
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let val = format!("{:?}", value);
        let val = if field.name() == "message" {
            val
        } else {
            val.trim_matches('"').to_string()
        };
        self.record_text(field.name(), val);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_text(field.name(), value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

/// Whether an event should be persisted, and as what.
fn classify(metadata: &tracing::Metadata<'_>) -> Option<LogKind> {
    if metadata.target() == AUDIT_TARGET {
        Some(LogKind::Audit)
    } else if *metadata.level() <= tracing::Level::WARN {
        Some(LogKind::Log)
    } else {
        None
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let Some(kind) = classify(event.metadata()) else {
            return;
        };

        let mut visitor = FieldVisitor::new();
        event.record(&mut visitor);

        if !visitor.correlation.is_complete() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    let extensions = span.extensions();
                    if let Some(fields) = extensions.get::<Correlation>() {
                        visitor.correlation.fill_from(fields);
                    }
                }
            }
        }

        let fields_json = if visitor.fields.is_empty() {
            None
        } else {
            serde_json::to_string(&visitor.fields).ok()
        };

        let record = LogInsert {
            timestamp: Utc::now().to_rfc3339(),
            kind,
            level: event.metadata().level().to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields: fields_json,
            request_id: visitor.correlation.request_id,
            tab_id: visitor.correlation.tab_id,
            user_id: visitor.correlation.user_id,
        };

        self.sink.insert(&record);
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::new();
        attrs.record(&mut visitor);

        if !visitor.correlation.is_empty() {
            if let Some(span) = ctx.span(id) {
                span.extensions_mut().insert(visitor.correlation);
            }
        }
    }
}
