//! Durable backing store for sessions, users and the telemetry log.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::OptionalExtension;
use tracing::instrument;

use tabwatch_core::ids::{OperationId, RequestId, TabId, UserId};
use tabwatch_core::session::{EventKind, Session, SessionState, TelemetryLogEntry};

use crate::database::Database;
use crate::error::StoreError;

/// Keyed record store. Every call may fail transiently; callers go through
/// [`crate::RetryingExecutor`].
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_session(&self, tab_id: &TabId) -> Result<Option<Session>, StoreError>;

    /// Fails with [`StoreError::Duplicate`] if the tab already exists.
    async fn create_session(&self, session: &Session) -> Result<(), StoreError>;

    /// Fails with [`StoreError::NotFound`] if the tab does not exist.
    async fn update_session(&self, session: &Session) -> Result<(), StoreError>;

    /// Fails with [`StoreError::NotFound`] if the tab does not exist.
    async fn delete_session(&self, tab_id: &TabId) -> Result<(), StoreError>;

    async fn list_sessions_seen_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Session>, StoreError>;

    async fn list_stale_sessions(&self, cutoff: DateTime<Utc>) -> Result<Vec<Session>, StoreError>;

    async fn append_log(&self, entry: &TelemetryLogEntry) -> Result<(), StoreError>;

    async fn lookup_username(&self, user_id: &UserId) -> Result<Option<String>, StoreError>;

    /// Most recent telemetry log entries, newest first.
    async fn recent_logs(&self, limit: u32) -> Result<Vec<TelemetryLogEntry>, StoreError>;
}

/// Fixed-width timestamps so lexicographic order matches time order.
fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("invalid timestamp {raw:?}: {e}")))
}

const SESSION_COLUMNS: &str =
    "tab_id, user_id, username, source_ip, state, last_seen, updated_at, version, last_operation_id";

struct SessionRow {
    tab_id: String,
    user_id: String,
    username: String,
    source_ip: Option<String>,
    state: Option<String>,
    last_seen: String,
    updated_at: String,
    version: i64,
    last_operation_id: Option<String>,
}

impl SessionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            tab_id: row.get(0)?,
            user_id: row.get(1)?,
            username: row.get(2)?,
            source_ip: row.get(3)?,
            state: row.get(4)?,
            last_seen: row.get(5)?,
            updated_at: row.get(6)?,
            version: row.get(7)?,
            last_operation_id: row.get(8)?,
        })
    }

    fn into_session(self) -> Result<Session, StoreError> {
        Ok(Session {
            tab_id: TabId::from_raw(self.tab_id),
            user_id: UserId::from_raw(self.user_id),
            username: self.username,
            source_ip: self.source_ip,
            state: self.state.map(SessionState::from),
            last_seen: parse_ts(&self.last_seen)?,
            updated_at: parse_ts(&self.updated_at)?,
            version: u64::try_from(self.version).unwrap_or(0),
            last_operation_id: self.last_operation_id.map(OperationId::from_raw),
        })
    }
}

/// SQLite-backed [`RecordStore`].
#[derive(Clone)]
pub struct SqliteRecordStore {
    db: Database,
}

impl SqliteRecordStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or rename a user. User administration lives outside this service;
    /// this exists for seeding.
    pub fn upsert_user(&self, user_id: &UserId, username: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET username = excluded.username",
                rusqlite::params![user_id.as_str(), username, ts(&Utc::now())],
            )?;
            Ok(())
        })
    }

    fn query_sessions(&self, sql: &str, cutoff: &DateTime<Utc>) -> Result<Vec<Session>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([ts(cutoff)], SessionRow::from_row)?;
            let mut sessions = Vec::new();
            for row in rows {
                sessions.push(row?.into_session()?);
            }
            Ok(sessions)
        })
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    #[instrument(skip_all, fields(tab_id = %tab_id))]
    async fn get_session(&self, tab_id: &TabId) -> Result<Option<Session>, StoreError> {
        let row = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE tab_id = ?1"),
                    [tab_id.as_str()],
                    SessionRow::from_row,
                )
                .optional()?)
        })?;
        row.map(SessionRow::into_session).transpose()
    }

    async fn create_session(&self, s: &Session) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                &format!("INSERT INTO sessions ({SESSION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                rusqlite::params![
                    s.tab_id.as_str(),
                    s.user_id.as_str(),
                    s.username,
                    s.source_ip,
                    s.state.as_ref().map(SessionState::as_str),
                    ts(&s.last_seen),
                    ts(&s.updated_at),
                    s.version as i64,
                    s.last_operation_id.as_ref().map(OperationId::as_str),
                ],
            )?;
            Ok(())
        })
    }

    async fn update_session(&self, s: &Session) -> Result<(), StoreError> {
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE sessions SET user_id = ?2, username = ?3, source_ip = ?4, state = ?5,
                        last_seen = ?6, updated_at = ?7, version = ?8, last_operation_id = ?9
                 WHERE tab_id = ?1",
                rusqlite::params![
                    s.tab_id.as_str(),
                    s.user_id.as_str(),
                    s.username,
                    s.source_ip,
                    s.state.as_ref().map(SessionState::as_str),
                    ts(&s.last_seen),
                    ts(&s.updated_at),
                    s.version as i64,
                    s.last_operation_id.as_ref().map(OperationId::as_str),
                ],
            )?)
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("session {}", s.tab_id)));
        }
        Ok(())
    }

    async fn delete_session(&self, tab_id: &TabId) -> Result<(), StoreError> {
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM sessions WHERE tab_id = ?1", [tab_id.as_str()])?)
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("session {tab_id}")));
        }
        Ok(())
    }

    async fn list_sessions_seen_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Session>, StoreError> {
        self.query_sessions(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE last_seen >= ?1 ORDER BY user_id, tab_id"),
            &cutoff,
        )
    }

    async fn list_stale_sessions(&self, cutoff: DateTime<Utc>) -> Result<Vec<Session>, StoreError> {
        self.query_sessions(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE last_seen < ?1"),
            &cutoff,
        )
    }

    async fn append_log(&self, e: &TelemetryLogEntry) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO telemetry_logs (user_id, tab_id, state, event_type, operation_id, request_id, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    e.user_id.as_str(),
                    e.tab_id.as_str(),
                    e.state.as_ref().map(SessionState::as_str),
                    e.event_type.as_str(),
                    e.operation_id.as_ref().map(OperationId::as_str),
                    e.request_id.as_ref().map(RequestId::as_str),
                    ts(&e.timestamp),
                ],
            )?;
            Ok(())
        })
    }

    async fn lookup_username(&self, user_id: &UserId) -> Result<Option<String>, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT username FROM users WHERE id = ?1",
                    [user_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    async fn recent_logs(&self, limit: u32) -> Result<Vec<TelemetryLogEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, tab_id, state, event_type, operation_id, request_id, timestamp
                 FROM telemetry_logs ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?;

            let mut entries = Vec::new();
            for row in rows {
                let (user_id, tab_id, state, event_type, operation_id, request_id, timestamp) = row?;
                entries.push(TelemetryLogEntry {
                    user_id: UserId::from_raw(user_id),
                    tab_id: TabId::from_raw(tab_id),
                    state: state.map(SessionState::from),
                    event_type: EventKind::from(event_type),
                    operation_id: operation_id.map(OperationId::from_raw),
                    request_id: request_id.map(RequestId::from_raw),
                    timestamp: parse_ts(&timestamp)?,
                });
            }
            Ok(entries)
        })
    }
}
