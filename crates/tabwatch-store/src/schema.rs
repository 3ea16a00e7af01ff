/// SQL DDL for the tabwatch record store.
/// WAL mode enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;
"#;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    tab_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    username TEXT NOT NULL,
    source_ip TEXT,
    state TEXT,
    last_seen TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    version INTEGER NOT NULL,
    last_operation_id TEXT
);

CREATE TABLE IF NOT EXISTS telemetry_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    tab_id TEXT NOT NULL,
    state TEXT,
    event_type TEXT NOT NULL,
    operation_id TEXT,
    request_id TEXT,
    timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
CREATE INDEX IF NOT EXISTS idx_sessions_last_seen ON sessions(last_seen);
CREATE INDEX IF NOT EXISTS idx_logs_tab ON telemetry_logs(tab_id);
CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON telemetry_logs(timestamp);
"#;
