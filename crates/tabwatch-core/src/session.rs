use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::IngestError;
use crate::ids::{OperationId, RequestId, TabId, UserId};

/// Visibility state reported by a browser tab.
///
/// Unknown strings are carried through untouched so newer clients never fail
/// ingestion on an older server.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SessionState {
    Focused,
    VisibleUnfocused,
    Hidden,
    Other(String),
}

/// State value the client sends when it believes the tab is being closed.
pub const TAB_PROBABLY_CLOSED: &str = "TAB_PROBABLY_CLOSED";

impl SessionState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Focused => "FOCUSED",
            Self::VisibleUnfocused => "VISIBLE_UNFOCUSED",
            Self::Hidden => "HIDDEN",
            Self::Other(s) => s,
        }
    }

    pub fn is_probably_closed(&self) -> bool {
        self.as_str() == TAB_PROBABLY_CLOSED
    }
}

impl From<String> for SessionState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "FOCUSED" => Self::Focused,
            "VISIBLE_UNFOCUSED" => Self::VisibleUnfocused,
            "HIDDEN" => Self::Hidden,
            _ => Self::Other(s),
        }
    }
}

impl From<SessionState> for String {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Other(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound event type (`type` on the wire).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    Heartbeat,
    StateChange,
    Init,
    Shutdown,
    PeriodicLog,
    ManualDisconnect,
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::StateChange => "state_change",
            Self::Init => "init",
            Self::Shutdown => "shutdown",
            Self::PeriodicLog => "periodic_log",
            Self::ManualDisconnect => "manual_disconnect",
            Self::Other(s) => s,
        }
    }

    /// Event types that append an audit row to the telemetry log.
    pub fn is_state_changing(&self) -> bool {
        matches!(
            self,
            Self::StateChange | Self::Init | Self::Shutdown | Self::PeriodicLog | Self::ManualDisconnect
        )
    }
}

impl From<String> for EventKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "heartbeat" => Self::Heartbeat,
            "state_change" => Self::StateChange,
            "init" => Self::Init,
            "shutdown" => Self::Shutdown,
            "periodic_log" => Self::PeriodicLog,
            "manual_disconnect" => Self::ManualDisconnect,
            _ => Self::Other(s),
        }
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Other(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tab's authoritative session record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub tab_id: TabId,
    pub user_id: UserId,
    pub username: String,
    pub source_ip: Option<String>,
    pub state: Option<SessionState>,
    pub last_seen: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
    pub last_operation_id: Option<OperationId>,
}

impl Session {
    /// True when no heartbeat arrived within `stale_after` of `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_seen) > stale_after
    }
}

/// Append-only audit row written for state-changing events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryLogEntry {
    pub user_id: UserId,
    pub tab_id: TabId,
    pub state: Option<SessionState>,
    pub event_type: EventKind,
    pub operation_id: Option<OperationId>,
    pub request_id: Option<RequestId>,
    pub timestamp: DateTime<Utc>,
}

/// Result of an accepted upsert.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertOutcome {
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Per-user rollup served to dashboards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
    pub user_id: UserId,
    pub username: String,
    pub tab_count: usize,
    pub distinct_ips: usize,
}

/// Converts a configured duration for timestamp arithmetic, saturating at ten years.
pub fn chrono_span(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(3650))
}

/// Sessions grouped by user, then by tab.
pub type SessionMap = BTreeMap<UserId, BTreeMap<TabId, Session>>;

pub fn group_by_user(sessions: impl IntoIterator<Item = Session>) -> SessionMap {
    let mut map = SessionMap::new();
    for session in sessions {
        map.entry(session.user_id.clone())
            .or_default()
            .insert(session.tab_id.clone(), session);
    }
    map
}

/// Raw ingestion body as sent by the browser.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub tab_id: Option<String>,
    #[serde(default, rename = "type")]
    pub event_type: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub operation_id: Option<String>,
    #[serde(default)]
    pub version: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
}

/// A validated event ready for the ingestion pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionEvent {
    pub user_id: UserId,
    pub tab_id: TabId,
    pub kind: EventKind,
    pub state: Option<SessionState>,
    pub operation_id: OperationId,
    pub expected_version: Option<u64>,
    pub source_ip: Option<String>,
    pub request_id: RequestId,
}

impl SessionEvent {
    /// Shutdown events and "probably closed" states remove the session instead of upserting it.
    pub fn is_shutdown(&self) -> bool {
        self.kind == EventKind::Shutdown
            || self.state.as_ref().is_some_and(SessionState::is_probably_closed)
    }
}

impl TelemetryRequest {
    pub fn validate(
        self,
        source_ip: Option<String>,
        request_id: RequestId,
    ) -> Result<SessionEvent, IngestError> {
        let user_id = self.user_id.filter(|s| !s.is_empty());
        let tab_id = self.tab_id.filter(|s| !s.is_empty());
        let (user_id, tab_id) = match (user_id, tab_id) {
            (Some(u), Some(t)) => (u, t),
            _ => return Err(IngestError::Validation("missing identity".into())),
        };

        let event_type = self.event_type.unwrap_or_default();
        let timestamp = self.timestamp.map(|v| match v {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        });
        let operation_id = match self.operation_id.filter(|s| !s.is_empty()) {
            Some(op) => OperationId::from_raw(op),
            None => OperationId::derive(&user_id, &tab_id, &event_type, timestamp.as_deref()),
        };

        Ok(SessionEvent {
            user_id: UserId::from_raw(user_id),
            tab_id: TabId::from_raw(tab_id),
            kind: EventKind::from(event_type),
            state: self.state.filter(|s| !s.is_empty()).map(SessionState::from),
            operation_id,
            expected_version: self.version,
            source_ip,
            request_id,
        })
    }
}
