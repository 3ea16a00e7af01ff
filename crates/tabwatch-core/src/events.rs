use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::UserId;
use crate::session::{SessionMap, UserStats};

/// What happened to a user's session set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Update,
    Disconnected,
}

/// Incremental update pushed to subscribers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdate {
    pub user_id: UserId,
    pub event_type: UpdateKind,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<UserStats>,
}

/// Server -> subscriber messages on the real-time channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum BroadcastEvent {
    #[serde(rename = "full_snapshot")]
    FullSnapshot(SessionMap),

    #[serde(rename = "session_update")]
    SessionUpdate(SessionUpdate),

    #[serde(rename = "ping")]
    Ping { server_ts: i64 },
}

/// Subscriber -> server messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscriberMessage {
    Pong,
}

impl BroadcastEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::FullSnapshot(_) => "full_snapshot",
            Self::SessionUpdate(_) => "session_update",
            Self::Ping { .. } => "ping",
        }
    }

    pub fn to_wire(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}
