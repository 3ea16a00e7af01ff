use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

// Tab and user ids arrive from clients; `new()` is only used by tests and tooling.
branded_id!(TabId, "tab");
branded_id!(UserId, "user");
branded_id!(OperationId, "op");
branded_id!(TaskId, "task");
branded_id!(SubscriberId, "sub");
branded_id!(RequestId, "req");

impl OperationId {
    /// Derive a stable id for an event that carries no client operation id.
    ///
    /// Client retries of the same logical event hash to the same value, so they
    /// collapse onto one idempotency entry.
    pub fn derive(user_id: &str, tab_id: &str, event_type: &str, timestamp: Option<&str>) -> Self {
        let base = format!(
            "{}:{}:{}:{}",
            non_empty_or(user_id, "unknown"),
            non_empty_or(tab_id, "unknown"),
            non_empty_or(event_type, "unknown"),
            timestamp.filter(|t| !t.is_empty()).unwrap_or("na"),
        );
        Self(format!("{:x}", Sha256::digest(base.as_bytes())))
    }
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_have_prefix() {
        assert!(TaskId::new().as_str().starts_with("task_"));
        assert!(SubscriberId::new().as_str().starts_with("sub_"));
        assert!(RequestId::new().as_str().starts_with("req_"));
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(TaskId::new(), TaskId::new());
    }

    #[test]
    fn from_raw_preserves_client_value() {
        let tab = TabId::from_raw("t1");
        assert_eq!(tab.as_str(), "t1");
        assert_eq!(tab.to_string(), "t1");
    }

    #[test]
    fn serde_is_transparent() {
        let tab = TabId::from_raw("t1");
        assert_eq!(serde_json::to_string(&tab).unwrap(), "\"t1\"");
        let parsed: TabId = serde_json::from_str("\"t1\"").unwrap();
        assert_eq!(parsed, tab);
    }

    #[test]
    fn derived_operation_id_is_deterministic() {
        let a = OperationId::derive("u1", "t1", "heartbeat", Some("1700000000000"));
        let b = OperationId::derive("u1", "t1", "heartbeat", Some("1700000000000"));
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn derived_operation_id_depends_on_every_field() {
        let base = OperationId::derive("u1", "t1", "heartbeat", Some("1"));
        assert_ne!(base, OperationId::derive("u2", "t1", "heartbeat", Some("1")));
        assert_ne!(base, OperationId::derive("u1", "t2", "heartbeat", Some("1")));
        assert_ne!(base, OperationId::derive("u1", "t1", "state_change", Some("1")));
        assert_ne!(base, OperationId::derive("u1", "t1", "heartbeat", Some("2")));
    }

    #[test]
    fn missing_timestamp_uses_placeholder() {
        assert_eq!(
            OperationId::derive("u1", "t1", "init", None),
            OperationId::derive("u1", "t1", "init", Some("")),
        );
    }
}
