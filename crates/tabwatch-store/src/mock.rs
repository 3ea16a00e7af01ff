use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use tabwatch_core::ids::{TabId, UserId};
use tabwatch_core::session::{Session, TelemetryLogEntry};

use crate::error::StoreError;
use crate::record_store::RecordStore;

/// In-memory [`RecordStore`] with scripted failures, for deterministic tests.
///
/// Every call yields to the scheduler first so concurrent callers interleave
/// the way they would against a real network store.
#[derive(Default)]
pub struct MemoryRecordStore {
    sessions: Mutex<HashMap<TabId, Session>>,
    users: Mutex<HashMap<UserId, String>>,
    logs: Mutex<Vec<TelemetryLogEntry>>,
    scripted_failures: Mutex<VecDeque<StoreError>>,
    unavailable: AtomicBool,
    latency: Mutex<Option<Duration>>,
    call_count: AtomicUsize,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` calls (of any kind) fail with `error`.
    pub fn fail_next(&self, n: usize, error: StoreError) {
        let mut failures = self.scripted_failures.lock();
        for _ in 0..n {
            failures.push_back(error.clone());
        }
    }

    /// While set, every call fails with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.calls.lock().get(operation).copied().unwrap_or(0)
    }

    pub fn insert_user(&self, user_id: &UserId, username: &str) {
        self.users.lock().insert(user_id.clone(), username.to_string());
    }

    /// Seed a session directly, bypassing failure injection.
    pub fn insert_session(&self, session: Session) {
        self.sessions.lock().insert(session.tab_id.clone(), session);
    }

    pub fn session(&self, tab_id: &TabId) -> Option<Session> {
        self.sessions.lock().get(tab_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn logs(&self) -> Vec<TelemetryLogEntry> {
        self.logs.lock().clone()
    }

    async fn enter(&self, operation: &'static str) -> Result<(), StoreError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        *self.calls.lock().entry(operation).or_insert(0) += 1;

        let latency = *self.latency.lock();
        match latency {
            Some(d) => tokio::time::sleep(d).await,
            None => tokio::task::yield_now().await,
        }

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("{operation}: store offline")));
        }
        if let Some(err) = self.scripted_failures.lock().pop_front() {
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get_session(&self, tab_id: &TabId) -> Result<Option<Session>, StoreError> {
        self.enter("get_session").await?;
        Ok(self.sessions.lock().get(tab_id).cloned())
    }

    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        self.enter("create_session").await?;
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&session.tab_id) {
            return Err(StoreError::Duplicate(format!("session {}", session.tab_id)));
        }
        sessions.insert(session.tab_id.clone(), session.clone());
        Ok(())
    }

    async fn update_session(&self, session: &Session) -> Result<(), StoreError> {
        self.enter("update_session").await?;
        match self.sessions.lock().get_mut(&session.tab_id) {
            Some(existing) => {
                *existing = session.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("session {}", session.tab_id))),
        }
    }

    async fn delete_session(&self, tab_id: &TabId) -> Result<(), StoreError> {
        self.enter("delete_session").await?;
        match self.sessions.lock().remove(tab_id) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(format!("session {tab_id}"))),
        }
    }

    async fn list_sessions_seen_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Session>, StoreError> {
        self.enter("list_sessions_seen_since").await?;
        Ok(self
            .sessions
            .lock()
            .values()
            .filter(|s| s.last_seen >= cutoff)
            .cloned()
            .collect())
    }

    async fn list_stale_sessions(&self, cutoff: DateTime<Utc>) -> Result<Vec<Session>, StoreError> {
        self.enter("list_stale_sessions").await?;
        Ok(self
            .sessions
            .lock()
            .values()
            .filter(|s| s.last_seen < cutoff)
            .cloned()
            .collect())
    }

    async fn append_log(&self, entry: &TelemetryLogEntry) -> Result<(), StoreError> {
        self.enter("append_log").await?;
        self.logs.lock().push(entry.clone());
        Ok(())
    }

    async fn lookup_username(&self, user_id: &UserId) -> Result<Option<String>, StoreError> {
        self.enter("lookup_username").await?;
        Ok(self.users.lock().get(user_id).cloned())
    }

    async fn recent_logs(&self, limit: u32) -> Result<Vec<TelemetryLogEntry>, StoreError> {
        self.enter("recent_logs").await?;
        Ok(self.logs.lock().iter().rev().take(limit as usize).cloned().collect())
    }
}
