//! Versioned session ledger.
//!
//! Three write modes, fixed at construction:
//! - **Hot**: the in-memory map is authoritative; every mutation is queued for
//!   the durable store and the call returns without waiting for it.
//! - **Direct**: writes go straight to the durable store, with the version
//!   cache steering create vs update.
//! - **Strict**: the durable record is read first and the caller's expected
//!   version is verified before writing.
//!
//! Mutations of one tab are serialized through [`KeyLockManager`] when the
//! tab mutex is enabled.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use tabwatch_core::config::{FeatureFlags, SessionConfig};
use tabwatch_core::ids::{TabId, UserId};
use tabwatch_core::session::{
    chrono_span, group_by_user, EventKind, Session, SessionEvent, SessionMap, TelemetryLogEntry,
    UpsertOutcome, UserStats,
};
use tabwatch_core::{IngestError, AUDIT_TARGET};

use crate::error::StoreError;
use crate::lock::KeyLockManager;
use crate::queue::{DurableWriteQueue, PersistAction};
use crate::record_store::RecordStore;
use crate::reliable::RetryingExecutor;

const UNKNOWN_USERNAME: &str = "Unknown";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    Hot,
    Direct,
    Strict,
}

impl WriteMode {
    pub fn from_flags(flags: &FeatureFlags) -> Self {
        if flags.uses_hot_path() {
            Self::Hot
        } else if flags.strict_version_check {
            Self::Strict
        } else {
            Self::Direct
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Direct => "direct",
            Self::Strict => "strict",
        }
    }
}

struct TtlCache<K, V> {
    ttl: Duration,
    entries: DashMap<K, (V, Instant)>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let hit = self.entries.get(key).map(|e| (e.0.clone(), e.1));
        match hit {
            Some((value, expires)) if expires > now => Some(value),
            Some(_) => {
                self.entries.remove_if(key, |_, (_, e)| *e <= now);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: K, value: V) {
        self.entries.insert(key, (value, Instant::now() + self.ttl));
    }

    fn remove(&self, key: &K) {
        self.entries.remove(key);
    }

    fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, (_, expires)| *expires > now);
    }
}

pub struct SessionStore {
    mode: WriteMode,
    config: SessionConfig,
    store: Arc<dyn RecordStore>,
    executor: Arc<RetryingExecutor>,
    queue: Arc<DurableWriteQueue>,
    locks: Option<KeyLockManager<TabId>>,
    sessions: DashMap<TabId, Session>,
    versions: TtlCache<TabId, u64>,
    usernames: TtlCache<UserId, String>,
    user_stats: TtlCache<UserId, UserStats>,
}

impl SessionStore {
    pub fn new(
        flags: &FeatureFlags,
        config: SessionConfig,
        store: Arc<dyn RecordStore>,
        executor: Arc<RetryingExecutor>,
        queue: Arc<DurableWriteQueue>,
    ) -> Self {
        let this = Self {
            mode: WriteMode::from_flags(flags),
            store,
            executor,
            queue,
            locks: flags.tab_mutex.then(KeyLockManager::new),
            sessions: DashMap::new(),
            versions: TtlCache::new(config.version_cache_ttl),
            usernames: TtlCache::new(config.username_ttl),
            user_stats: TtlCache::new(config.user_stats_ttl),
            config,
        };
        if this.mode == WriteMode::Hot {
            let replayed = this.hydrate_from_queue();
            if replayed > 0 {
                info!(replayed, "hydrated hot session map from write queue");
            }
        }
        this
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    pub fn executor(&self) -> &Arc<RetryingExecutor> {
        &self.executor
    }

    pub fn queue(&self) -> &Arc<DurableWriteQueue> {
        &self.queue
    }

    fn stale_after(&self) -> chrono::Duration {
        chrono_span(self.config.stale_after)
    }

    /// Replay queued upserts and deletes into the hot map so numbering
    /// continues where the previous process stopped.
    fn hydrate_from_queue(&self) -> usize {
        let mut replayed = 0;
        for task in self.queue.pending() {
            match task.action {
                PersistAction::Upsert { session } => {
                    let newer = self
                        .sessions
                        .get(&session.tab_id)
                        .map_or(true, |s| s.version < session.version);
                    if newer {
                        self.versions.set(session.tab_id.clone(), session.version);
                        self.sessions.insert(session.tab_id.clone(), session);
                    }
                    replayed += 1;
                }
                PersistAction::Delete { tab_id, .. } => {
                    self.sessions.remove(&tab_id);
                    self.versions.remove(&tab_id);
                    replayed += 1;
                }
                PersistAction::Log { .. } => {}
            }
        }
        replayed
    }

    /// Apply an event to the tab's session and return its new version.
    pub async fn upsert(&self, event: &SessionEvent) -> Result<UpsertOutcome, IngestError> {
        match &self.locks {
            Some(locks) => locks.with_lock(&event.tab_id, || self.upsert_unlocked(event)).await,
            None => self.upsert_unlocked(event).await,
        }
    }

    async fn upsert_unlocked(&self, event: &SessionEvent) -> Result<UpsertOutcome, IngestError> {
        match self.mode {
            WriteMode::Hot => self.upsert_hot(event).await,
            WriteMode::Direct | WriteMode::Strict => self.upsert_durable(event).await,
        }
    }

    async fn upsert_hot(&self, event: &SessionEvent) -> Result<UpsertOutcome, IngestError> {
        let existing = self.sessions.get(&event.tab_id).map(|s| s.value().clone());
        let username = self
            .resolve_username(event, existing.as_ref().map(|s| s.username.as_str()))
            .await;

        let previous = match existing.as_ref().map(|s| s.version) {
            Some(v) => v,
            None => match self.versions.get(&event.tab_id) {
                Some(v) => v,
                None => self.reconcile_version(event).await,
            },
        };
        let now = Utc::now();
        let session = build_session(event, username, previous + 1, now);

        let mut actions = vec![PersistAction::Upsert {
            session: session.clone(),
        }];
        if event.kind.is_state_changing() {
            actions.push(PersistAction::Log {
                entry: log_entry(event, now),
            });
        }
        if let Err(e) = self.queue.enqueue_all(actions) {
            error!(
                user_id = %event.user_id,
                tab_id = %event.tab_id,
                error_kind = e.error_kind(),
                error = %e,
                "write queue refused session upsert"
            );
            return Err(IngestError::DurabilityUnavailable(e.to_string()));
        }

        self.versions.set(event.tab_id.clone(), session.version);
        self.user_stats.remove(&event.user_id);
        let outcome = UpsertOutcome {
            version: session.version,
            updated_at: session.updated_at,
        };
        self.sessions.insert(event.tab_id.clone(), session);
        Ok(outcome)
    }

    /// First touch of a tab with nothing in memory: continue from the
    /// durable record so a restart does not reuse version numbers.
    async fn reconcile_version(&self, event: &SessionEvent) -> u64 {
        match self.read_session(&event.tab_id).await {
            Ok(Some(stored)) => {
                debug!(tab_id = %event.tab_id, version = stored.version, "reconciled version from durable store");
                stored.version
            }
            Ok(None) => 0,
            Err(e) => {
                warn!(
                    tab_id = %event.tab_id,
                    error_kind = e.error_kind(),
                    error = %e,
                    "could not reconcile session version, starting from cache"
                );
                0
            }
        }
    }

    #[instrument(skip_all, fields(user_id = %event.user_id, tab_id = %event.tab_id, mode = self.mode.as_str()))]
    async fn upsert_durable(&self, event: &SessionEvent) -> Result<UpsertOutcome, IngestError> {
        let strict = self.mode == WriteMode::Strict;
        let username = self.resolve_username(event, None).await;

        let existing = if strict {
            let existing = self.read_session(&event.tab_id).await.map_err(|e| {
                error!(operation = "get_session", error_kind = e.error_kind(), error = %e, "strict read failed");
                IngestError::from(e)
            })?;
            if let Some(s) = &existing {
                self.versions.set(event.tab_id.clone(), s.version);
            }
            existing
        } else {
            None
        };

        if let (Some(current), Some(expected)) = (&existing, event.expected_version) {
            if current.version != expected {
                warn!(
                    target: AUDIT_TARGET,
                    user_id = %event.user_id,
                    tab_id = %event.tab_id,
                    current_version = current.version,
                    expected_version = expected,
                    operation_id = %event.operation_id,
                    request_id = %event.request_id,
                    "session version conflict"
                );
                return Err(IngestError::VersionConflict {
                    current_version: current.version,
                    expected_version: expected,
                });
            }
        }

        let cached = self.versions.get(&event.tab_id);
        let previous = existing.as_ref().map(|s| s.version).or(cached);
        let now = Utc::now();
        let mut session = build_session(event, username, previous.unwrap_or(0) + 1, now);

        if let Err(e) = self.write_durable(&mut session, previous.is_some()).await {
            error!(
                operation = "upsert_session",
                error_kind = e.error_kind(),
                error = %e,
                "session upsert failed"
            );
            return Err(e.into());
        }
        self.versions.set(event.tab_id.clone(), session.version);
        self.user_stats.remove(&event.user_id);

        if event.kind.is_state_changing() {
            let entry = log_entry(event, now);
            let store = &self.store;
            if let Err(e) = self
                .executor
                .execute("append_log", || store.append_log(&entry))
                .await
            {
                error!(
                    operation = "append_log",
                    event_type = %event.kind,
                    error_kind = e.error_kind(),
                    error = %e,
                    "failed to write telemetry log"
                );
            }
        }

        Ok(UpsertOutcome {
            version: session.version,
            updated_at: session.updated_at,
        })
    }

    /// Write `session`, falling back to the complementary operation when the
    /// durable store disagrees about whether the record exists.
    async fn write_durable(&self, session: &mut Session, exists: bool) -> Result<(), StoreError> {
        let store = &self.store;
        let exec = &self.executor;

        if exists {
            let updated = {
                let current = &*session;
                exec.execute("update_session", || store.update_session(current)).await
            };
            match updated {
                Err(e) if e.is_not_found() => {
                    self.versions.remove(&session.tab_id);
                    session.version = 1;
                    let current = &*session;
                    exec.execute("create_session", || store.create_session(current)).await
                }
                other => other,
            }
        } else {
            let created = {
                let current = &*session;
                exec.execute("create_session", || store.create_session(current)).await
            };
            match created {
                Err(e) if e.is_duplicate() => {
                    let latest = self.read_session(&session.tab_id).await?;
                    session.version = latest.map_or(0, |s| s.version) + 1;
                    let current = &*session;
                    exec.execute("update_session", || store.update_session(current)).await
                }
                other => other,
            }
        }
    }

    async fn read_session(&self, tab_id: &TabId) -> Result<Option<Session>, StoreError> {
        let store = &self.store;
        self.executor
            .execute("get_session", || store.get_session(tab_id))
            .await
    }

    /// Cached name, then a durable lookup for non-heartbeats, then whatever
    /// the session already carried. Lookup failures never fail the write.
    async fn resolve_username(&self, event: &SessionEvent, previous: Option<&str>) -> String {
        if let Some(name) = self.usernames.get(&event.user_id) {
            return name;
        }
        if event.kind != EventKind::Heartbeat {
            let store = &self.store;
            let user_id = &event.user_id;
            match self
                .executor
                .execute("lookup_username", || store.lookup_username(user_id))
                .await
            {
                Ok(Some(name)) => {
                    self.usernames.set(event.user_id.clone(), name.clone());
                    return name;
                }
                Ok(None) => {}
                Err(e) => warn!(
                    user_id = %event.user_id,
                    tab_id = %event.tab_id,
                    error_kind = e.error_kind(),
                    error = %e,
                    "could not load username for session"
                ),
            }
        }
        previous.unwrap_or(UNKNOWN_USERNAME).to_string()
    }

    /// Remove a tab's session. Failures are logged, never surfaced: the tab
    /// is gone either way and the staleness sweep catches leftovers.
    pub async fn remove(&self, user_id: &UserId, tab_id: &TabId) {
        match &self.locks {
            Some(locks) => locks.with_lock(tab_id, || self.remove_unlocked(user_id, tab_id)).await,
            None => self.remove_unlocked(user_id, tab_id).await,
        }
    }

    async fn remove_unlocked(&self, user_id: &UserId, tab_id: &TabId) {
        if self.mode == WriteMode::Hot {
            self.sessions.remove(tab_id);
            self.versions.remove(tab_id);
            self.user_stats.remove(user_id);
            self.enqueue_delete(user_id, tab_id);
            return;
        }

        let store = &self.store;
        match self
            .executor
            .execute("delete_session", || store.delete_session(tab_id))
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(
                    user_id = %user_id,
                    tab_id = %tab_id,
                    error_kind = e.error_kind(),
                    error = %e,
                    "failed to remove session"
                );
                return;
            }
        }
        self.versions.remove(tab_id);
        self.user_stats.remove(user_id);
    }

    fn enqueue_delete(&self, user_id: &UserId, tab_id: &TabId) {
        let action = PersistAction::Delete {
            user_id: user_id.clone(),
            tab_id: tab_id.clone(),
        };
        if let Err(e) = self.queue.enqueue(action) {
            error!(
                user_id = %user_id,
                tab_id = %tab_id,
                error = %e,
                "failed to queue session delete"
            );
        }
    }

    /// Evict a hot session if it is still stale. Returns true when evicted.
    fn evict_if_stale(&self, tab_id: &TabId, now: DateTime<Utc>) -> bool {
        let stale_after = self.stale_after();
        let Some((_, session)) = self
            .sessions
            .remove_if(tab_id, |_, s| s.is_stale(now, stale_after))
        else {
            return false;
        };
        self.versions.remove(tab_id);
        self.user_stats.remove(&session.user_id);
        self.enqueue_delete(&session.user_id, tab_id);
        true
    }

    /// Delete every session with no heartbeat inside the stale window.
    /// Returns the number removed.
    pub async fn prune_stale(&self, now: DateTime<Utc>) -> usize {
        self.versions.purge_expired();
        self.usernames.purge_expired();
        self.user_stats.purge_expired();

        if self.mode == WriteMode::Hot {
            let stale_after = self.stale_after();
            let candidates: Vec<TabId> = self
                .sessions
                .iter()
                .filter(|s| s.is_stale(now, stale_after))
                .map(|s| s.key().clone())
                .collect();
            let pruned = candidates
                .iter()
                .filter(|tab_id| self.evict_if_stale(tab_id, now))
                .count();
            if pruned > 0 {
                info!(pruned, "pruned stale sessions");
            }
            return pruned;
        }

        let cutoff = now - self.stale_after();
        let store = &self.store;
        let stale = match self
            .executor
            .execute("list_stale_sessions", || store.list_stale_sessions(cutoff))
            .await
        {
            Ok(stale) => stale,
            Err(e) => {
                error!(error_kind = e.error_kind(), error = %e, "stale session sweep failed");
                return 0;
            }
        };

        let mut pruned = 0;
        for session in &stale {
            let delete = || self.delete_if_still_stale(session, cutoff);
            let result = match &self.locks {
                Some(locks) => locks.with_lock(&session.tab_id, delete).await,
                None => delete().await,
            };
            match result {
                Ok(true) => pruned += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    user_id = %session.user_id,
                    tab_id = %session.tab_id,
                    error = %e,
                    "failed to delete stale session"
                ),
            }
        }
        if pruned > 0 {
            info!(pruned, "pruned stale sessions");
        }
        pruned
    }

    /// Re-read right before deleting so a concurrently refreshed tab survives.
    async fn delete_if_still_stale(
        &self,
        session: &Session,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let Some(latest) = self.read_session(&session.tab_id).await? else {
            return Ok(false);
        };
        if latest.last_seen >= cutoff {
            return Ok(false);
        }
        let store = &self.store;
        match self
            .executor
            .execute("delete_session", || store.delete_session(&session.tab_id))
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        }
        self.versions.remove(&session.tab_id);
        self.user_stats.remove(&session.user_id);
        Ok(true)
    }

    /// Current non-stale sessions grouped by user.
    pub async fn all_sessions(&self) -> SessionMap {
        group_by_user(self.live_sessions().await)
    }

    /// Current non-stale sessions. Hot mode evicts stale entries it passes over.
    pub async fn live_sessions(&self) -> Vec<Session> {
        let now = Utc::now();
        if self.mode == WriteMode::Hot {
            let stale_after = self.stale_after();
            let mut fresh = Vec::new();
            let mut stale = Vec::new();
            for entry in self.sessions.iter() {
                if entry.is_stale(now, stale_after) {
                    stale.push(entry.key().clone());
                } else {
                    fresh.push(entry.value().clone());
                }
            }
            for tab_id in &stale {
                self.evict_if_stale(tab_id, now);
            }
            return fresh;
        }

        let cutoff = now - self.stale_after();
        let store = &self.store;
        match self
            .executor
            .execute("list_sessions_seen_since", || store.list_sessions_seen_since(cutoff))
            .await
        {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error_kind = e.error_kind(), error = %e, "failed to list sessions");
                Vec::new()
            }
        }
    }

    /// Tab and distinct-IP counts for a user, briefly cached.
    pub async fn user_stats(&self, user_id: &UserId) -> UserStats {
        if let Some(stats) = self.user_stats.get(user_id) {
            return stats;
        }
        let tabs: Vec<Session> = self
            .live_sessions()
            .await
            .into_iter()
            .filter(|s| &s.user_id == user_id)
            .collect();

        let mut ips: Vec<&str> = tabs.iter().filter_map(|t| t.source_ip.as_deref()).collect();
        ips.sort_unstable();
        ips.dedup();

        let username = tabs
            .first()
            .map(|t| t.username.clone())
            .or_else(|| self.usernames.get(user_id))
            .unwrap_or_else(|| UNKNOWN_USERNAME.to_string());

        let stats = UserStats {
            user_id: user_id.clone(),
            username,
            tab_count: tabs.len(),
            distinct_ips: ips.len(),
        };
        self.user_stats.set(user_id.clone(), stats.clone());
        stats
    }

    /// Sessions held in memory (hot mode only).
    pub fn hot_len(&self) -> usize {
        self.sessions.len()
    }
}

fn build_session(event: &SessionEvent, username: String, version: u64, now: DateTime<Utc>) -> Session {
    Session {
        tab_id: event.tab_id.clone(),
        user_id: event.user_id.clone(),
        username,
        source_ip: event.source_ip.clone(),
        state: event.state.clone(),
        last_seen: now,
        updated_at: now,
        version,
        last_operation_id: Some(event.operation_id.clone()),
    }
}

fn log_entry(event: &SessionEvent, now: DateTime<Utc>) -> TelemetryLogEntry {
    TelemetryLogEntry {
        user_id: event.user_id.clone(),
        tab_id: event.tab_id.clone(),
        state: event.state.clone(),
        event_type: event.kind.clone(),
        operation_id: Some(event.operation_id.clone()),
        request_id: Some(event.request_id.clone()),
        timestamp: now,
    }
}
