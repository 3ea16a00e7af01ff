use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use tabwatch_core::config::CoalesceConfig;
use tabwatch_core::ids::{TabId, UserId};
use tabwatch_core::session::{EventKind, SessionEvent, SessionState};

#[derive(Clone, Debug)]
struct Persisted {
    user_id: UserId,
    state: Option<SessionState>,
    source_ip: Option<String>,
    at: Instant,
}

impl Persisted {
    fn matches(&self, event: &SessionEvent) -> bool {
        self.user_id == event.user_id
            && self.state == event.state
            && self.source_ip == event.source_ip
    }
}

/// Suppresses durable writes for repeated, unchanged heartbeats.
pub struct HeartbeatCoalescer {
    window: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<TabId, Persisted>>,
}

impl HeartbeatCoalescer {
    pub fn new(config: &CoalesceConfig) -> Self {
        Self {
            window: config.window,
            max_entries: config.max_entries.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// True when `event` is a heartbeat identical to the last persisted one
    /// for its tab and that write is still inside the window.
    pub fn should_coalesce(&self, event: &SessionEvent) -> bool {
        if event.kind != EventKind::Heartbeat {
            return false;
        }
        let entries = self.entries.lock();
        entries
            .get(&event.tab_id)
            .is_some_and(|p| p.matches(event) && p.at.elapsed() <= self.window)
    }

    /// Remember that `event` reached the session store.
    pub fn mark_persisted(&self, event: &SessionEvent) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.insert(
            event.tab_id.clone(),
            Persisted {
                user_id: event.user_id.clone(),
                state: event.state.clone(),
                source_ip: event.source_ip.clone(),
                at: now,
            },
        );
        if entries.len() > self.max_entries {
            self.prune(&mut entries, now);
        }
    }

    pub fn forget(&self, tab_id: &TabId) {
        self.entries.lock().remove(tab_id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune(&self, entries: &mut HashMap<TabId, Persisted>, now: Instant) {
        let horizon = self.window * 20;
        entries.retain(|_, p| now.duration_since(p.at) <= horizon);

        if entries.len() > self.max_entries {
            let mut by_age: Vec<(TabId, Instant)> =
                entries.iter().map(|(k, p)| (k.clone(), p.at)).collect();
            by_age.sort_by_key(|(_, at)| *at);
            let excess = entries.len() - self.max_entries;
            for (tab_id, _) in by_age.into_iter().take(excess) {
                entries.remove(&tab_id);
            }
        }
    }
}
