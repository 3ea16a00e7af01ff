use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use tabwatch_core::config::IdempotencyConfig;
use tabwatch_core::ids::OperationId;

struct Inner<V> {
    entries: HashMap<OperationId, (V, Instant)>,
    /// Insertion order. Entries whose expiry no longer matches the map are stale.
    order: VecDeque<(OperationId, Instant)>,
}

/// TTL + capacity bounded cache of responses keyed by operation id.
pub struct IdempotencyCache<V: Clone> {
    ttl: Duration,
    max_entries: usize,
    inner: Mutex<Inner<V>>,
}

impl<V: Clone> IdempotencyCache<V> {
    pub fn new(config: &IdempotencyConfig) -> Self {
        Self {
            ttl: config.ttl,
            max_entries: config.max_entries.max(1),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// The stored response, if present and unexpired.
    pub fn get(&self, key: &OperationId) -> Option<V> {
        let mut inner = self.inner.lock();
        let (value, expires) = inner.entries.get(key).cloned()?;
        if expires > Instant::now() {
            return Some(value);
        }
        inner.entries.remove(key);
        None
    }

    pub fn set(&self, key: OperationId, value: V) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let expires = now + self.ttl;
        inner.entries.insert(key.clone(), (value, expires));
        inner.order.push_back((key, expires));
        self.prune(&mut inner, now);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune(&self, inner: &mut Inner<V>, now: Instant) {
        while let Some((key, expires)) = inner.order.front().cloned() {
            let live = matches!(inner.entries.get(&key), Some((_, e)) if *e == expires);
            if !live {
                inner.order.pop_front();
            } else if expires <= now || inner.entries.len() > self.max_entries {
                inner.order.pop_front();
                inner.entries.remove(&key);
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(ttl_ms: u64, max: usize) -> IdempotencyCache<String> {
        IdempotencyCache::new(&IdempotencyConfig {
            ttl: Duration::from_millis(ttl_ms),
            max_entries: max,
        })
    }

    fn op(s: &str) -> OperationId {
        OperationId::from_raw(s)
    }

    #[tokio::test(start_paused = true)]
    async fn returns_stored_response_until_expiry() {
        let cache = cache(1000, 10);
        cache.set(op("a"), "first".into());
        assert_eq!(cache.get(&op("a")).as_deref(), Some("first"));

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(cache.get(&op("a")).is_some());
        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(cache.get(&op("a")).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn evicts_oldest_over_capacity() {
        let cache = cache(60_000, 2);
        cache.set(op("a"), "1".into());
        cache.set(op("b"), "2".into());
        cache.set(op("c"), "3".into());
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&op("a")).is_none());
        assert!(cache.get(&op("c")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn overwrite_refreshes_expiry() {
        let cache = cache(1000, 10);
        cache.set(op("a"), "old".into());
        tokio::time::advance(Duration::from_millis(800)).await;
        cache.set(op("a"), "new".into());
        tokio::time::advance(Duration::from_millis(800)).await;
        // The stale order entry from the first set must not evict the refreshed one.
        cache.set(op("b"), "x".into());
        assert_eq!(cache.get(&op("a")).as_deref(), Some("new"));
    }
}
