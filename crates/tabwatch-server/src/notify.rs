//! Fan-out of session changes to real-time subscribers.
//!
//! Sync mode dispatches inline on the request path. Async mode hands the
//! notification to a bounded broadcast channel drained by a background
//! bridge; when the bridge falls behind, the oldest notifications are lost
//! and a warning is logged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tabwatch_core::events::{BroadcastEvent, SessionUpdate, UpdateKind};
use tabwatch_core::ids::UserId;
use tabwatch_store::SessionStore;

use crate::client::SubscriberRegistry;

#[derive(Clone, Debug)]
pub struct Notification {
    pub user_id: UserId,
    pub kind: UpdateKind,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(user_id: UserId, kind: UpdateKind, data: serde_json::Value) -> Self {
        Self {
            user_id,
            kind,
            data,
            timestamp: Utc::now(),
        }
    }
}

pub struct Notifier {
    registry: Arc<SubscriberRegistry>,
    sessions: Arc<SessionStore>,
    queue: Option<broadcast::Sender<Notification>>,
    dropped: AtomicU64,
}

impl Notifier {
    /// `queue_max` of `None` selects inline dispatch.
    pub fn new(
        registry: Arc<SubscriberRegistry>,
        sessions: Arc<SessionStore>,
        queue_max: Option<usize>,
    ) -> Self {
        Self {
            registry,
            sessions,
            queue: queue_max.map(|max| broadcast::channel(max.max(1)).0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn is_async(&self) -> bool {
        self.queue.is_some()
    }

    /// Notifications lost to queue saturation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub async fn publish(&self, notification: Notification) {
        let Some(queue) = &self.queue else {
            self.dispatch(notification).await;
            return;
        };
        // No bridge listening yet: deliver inline rather than lose it.
        if let Err(broadcast::error::SendError(notification)) = queue.send(notification) {
            self.dispatch(notification).await;
        }
    }

    /// Build the wire event (with fresh stats for updates) and send it to
    /// every subscriber.
    pub async fn dispatch(&self, notification: Notification) -> usize {
        let stats = match notification.kind {
            UpdateKind::Update => Some(self.sessions.user_stats(&notification.user_id).await),
            UpdateKind::Disconnected => None,
        };
        let event = BroadcastEvent::SessionUpdate(SessionUpdate {
            user_id: notification.user_id,
            event_type: notification.kind,
            data: notification.data,
            timestamp: notification.timestamp,
            stats,
        });
        match event.to_wire() {
            Some(json) => self.registry.broadcast(&json),
            None => 0,
        }
    }

    /// Start the background bridge. Returns `None` in sync mode.
    pub fn spawn_bridge(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let mut rx = self.queue.as_ref()?.subscribe();
        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => received,
                };
                match received {
                    Ok(notification) => {
                        this.dispatch(notification).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        this.dropped.fetch_add(n, Ordering::Relaxed);
                        warn!(skipped = n, "notification queue saturated, dropped oldest");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("notification queue closed");
                        break;
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tabwatch_core::config::{FeatureFlags, QueueConfig, SaturationPolicy, SessionConfig};
    use tabwatch_core::ids::{OperationId, RequestId, TabId};
    use tabwatch_core::session::{EventKind, SessionEvent, SessionState};
    use tabwatch_store::{DurableWriteQueue, MemoryRecordStore, RetryingExecutor};

    fn sessions() -> Arc<SessionStore> {
        let queue = DurableWriteQueue::in_memory(
            &QueueConfig::with_log_path(std::env::temp_dir().join("unused.log")),
            SaturationPolicy::Reject,
        );
        Arc::new(SessionStore::new(
            &FeatureFlags::default(),
            SessionConfig::default(),
            Arc::new(MemoryRecordStore::new()),
            Arc::new(RetryingExecutor::disabled()),
            Arc::new(queue),
        ))
    }

    fn update(user: &str) -> Notification {
        Notification::new(
            UserId::from_raw(user),
            UpdateKind::Update,
            serde_json::json!({ "tabId": "t1" }),
        )
    }

    #[tokio::test]
    async fn sync_dispatch_carries_stats() {
        let store = sessions();
        store
            .upsert(&SessionEvent {
                user_id: UserId::from_raw("u1"),
                tab_id: TabId::from_raw("t1"),
                kind: EventKind::Heartbeat,
                state: Some(SessionState::Focused),
                operation_id: OperationId::new(),
                expected_version: None,
                source_ip: Some("10.0.0.1".into()),
                request_id: RequestId::new(),
            })
            .await
            .unwrap();

        let registry = Arc::new(SubscriberRegistry::new(8));
        let (_id, mut rx) = registry.register();
        let notifier = Notifier::new(Arc::clone(&registry), store, None);
        assert!(!notifier.is_async());

        notifier.publish(update("u1")).await;
        let json: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(json["type"], "session_update");
        assert_eq!(json["payload"]["eventType"], "update");
        assert_eq!(json["payload"]["stats"]["tabCount"], 1);
    }

    #[tokio::test]
    async fn disconnect_has_no_stats() {
        let registry = Arc::new(SubscriberRegistry::new(8));
        let (_id, mut rx) = registry.register();
        let notifier = Notifier::new(Arc::clone(&registry), sessions(), None);

        notifier
            .publish(Notification::new(
                UserId::from_raw("u1"),
                UpdateKind::Disconnected,
                serde_json::json!({ "tabId": "t1" }),
            ))
            .await;
        let json: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(json["payload"]["eventType"], "disconnected");
        assert!(json["payload"].get("stats").is_none());
    }

    #[tokio::test]
    async fn async_bridge_delivers_in_background() {
        let registry = Arc::new(SubscriberRegistry::new(8));
        let (_id, mut rx) = registry.register();
        let notifier = Arc::new(Notifier::new(Arc::clone(&registry), sessions(), Some(16)));
        let cancel = CancellationToken::new();
        let bridge = notifier.spawn_bridge(cancel.clone()).unwrap();

        notifier.publish(update("u1")).await;
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(msg.contains("session_update"));

        cancel.cancel();
        bridge.await.unwrap();
    }

    #[tokio::test]
    async fn saturated_queue_drops_oldest() {
        let registry = Arc::new(SubscriberRegistry::new(64));
        let (_id, mut rx) = registry.register();
        let notifier = Arc::new(Notifier::new(Arc::clone(&registry), sessions(), Some(2)));
        let cancel = CancellationToken::new();
        // Subscribe before publishing, but let the bridge run only afterwards.
        let bridge = notifier.spawn_bridge(cancel.clone()).unwrap();

        for i in 0..5 {
            notifier.publish(update(&format!("u{i}"))).await;
        }
        let mut users = Vec::new();
        while users.len() < 2 {
            let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            let json: serde_json::Value = serde_json::from_str(&msg).unwrap();
            users.push(json["payload"]["userId"].as_str().unwrap().to_string());
        }
        assert_eq!(users, vec!["u3", "u4"]);
        assert_eq!(notifier.dropped(), 3);

        cancel.cancel();
        bridge.await.unwrap();
    }
}
