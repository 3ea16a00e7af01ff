use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tabwatch_core::config::WatchdogConfig;
use tabwatch_core::events::BroadcastEvent;
use tabwatch_core::ids::SubscriberId;

use crate::client::SubscriberRegistry;

/// Result of one watchdog pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WatchdogTick {
    pub pinged: usize,
    pub stale: Vec<SubscriberId>,
}

/// Pings every connected subscriber and reports those whose last pong is
/// older than `stale_after`. Diagnostic only: nobody is disconnected.
pub struct SubscriberWatchdog {
    registry: Arc<SubscriberRegistry>,
    config: WatchdogConfig,
}

impl SubscriberWatchdog {
    pub fn new(registry: Arc<SubscriberRegistry>, config: WatchdogConfig) -> Self {
        Self { registry, config }
    }

    pub fn tick(&self) -> WatchdogTick {
        let now = Instant::now();
        let Some(ping) = (BroadcastEvent::Ping {
            server_ts: Utc::now().timestamp_millis(),
        })
        .to_wire() else {
            return WatchdogTick::default();
        };

        let mut result = WatchdogTick::default();
        for subscriber in self.registry.connected() {
            if subscriber.send(ping.clone()) {
                result.pinged += 1;
            }
            let silent_for = now.saturating_duration_since(subscriber.last_pong());
            if silent_for > self.config.stale_after {
                warn!(
                    subscriber_id = %subscriber.id,
                    silent_ms = silent_for.as_millis() as u64,
                    stale_after_ms = self.config.stale_after.as_millis() as u64,
                    "subscriber has not answered pings"
                );
                result.stale.push(subscriber.id.clone());
            }
        }
        debug!(pinged = result.pinged, stale = result.stale.len(), "subscriber watchdog tick");
        result
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.tick_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.tick();
                    }
                }
            }
        })
    }
}
