//! Periodic background passes: stale-session pruning, the health watchdog and
//! the operational summary line.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tabwatch_core::config::FeatureFlags;
use tabwatch_store::SessionStore;
use tabwatch_telemetry::{HealthAggregator, HealthSnapshot};

pub const HEALTH_WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);
pub const SUMMARY_INTERVAL: Duration = Duration::from_secs(10);

pub struct Maintenance {
    flags: FeatureFlags,
    prune_interval: Duration,
    sessions: Arc<SessionStore>,
    health: Arc<HealthAggregator>,
}

impl Maintenance {
    pub fn new(
        flags: FeatureFlags,
        prune_interval: Duration,
        sessions: Arc<SessionStore>,
        health: Arc<HealthAggregator>,
    ) -> Self {
        Self {
            flags,
            prune_interval,
            sessions,
            health,
        }
    }

    pub async fn prune_pass(&self) -> usize {
        self.sessions.prune_stale(Utc::now()).await
    }

    pub async fn snapshot(&self) -> HealthSnapshot {
        let live = self.sessions.live_sessions().await;
        self.health
            .snapshot(live.iter(), self.sessions.executor().state())
    }

    /// One health watchdog run. Alerts when any session has missed the
    /// heartbeat SLA.
    pub async fn health_pass(&self) -> HealthSnapshot {
        self.health.record_watchdog_run();
        let snapshot = self.snapshot().await;
        if snapshot.sessions_over_sla > 0 {
            self.health.record_watchdog_alert();
            warn!(
                sessions_over_sla = snapshot.sessions_over_sla,
                heartbeat_sla_ms = snapshot.heartbeat_sla_ms,
                status = ?snapshot.status,
                "sessions missed heartbeat SLA"
            );
        }
        snapshot
    }

    pub async fn summary_pass(&self) {
        let snapshot = self.snapshot().await;
        let queue = self.sessions.queue();
        info!(
            mode = self.sessions.mode().as_str(),
            hot_path = self.flags.hot_path,
            strict_version_check = self.flags.strict_version_check,
            idempotency_guard = self.flags.idempotency_guard,
            tab_mutex = self.flags.tab_mutex,
            durable_queue = self.flags.durable_queue,
            heartbeat_coalescing = self.flags.heartbeat_coalescing,
            async_notify = self.flags.async_notify,
            status = ?snapshot.status,
            breaker_state = ?snapshot.breaker_state,
            active_users = snapshot.active_users,
            active_tabs = snapshot.active_tabs,
            p95_ms = snapshot.latency.p95_ms,
            failure_rate = snapshot.failure_rate,
            conflict_rate = snapshot.conflict_rate,
            queue_depth = queue.len(),
            queue_dropped = queue.dropped(),
            "operational summary"
        );
    }

    pub fn spawn(self: Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        let this = Arc::clone(&self);
        tasks.push(spawn_periodic(self.prune_interval, cancel.clone(), move || {
            let this = Arc::clone(&this);
            async move {
                this.prune_pass().await;
            }
        }));

        if self.flags.health_watchdog {
            let this = Arc::clone(&self);
            tasks.push(spawn_periodic(HEALTH_WATCHDOG_INTERVAL, cancel.clone(), move || {
                let this = Arc::clone(&this);
                async move {
                    this.health_pass().await;
                }
            }));
        }

        let this = Arc::clone(&self);
        tasks.push(spawn_periodic(SUMMARY_INTERVAL, cancel.clone(), move || {
            let this = Arc::clone(&this);
            async move { this.summary_pass().await }
        }));

        tasks
    }
}

/// Run `pass` every `period` until cancelled. The first run happens one
/// period after start.
fn spawn_periodic<F, Fut>(period: Duration, cancel: CancellationToken, mut pass: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => pass().await,
            }
        }
        debug!(period_ms = period.as_millis() as u64, "maintenance loop stopped");
    })
}
