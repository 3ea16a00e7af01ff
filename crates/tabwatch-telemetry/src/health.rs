//! Sliding-window health aggregation.
//!
//! Ingestion outcomes are kept in a window bounded by both age and count.
//! A snapshot combines that window with the live session map and the
//! breaker state into a classified [`HealthSnapshot`].

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use tabwatch_core::config::{HealthConfig, HealthThresholds};
use tabwatch_core::session::{chrono_span, Session};
use tabwatch_core::BreakerState;

/// One recorded ingestion outcome.
#[derive(Clone, Debug, PartialEq)]
pub struct Outcome {
    pub latency_ms: Option<f64>,
    pub ok: bool,
    pub conflict: bool,
    pub event_type: String,
}

impl Outcome {
    pub fn ok(event_type: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            latency_ms: Some(latency_ms),
            ok: true,
            conflict: false,
            event_type: event_type.into(),
        }
    }

    pub fn failed(event_type: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            ok: false,
            ..Self::ok(event_type, latency_ms)
        }
    }

    pub fn conflict(event_type: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            ok: false,
            conflict: true,
            ..Self::ok(event_type, latency_ms)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

/// Named reasons behind a non-healthy classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthSignal {
    CircuitBreakerOpen,
    LatencyP95Critical,
    FailureRateCritical,
    ConflictRateCritical,
    SessionsOverSlaCritical,
    CircuitBreakerHalfOpen,
    LatencyP95Degraded,
    FailureRateDegraded,
    ConflictRateDegraded,
    SessionsOverSlaDegraded,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub avg_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

/// Point-in-time health view. Never persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub signals: Vec<HealthSignal>,
    pub recommendation: String,
    pub breaker_state: BreakerState,
    pub heartbeat_sla_ms: u64,
    pub active_users: usize,
    pub active_tabs: usize,
    pub sessions_over_sla: usize,
    pub window_ms: u64,
    pub event_count: usize,
    pub failure_count: usize,
    pub conflict_count: usize,
    pub failure_rate: f64,
    pub conflict_rate: f64,
    pub latency: LatencyStats,
    pub watchdog_runs: u64,
    pub watchdog_alerts: u64,
    pub last_watchdog_run_at: Option<DateTime<Utc>>,
    pub generated_at: DateTime<Utc>,
}

struct Recorded {
    at: DateTime<Utc>,
    outcome: Outcome,
}

#[derive(Default)]
struct Window {
    events: VecDeque<Recorded>,
    watchdog_runs: u64,
    watchdog_alerts: u64,
    last_watchdog_run_at: Option<DateTime<Utc>>,
}

pub struct HealthAggregator {
    config: HealthConfig,
    window: Mutex<Window>,
}

impl HealthAggregator {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            window: Mutex::new(Window::default()),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn record(&self, outcome: Outcome) {
        self.record_at(Utc::now(), outcome);
    }

    pub fn record_at(&self, at: DateTime<Utc>, outcome: Outcome) {
        let mut window = self.window.lock();
        window.events.push_back(Recorded { at, outcome });
        self.prune(&mut window, at);
    }

    pub fn record_watchdog_run(&self) {
        let mut window = self.window.lock();
        window.last_watchdog_run_at = Some(Utc::now());
        window.watchdog_runs += 1;
    }

    pub fn record_watchdog_alert(&self) {
        self.window.lock().watchdog_alerts += 1;
    }

    /// Number of outcomes currently inside the window.
    pub fn event_count(&self) -> usize {
        self.window.lock().events.len()
    }

    pub fn snapshot<'a>(
        &self,
        sessions: impl IntoIterator<Item = &'a Session>,
        breaker_state: BreakerState,
    ) -> HealthSnapshot {
        self.snapshot_at(Utc::now(), sessions, breaker_state)
    }

    pub fn snapshot_at<'a>(
        &self,
        now: DateTime<Utc>,
        sessions: impl IntoIterator<Item = &'a Session>,
        breaker_state: BreakerState,
    ) -> HealthSnapshot {
        let sla = chrono_span(self.config.heartbeat_sla);
        let mut users = HashSet::new();
        let mut active_tabs = 0;
        let mut sessions_over_sla = 0;
        for session in sessions {
            users.insert(&session.user_id);
            active_tabs += 1;
            if session.is_stale(now, sla) {
                sessions_over_sla += 1;
            }
        }

        let mut window = self.window.lock();
        self.prune(&mut window, now);

        let event_count = window.events.len();
        let failure_count = window.events.iter().filter(|e| !e.outcome.ok).count();
        let conflict_count = window.events.iter().filter(|e| e.outcome.conflict).count();
        let latency = latency_stats(window.events.iter().filter_map(|e| e.outcome.latency_ms));

        let mut snapshot = HealthSnapshot {
            status: HealthStatus::Healthy,
            signals: Vec::new(),
            recommendation: String::new(),
            breaker_state,
            heartbeat_sla_ms: self.config.heartbeat_sla.as_millis() as u64,
            active_users: users.len(),
            active_tabs,
            sessions_over_sla,
            window_ms: self.config.window.as_millis() as u64,
            event_count,
            failure_count,
            conflict_count,
            failure_rate: rate(failure_count, event_count),
            conflict_rate: rate(conflict_count, event_count),
            latency,
            watchdog_runs: window.watchdog_runs,
            watchdog_alerts: window.watchdog_alerts,
            last_watchdog_run_at: window.last_watchdog_run_at,
            generated_at: now,
        };
        drop(window);

        let (status, signals) = classify(&snapshot, &self.config.thresholds);
        snapshot.recommendation = recommendation(status, &signals).to_string();
        snapshot.status = status;
        snapshot.signals = signals;
        snapshot
    }

    fn prune(&self, window: &mut Window, now: DateTime<Utc>) {
        let cutoff = now - chrono_span(self.config.window);
        window.events.retain(|e| e.at >= cutoff);
        while window.events.len() > self.config.max_events {
            window.events.pop_front();
        }
    }
}

fn rate(part: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    ((part as f64 / total as f64) * 10_000.0).round() / 10_000.0
}

fn latency_stats(values: impl Iterator<Item = f64>) -> LatencyStats {
    let mut latencies: Vec<f64> = values.filter(|v| v.is_finite()).collect();
    if latencies.is_empty() {
        return LatencyStats::default();
    }
    latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let count = latencies.len();
    let sum: f64 = latencies.iter().sum();
    let pick = |percent: f64| {
        let idx = ((percent / 100.0) * count as f64).floor() as usize;
        latencies[idx.min(count - 1)]
    };
    LatencyStats {
        avg_ms: (sum / count as f64).round(),
        p95_ms: pick(95.0),
        p99_ms: pick(99.0),
    }
}

/// Strict priority: breaker open, then critical thresholds, then degraded.
fn classify(snapshot: &HealthSnapshot, t: &HealthThresholds) -> (HealthStatus, Vec<HealthSignal>) {
    use HealthSignal::*;

    if snapshot.breaker_state == BreakerState::Open {
        return (HealthStatus::Critical, vec![CircuitBreakerOpen]);
    }

    let mut signals = Vec::new();
    if snapshot.latency.p95_ms >= t.critical_p95_ms {
        signals.push(LatencyP95Critical);
    }
    if snapshot.failure_rate >= t.critical_failure_rate {
        signals.push(FailureRateCritical);
    }
    if snapshot.conflict_rate >= t.critical_conflict_rate {
        signals.push(ConflictRateCritical);
    }
    if snapshot.sessions_over_sla >= t.critical_sessions_over_sla {
        signals.push(SessionsOverSlaCritical);
    }
    if !signals.is_empty() {
        return (HealthStatus::Critical, signals);
    }

    if snapshot.breaker_state == BreakerState::HalfOpen {
        signals.push(CircuitBreakerHalfOpen);
    }
    if snapshot.latency.p95_ms >= t.degraded_p95_ms {
        signals.push(LatencyP95Degraded);
    }
    if snapshot.failure_rate >= t.degraded_failure_rate {
        signals.push(FailureRateDegraded);
    }
    if snapshot.conflict_rate >= t.degraded_conflict_rate {
        signals.push(ConflictRateDegraded);
    }
    if snapshot.sessions_over_sla >= t.degraded_sessions_over_sla {
        signals.push(SessionsOverSlaDegraded);
    }
    if !signals.is_empty() {
        return (HealthStatus::Degraded, signals);
    }

    (HealthStatus::Healthy, signals)
}

fn recommendation(status: HealthStatus, signals: &[HealthSignal]) -> &'static str {
    match status {
        HealthStatus::Critical if signals.contains(&HealthSignal::CircuitBreakerOpen) => {
            "Immediate action: the durable store is unavailable. Check backing store connectivity and reduce write traffic."
        }
        HealthStatus::Critical => {
            "Immediate action: system is critical. Escalate, reduce load and investigate the critical signals."
        }
        HealthStatus::Degraded => {
            "Monitor closely: system is degraded. Tune thresholds, watch latency and failures, prepare mitigation."
        }
        HealthStatus::Healthy => "Normal operation: system is healthy. Keep monitoring.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tabwatch_core::ids::{TabId, UserId};

    fn aggregator() -> HealthAggregator {
        HealthAggregator::new(HealthConfig::default())
    }

    fn session(tab: &str, user: &str, last_seen: DateTime<Utc>) -> Session {
        Session {
            tab_id: TabId::from_raw(tab),
            user_id: UserId::from_raw(user),
            username: "alice".into(),
            source_ip: None,
            state: None,
            last_seen,
            updated_at: last_seen,
            version: 1,
            last_operation_id: None,
        }
    }

    #[test]
    fn empty_window_is_healthy() {
        let snap = aggregator().snapshot(std::iter::empty(), BreakerState::Closed);
        assert_eq!(snap.status, HealthStatus::Healthy);
        assert!(snap.signals.is_empty());
        assert_eq!(snap.failure_rate, 0.0);
        assert_eq!(snap.latency, LatencyStats::default());
    }

    #[test]
    fn mixed_outcomes_compute_rates_and_percentiles() {
        let agg = aggregator();
        agg.record(Outcome::ok("heartbeat", 40.0));
        agg.record(Outcome::ok("heartbeat", 95.0));
        agg.record(Outcome::failed("heartbeat", 180.0));

        let snap = agg.snapshot(std::iter::empty(), BreakerState::Closed);
        assert_eq!(snap.event_count, 3);
        assert_eq!(snap.failure_rate, 0.3333);
        assert_eq!(snap.conflict_rate, 0.0);
        assert_eq!(snap.latency.avg_ms, 105.0);
        assert!(snap.latency.p99_ms >= snap.latency.p95_ms);
        assert!(snap.latency.p95_ms >= snap.latency.avg_ms);
        assert_eq!(snap.status, HealthStatus::Critical);
        assert!(snap.signals.contains(&HealthSignal::FailureRateCritical));
    }

    #[test]
    fn open_breaker_is_always_critical() {
        let agg = aggregator();
        agg.record(Outcome::ok("heartbeat", 5.0));
        let snap = agg.snapshot(std::iter::empty(), BreakerState::Open);
        assert_eq!(snap.status, HealthStatus::Critical);
        assert_eq!(snap.signals, vec![HealthSignal::CircuitBreakerOpen]);
        assert!(snap.recommendation.contains("durable store"));
    }

    #[test]
    fn half_open_breaker_degrades() {
        let agg = aggregator();
        agg.record(Outcome::ok("heartbeat", 5.0));
        let snap = agg.snapshot(std::iter::empty(), BreakerState::HalfOpen);
        assert_eq!(snap.status, HealthStatus::Degraded);
        assert_eq!(snap.signals, vec![HealthSignal::CircuitBreakerHalfOpen]);
    }

    #[test]
    fn conflicts_count_as_failures_and_conflicts() {
        let agg = aggregator();
        for _ in 0..9 {
            agg.record(Outcome::ok("state_change", 10.0));
        }
        agg.record(Outcome::conflict("state_change", 10.0));
        let snap = agg.snapshot(std::iter::empty(), BreakerState::Closed);
        assert_eq!(snap.conflict_count, 1);
        assert_eq!(snap.conflict_rate, 0.1);
        assert!(snap.signals.contains(&HealthSignal::ConflictRateCritical));
    }

    #[test]
    fn sessions_over_sla_are_counted() {
        let agg = aggregator();
        let now = Utc::now();
        let sessions = vec![
            session("t1", "u1", now),
            session("t2", "u1", now - chrono::Duration::seconds(20)),
            session("t3", "u2", now),
        ];
        let snap = agg.snapshot_at(now, &sessions, BreakerState::Closed);
        assert_eq!(snap.active_users, 2);
        assert_eq!(snap.active_tabs, 3);
        assert_eq!(snap.sessions_over_sla, 1);
        assert_eq!(snap.status, HealthStatus::Degraded);
        assert_eq!(snap.signals, vec![HealthSignal::SessionsOverSlaDegraded]);
    }

    #[test]
    fn window_drops_old_and_excess_events() {
        let agg = HealthAggregator::new(HealthConfig {
            window: Duration::from_secs(60),
            max_events: 3,
            ..HealthConfig::default()
        });
        let now = Utc::now();
        agg.record_at(now - chrono::Duration::seconds(120), Outcome::failed("heartbeat", 1.0));
        for _ in 0..5 {
            agg.record_at(now, Outcome::ok("heartbeat", 1.0));
        }
        assert_eq!(agg.event_count(), 3);
        let snap = agg.snapshot_at(now, std::iter::empty(), BreakerState::Closed);
        assert_eq!(snap.failure_count, 0);
    }

    #[test]
    fn watchdog_bookkeeping_is_reported() {
        let agg = aggregator();
        agg.record_watchdog_run();
        agg.record_watchdog_run();
        agg.record_watchdog_alert();
        let snap = agg.snapshot(std::iter::empty(), BreakerState::Closed);
        assert_eq!(snap.watchdog_runs, 2);
        assert_eq!(snap.watchdog_alerts, 1);
        assert!(snap.last_watchdog_run_at.is_some());
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let snap = aggregator().snapshot(std::iter::empty(), BreakerState::HalfOpen);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["breakerState"], "HALF_OPEN");
        assert_eq!(json["signals"][0], "circuit_breaker_half_open");
        assert!(json["latency"].get("p95Ms").is_some());
    }
}
