//! Immutable runtime configuration.
//!
//! Loading flow:
//! 1. Start with compiled [`Config::default()`]
//! 2. Apply environment variable overrides
//!
//! Every component receives the sub-struct it needs at construction time; no
//! call site reads the environment directly.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

/// Boolean feature switches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeatureFlags {
    pub hot_path: bool,
    pub strict_version_check: bool,
    pub idempotency_guard: bool,
    pub tab_mutex: bool,
    pub durable_queue: bool,
    pub heartbeat_coalescing: bool,
    pub health_watchdog: bool,
    pub subscriber_watchdog: bool,
    pub async_notify: bool,
    pub reliability_layer: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            hot_path: true,
            strict_version_check: false,
            idempotency_guard: true,
            tab_mutex: true,
            durable_queue: true,
            heartbeat_coalescing: true,
            health_watchdog: true,
            subscriber_watchdog: true,
            async_notify: true,
            reliability_layer: true,
        }
    }
}

impl FeatureFlags {
    /// Strict version checking needs the durable store to be authoritative,
    /// so it always wins over the hot path.
    pub fn uses_hot_path(&self) -> bool {
        self.hot_path && !self.strict_version_check
    }
}

/// Retry and circuit breaker behavior around durable store calls.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    pub failure_threshold: u32,
    pub open_duration: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            base_delay: Duration::from_millis(80),
            max_delay: Duration::from_millis(1800),
            jitter_factor: 0.2,
            failure_threshold: 5,
            open_duration: Duration::from_secs(15),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdempotencyConfig {
    pub ttl: Duration,
    pub max_entries: usize,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(120),
            max_entries: 50_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoalesceConfig {
    pub window: Duration,
    pub max_entries: usize,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(2500),
            max_entries: 20_000,
        }
    }
}

/// What the durable write queue does when it is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaturationPolicy {
    /// Refuse the enqueue; the caller fails its request.
    Reject,
    /// Evict the oldest queued task and log a warning.
    DropOldest,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueConfig {
    pub capacity: usize,
    pub log_path: PathBuf,
    /// Number of acks between log compactions.
    pub compact_every: u64,
    /// Pause before the drain worker retries a task whose apply failed.
    pub retry_pause: Duration,
}

impl QueueConfig {
    pub fn with_log_path(log_path: PathBuf) -> Self {
        Self {
            capacity: 50_000,
            log_path,
            compact_every: 2000,
            retry_pause: Duration::from_secs(1),
        }
    }
}

/// Threshold pairs used to classify health.
#[derive(Clone, Debug, PartialEq)]
pub struct HealthThresholds {
    pub degraded_p95_ms: f64,
    pub critical_p95_ms: f64,
    pub degraded_failure_rate: f64,
    pub critical_failure_rate: f64,
    pub degraded_conflict_rate: f64,
    pub critical_conflict_rate: f64,
    pub degraded_sessions_over_sla: usize,
    pub critical_sessions_over_sla: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded_p95_ms: 150.0,
            critical_p95_ms: 300.0,
            degraded_failure_rate: 0.05,
            critical_failure_rate: 0.15,
            degraded_conflict_rate: 0.02,
            critical_conflict_rate: 0.08,
            degraded_sessions_over_sla: 1,
            critical_sessions_over_sla: 5,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct HealthConfig {
    pub heartbeat_sla: Duration,
    pub window: Duration,
    pub max_events: usize,
    pub thresholds: HealthThresholds,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_sla: Duration::from_secs(12),
            window: Duration::from_secs(60),
            max_events: 5000,
            thresholds: HealthThresholds::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchdogConfig {
    pub stale_after: Duration,
    pub tick_interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(30),
            tick_interval: Duration::from_secs(10),
        }
    }
}

/// Session ledger knobs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// A session with no heartbeat for this long is pruned.
    pub stale_after: Duration,
    pub prune_interval: Duration,
    pub user_stats_ttl: Duration,
    pub username_ttl: Duration,
    pub version_cache_ttl: Duration,
}

impl SessionConfig {
    pub fn for_sla(heartbeat_sla: Duration) -> Self {
        Self {
            stale_after: default_stale_after(heartbeat_sla),
            prune_interval: Duration::from_secs(15),
            user_stats_ttl: Duration::from_secs(2),
            username_ttl: Duration::from_secs(300),
            version_cache_ttl: Duration::from_secs(1800),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::for_sla(HealthConfig::default().heartbeat_sla)
    }
}

fn default_stale_after(heartbeat_sla: Duration) -> Duration {
    (heartbeat_sla + Duration::from_secs(4)).max(Duration::from_secs(15))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub notify_queue_max: usize,
    pub max_send_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8090,
            notify_queue_max: 5000,
            max_send_queue: 256,
        }
    }
}

/// Full process configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub flags: FeatureFlags,
    pub retry: RetryConfig,
    pub idempotency: IdempotencyConfig,
    pub coalesce: CoalesceConfig,
    pub queue: QueueConfig,
    pub health: HealthConfig,
    pub watchdog: WatchdogConfig,
    pub session: SessionConfig,
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self::with_data_dir(default_data_dir())
    }
}

impl Config {
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            queue: QueueConfig::with_log_path(data_dir.join("hotpath-queue.log")),
            data_dir,
            flags: FeatureFlags::default(),
            retry: RetryConfig::default(),
            idempotency: IdempotencyConfig::default(),
            coalesce: CoalesceConfig::default(),
            health: HealthConfig::default(),
            watchdog: WatchdogConfig::default(),
            session: SessionConfig::default(),
            server: ServerConfig::default(),
        }
    }

    /// Defaults plus process environment overrides.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults plus overrides from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env = EnvReader { lookup: &lookup };
        let data_dir = env.string("TABWATCH_DATA_DIR").map(PathBuf::from).unwrap_or_else(default_data_dir);
        let mut config = Self::with_data_dir(data_dir);
        config.apply_overrides(&env);
        config
    }

    /// Where the SQLite record store lives.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("tabwatch.db")
    }

    /// Where persisted warn+ and audit logs live.
    pub fn log_database_path(&self) -> PathBuf {
        self.data_dir.join("tabwatch-logs.db")
    }

    /// What the durable queue does once full.
    pub fn saturation_policy(&self) -> SaturationPolicy {
        if self.flags.durable_queue {
            SaturationPolicy::Reject
        } else {
            SaturationPolicy::DropOldest
        }
    }

    fn apply_overrides(&mut self, env: &EnvReader<'_>) {
        // ── Feature flags ───────────────────────────────────────────────
        let flags = &mut self.flags;
        env.set_bool("ENABLE_INMEMORY_HOT_PATH", &mut flags.hot_path);
        env.set_bool("ENABLE_STRICT_VERSION_CHECK", &mut flags.strict_version_check);
        env.set_bool("ENABLE_IDEMPOTENCY_GUARD", &mut flags.idempotency_guard);
        env.set_bool("ENABLE_TAB_MUTEX", &mut flags.tab_mutex);
        env.set_bool("ENABLE_DURABLE_HOTPATH_QUEUE", &mut flags.durable_queue);
        env.set_bool("ENABLE_HEARTBEAT_COALESCING", &mut flags.heartbeat_coalescing);
        env.set_bool("ENABLE_HEALTH_WATCHDOG", &mut flags.health_watchdog);
        env.set_bool("ENABLE_ADMIN_SOCKET_WATCHDOG", &mut flags.subscriber_watchdog);
        env.set_bool("ENABLE_ASYNC_ADMIN_NOTIFY", &mut flags.async_notify);
        env.set_bool("ENABLE_RELIABILITY_LAYER", &mut flags.reliability_layer);

        // ── Retry / breaker ─────────────────────────────────────────────
        self.retry.enabled = flags.reliability_layer;
        if let Some(v) = env.u64("RETRY_MAX_ATTEMPTS", 0, 20) {
            self.retry.max_retries = v as u32;
        }
        env.set_millis("RETRY_BASE_DELAY_MS", 1, 60_000, &mut self.retry.base_delay);
        env.set_millis("RETRY_MAX_DELAY_MS", 1, 600_000, &mut self.retry.max_delay);
        if let Some(v) = env.u64("CB_FAILURE_THRESHOLD", 1, 1000) {
            self.retry.failure_threshold = v as u32;
        }
        env.set_millis("CB_OPEN_MS", 1, 3_600_000, &mut self.retry.open_duration);

        // ── Caches ──────────────────────────────────────────────────────
        env.set_millis("IDEMPOTENCY_TTL_MS", 1, 86_400_000, &mut self.idempotency.ttl);
        env.set_usize("IDEMPOTENCY_MAX_ENTRIES", 1, 10_000_000, &mut self.idempotency.max_entries);
        env.set_millis("HEARTBEAT_COALESCE_WINDOW_MS", 1, 3_600_000, &mut self.coalesce.window);
        env.set_usize("HEARTBEAT_COALESCE_CACHE_MAX", 1, 10_000_000, &mut self.coalesce.max_entries);

        // ── Durable queue ───────────────────────────────────────────────
        env.set_usize("HOT_PATH_PERSIST_QUEUE_MAX", 1, 10_000_000, &mut self.queue.capacity);
        if let Some(v) = env.u64("HOT_PATH_DURABLE_COMPACT_INTERVAL", 1, 10_000_000) {
            self.queue.compact_every = v;
        }
        if let Some(v) = env.string("HOT_PATH_DURABLE_LOG_PATH") {
            self.queue.log_path = PathBuf::from(v);
        }

        // ── Health ──────────────────────────────────────────────────────
        env.set_millis("HEARTBEAT_SLA_MS", 1, 3_600_000, &mut self.health.heartbeat_sla);
        env.set_millis("HEALTH_WINDOW_MS", 1, 86_400_000, &mut self.health.window);
        env.set_usize("HEALTH_MAX_EVENTS", 1, 10_000_000, &mut self.health.max_events);
        let t = &mut self.health.thresholds;
        env.set_f64("HEALTH_DEGRADED_P95_MS", &mut t.degraded_p95_ms);
        env.set_f64("HEALTH_CRITICAL_P95_MS", &mut t.critical_p95_ms);
        env.set_f64("HEALTH_DEGRADED_FAILURE_RATE", &mut t.degraded_failure_rate);
        env.set_f64("HEALTH_CRITICAL_FAILURE_RATE", &mut t.critical_failure_rate);
        env.set_f64("HEALTH_DEGRADED_CONFLICT_RATE", &mut t.degraded_conflict_rate);
        env.set_f64("HEALTH_CRITICAL_CONFLICT_RATE", &mut t.critical_conflict_rate);
        env.set_usize("HEALTH_DEGRADED_SESSIONS_OVER_SLA", 0, 1_000_000, &mut t.degraded_sessions_over_sla);
        env.set_usize("HEALTH_CRITICAL_SESSIONS_OVER_SLA", 0, 1_000_000, &mut t.critical_sessions_over_sla);

        // ── Sessions ────────────────────────────────────────────────────
        self.session.stale_after = default_stale_after(self.health.heartbeat_sla);
        env.set_millis("SESSION_STALE_MS", 1, 86_400_000, &mut self.session.stale_after);
        env.set_millis("USER_STATS_CACHE_TTL_MS", 1, 3_600_000, &mut self.session.user_stats_ttl);
        env.set_millis("USER_CACHE_TTL_MS", 1, 86_400_000, &mut self.session.username_ttl);
        env.set_millis("SESSION_VERSION_CACHE_TTL_MS", 1, 86_400_000, &mut self.session.version_cache_ttl);

        // ── Subscribers / server ────────────────────────────────────────
        env.set_millis("ADMIN_SOCKET_STALE_MS", 1, 3_600_000, &mut self.watchdog.stale_after);
        env.set_usize("ADMIN_NOTIFY_QUEUE_MAX", 1, 10_000_000, &mut self.server.notify_queue_max);
        if let Some(v) = env.u64("TABWATCH_PORT", 0, 65535) {
            self.server.port = v as u16;
        }
        if let Some(v) = env.string("TABWATCH_HOST") {
            self.server.host = v;
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".tabwatch")
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a finite, non-negative float.
pub fn parse_non_negative_f64(val: &str) -> Option<f64> {
    let n: f64 = val.trim().parse().ok()?;
    (n.is_finite() && n >= 0.0).then_some(n)
}

// ── Env readers (thin wrappers) ─────────────────────────────────────────────

struct EnvReader<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl EnvReader<'_> {
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, name: &str) -> Option<String> {
        self.raw(name)
    }

    fn set_bool(&self, name: &str, target: &mut bool) {
        let Some(val) = self.raw(name) else { return };
        match parse_bool(&val) {
            Some(v) => *target = v,
            None => warn!(key = name, value = %val, "invalid boolean env var, ignoring"),
        }
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = self.raw(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid integer env var, ignoring");
        }
        result
    }

    fn set_usize(&self, name: &str, min: u64, max: u64, target: &mut usize) {
        if let Some(v) = self.u64(name, min, max) {
            *target = v as usize;
        }
    }

    fn set_millis(&self, name: &str, min: u64, max: u64, target: &mut Duration) {
        if let Some(v) = self.u64(name, min, max) {
            *target = Duration::from_millis(v);
        }
    }

    fn set_f64(&self, name: &str, target: &mut f64) {
        let Some(val) = self.raw(name) else { return };
        match parse_non_negative_f64(&val) {
            Some(v) => *target = v,
            None => warn!(key = name, value = %val, "invalid number env var, ignoring"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(move |k| map.get(k).cloned())
    }

    #[test]
    fn defaults_are_safe() {
        let config = from_pairs(&[("TABWATCH_DATA_DIR", "/tmp/tw")]);
        assert!(config.flags.uses_hot_path());
        assert!(config.flags.durable_queue);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.failure_threshold, 5);
        assert_eq!(config.retry.open_duration, Duration::from_secs(15));
        assert_eq!(config.idempotency.ttl, Duration::from_secs(120));
        assert_eq!(config.session.stale_after, Duration::from_secs(16));
        assert_eq!(config.queue.log_path, PathBuf::from("/tmp/tw/hotpath-queue.log"));
        assert_eq!(config.saturation_policy(), SaturationPolicy::Reject);
    }

    #[test]
    fn strict_check_disables_hot_path() {
        let config = from_pairs(&[("ENABLE_STRICT_VERSION_CHECK", "yes")]);
        assert!(config.flags.hot_path);
        assert!(!config.flags.uses_hot_path());
    }

    #[test]
    fn numeric_overrides_apply() {
        let config = from_pairs(&[
            ("RETRY_MAX_ATTEMPTS", "5"),
            ("CB_OPEN_MS", "2000"),
            ("HEARTBEAT_SLA_MS", "20000"),
            ("HEALTH_CRITICAL_FAILURE_RATE", "0.3"),
            ("TABWATCH_PORT", "9000"),
        ]);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.open_duration, Duration::from_millis(2000));
        assert_eq!(config.health.heartbeat_sla, Duration::from_secs(20));
        assert_eq!(config.session.stale_after, Duration::from_secs(24));
        assert!((config.health.thresholds.critical_failure_rate - 0.3).abs() < f64::EPSILON);
        assert_eq!(config.server.port, 9000);
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = from_pairs(&[
            ("ENABLE_TAB_MUTEX", "maybe"),
            ("RETRY_MAX_ATTEMPTS", "-1"),
            ("HEALTH_DEGRADED_P95_MS", "NaN"),
        ]);
        assert!(config.flags.tab_mutex);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.health.thresholds.degraded_p95_ms, 150.0);
    }

    #[test]
    fn best_effort_queue_when_durability_disabled() {
        let config = from_pairs(&[("ENABLE_DURABLE_HOTPATH_QUEUE", "off")]);
        assert_eq!(config.saturation_policy(), SaturationPolicy::DropOldest);
    }

    #[test]
    fn reliability_layer_toggles_retry() {
        let config = from_pairs(&[("ENABLE_RELIABILITY_LAYER", "0")]);
        assert!(!config.retry.enabled);
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool(" no "), Some(false));
        assert_eq!(parse_bool("2"), None);
        assert_eq!(parse_u64_range("10", 1, 5), None);
        assert_eq!(parse_u64_range("3", 1, 5), Some(3));
        assert_eq!(parse_non_negative_f64("-0.5"), None);
        assert_eq!(parse_non_negative_f64("0.25"), Some(0.25));
    }
}
