use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;
use tracing::{error, info, warn};

use tabwatch_core::config::RetryConfig;
use tabwatch_core::{BreakerState, AUDIT_TARGET};

use crate::error::StoreError;

/// Circuit breaker state machine.
#[derive(Clone, Debug, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { since: Instant },
    /// Cooldown elapsed; exactly one trial call is let through.
    HalfOpen { trial_in_flight: bool },
}

struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
}

/// Retry with exponential backoff and a circuit breaker around durable store calls.
///
/// - Retryable errors are retried up to `max_retries` times with jittered backoff
/// - Non-retryable errors (`NotFound`, `Duplicate`) pass straight through and
///   count as a healthy response
/// - N consecutive failures → open → cooldown → half-open trial → closed or reopened
/// - With the layer disabled, every call is a single attempt and the breaker never trips
pub struct RetryingExecutor {
    config: RetryConfig,
    breaker: Mutex<Breaker>,
    total_retries: AtomicU64,
    rejected: AtomicU64,
}

impl RetryingExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            breaker: Mutex::new(Breaker {
                state: CircuitState::Closed,
                consecutive_failures: 0,
            }),
            total_retries: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Single attempt, no breaker.
    pub fn disabled() -> Self {
        Self::new(RetryConfig {
            enabled: false,
            ..RetryConfig::default()
        })
    }

    pub async fn execute<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        if !self.config.enabled {
            return op().await;
        }

        let mut trial = TrialGuard {
            executor: self,
            armed: self.check_circuit(operation)?,
        };

        let mut attempt = 0;
        loop {
            let result = op().await;
            // Every outcome is recorded below from here on.
            trial.armed = false;
            match result {
                Ok(value) => {
                    self.record_success();
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => {
                    self.record_success();
                    return Err(e);
                }
                Err(e) => {
                    self.record_failure(operation);

                    if attempt >= self.config.max_retries {
                        error!(
                            operation,
                            attempt,
                            breaker_state = %self.state(),
                            error_kind = e.error_kind(),
                            error = %e,
                            "store operation failed after retries"
                        );
                        return Err(e);
                    }

                    let delay = self.retry_delay(attempt);
                    self.total_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        breaker_state = %self.state(),
                        error = %e,
                        "retrying store operation"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;

                    if self.state() == BreakerState::Open {
                        self.rejected.fetch_add(1, Ordering::Relaxed);
                        return Err(StoreError::CircuitOpen {
                            operation: operation.to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Check if the circuit breaker allows a request through. `Ok(true)`
    /// means the caller holds the single half-open trial.
    fn check_circuit(&self, operation: &str) -> Result<bool, StoreError> {
        let mut breaker = self.breaker.lock();
        match breaker.state.clone() {
            CircuitState::Closed => return Ok(false),
            CircuitState::Open { since } if since.elapsed() >= self.config.open_duration => {
                info!(operation, "circuit breaker half-open, allowing trial call");
                breaker.state = CircuitState::HalfOpen { trial_in_flight: true };
                return Ok(true);
            }
            CircuitState::HalfOpen { trial_in_flight: false } => {
                breaker.state = CircuitState::HalfOpen { trial_in_flight: true };
                return Ok(true);
            }
            CircuitState::Open { .. } | CircuitState::HalfOpen { trial_in_flight: true } => {}
        }
        let state = state_of(&breaker.state);
        drop(breaker);

        self.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(operation, breaker_state = %state, "circuit open, failing fast");
        Err(StoreError::CircuitOpen {
            operation: operation.to_string(),
        })
    }

    fn record_success(&self) {
        let mut breaker = self.breaker.lock();
        breaker.consecutive_failures = 0;
        if breaker.state != CircuitState::Closed {
            info!("circuit breaker closed after successful call");
            breaker.state = CircuitState::Closed;
        }
    }

    fn record_failure(&self, operation: &str) {
        let mut breaker = self.breaker.lock();
        breaker.consecutive_failures += 1;
        let failures = breaker.consecutive_failures;

        let trip = match breaker.state {
            CircuitState::HalfOpen { .. } => true,
            CircuitState::Closed => failures >= self.config.failure_threshold,
            CircuitState::Open { .. } => false,
        };
        if trip {
            breaker.state = CircuitState::Open { since: Instant::now() };
            drop(breaker);
            warn!(
                target: AUDIT_TARGET,
                operation,
                failures,
                cooldown_ms = self.config.open_duration.as_millis() as u64,
                "circuit breaker opened"
            );
        }
    }

    /// Exponential backoff capped at `max_delay`, plus up to `jitter_factor` of it.
    fn retry_delay(&self, attempt: u32) -> Duration {
        let exp_delay = self.config.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let capped = exp_delay.min(self.config.max_delay.as_millis() as f64);
        let jitter_range = (capped * self.config.jitter_factor).max(1.0);
        let jitter = rand::thread_rng().gen_range(0.0..jitter_range);
        Duration::from_millis((capped + jitter) as u64)
    }

    pub fn state(&self) -> BreakerState {
        state_of(&self.breaker.lock().state)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.breaker.lock().consecutive_failures
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// Calls refused because the circuit was open.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// Frees the half-open trial slot if the trial call is dropped before it
/// reports an outcome, so the next caller can run the trial instead.
struct TrialGuard<'a> {
    executor: &'a RetryingExecutor,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut breaker = self.executor.breaker.lock();
        if breaker.state == (CircuitState::HalfOpen { trial_in_flight: true }) {
            breaker.state = CircuitState::HalfOpen { trial_in_flight: false };
            drop(breaker);
            warn!("half-open trial cancelled before completing, releasing trial slot");
        }
    }
}

fn state_of(state: &CircuitState) -> BreakerState {
    match state {
        CircuitState::Closed => BreakerState::Closed,
        CircuitState::Open { .. } => BreakerState::Open,
        CircuitState::HalfOpen { .. } => BreakerState::HalfOpen,
    }
}
