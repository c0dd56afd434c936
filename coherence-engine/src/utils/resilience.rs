//! Circuit breaking and transient retry
//!
//! Every network and storage call made by the engine goes through a
//! [`ResilienceRegistry`], keyed by operation name so one failing dependency
//! cannot starve the others.
//!
//! **State machine (per operation key):**
//! - CLOSED → OPEN after `failure_threshold` consecutive failures
//! - OPEN → HALF_OPEN on the first call after `cooldown_ms`
//! - HALF_OPEN → CLOSED after `success_threshold` consecutive successes
//! - HALF_OPEN → OPEN on any failure
//!
//! While OPEN, calls short-circuit without invoking the wrapped operation.
//!
//! **Retry (inside one call):**
//! - Retryable errors are retried up to `max_attempts` with exponential
//!   backoff capped at `max_backoff_ms`
//! - Non-retryable errors return immediately without retrying
//! - The final error counts as a circuit failure unless it reports
//!   `counts_as_failure() == false` (e.g. upstream throttling)

use chrono::Utc;
use coherence_common::events::{CoherenceEvent, EventBus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Classifies errors for the retry loop
pub trait Retryable {
    /// Whether a retry could plausibly succeed
    fn is_retryable(&self) -> bool;

    /// Whether the error counts against the breaker
    fn counts_as_failure(&self) -> bool {
        true
    }
}

impl Retryable for coherence_common::Error {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

/// Breaker and retry tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Attempts per call, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    2
}
fn default_cooldown_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    100
}
fn default_max_backoff_ms() -> u64 {
    5_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            cooldown_ms: default_cooldown_ms(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl ResilienceConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("resilience.failure_threshold must be at least 1".to_string());
        }
        if self.success_threshold == 0 {
            return Err("resilience.success_threshold must be at least 1".to_string());
        }
        if self.max_attempts == 0 {
            return Err("resilience.max_attempts must be at least 1".to_string());
        }
        if !(self.backoff_multiplier >= 1.0) {
            return Err("resilience.backoff_multiplier must be >= 1.0".to_string());
        }
        Ok(())
    }
}

/// Breaker position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker bookkeeping for one operation key
#[derive(Debug, Clone)]
pub struct CircuitState {
    pub status: CircuitStatus,
    /// Consecutive failures (reset by a success while CLOSED)
    pub failure_count: u32,
    pub last_failure_time: Option<Instant>,
    pub consecutive_successes: u32,
    opened_at: Option<Instant>,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self {
            status: CircuitStatus::Closed,
            failure_count: 0,
            last_failure_time: None,
            consecutive_successes: 0,
            opened_at: None,
        }
    }
}

/// Outcome of a guarded call that did not produce a value
#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    /// The breaker is open; the operation was not invoked
    #[error("Circuit open for operation '{operation}'")]
    CircuitOpen { operation: String },

    /// The operation failed (after retries, if retryable)
    #[error("{0}")]
    Failed(E),
}

impl<E> ResilienceError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen { .. })
    }
}

/// Per-operation circuit breakers plus the retry executor
pub struct ResilienceRegistry {
    config: ResilienceConfig,
    circuits: Mutex<HashMap<String, CircuitState>>,
    event_bus: Option<EventBus>,
}

impl ResilienceRegistry {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
            event_bus: None,
        }
    }

    /// Emit `CircuitOpened` / `CircuitClosed` on this bus
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CircuitState>> {
        // a poisoned breaker table is still structurally valid
        self.circuits.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Decide whether a call may proceed, moving OPEN → HALF_OPEN after cooldown
    fn admit(&self, operation: &str) -> bool {
        let mut circuits = self.lock();
        let state = circuits.entry(operation.to_string()).or_default();
        match state.status {
            CircuitStatus::Closed | CircuitStatus::HalfOpen => true,
            CircuitStatus::Open => {
                let cooldown = Duration::from_millis(self.config.cooldown_ms);
                let cooled = state
                    .opened_at
                    .map(|opened| opened.elapsed() >= cooldown)
                    .unwrap_or(true);
                if cooled {
                    state.status = CircuitStatus::HalfOpen;
                    state.consecutive_successes = 0;
                    tracing::info!(operation, "Circuit half-open, probing");
                }
                cooled
            }
        }
    }

    fn record_success(&self, operation: &str) {
        let closed = {
            let mut circuits = self.lock();
            let state = circuits.entry(operation.to_string()).or_default();
            match state.status {
                CircuitStatus::Closed => {
                    state.failure_count = 0;
                    false
                }
                CircuitStatus::HalfOpen => {
                    state.consecutive_successes += 1;
                    if state.consecutive_successes >= self.config.success_threshold {
                        state.status = CircuitStatus::Closed;
                        state.failure_count = 0;
                        state.consecutive_successes = 0;
                        state.opened_at = None;
                        true
                    } else {
                        false
                    }
                }
                // a call admitted before the breaker opened; leave it open
                CircuitStatus::Open => false,
            }
        };

        if closed {
            tracing::info!(operation, "Circuit closed");
            if let Some(bus) = &self.event_bus {
                bus.emit_lossy(CoherenceEvent::CircuitClosed {
                    operation: operation.to_string(),
                    timestamp: Utc::now(),
                });
            }
        }
    }

    fn record_failure(&self, operation: &str) {
        let opened = {
            let mut circuits = self.lock();
            let state = circuits.entry(operation.to_string()).or_default();
            let now = Instant::now();
            state.last_failure_time = Some(now);
            state.failure_count = state.failure_count.saturating_add(1);
            state.consecutive_successes = 0;

            let trip = match state.status {
                CircuitStatus::Closed => state.failure_count >= self.config.failure_threshold,
                CircuitStatus::HalfOpen => true,
                CircuitStatus::Open => false,
            };
            if trip {
                state.status = CircuitStatus::Open;
                state.opened_at = Some(now);
                Some(state.failure_count)
            } else {
                None
            }
        };

        if let Some(failure_count) = opened {
            tracing::warn!(operation, failure_count, "Circuit opened");
            if let Some(bus) = &self.event_bus {
                bus.emit_lossy(CoherenceEvent::CircuitOpened {
                    operation: operation.to_string(),
                    failure_count,
                    timestamp: Utc::now(),
                });
            }
        }
    }

    /// Run `operation_fn` under the breaker for `operation`, retrying transient errors
    pub async fn execute<T, E, F, Fut>(
        &self,
        operation: &str,
        operation_fn: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        self.execute_with_attempts(operation, self.config.max_attempts, operation_fn)
            .await
    }

    /// Like `execute` with a per-call attempt budget
    ///
    /// Callers that run their own retry loop inside `operation_fn` pass `1`.
    pub async fn execute_with_attempts<T, E, F, Fut>(
        &self,
        operation: &str,
        max_attempts: u32,
        mut operation_fn: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let max_attempts = max_attempts.max(1);
        if !self.admit(operation) {
            tracing::debug!(operation, "Circuit open, short-circuiting call");
            return Err(ResilienceError::CircuitOpen {
                operation: operation.to_string(),
            });
        }

        let started = Instant::now();
        let mut attempt = 0u32;
        let mut backoff_ms = self.config.initial_backoff_ms;

        loop {
            attempt += 1;

            match operation_fn().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(
                            operation,
                            attempt,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Operation succeeded after retry"
                        );
                    }
                    self.record_success(operation);
                    return Ok(value);
                }
                Err(err) => {
                    if !err.is_retryable() {
                        tracing::debug!(operation, error = %err, "Non-retryable failure");
                        if err.counts_as_failure() {
                            self.record_failure(operation);
                        }
                        return Err(ResilienceError::Failed(err));
                    }

                    if attempt >= max_attempts {
                        tracing::error!(
                            operation,
                            attempt,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            error = %err,
                            "Operation failed: retries exhausted"
                        );
                        if err.counts_as_failure() {
                            self.record_failure(operation);
                        }
                        return Err(ResilienceError::Failed(err));
                    }

                    let delay_ms = backoff_ms.min(self.config.max_backoff_ms);
                    tracing::warn!(
                        operation,
                        attempt,
                        backoff_ms = delay_ms,
                        error = %err,
                        "Transient failure, will retry after backoff"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                    let next = (backoff_ms as f64 * self.config.backoff_multiplier) as u64;
                    backoff_ms = next.min(self.config.max_backoff_ms).max(1);
                }
            }
        }
    }

    /// Like `execute`, but an open circuit yields `fallback()` instead of an error
    pub async fn execute_with_fallback<T, E, F, Fut, FB>(
        &self,
        operation: &str,
        operation_fn: F,
        fallback: FB,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
        FB: FnOnce() -> T,
    {
        match self.execute(operation, operation_fn).await {
            Ok(value) => Ok(value),
            Err(ResilienceError::CircuitOpen { .. }) => Ok(fallback()),
            Err(ResilienceError::Failed(err)) => Err(err),
        }
    }

    /// Like `execute`, but an open circuit yields `T::default()` (empty result for fetch-like ops)
    pub async fn execute_or_default<T, E, F, Fut>(
        &self,
        operation: &str,
        operation_fn: F,
    ) -> Result<T, E>
    where
        T: Default,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        self.execute_with_fallback(operation, operation_fn, T::default)
            .await
    }

    /// Current breaker state for an operation, if it has been used
    pub fn state(&self, operation: &str) -> Option<CircuitState> {
        self.lock().get(operation).cloned()
    }

    /// Current status; unknown operations are CLOSED
    pub fn status(&self, operation: &str) -> CircuitStatus {
        self.state(operation)
            .map(|s| s.status)
            .unwrap_or(CircuitStatus::Closed)
    }

    /// Force an operation back to CLOSED
    pub fn reset(&self, operation: &str) {
        self.lock().remove(operation);
    }

    /// Snapshot of every known breaker, sorted by key
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let mut all: Vec<(String, CircuitState)> = self
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Number of breakers currently OPEN
    pub fn open_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|s| s.status == CircuitStatus::Open)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError {
        retryable: bool,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error (retryable: {})", self.retryable)
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            self.retryable
        }
    }

    fn config(max_attempts: u32) -> ResilienceConfig {
        ResilienceConfig {
            failure_threshold: 3,
            success_threshold: 2,
            cooldown_ms: 1_000,
            max_attempts,
            initial_backoff_ms: 10,
            max_backoff_ms: 40,
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_transient_errors() {
        let registry = ResilienceRegistry::new(config(3));
        let calls = Arc::new(AtomicU32::new(0));

        let c = calls.clone();
        let result = registry
            .execute("op", || {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(TestError { retryable: true })
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(registry.status("op"), CircuitStatus::Closed);
        assert_eq!(registry.state("op").unwrap().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_fails_immediately_and_is_counted() {
        let registry = ResilienceRegistry::new(config(5));
        let calls = Arc::new(AtomicU32::new(0));

        let c = calls.clone();
        let result: Result<(), _> = registry
            .execute("op", || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError { retryable: false }) }
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::Failed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.state("op").unwrap().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_is_capped() {
        let registry = ResilienceRegistry::new(config(4));
        let start = Instant::now();

        let _: Result<(), _> = registry
            .execute("op", || async { Err(TestError { retryable: true }) })
            .await;

        // 10 + 20 + 40 (capped) between the four attempts
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(70));
        assert!(elapsed < Duration::from_millis(80));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_used_when_open() {
        let registry = ResilienceRegistry::new(config(1));
        for _ in 0..3 {
            let _: Result<Vec<u8>, _> = registry
                .execute("fetch", || async { Err(TestError { retryable: true }) })
                .await;
        }
        assert_eq!(registry.status("fetch"), CircuitStatus::Open);
        assert_eq!(registry.open_count(), 1);

        let items: Vec<u8> = registry
            .execute_or_default("fetch", || async { Ok::<_, TestError>(vec![1, 2, 3]) })
            .await
            .unwrap();
        assert!(items.is_empty());

        let marker = registry
            .execute_with_fallback(
                "fetch",
                || async { Ok::<_, TestError>("stored") },
                || "queued",
            )
            .await
            .unwrap();
        assert_eq!(marker, "queued");
    }

    #[tokio::test(start_paused = true)]
    async fn test_breakers_are_independent_per_operation() {
        let registry = ResilienceRegistry::new(config(1));
        for _ in 0..3 {
            let _: Result<(), _> = registry
                .execute("failing", || async { Err(TestError { retryable: true }) })
                .await;
        }
        assert_eq!(registry.status("failing"), CircuitStatus::Open);

        let ok = registry
            .execute("healthy", || async { Ok::<_, TestError>(1) })
            .await;
        assert!(ok.is_ok());
        assert_eq!(registry.status("healthy"), CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_closes_breaker() {
        let registry = ResilienceRegistry::new(config(1));
        for _ in 0..3 {
            let _: Result<(), _> = registry
                .execute("op", || async { Err(TestError { retryable: true }) })
                .await;
        }
        registry.reset("op");
        assert_eq!(registry.status("op"), CircuitStatus::Closed);
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_config_validation() {
        assert!(ResilienceConfig::default().validate().is_ok());
        let bad = ResilienceConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
