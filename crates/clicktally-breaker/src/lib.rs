//! Keyed circuit breaker for async operations.
//!
//! One [`CircuitBreaker`] holds independent state per string key, so several
//! dependencies (a telemetry endpoint, a search backend) can share an
//! instance without affecting each other.
//!
//! # States
//!
//! - **Closed**: operations run. Failures count up; a success resets the count.
//! - **Open**: operations short-circuit to the fallback (or [`BreakerError::Open`])
//!   until `next_attempt_time`.
//! - **Half-Open**: entered on the first call after `next_attempt_time`. Real
//!   attempts go through; `success_threshold` successes close the circuit, a
//!   single failure reopens it with a fresh cooldown.
//!
//! Every guarded call races its configured timeout; losing counts as a failure.

mod error;

pub use error::BreakerError;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Per-key breaker state. Created lazily on first use of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<Instant>,
    pub next_attempt_time: Option<Instant>,
}

impl Default for CircuitStats {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            next_attempt_time: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerOptions {
    /// Failures in the closed state before the circuit opens.
    pub failure_threshold: u32,
    /// Half-open successes needed to close the circuit.
    pub success_threshold: u32,
    /// Per-call timeout.
    pub timeout: Duration,
    /// How long an open circuit waits before probing.
    pub cooldown_period: Duration,
}

impl Default for BreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 8,
            success_threshold: 2,
            timeout: Duration::from_secs(10),
            cooldown_period: Duration::from_secs(300),
        }
    }
}

impl BreakerOptions {
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_cooldown_period(mut self, cooldown: Duration) -> Self {
        self.cooldown_period = cooldown;
        self
    }
}

#[derive(Debug, Default)]
pub struct CircuitBreaker {
    circuits: Mutex<HashMap<String, CircuitStats>>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Effective state of `key`. An open circuit whose cooldown has elapsed
    /// reports `HalfOpen`; the stored state only changes on the next call.
    pub fn state(&self, key: &str) -> CircuitState {
        let circuits = self.circuits.lock();
        match circuits.get(key) {
            None => CircuitState::Closed,
            Some(stats) => effective_state(stats, Instant::now()),
        }
    }

    /// True while calls on `key` would be short-circuited.
    pub fn is_open(&self, key: &str) -> bool {
        self.state(key) == CircuitState::Open
    }

    pub fn stats(&self, key: &str) -> Option<CircuitStats> {
        self.circuits.lock().get(key).cloned()
    }

    /// Forget all state for `key`. Operator use only.
    pub fn reset(&self, key: &str) {
        if self.circuits.lock().remove(key).is_some() {
            info!(circuit = %key, "Circuit reset");
        }
    }

    pub fn reset_all(&self) {
        self.circuits.lock().clear();
        info!("All circuits reset");
    }

    /// Run `operation` under the breaker for `key`.
    pub async fn execute<T, E, F, Fut>(
        &self,
        key: &str,
        operation: F,
        options: &BreakerOptions,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Err(retry_in) = self.admit(key, options) {
            debug!(circuit = %key, ?retry_in, "Circuit open, short-circuiting");
            return Err(BreakerError::Open {
                key: key.to_string(),
                retry_in,
            });
        }

        match tokio::time::timeout(options.timeout, operation()).await {
            Ok(Ok(value)) => {
                self.record_success(key, options);
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record_failure(key, options);
                Err(BreakerError::Operation(e))
            }
            Err(_) => {
                self.record_failure(key, options);
                Err(BreakerError::Timeout {
                    key: key.to_string(),
                    timeout: options.timeout,
                })
            }
        }
    }

    /// Like [`execute`](Self::execute), but any failure (including an open
    /// circuit) is handed to `fallback` and its result returned instead.
    pub async fn execute_or_else<T, E, F, Fut, G, GFut>(
        &self,
        key: &str,
        operation: F,
        fallback: G,
        options: &BreakerOptions,
    ) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce(BreakerError<E>) -> GFut,
        GFut: Future<Output = T>,
    {
        match self.execute(key, operation, options).await {
            Ok(value) => value,
            Err(e) => fallback(e).await,
        }
    }

    /// Decide whether a call may proceed, moving Open to HalfOpen once the
    /// cooldown has passed. Returns the remaining wait when rejected.
    fn admit(&self, key: &str, options: &BreakerOptions) -> Result<(), Duration> {
        let now = Instant::now();
        let mut circuits = self.circuits.lock();
        let stats = circuits.entry(key.to_string()).or_default();

        if stats.state != CircuitState::Open {
            return Ok(());
        }

        let next_attempt = stats
            .next_attempt_time
            .unwrap_or_else(|| now + options.cooldown_period);
        if now < next_attempt {
            return Err(next_attempt - now);
        }

        stats.state = CircuitState::HalfOpen;
        stats.success_count = 0;
        info!(circuit = %key, "Circuit half-open, probing");
        Ok(())
    }

    fn record_success(&self, key: &str, options: &BreakerOptions) {
        let mut circuits = self.circuits.lock();
        let stats = circuits.entry(key.to_string()).or_default();

        match stats.state {
            CircuitState::Closed => {
                stats.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                stats.success_count += 1;
                if stats.success_count >= options.success_threshold {
                    stats.state = CircuitState::Closed;
                    stats.failure_count = 0;
                    stats.success_count = 0;
                    stats.next_attempt_time = None;
                    info!(circuit = %key, "Circuit closed");
                }
            }
            CircuitState::Open => {
                warn!(circuit = %key, "Success recorded while circuit is open");
            }
        }
    }

    fn record_failure(&self, key: &str, options: &BreakerOptions) {
        let now = Instant::now();
        let mut circuits = self.circuits.lock();
        let stats = circuits.entry(key.to_string()).or_default();

        stats.failure_count = stats.failure_count.saturating_add(1);
        stats.last_failure_time = Some(now);

        let reopen = match stats.state {
            CircuitState::Closed => stats.failure_count >= options.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if reopen {
            stats.state = CircuitState::Open;
            stats.success_count = 0;
            stats.next_attempt_time = Some(now + options.cooldown_period);
            warn!(
                circuit = %key,
                failures = stats.failure_count,
                cooldown = ?options.cooldown_period,
                "Circuit opened"
            );
        }
    }
}

fn effective_state(stats: &CircuitStats, now: Instant) -> CircuitState {
    match (stats.state, stats.next_attempt_time) {
        (CircuitState::Open, Some(next)) if now >= next => CircuitState::HalfOpen,
        (state, _) => state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "click-batch";

    fn options() -> BreakerOptions {
        BreakerOptions::default()
            .with_failure_threshold(3)
            .with_success_threshold(1)
            .with_cooldown_period(Duration::from_secs(60))
    }

    async fn fail(breaker: &CircuitBreaker, opts: &BreakerOptions) -> BreakerError<String> {
        breaker
            .execute(KEY, || async { Err::<(), _>("boom".to_string()) }, opts)
            .await
            .unwrap_err()
    }

    async fn succeed(
        breaker: &CircuitBreaker,
        opts: &BreakerOptions,
    ) -> Result<u32, BreakerError<String>> {
        breaker
            .execute(KEY, || async { Ok::<_, String>(7) }, opts)
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_failure_threshold() {
        let breaker = CircuitBreaker::default();
        let opts = options();

        for _ in 0..2 {
            fail(&breaker, &opts).await;
            assert_eq!(breaker.state(KEY), CircuitState::Closed);
        }
        fail(&breaker, &opts).await;

        assert_eq!(breaker.state(KEY), CircuitState::Open);
        let err = succeed(&breaker, &opts).await.unwrap_err();
        assert!(err.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count_while_closed() {
        let breaker = CircuitBreaker::default();
        let opts = options();

        fail(&breaker, &opts).await;
        fail(&breaker, &opts).await;
        assert_eq!(succeed(&breaker, &opts).await.unwrap(), 7);
        assert_eq!(breaker.stats(KEY).unwrap().failure_count, 0);

        fail(&breaker, &opts).await;
        assert_eq!(breaker.state(KEY), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let breaker = CircuitBreaker::default();
        let opts = options();
        for _ in 0..3 {
            fail(&breaker, &opts).await;
        }

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(breaker.state(KEY), CircuitState::HalfOpen);

        assert_eq!(succeed(&breaker, &opts).await.unwrap(), 7);
        let stats = breaker.stats(KEY).unwrap();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.success_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_needs_success_threshold() {
        let breaker = CircuitBreaker::default();
        let opts = options().with_success_threshold(2);
        for _ in 0..3 {
            fail(&breaker, &opts).await;
        }
        tokio::time::advance(Duration::from_secs(60)).await;

        succeed(&breaker, &opts).await.unwrap();
        assert_eq!(breaker.stats(KEY).unwrap().state, CircuitState::HalfOpen);
        succeed(&breaker, &opts).await.unwrap();
        assert_eq!(breaker.stats(KEY).unwrap().state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_with_fresh_cooldown() {
        let breaker = CircuitBreaker::default();
        let opts = options();
        for _ in 0..3 {
            fail(&breaker, &opts).await;
        }
        tokio::time::advance(Duration::from_secs(61)).await;

        fail(&breaker, &opts).await;
        let stats = breaker.stats(KEY).unwrap();
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(
            stats.next_attempt_time,
            Some(Instant::now() + Duration::from_secs(60))
        );

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.is_open(KEY));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let breaker = CircuitBreaker::default();
        let opts = options().with_timeout(Duration::from_secs(10));

        let err = breaker
            .execute(
                KEY,
                || async {
                    tokio::time::sleep(Duration::from_secs(20)).await;
                    Ok::<_, String>(())
                },
                &opts,
            )
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(breaker.stats(KEY).unwrap().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_used_on_failure_and_when_open() {
        let breaker = CircuitBreaker::default();
        let opts = options().with_failure_threshold(1);

        let value = breaker
            .execute_or_else(
                KEY,
                || async { Err::<u32, _>("down".to_string()) },
                |_| async { 0 },
                &opts,
            )
            .await;
        assert_eq!(value, 0);
        assert!(breaker.is_open(KEY));

        let value = breaker
            .execute_or_else(
                KEY,
                || async { Ok::<u32, String>(5) },
                |e| async move {
                    assert!(e.is_open());
                    1
                },
                &opts,
            )
            .await;
        assert_eq!(value, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_isolated_and_resettable() {
        let breaker = CircuitBreaker::default();
        let opts = options().with_failure_threshold(1);

        fail(&breaker, &opts).await;
        assert!(breaker.is_open(KEY));
        assert_eq!(breaker.state("search"), CircuitState::Closed);

        breaker.reset(KEY);
        assert_eq!(breaker.state(KEY), CircuitState::Closed);
        assert!(breaker.stats(KEY).is_none());
    }
}
