//! Circuit breaker for device and upstream protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: dependency assumed down, calls fail fast
//! - Half-Open: testing if the dependency recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: error% >= threshold AND calls >= volume threshold within the window
//! Open → Half-Open: after reset timeout
//! Half-Open → Closed: probe call succeeds (window reset)
//! Half-Open → Open: probe call fails (reset timer restarted)
//! ```
//!
//! # Design Decisions
//! - Per-dependency circuit breaker (not global)
//! - Fail fast in Open state (no waiting for timeout)
//! - Single probe in Half-Open (prevents hammering a recovering device)
//! - Rejections are counted as `rejects`, never as failures
//! - State lives behind a short synchronous lock; it is never held across the call

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::connection::state::unix_millis;
use crate::error::{LinkError, ProtocolError};
use crate::observability::metrics;

/// Latency samples kept for mean/p95 reporting.
const LATENCY_SAMPLES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Error returned by a call made through a breaker.
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    #[error("circuit {name} is open, retry after {retry_after:?}")]
    Open { name: String, retry_after: Duration },

    #[error("call through {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error(transparent)]
    Inner(E),
}

impl From<CircuitError<LinkError>> for LinkError {
    fn from(err: CircuitError<LinkError>) -> Self {
        match err {
            CircuitError::Open { name, retry_after } => LinkError::CircuitOpen { name, retry_after },
            CircuitError::Timeout { name, timeout } => LinkError::Timeout {
                operation: format!("call through {}", name),
                timeout,
            },
            CircuitError::Inner(e) => e,
        }
    }
}

/// Decides whether an error says something about the dependency's health.
///
/// Errors that do not trip the breaker are recorded as successes: the dependency
/// answered, the answer just wasn't what the caller wanted.
pub trait TripsBreaker {
    fn trips_breaker(&self) -> bool {
        true
    }
}

impl TripsBreaker for LinkError {
    fn trips_breaker(&self) -> bool {
        match self {
            LinkError::Connection { .. } | LinkError::Timeout { .. } | LinkError::DeviceFailed { .. } => true,
            LinkError::Protocol { source, .. } => matches!(source, ProtocolError::Malformed(_)),
            LinkError::Upstream { status, .. } => match status {
                Some(code) => *code >= 500 || *code == 429,
                None => true,
            },
            // Admission, lookup and lifecycle errors never reached the dependency.
            LinkError::QueueFull { .. }
            | LinkError::CircuitOpen { .. }
            | LinkError::RateLimitExceeded { .. }
            | LinkError::Disconnected { .. }
            | LinkError::UnknownDevice(_)
            | LinkError::UnknownProtocol(_)
            | LinkError::ShuttingDown => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed,
    Open {
        opened_at_unix_ms: u64,
        next_attempt: Instant,
    },
    HalfOpen {
        probing: bool,
    },
}

impl Phase {
    fn state(&self) -> CircuitState {
        match self {
            Phase::Closed => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Success,
    Failure,
    Timeout,
}

#[derive(Debug)]
struct Bucket {
    start: Instant,
    successes: u32,
    failures: u32,
}

/// Bucketed rolling window of call outcomes.
#[derive(Debug)]
struct RollingWindow {
    bucket_width: Duration,
    span: Duration,
    buckets: VecDeque<Bucket>,
}

impl RollingWindow {
    fn new(span: Duration, buckets: u32) -> Self {
        let bucket_width = (span / buckets.max(1)).max(Duration::from_millis(1));
        Self {
            bucket_width,
            span,
            buckets: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.buckets.front() {
            if front.start + self.span <= now {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn record(&mut self, now: Instant, failed: bool) {
        self.prune(now);
        let fresh = match self.buckets.back() {
            Some(back) => now >= back.start + self.bucket_width,
            None => true,
        };
        if fresh {
            self.buckets.push_back(Bucket {
                start: now,
                successes: 0,
                failures: 0,
            });
        }
        if let Some(bucket) = self.buckets.back_mut() {
            if failed {
                bucket.failures += 1;
            } else {
                bucket.successes += 1;
            }
        }
    }

    /// (calls, failures) within the window.
    fn counts(&mut self, now: Instant) -> (u32, u32) {
        self.prune(now);
        self.buckets.iter().fold((0, 0), |(calls, failures), b| {
            (calls + b.successes + b.failures, failures + b.failures)
        })
    }

    fn reset(&mut self) {
        self.buckets.clear();
    }
}

/// Cumulative counters since the breaker was created.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BreakerStats {
    pub fires: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub rejects: u64,
    pub fallbacks: u64,
    /// Calls within the rolling window.
    pub window_calls: u32,
    /// Error percentage within the rolling window.
    pub error_percentage: f64,
    pub latency_mean_ms: f64,
    pub latency_p95_ms: f64,
}

/// Serializable breaker view for status APIs.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub state: CircuitState,
    pub stats: BreakerStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    window: RollingWindow,
    stats: BreakerStats,
    latencies: VecDeque<u64>,
}

/// Failure-rate circuit breaker for one named dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

/// Releases the half-open probe slot if the probe call is cancelled.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.breaker.lock();
        if let Phase::HalfOpen { probing: true } = inner.phase {
            inner.phase = Phase::HalfOpen { probing: false };
            tracing::debug!(breaker = %self.breaker.name, "Half-open probe cancelled, slot released");
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let window = RollingWindow::new(config.rolling_window(), config.rolling_buckets);
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                phase: Phase::Closed,
                window,
                stats: BreakerStats::default(),
                latencies: VecDeque::with_capacity(LATENCY_SAMPLES),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state. An open breaker whose reset timeout has elapsed still reports
    /// Open until the next call moves it to HalfOpen.
    pub fn state(&self) -> CircuitState {
        self.lock().phase.state()
    }

    /// Execute `call` through the breaker.
    pub async fn fire<F, Fut, T, E>(&self, call: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: TripsBreaker,
    {
        let probe = self.admit::<E>()?;
        let mut guard = ProbeGuard {
            breaker: self,
            armed: probe,
        };

        let started = Instant::now();
        let result = match self.config.call_timeout() {
            Some(timeout) => match tokio::time::timeout(timeout, call()).await {
                Ok(result) => result.map_err(CircuitError::Inner),
                Err(_) => Err(CircuitError::Timeout {
                    name: self.name.clone(),
                    timeout,
                }),
            },
            None => call().await.map_err(CircuitError::Inner),
        };

        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(CircuitError::Timeout { .. }) => Outcome::Timeout,
            Err(CircuitError::Inner(e)) if e.trips_breaker() => Outcome::Failure,
            Err(_) => Outcome::Success,
        };

        guard.armed = false;
        self.complete(probe, outcome, started.elapsed());
        result
    }

    /// Execute `call`; when it does not produce a value (rejected, timed out or failed)
    /// hand the error to `fallback` instead.
    pub async fn fire_with_fallback<F, Fut, T, E, FB>(&self, call: F, fallback: FB) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: TripsBreaker,
        FB: FnOnce(CircuitError<E>) -> Result<T, CircuitError<E>>,
    {
        match self.fire(call).await {
            Ok(value) => Ok(value),
            Err(err) => {
                self.lock().stats.fallbacks += 1;
                fallback(err)
            }
        }
    }

    /// Returns whether the admitted call is the half-open probe.
    fn admit<E>(&self) -> Result<bool, CircuitError<E>> {
        let mut inner = self.lock();
        inner.stats.fires += 1;
        let now = Instant::now();

        let phase = inner.phase;
        let rejected = match phase {
            Phase::Closed => return Ok(false),
            Phase::Open { next_attempt, .. } if now >= next_attempt => {
                self.transition(&mut inner, Phase::HalfOpen { probing: true });
                return Ok(true);
            }
            Phase::HalfOpen { probing: false } => {
                inner.phase = Phase::HalfOpen { probing: true };
                return Ok(true);
            }
            Phase::Open { next_attempt, .. } => next_attempt.saturating_duration_since(now),
            // The probe is still out; ask callers to come back after it settles.
            Phase::HalfOpen { probing: true } => self.config.call_timeout().unwrap_or(self.config.reset_timeout()),
        };

        inner.stats.rejects += 1;
        drop(inner);
        metrics::record_breaker_rejected(&self.name);

        Err(CircuitError::Open {
            name: self.name.clone(),
            retry_after: rejected,
        })
    }

    fn complete(&self, probe: bool, outcome: Outcome, latency: Duration) {
        let mut inner = self.lock();
        let now = Instant::now();

        match outcome {
            Outcome::Success => inner.stats.successes += 1,
            Outcome::Failure => inner.stats.failures += 1,
            Outcome::Timeout => inner.stats.timeouts += 1,
        }
        if inner.latencies.len() == LATENCY_SAMPLES {
            inner.latencies.pop_front();
        }
        inner.latencies.push_back(latency.as_millis() as u64);

        let failed = !matches!(outcome, Outcome::Success);
        inner.window.record(now, failed);

        if probe {
            if failed {
                self.trip(&mut inner, now);
            } else {
                inner.window.reset();
                self.transition(&mut inner, Phase::Closed);
            }
            return;
        }

        if let Phase::Closed = inner.phase {
            let (calls, failures) = inner.window.counts(now);
            if calls >= self.config.volume_threshold
                && calls > 0
                && failures * 100 >= self.config.error_threshold_percentage * calls
            {
                tracing::warn!(
                    breaker = %self.name,
                    calls,
                    failures,
                    "Error threshold exceeded, opening circuit"
                );
                self.trip(&mut inner, now);
            }
        }
    }

    fn trip(&self, inner: &mut Inner, now: Instant) {
        self.transition(
            inner,
            Phase::Open {
                opened_at_unix_ms: unix_millis(),
                next_attempt: now + self.config.reset_timeout(),
            },
        );
    }

    fn transition(&self, inner: &mut Inner, next: Phase) {
        let from = inner.phase.state();
        inner.phase = next;
        let to = next.state();
        if from != to {
            tracing::info!(breaker = %self.name, from = from.as_str(), to = to.as_str(), "Circuit state changed");
            metrics::record_breaker_transition(&self.name, to);
        }
    }

    pub fn status(&self) -> BreakerStatus {
        let mut inner = self.lock();
        let now = Instant::now();

        let (calls, failures) = inner.window.counts(now);
        let mut stats = inner.stats.clone();
        stats.window_calls = calls;
        stats.error_percentage = if calls == 0 {
            0.0
        } else {
            failures as f64 * 100.0 / calls as f64
        };

        if !inner.latencies.is_empty() {
            let mut sorted: Vec<u64> = inner.latencies.iter().copied().collect();
            sorted.sort_unstable();
            stats.latency_mean_ms = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
            let idx = ((sorted.len() as f64 * 0.95).ceil() as usize).clamp(1, sorted.len()) - 1;
            stats.latency_p95_ms = sorted[idx] as f64;
        }

        let (opened_at, next_attempt_at) = match inner.phase {
            Phase::Open {
                opened_at_unix_ms,
                next_attempt,
            } => {
                let wait = next_attempt.saturating_duration_since(now).as_millis() as u64;
                (Some(opened_at_unix_ms), Some(unix_millis() + wait))
            }
            _ => (None, None),
        };

        BreakerStatus {
            state: inner.phase.state(),
            stats,
            opened_at,
            next_attempt_at,
        }
    }
}
