//! Per-worker circuit breaker.
//!
//! A registry may serve many concurrent workflow instances, so a worker
//! that keeps failing in one run trips the breaker for all of them:
//!
//! ```text
//! Closed ──(failure_threshold consecutive failures)──► Open
//!   ▲                                                  │
//!   │ success                              reset_timeout elapsed
//!   │                                                  ▼
//!   └──────────────────────────────────────────── HalfOpen ──failure──► Open
//! ```

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Attempts pass through.
    Closed,
    /// Attempts are rejected without invoking the worker.
    Open,
    /// A limited number of trial attempts are let through.
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before allowing a trial attempt.
    pub reset_timeout_ms: u64,
    /// Trial attempts allowed while half-open.
    pub half_open_max_attempts: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            half_open_max_attempts: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// Rejection returned by [`CircuitBreaker::check`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit open for worker '{worker_id}', retry after {}ms", .retry_after.as_millis())]
pub struct CircuitOpen {
    pub worker_id: String,
    pub retry_after: Duration,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    half_open_attempts: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    worker_id: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(worker_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            worker_id: worker_id.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                half_open_attempts: 0,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    /// Whether an attempt may be made right now.
    pub fn check(&self) -> Result<(), CircuitOpen> {
        self.check_at(Instant::now())
    }

    fn check_at(&self, now: Instant) -> Result<(), CircuitOpen> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        self.refresh(&mut inner, now);

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen if inner.half_open_attempts < self.config.half_open_max_attempts => {
                inner.half_open_attempts += 1;
                Ok(())
            }
            _ => Err(CircuitOpen {
                worker_id: self.worker_id.clone(),
                retry_after: inner
                    .last_failure
                    .map(|t| self.config.reset_timeout().saturating_sub(now.duration_since(t)))
                    .unwrap_or_else(|| self.config.reset_timeout()),
            }),
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if inner.state != CircuitState::Closed {
            tracing::info!("[CircuitBreaker] {} closed after successful trial", self.worker_id);
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.half_open_attempts = 0;
    }

    /// Give back a half-open trial slot taken by an attempt that ended
    /// without an outcome (cancelled before the worker returned).
    pub fn release_trial(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if inner.state == CircuitState::HalfOpen && inner.half_open_attempts > 0 {
            inner.half_open_attempts -= 1;
        }
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    fn record_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.consecutive_failures += 1;
        inner.last_failure = Some(now);

        let trips = inner.state == CircuitState::HalfOpen
            || (inner.state == CircuitState::Closed
                && inner.consecutive_failures >= self.config.failure_threshold);
        if trips {
            tracing::warn!(
                "[CircuitBreaker] {} opened after {} consecutive failures",
                self.worker_id,
                inner.consecutive_failures
            );
            inner.state = CircuitState::Open;
            inner.half_open_attempts = 0;
        }
    }

    fn refresh(&self, inner: &mut Inner, now: Instant) {
        if inner.state != CircuitState::Open {
            return;
        }
        if let Some(last) = inner.last_failure {
            if now.duration_since(last) >= self.config.reset_timeout() {
                inner.state = CircuitState::HalfOpen;
                inner.half_open_attempts = 0;
            }
        }
    }
}
