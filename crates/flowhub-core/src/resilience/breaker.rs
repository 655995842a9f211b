//! Per-adapter circuit breaker
//!
//! Closed → Open once consecutive failures reach the threshold; Open → HalfOpen
//! after the reset timeout; exactly one probe runs while HalfOpen and every
//! concurrent caller waits on its outcome.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
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

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a breaker for observability
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub threshold: u32,
    pub reset_timeout_ms: u64,
}

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
    /// Bumped every time the circuit opens
    generation: u64,
    /// Outcome channel of the in-flight HalfOpen probe
    probe: Option<watch::Receiver<Option<bool>>>,
}

/// How a call was let through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ticket {
    /// Admitted while Closed in the given generation
    Closed(u64),
    /// The single HalfOpen probe
    Probe,
}

enum Admission {
    Proceed(u64),
    Probe(watch::Sender<Option<bool>>),
    Wait(watch::Receiver<Option<bool>>),
    Reject,
}

/// Failure-tracking gate around outbound calls
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("CircuitBreaker")
            .field("name", &stats.name)
            .field("state", &stats.state)
            .field("failure_count", &stats.failure_count)
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(name: impl Into<String>, threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            reset_timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                last_failure_time: None,
                generation: 0,
                probe: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Counters and state for observability
    pub fn stats(&self) -> BreakerStats {
        let inner = self.lock();
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_time: inner.last_failure_time,
            threshold: self.threshold,
            reset_timeout_ms: self.reset_timeout.as_millis() as u64,
        }
    }

    /// Run `op` if the breaker admits it, recording the outcome.
    ///
    /// Only errors for which [`Error::trips_breaker`] holds count as failures;
    /// any other outcome is a success from the breaker's point of view.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let probe = loop {
            match self.admit() {
                Admission::Proceed(generation) => break Err(generation),
                Admission::Probe(tx) => break Ok(tx),
                Admission::Wait(rx) => {
                    if !Self::await_probe(rx).await {
                        return Err(Error::CircuitOpen(self.name.clone()));
                    }
                }
                Admission::Reject => {
                    debug!(breaker = %self.name, "Circuit open, rejecting call");
                    return Err(Error::CircuitOpen(self.name.clone()));
                }
            }
        };

        match probe {
            Err(generation) => {
                let result = op().await;
                self.record(Ticket::Closed(generation), result.as_ref().err());
                result
            }
            Ok(tx) => {
                let mut guard = ProbeGuard {
                    breaker: self,
                    tx: Some(tx),
                };
                let result = op().await;
                guard.finish(result.as_ref().err());
                result
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // A poisoned lock only means a panic elsewhere; the counters are still usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn admit(&self) -> Admission {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Admission::Proceed(inner.generation),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    info!(breaker = %self.name, "Reset timeout elapsed, admitting half-open probe");
                    inner.state = CircuitState::HalfOpen;
                    let (tx, rx) = watch::channel(None);
                    inner.probe = Some(rx);
                    Admission::Probe(tx)
                } else {
                    Admission::Reject
                }
            }
            CircuitState::HalfOpen => match inner.probe.clone() {
                Some(rx) => Admission::Wait(rx),
                None => {
                    let (tx, rx) = watch::channel(None);
                    inner.probe = Some(rx);
                    Admission::Probe(tx)
                }
            },
        }
    }

    /// Wait for the in-flight probe; true when it closed the circuit
    async fn await_probe(mut rx: watch::Receiver<Option<bool>>) -> bool {
        match rx.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => (*outcome).unwrap_or(false),
            Err(_) => false,
        }
    }

    fn record(&self, ticket: Ticket, error: Option<&Error>) {
        match error {
            Some(err) if err.trips_breaker() => self.on_failure(ticket, err),
            _ => self.on_success(ticket),
        }
    }

    /// A Closed-state call that outlived its generation must not move the state
    fn is_current(inner: &BreakerInner, ticket: Ticket) -> bool {
        match ticket {
            Ticket::Probe => inner.state == CircuitState::HalfOpen,
            Ticket::Closed(generation) => {
                inner.state == CircuitState::Closed && generation == inner.generation
            }
        }
    }

    fn on_success(&self, ticket: Ticket) {
        let mut inner = self.lock();
        inner.success_count = inner.success_count.saturating_add(1);
        if !Self::is_current(&inner, ticket) {
            debug!(breaker = %self.name, state = %inner.state, "Ignoring success from a stale call");
            return;
        }

        if ticket == Ticket::Probe {
            info!(breaker = %self.name, "Probe succeeded, closing circuit");
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            inner.probe = None;
        }
        inner.failure_count = 0;
    }

    fn on_failure(&self, ticket: Ticket, err: &Error) {
        let mut inner = self.lock();
        inner.last_failure_time = Some(Utc::now());
        if !Self::is_current(&inner, ticket) {
            debug!(breaker = %self.name, state = %inner.state, error = %err, "Ignoring failure from a stale call");
            return;
        }

        inner.failure_count = inner.failure_count.saturating_add(1);
        if ticket == Ticket::Probe || inner.failure_count >= self.threshold {
            warn!(
                breaker = %self.name,
                failures = inner.failure_count,
                threshold = self.threshold,
                error = %err,
                "Opening circuit"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.generation = inner.generation.wrapping_add(1);
            inner.probe = None;
        }
    }

    /// The probe future was dropped before completing; reopen without counting a failure
    fn abandon_probe(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.probe = None;
        }
    }
}

struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    tx: Option<watch::Sender<Option<bool>>>,
}

impl ProbeGuard<'_> {
    fn finish(&mut self, error: Option<&Error>) {
        let closed = !matches!(error, Some(err) if err.trips_breaker());
        self.breaker.record(Ticket::Probe, error);
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(closed));
        }
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            self.breaker.abandon_probe();
            let _ = tx.send(Some(false));
        }
    }
}
