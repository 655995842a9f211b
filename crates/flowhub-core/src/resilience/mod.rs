//! Resilience primitives for outbound platform calls
//!
//! This module provides:
//! - A per-adapter circuit breaker with a single half-open probe
//! - A bounded exponential-backoff retry policy for transient failures
//!
//! The retry policy runs *inside* the breaker, so an exhausted retry
//! sequence counts as one breaker failure.

mod breaker;
mod retry;

pub use breaker::{BreakerStats, CircuitBreaker, CircuitState};
pub use retry::{DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, RetryPolicy};
