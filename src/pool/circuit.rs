//! Circuit breaker guarding catalog reads
//!
//! This module implements a circuit breaker with three states:
//! - Closed: Normal operation, calls pass through
//! - Open: The dependency is failing, callers should fail fast
//! - HalfOpen: Recovery probing, one probe call in flight at a time
//!
//! The breaker is advisory: callers ask [`CatalogBreaker::should_short_circuit`]
//! before the guarded call and report the outcome with
//! [`CatalogBreaker::record_success`] / [`CatalogBreaker::record_failure`].
//! [`CatalogBreaker::try_acquire`] wraps both in a [`BreakerPermit`] whose
//! drop frees the HalfOpen probe slot if the call never reports back.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Error returned by [`CatalogBreaker::call`]
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("Circuit breaker is open, call short-circuited")]
    ShortCircuited,

    #[error(transparent)]
    Inner(E),
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - calls are allowed
    Closed,

    /// Dependency has failed - calls are short-circuited
    Open {
        /// When the breaker tripped
        opened_at: Instant,
    },

    /// Testing recovery - one probe at a time
    HalfOpen {
        /// Successful probes so far
        successes: u32,

        /// A caller holds the probe slot and has not reported back yet
        probe_in_flight: bool,
    },
}

impl CircuitState {
    /// Get a human-readable state name
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open { .. } => "OPEN",
            CircuitState::HalfOpen { .. } => "HALF_OPEN",
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Failures within `window` that trip the breaker
    pub failure_threshold: u32,

    /// Sliding window for counting failures
    pub window: Duration,

    /// How long the breaker stays open before probing
    pub open_timeout: Duration,

    /// Successful probes needed to close again
    pub half_open_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(30),
            open_timeout: Duration::from_secs(60),
            half_open_probes: 2,
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitStats {
    /// Current state name
    pub state: &'static str,

    /// Failures currently inside the sliding window
    pub failures_in_window: usize,

    /// Number of times the breaker has opened
    pub open_count: u64,

    /// Calls reported as successful
    pub total_successes: u64,

    /// Calls reported as failed
    pub total_failures: u64,

    /// Calls rejected by `should_short_circuit`
    pub short_circuited: u64,

    /// Milliseconds since the last state transition
    pub time_in_state_ms: u64,
}

struct BreakerInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    open_count: u64,
    total_successes: u64,
    total_failures: u64,
    short_circuited: u64,
    last_transition: Instant,
    /// Bumped every time the probe slot is handed out
    probe_epoch: u64,
}

enum Admission {
    Rejected,
    Pass,
    Probe(u64),
}

/// Admission to one guarded call
///
/// Report the outcome with [`BreakerPermit::success`] or
/// [`BreakerPermit::failure`]. A probe permit dropped without an outcome
/// (cancelled future, panic) frees the slot for the next caller.
#[must_use = "report the outcome of the guarded call"]
pub struct BreakerPermit<'a> {
    breaker: &'a CatalogBreaker,
    probe: Option<u64>,
}

impl BreakerPermit<'_> {
    /// Whether this permit holds the HalfOpen probe slot
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }

    pub fn success(mut self) {
        self.probe = None;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.probe = None;
        self.breaker.record_failure();
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if let Some(epoch) = self.probe.take() {
            self.breaker.release_probe(epoch);
        }
    }
}

/// Three-state circuit breaker for a single dependency
///
/// Construct once and share behind an `Arc`; all methods take `&self`.
pub struct CatalogBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CatalogBreaker {
    /// Create a new breaker in the Closed state
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                open_count: 0,
                total_successes: 0,
                total_failures: 0,
                short_circuited: 0,
                last_transition: Instant::now(),
                probe_epoch: 0,
            }),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether the caller should skip the guarded call and fail fast
    ///
    /// Side-effecting: the first check after the open timeout moves the
    /// breaker to HalfOpen and hands that caller the probe slot. A caller
    /// granted the slot must report an outcome; prefer [`Self::try_acquire`].
    pub fn should_short_circuit(&self) -> bool {
        matches!(self.admit(), Admission::Rejected)
    }

    /// Gate a call, returning `None` when it should be short-circuited
    pub fn try_acquire(&self) -> Option<BreakerPermit<'_>> {
        match self.admit() {
            Admission::Rejected => None,
            Admission::Pass => Some(BreakerPermit {
                breaker: self,
                probe: None,
            }),
            Admission::Probe(epoch) => Some(BreakerPermit {
                breaker: self,
                probe: Some(epoch),
            }),
        }
    }

    fn admit(&self) -> Admission {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        let state = inner.state;
        let admission = match state {
            CircuitState::Closed => Admission::Pass,

            CircuitState::Open { opened_at } => {
                if now.duration_since(opened_at) < self.config.open_timeout {
                    Admission::Rejected
                } else {
                    info!("Catalog breaker transitioning from OPEN to HALF_OPEN");
                    Self::transition(
                        &mut inner,
                        CircuitState::HalfOpen {
                            successes: 0,
                            probe_in_flight: true,
                        },
                    );
                    inner.probe_epoch += 1;
                    Admission::Probe(inner.probe_epoch)
                }
            }

            CircuitState::HalfOpen {
                successes,
                probe_in_flight,
            } => {
                if probe_in_flight {
                    Admission::Rejected
                } else {
                    inner.state = CircuitState::HalfOpen {
                        successes,
                        probe_in_flight: true,
                    };
                    inner.probe_epoch += 1;
                    Admission::Probe(inner.probe_epoch)
                }
            }
        };

        if matches!(admission, Admission::Rejected) {
            inner.short_circuited += 1;
        }
        admission
    }

    /// Free the probe slot handed out as `epoch` if it is still held
    fn release_probe(&self, epoch: u64) {
        let mut inner = self.inner.lock();
        if let CircuitState::HalfOpen {
            successes,
            probe_in_flight: true,
        } = inner.state
        {
            if inner.probe_epoch == epoch {
                debug!(successes, "Probe abandoned without an outcome, releasing HALF_OPEN slot");
                inner.state = CircuitState::HalfOpen {
                    successes,
                    probe_in_flight: false,
                };
            }
        }
    }

    /// Record a successful guarded call
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.total_successes += 1;

        let state = inner.state;
        match state {
            CircuitState::Closed => {
                // One success wipes accumulated failures
                inner.failures.clear();
            }

            CircuitState::Open { .. } => {
                debug!("Recorded success while OPEN, staying open");
            }

            CircuitState::HalfOpen { successes, .. } => {
                let successes = successes + 1;
                debug!(successes, required = self.config.half_open_probes, "Probe succeeded in HALF_OPEN");

                if successes >= self.config.half_open_probes {
                    info!(successes, "Catalog breaker transitioning from HALF_OPEN to CLOSED");
                    Self::reset_inner(&mut inner);
                } else {
                    inner.state = CircuitState::HalfOpen {
                        successes,
                        probe_in_flight: false,
                    };
                }
            }
        }
    }

    /// Record a failed guarded call
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.total_failures += 1;

        let window = self.config.window;
        while let Some(&oldest) = inner.failures.front() {
            if now.duration_since(oldest) < window {
                break;
            }
            inner.failures.pop_front();
        }
        inner.failures.push_back(now);

        let state = inner.state;
        match state {
            CircuitState::Closed => {
                let failures = inner.failures.len();
                debug!(failures, threshold = self.config.failure_threshold, "Catalog read failed in CLOSED");

                if failures >= self.config.failure_threshold as usize {
                    warn!(failures, "Catalog breaker transitioning from CLOSED to OPEN");
                    Self::trip_inner(&mut inner);
                }
            }

            CircuitState::Open { .. } => {
                debug!("Catalog read failed while OPEN");
            }

            CircuitState::HalfOpen { successes, .. } => {
                warn!(successes, "Probe failed in HALF_OPEN, reopening breaker");
                Self::trip_inner(&mut inner);
            }
        }
    }

    /// Run `f` through the breaker, recording its outcome
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire().ok_or(BreakerError::ShortCircuited)?;

        match f().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Force the breaker open
    pub fn trip(&self) {
        let mut inner = self.inner.lock();
        warn!("Catalog breaker tripped manually");
        Self::trip_inner(&mut inner);
    }

    /// Force the breaker closed, clearing the failure window
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        info!("Catalog breaker reset manually");
        Self::reset_inner(&mut inner);
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> CircuitStats {
        let inner = self.inner.lock();
        CircuitStats {
            state: inner.state.name(),
            failures_in_window: inner.failures.len(),
            open_count: inner.open_count,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            short_circuited: inner.short_circuited,
            time_in_state_ms: inner.last_transition.elapsed().as_millis() as u64,
        }
    }

    fn trip_inner(inner: &mut BreakerInner) {
        inner.open_count += 1;
        Self::transition(
            inner,
            CircuitState::Open {
                opened_at: Instant::now(),
            },
        );
    }

    fn reset_inner(inner: &mut BreakerInner) {
        inner.failures.clear();
        Self::transition(inner, CircuitState::Closed);
    }

    fn transition(inner: &mut BreakerInner, state: CircuitState) {
        inner.state = state;
        inner.last_transition = Instant::now();
    }
}

impl Default for CatalogBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
