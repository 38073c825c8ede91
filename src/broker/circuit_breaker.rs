//! Circuit breaker for backend calls
//!
//! ```text
//!      ┌──────────┐  failures >= threshold  ┌──────────┐
//!      │  CLOSED  │ ──────────────────────► │   OPEN   │ ◄─────┐
//!      └──────────┘                         └──────────┘       │
//!           ▲                                    │ timeout     │ trial failed
//!           │ trial succeeded               ┌────▼─────┐       │
//!           └────────────────────────────── │HALF-OPEN │ ──────┘
//!                                           └──────────┘
//! ```
//!
//! All state lives in atomics so one breaker can be shared by every concurrent
//! producer call without a lock. Half-open admits exactly one trial call; the
//! probing flag is encoded in the state word so claiming the trial is a single
//! compare-and-swap. The trial is held by a [`Permit`] guard, so a caller that
//! is cancelled mid-trial hands the half-open slot back instead of wedging it.

use crate::core::time::{epoch_millis, system_clock, TimeProvider};
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN_IDLE: u8 = 2;
const HALF_OPEN_PROBING: u8 = 3;
// `opened_at` while the circuit is not open; reads as "just opened"
const NOT_OPEN: u64 = u64::MAX;

/// Publicly observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Returned when the breaker rejects a call without attempting it
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Circuit '{name}' is open; retry in {retry_after_ms}ms")]
pub struct CircuitOpenError {
    pub name: String,
    pub retry_after_ms: u64,
}

/// Classifies errors that count as breaker failures
///
/// Only transport/backend failures should return `true`; programmer and
/// message-format errors pass through without touching the failure counter.
pub trait TripsBreaker {
    fn trips_breaker(&self) -> bool;
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting a trial call
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Unix epoch millis of the most recent counted failure, 0 if none
    pub last_failure_at_ms: u64,
    pub failure_threshold: u32,
    pub open_timeout: Duration,
    pub rejected_calls: u64,
}

/// Admission to run one call; settles the breaker with the call's verdict
///
/// Dropping an unsettled trial permit (the call was cancelled or panicked)
/// returns the breaker to half-open idle so the next caller can try.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.release_trial();
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    /// Millis since `epoch` at which the circuit last opened
    opened_at: AtomicU64,
    last_failure_at_ms: AtomicU64,
    rejected_calls: AtomicU64,
    epoch: Instant,
    clock: Arc<dyn TimeProvider>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("consecutive_failures", &self.consecutive_failures())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, system_clock())
    }

    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn TimeProvider>,
    ) -> Self {
        let epoch = clock.now();
        Self {
            name: name.into(),
            config: CircuitBreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                open_timeout: config.open_timeout,
            },
            state: AtomicU8::new(CLOSED),
            consecutive_failures: AtomicU32::new(0),
            opened_at: AtomicU64::new(NOT_OPEN),
            last_failure_at_ms: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
            epoch,
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        match self.state.load(Ordering::Acquire) {
            CLOSED => CircuitState::Closed,
            OPEN => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: self.state(),
            consecutive_failures: self.consecutive_failures(),
            last_failure_at_ms: self.last_failure_at_ms.load(Ordering::Relaxed),
            failure_threshold: self.config.failure_threshold,
            open_timeout: self.config.open_timeout,
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
        }
    }

    /// Run `operation` through the breaker
    ///
    /// Rejects with `CircuitOpenError` (converted into `E`) without invoking
    /// the operation while the circuit is open or a half-open trial is running.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError> + TripsBreaker,
    {
        let permit = self.acquire().map_err(E::from)?;
        let result = operation().await;
        match &result {
            Ok(_) => permit.success(),
            Err(error) if error.trips_breaker() => permit.failure(),
            // No verdict on the backend; dropping the permit frees a trial
            Err(_) => drop(permit),
        }
        result
    }

    /// Check whether a call would currently be admitted, without claiming a trial
    pub fn would_admit(&self) -> bool {
        match self.state.load(Ordering::Acquire) {
            CLOSED | HALF_OPEN_IDLE => true,
            OPEN => self.open_elapsed() >= self.open_timeout_ms(),
            _ => false,
        }
    }

    /// Force the breaker back to closed (administrative reset)
    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.opened_at.store(NOT_OPEN, Ordering::Release);
        self.state.store(CLOSED, Ordering::Release);
        log::info!("Circuit '{}' manually reset to closed", self.name);
    }

    fn now_ms(&self) -> u64 {
        self.clock.now().saturating_duration_since(self.epoch).as_millis() as u64
    }

    fn open_timeout_ms(&self) -> u64 {
        self.config.open_timeout.as_millis() as u64
    }

    fn open_elapsed(&self) -> u64 {
        self.now_ms()
            .saturating_sub(self.opened_at.load(Ordering::Acquire))
    }

    fn reject(&self, retry_after_ms: u64) -> CircuitOpenError {
        self.rejected_calls.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "Circuit '{}' rejected call, retry in {}ms",
            self.name,
            retry_after_ms
        );
        CircuitOpenError {
            name: self.name.clone(),
            retry_after_ms,
        }
    }

    fn permit(&self, trial: bool) -> Permit<'_> {
        Permit {
            breaker: self,
            trial,
            settled: false,
        }
    }

    fn acquire(&self) -> Result<Permit<'_>, CircuitOpenError> {
        loop {
            match self.state.load(Ordering::Acquire) {
                CLOSED => return Ok(self.permit(false)),
                OPEN => {
                    let elapsed = self.open_elapsed();
                    let timeout = self.open_timeout_ms();
                    if elapsed < timeout {
                        return Err(self.reject(timeout - elapsed));
                    }
                    if self
                        .state
                        .compare_exchange(OPEN, HALF_OPEN_PROBING, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        log::info!("Circuit '{}' half-open, admitting trial call", self.name);
                        return Ok(self.permit(true));
                    }
                }
                HALF_OPEN_IDLE => {
                    if self
                        .state
                        .compare_exchange(
                            HALF_OPEN_IDLE,
                            HALF_OPEN_PROBING,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return Ok(self.permit(true));
                    }
                }
                _ => return Err(self.reject(0)),
            }
        }
    }

    fn on_success(&self, trial: bool) {
        self.consecutive_failures.store(0, Ordering::Release);
        if trial {
            self.opened_at.store(NOT_OPEN, Ordering::Release);
            if self
                .state
                .compare_exchange(HALF_OPEN_PROBING, CLOSED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                log::info!("Circuit '{}' closed after successful trial", self.name);
            }
        }
    }

    fn on_failure(&self, trial: bool) {
        self.last_failure_at_ms
            .store(epoch_millis(self.clock.system_time()), Ordering::Relaxed);
        if trial {
            self.opened_at.store(self.now_ms(), Ordering::Release);
            self.state.store(OPEN, Ordering::Release);
            log::warn!("Circuit '{}' trial failed, re-opened", self.name);
            return;
        }
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.config.failure_threshold
            && self
                .state
                .compare_exchange(CLOSED, OPEN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            // Until this lands `opened_at` is NOT_OPEN and acquirers keep rejecting
            self.opened_at.store(self.now_ms(), Ordering::Release);
            log::warn!(
                "Circuit '{}' opened after {} consecutive failures",
                self.name,
                failures
            );
        }
    }

    fn release_trial(&self) {
        if self
            .state
            .compare_exchange(HALF_OPEN_PROBING, HALF_OPEN_IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            log::debug!("Circuit '{}' trial ended without a verdict", self.name);
        }
    }
}
