//! Per-endpoint circuit breakers.
//!
//! `Closed` counts consecutive failures and opens at `failure_threshold`.
//! `Open` fails fast until `reset_timeout` has passed since the last failure,
//! then the next call moves the circuit to `HalfOpen`, which admits up to
//! `half_open_requests` concurrent trials. A trial success closes the circuit;
//! a trial failure reopens it.

use crate::config::BreakerPolicy;
use crate::error::ApiError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CircuitStatus {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of one endpoint's breaker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CircuitState {
    pub status: CircuitStatus,
    pub failures: u32,
    pub last_failure: Option<Instant>,
    pub half_open_in_flight: u32,
    /// Identifies the current half-open period; trials from an earlier one
    /// no longer hold a slot.
    pub half_open_cycle: u64,
}

/// Registry of breakers keyed by endpoint.
#[derive(Debug, Default)]
pub struct CircuitBreakers {
    circuits: Mutex<HashMap<String, CircuitState>>,
    cycles: AtomicU64,
}

impl CircuitBreakers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `op` under the breaker for `endpoint`.
    ///
    /// `ApiError::Cancelled` is neither a success nor a failure: a
    /// superseded call says nothing about the endpoint's health.
    ///
    /// # Errors
    /// `ApiError::CircuitOpen` or `ApiError::HalfOpenSaturated` without
    /// invoking `op`; otherwise whatever `op` returns.
    pub async fn execute<T, F, Fut>(
        &self,
        endpoint: &str,
        policy: &BreakerPolicy,
        op: F,
    ) -> Result<T, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let permit = self.admit(endpoint, policy)?;
        let result = op().await;
        match &result {
            Ok(_) => permit.settle(Outcome::Success),
            Err(ApiError::Cancelled) => permit.settle(Outcome::Neutral),
            Err(_) => permit.settle(Outcome::Failure),
        }
        result
    }

    #[must_use]
    pub fn state(&self, endpoint: &str) -> Option<CircuitState> {
        self.circuits.lock().get(endpoint).copied()
    }

    /// Force `endpoint` back to `Closed`; returns whether it was known.
    #[must_use]
    pub fn reset(&self, endpoint: &str) -> bool {
        let reset = self.circuits.lock().remove(endpoint).is_some();
        if reset {
            tracing::info!(endpoint, "circuit reset");
        }
        reset
    }

    fn admit<'a>(&'a self, endpoint: &str, policy: &'a BreakerPolicy) -> Result<Permit<'a>, ApiError> {
        let mut circuits = self.circuits.lock();
        let state = circuits.entry(endpoint.to_owned()).or_default();

        match state.status {
            CircuitStatus::Closed => {
                return Ok(Permit::new(self, endpoint, policy, None));
            }
            CircuitStatus::Open => {
                let cooled_down = state
                    .last_failure
                    .is_none_or(|at| Instant::now().saturating_duration_since(at) > policy.reset_timeout);
                if !cooled_down {
                    return Err(ApiError::CircuitOpen {
                        endpoint: endpoint.to_owned(),
                    });
                }
                state.status = CircuitStatus::HalfOpen;
                state.half_open_in_flight = 0;
                state.half_open_cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::info!(endpoint, "circuit half-open, admitting trial calls");
            }
            CircuitStatus::HalfOpen => {}
        }

        if state.half_open_in_flight >= policy.half_open_requests.max(1) {
            return Err(ApiError::HalfOpenSaturated {
                endpoint: endpoint.to_owned(),
            });
        }
        state.half_open_in_flight += 1;
        Ok(Permit::new(self, endpoint, policy, Some(state.half_open_cycle)))
    }

    fn record(&self, endpoint: &str, policy: &BreakerPolicy, trial: Option<u64>, outcome: Outcome) {
        let mut circuits = self.circuits.lock();
        // reset() may have dropped the entry while the call was running
        let Some(state) = circuits.get_mut(endpoint) else {
            return;
        };
        let current_trial = trial.is_some_and(|cycle| {
            state.status == CircuitStatus::HalfOpen && state.half_open_cycle == cycle
        });
        if current_trial {
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
        }

        match outcome {
            Outcome::Success => {
                if state.status != CircuitStatus::Closed {
                    tracing::info!(endpoint, "circuit closed after successful trial");
                }
                state.status = CircuitStatus::Closed;
                state.failures = 0;
                state.half_open_in_flight = 0;
            }
            Outcome::Failure => {
                state.failures = state.failures.saturating_add(1);
                state.last_failure = Some(Instant::now());
                if state.status != CircuitStatus::Open && state.failures >= policy.failure_threshold {
                    tracing::warn!(
                        endpoint,
                        failures = state.failures,
                        "circuit opened"
                    );
                    state.status = CircuitStatus::Open;
                    state.half_open_in_flight = 0;
                }
            }
            Outcome::Neutral => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Neutral,
}

/// Admission ticket for one call. Dropped unsettled (the caller's future
/// was dropped mid-flight) it releases its trial slot without a verdict.
struct Permit<'a> {
    breakers: &'a CircuitBreakers,
    endpoint: String,
    policy: &'a BreakerPolicy,
    /// Half-open cycle this trial was admitted in
    trial: Option<u64>,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breakers: &'a CircuitBreakers, endpoint: &str, policy: &'a BreakerPolicy, trial: Option<u64>) -> Self {
        Self {
            breakers,
            endpoint: endpoint.to_owned(),
            policy,
            trial,
            settled: false,
        }
    }

    fn settle(mut self, outcome: Outcome) {
        self.settled = true;
        self.breakers
            .record(&self.endpoint, self.policy, self.trial, outcome);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breakers
                .record(&self.endpoint, self.policy, self.trial, Outcome::Neutral);
        }
    }
}
