//! Circuit breaker for dependency protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: dependency assumed down, calls fail fast
//! - Half-Open: a single probe tests whether the dependency recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive_failures >= failure_threshold
//! Open → Half-Open: first call after reset_timeout_ms (admitted as probe)
//! Half-Open → Closed: consecutive_successes >= success_threshold
//! Half-Open → Open: any failure (timer restarts)
//! ```
//!
//! # Design Decisions
//! - One breaker per service name, owned by a registry on the client
//! - State lives behind a mutex so concurrent outcomes never get lost
//! - Only one probe in flight while Half-Open
//! - The breaker decides; it never retries

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use serde::Serialize;

use crate::clock::Clock;
use crate::config::schema::BreakerConfig;
use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Snapshot of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitState {
    pub service_name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Milliseconds since the epoch at which the circuit last opened.
    pub opened_at: Option<u64>,
    pub config: BreakerConfig,
}

/// Returned when the breaker refuses a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected;

#[derive(Debug)]
struct Inner {
    circuit: CircuitState,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(service_name: impl Into<String>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                circuit: CircuitState {
                    service_name: service_name.into(),
                    state: BreakerState::Closed,
                    consecutive_failures: 0,
                    consecutive_successes: 0,
                    opened_at: None,
                    config,
                },
                probe_in_flight: false,
            }),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> CircuitState {
        self.lock().circuit.clone()
    }

    pub fn state(&self) -> BreakerState {
        self.lock().circuit.state
    }

    pub fn config(&self) -> BreakerConfig {
        self.lock().circuit.config
    }

    /// Replace thresholds; the current state and counters are kept.
    pub fn set_config(&self, config: BreakerConfig) {
        self.lock().circuit.config = config;
    }

    /// Decide whether a call may proceed.
    pub fn acquire(self: &Arc<Self>) -> Result<CallPermit, Rejected> {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        let probe = match inner.circuit.state {
            BreakerState::Closed => false,
            BreakerState::Open => {
                let opened_at = inner.circuit.opened_at.unwrap_or(now);
                if now.saturating_sub(opened_at) < inner.circuit.config.reset_timeout_ms {
                    return Err(Rejected);
                }
                transition(&mut inner.circuit, BreakerState::HalfOpen);
                true
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(Rejected);
                }
                true
            }
        };
        if probe {
            inner.probe_in_flight = true;
            tracing::debug!(service = %inner.circuit.service_name, "Admitting probe call");
        }
        Ok(CallPermit {
            breaker: self.clone(),
            probe,
            settled: false,
        })
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self.lock();
        if probe {
            inner.probe_in_flight = false;
        }
        let circuit = &mut inner.circuit;
        match circuit.state {
            BreakerState::Closed => {
                circuit.consecutive_failures = 0;
                circuit.consecutive_successes = circuit.consecutive_successes.saturating_add(1);
            }
            BreakerState::HalfOpen if probe => {
                circuit.consecutive_successes += 1;
                if circuit.consecutive_successes >= circuit.config.success_threshold {
                    transition(circuit, BreakerState::Closed);
                }
            }
            // Late results from calls admitted before the circuit opened.
            _ => {}
        }
    }

    fn on_failure(&self, probe: bool) {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        if probe {
            inner.probe_in_flight = false;
        }
        let circuit = &mut inner.circuit;
        match circuit.state {
            BreakerState::Closed => {
                circuit.consecutive_successes = 0;
                circuit.consecutive_failures += 1;
                if circuit.consecutive_failures >= circuit.config.failure_threshold {
                    transition(circuit, BreakerState::Open);
                    circuit.opened_at = Some(now);
                }
            }
            BreakerState::HalfOpen => {
                transition(circuit, BreakerState::Open);
                circuit.opened_at = Some(now);
            }
            BreakerState::Open => {}
        }
    }

    fn on_abandon(&self, probe: bool) {
        if probe {
            self.lock().probe_in_flight = false;
        }
    }
}

fn transition(circuit: &mut CircuitState, to: BreakerState) {
    let from = circuit.state;
    circuit.state = to;
    match to {
        BreakerState::Closed => {
            circuit.consecutive_failures = 0;
            circuit.consecutive_successes = 0;
            circuit.opened_at = None;
        }
        BreakerState::HalfOpen => {
            circuit.consecutive_successes = 0;
        }
        BreakerState::Open => {
            circuit.consecutive_successes = 0;
        }
    }
    match to {
        BreakerState::Open => tracing::warn!(
            service = %circuit.service_name,
            from = from.as_str(),
            failures = circuit.consecutive_failures,
            "Circuit opened"
        ),
        _ => tracing::info!(
            service = %circuit.service_name,
            from = from.as_str(),
            to = to.as_str(),
            "Circuit state changed"
        ),
    }
    metrics::record_circuit_transition(&circuit.service_name, from.as_str(), to.as_str());
}

/// Admission ticket for one call. Settle it with [`CallPermit::success`] or
/// [`CallPermit::failure`]; dropping it unsettled frees a probe slot without
/// counting an outcome.
#[derive(Debug)]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    settled: bool,
}

impl CallPermit {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandon(self.probe);
        }
    }
}

/// Per-service breakers owned by one client.
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    clock: Arc<dyn Clock>,
}

impl BreakerRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: DashMap::new(),
            clock,
        }
    }

    pub fn get_or_create(&self, service: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(service) {
            return existing.value().clone();
        }
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(service, config, self.clock.clone())))
            .value()
            .clone()
    }

    pub fn get(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(service).map(|b| b.value().clone())
    }

    /// Apply new thresholds to every known breaker.
    pub fn reconfigure(&self, config_for: impl Fn(&str) -> BreakerConfig) {
        for entry in self.breakers.iter() {
            entry.value().set_config(config_for(entry.key()));
        }
    }

    pub fn snapshots(&self) -> Vec<CircuitState> {
        let mut states: Vec<_> = self.breakers.iter().map(|b| b.value().snapshot()).collect();
        states.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        states
    }
}
