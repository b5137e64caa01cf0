//! Circuit Breaker Module
//!
//! Per-provider breakers plus the latched global breaker the risk engine
//! owns. Provider breakers recover on their own through half-open probes;
//! the global breaker only closes on operator resume.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::modules::alerts::{Alert, AlertSink};
use crate::modules::metrics::{names, MetricsSink};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CircuitPhase {
    Closed,
    HalfOpen,
    Open,
}

impl CircuitPhase {
    /// Stable gauge encoding: 0=Closed, 1=HalfOpen, 2=Open.
    pub fn gauge_value(&self) -> f64 {
        match self {
            CircuitPhase::Closed => 0.0,
            CircuitPhase::HalfOpen => 1.0,
            CircuitPhase::Open => 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub halfopen_probes: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
            halfopen_probes: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitState {
    pub phase: CircuitPhase,
    pub failure_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub halfopen_probes: u32,
}

#[derive(Debug)]
struct BreakerInner {
    phase: CircuitPhase,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    halfopen_admitted: u32,
    halfopen_successes: u32,
}

/// One breaker. Transitions happen inside `allow_request` (Open → HalfOpen
/// when the cooldown elapses) and the record calls.
pub struct CircuitBreaker {
    config: CircuitConfig,
    inner: Mutex<BreakerInner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitTransition {
    Opened,
    HalfOpened,
    Closed,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                phase: CircuitPhase::Closed,
                consecutive_failures: 0,
                opened_at: None,
                halfopen_admitted: 0,
                halfopen_successes: 0,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        CircuitState {
            phase: inner.phase,
            failure_count: inner.consecutive_failures,
            opened_at: inner.opened_at,
            halfopen_probes: inner.halfopen_successes,
        }
    }

    pub fn phase(&self) -> CircuitPhase {
        self.inner.lock().phase
    }

    /// Whether a request may proceed right now. Transitions Open→HalfOpen
    /// when the cooldown has elapsed; in HalfOpen admits at most
    /// `halfopen_probes` in-flight probes.
    pub fn allow_request(&self, now: DateTime<Utc>) -> (bool, Option<CircuitTransition>) {
        let mut inner = self.inner.lock();
        match inner.phase {
            CircuitPhase::Closed => (true, None),
            CircuitPhase::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| now.signed_duration_since(at))
                    .unwrap_or_else(chrono::Duration::zero);
                if elapsed >= chrono::Duration::milliseconds(self.config.cooldown_ms as i64) {
                    inner.phase = CircuitPhase::HalfOpen;
                    inner.halfopen_admitted = 1;
                    inner.halfopen_successes = 0;
                    (true, Some(CircuitTransition::HalfOpened))
                } else {
                    (false, None)
                }
            }
            CircuitPhase::HalfOpen => {
                if inner.halfopen_admitted < self.config.halfopen_probes {
                    inner.halfopen_admitted += 1;
                    (true, None)
                } else {
                    (false, None)
                }
            }
        }
    }

    pub fn record_success(&self) -> Option<CircuitTransition> {
        let mut inner = self.inner.lock();
        match inner.phase {
            CircuitPhase::Closed => {
                inner.consecutive_failures = 0;
                None
            }
            CircuitPhase::HalfOpen => {
                inner.halfopen_successes += 1;
                if inner.halfopen_successes >= self.config.halfopen_probes {
                    inner.phase = CircuitPhase::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                    inner.halfopen_admitted = 0;
                    inner.halfopen_successes = 0;
                    Some(CircuitTransition::Closed)
                } else {
                    None
                }
            }
            CircuitPhase::Open => None,
        }
    }

    pub fn record_failure(&self, now: DateTime<Utc>) -> Option<CircuitTransition> {
        let mut inner = self.inner.lock();
        match inner.phase {
            CircuitPhase::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.phase = CircuitPhase::Open;
                    inner.opened_at = Some(now);
                    Some(CircuitTransition::Opened)
                } else {
                    None
                }
            }
            CircuitPhase::HalfOpen => {
                // First failure in HalfOpen re-opens immediately.
                inner.phase = CircuitPhase::Open;
                inner.opened_at = Some(now);
                inner.halfopen_admitted = 0;
                inner.halfopen_successes = 0;
                Some(CircuitTransition::Opened)
            }
            CircuitPhase::Open => None,
        }
    }
}

/// All provider breakers plus transition-side observability.
pub struct CircuitRegistry {
    config: CircuitConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    metrics: Arc<dyn MetricsSink>,
    alerts: Arc<dyn AlertSink>,
}

impl CircuitRegistry {
    pub fn new(config: CircuitConfig, metrics: Arc<dyn MetricsSink>, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            metrics,
            alerts,
        }
    }

    pub fn breaker(&self, provider: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone())))
            .clone()
    }

    pub fn phase(&self, provider: &str) -> CircuitPhase {
        self.breaker(provider).phase()
    }

    /// True when the provider may be routed to right now. Publishes any
    /// Open→HalfOpen transition this check causes.
    pub fn admit(&self, provider: &str, now: DateTime<Utc>) -> bool {
        let breaker = self.breaker(provider);
        let (allowed, transition) = breaker.allow_request(now);
        if transition.is_some() {
            self.publish(provider, breaker.phase(), None);
        }
        allowed
    }

    pub fn record_success(&self, provider: &str) {
        let breaker = self.breaker(provider);
        if breaker.record_success().is_some() {
            self.publish(provider, breaker.phase(), None);
        }
    }

    pub fn record_failure(&self, provider: &str, now: DateTime<Utc>, reason: &str) {
        let breaker = self.breaker(provider);
        if breaker.record_failure(now).is_some() {
            self.publish(provider, breaker.phase(), Some(reason));
        }
    }

    fn publish(&self, provider: &str, phase: CircuitPhase, reason: Option<&str>) {
        self.metrics
            .set_gauge(names::CIRCUIT_STATE, &[("scope", provider)], phase.gauge_value());
        match phase {
            CircuitPhase::Open => self.alerts.send(Alert::CircuitOpened {
                scope: provider.to_string(),
                reason: reason.unwrap_or("failure threshold reached").to_string(),
            }),
            CircuitPhase::Closed => self.alerts.send(Alert::CircuitClosed {
                scope: provider.to_string(),
            }),
            CircuitPhase::HalfOpen => {}
        }
    }
}
