//! Circuit breaker guarding the store.
//!
//! The transition logic lives in [`BreakerCore`], a plain state machine driven
//! by call outcomes and caller-supplied instants. [`CircuitBreaker`] wraps it in
//! a mutex so one instance can be shared by every handler touching a store.

use crate::config::BreakerPolicy;
use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// How a call was let through. Report it back with the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    Probe,
}

/// Rejection while open; carries the time left until a probe is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerOpen {
    pub retry_after: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct BreakerCore {
    failure_threshold: u32,
    cooldown: Duration,
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_started_at: Option<Instant>,
}

impl BreakerCore {
    pub fn new(policy: &BreakerPolicy) -> Self {
        Self {
            failure_threshold: policy.failure_threshold.max(1),
            cooldown: policy.cooldown(),
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_started_at: None,
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            opened_at: self.opened_at,
        }
    }

    pub fn admit(&mut self, now: Instant) -> Result<Admission, BreakerOpen> {
        match self.state {
            BreakerState::Closed => Ok(Admission::Normal),
            BreakerState::Open => {
                let opened_at = self.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed < self.cooldown {
                    return Err(BreakerOpen {
                        retry_after: self.cooldown - elapsed,
                    });
                }
                self.state = BreakerState::HalfOpen;
                self.probe_started_at = Some(now);
                Ok(Admission::Probe)
            }
            BreakerState::HalfOpen => {
                // A probe that never reported back is superseded after a cooldown.
                let started = self.probe_started_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(started);
                if elapsed < self.cooldown {
                    return Err(BreakerOpen {
                        retry_after: self.cooldown - elapsed,
                    });
                }
                self.probe_started_at = Some(now);
                Ok(Admission::Probe)
            }
        }
    }

    /// Returns the new state when the call caused a transition.
    pub fn on_success(&mut self, admission: Admission) -> Option<BreakerState> {
        match (self.state, admission) {
            (BreakerState::HalfOpen, Admission::Probe) => {
                self.reset();
                Some(BreakerState::Closed)
            }
            (BreakerState::Closed, _) => {
                self.consecutive_failures = 0;
                None
            }
            // Stragglers admitted before the breaker opened do not close it.
            _ => None,
        }
    }

    pub fn on_failure(&mut self, admission: Admission, now: Instant) -> Option<BreakerState> {
        match (self.state, admission) {
            (BreakerState::HalfOpen, Admission::Probe) => {
                self.trip(now);
                Some(BreakerState::Open)
            }
            (BreakerState::Closed, _) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.failure_threshold {
                    self.trip(now);
                    Some(BreakerState::Open)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.probe_started_at = None;
    }

    fn reset(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.probe_started_at = None;
    }
}

/// Shared, named breaker instance.
pub struct CircuitBreaker {
    name: &'static str,
    core: Mutex<BreakerCore>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, policy: &BreakerPolicy) -> Self {
        Self {
            name,
            core: Mutex::new(BreakerCore::new(policy)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        self.lock().snapshot()
    }

    pub fn try_acquire(&self) -> Result<Admission, BreakerOpen> {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> Result<Admission, BreakerOpen> {
        let admission = self.lock().admit(now)?;
        if admission == Admission::Probe {
            info!(breaker = self.name, "circuit half-open, sending probe");
        }
        Ok(admission)
    }

    pub fn record_success(&self, admission: Admission) {
        if let Some(BreakerState::Closed) = self.lock().on_success(admission) {
            info!(breaker = self.name, "circuit closed");
        }
    }

    pub fn record_failure(&self, admission: Admission) {
        self.record_failure_at(admission, Instant::now());
    }

    pub fn record_failure_at(&self, admission: Admission, now: Instant) {
        let mut core = self.lock();
        if let Some(BreakerState::Open) = core.on_failure(admission, now) {
            warn!(
                breaker = self.name,
                consecutive_failures = core.consecutive_failures,
                cooldown_ms = core.cooldown.as_millis() as u64,
                "circuit opened"
            );
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
