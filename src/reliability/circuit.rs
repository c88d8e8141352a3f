//! Placement circuit breaker.
//!
//! Consecutive execution failures open the circuit. After the cool-down ticks
//! a single half-open attempt decides whether it closes again.

use serde::{Deserialize, Serialize};

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

/// Consecutive-failure breaker for order placement.
///
/// Opens after `threshold` failures in a row. An open breaker blocks the
/// rest of the tick it opened on plus `cool_ticks` further ticks, then lets
/// a single trial attempt through. Any success closes it.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    pub state: CircuitState,
    pub failures: u32,
    pub threshold: u32,
    cool_ticks: u32,
    ticks_open: u32,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self { state: CircuitState::Closed, failures: 0, threshold: threshold.max(1), cool_ticks: 1, ticks_open: 0 }
    }

    pub fn with_cool_ticks(mut self, cool_ticks: u32) -> Self {
        self.cool_ticks = cool_ticks;
        self
    }

    /// Called once at the top of every tick.
    pub fn on_tick(&mut self) {
        if self.state != CircuitState::Open {
            return;
        }
        if self.ticks_open >= self.cool_ticks {
            self.state = CircuitState::HalfOpen;
        } else {
            self.ticks_open += 1;
        }
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.ticks_open = 0;
        self.state = CircuitState::Closed;
    }

    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
        if self.state == CircuitState::HalfOpen || self.failures >= self.threshold {
            self.state = CircuitState::Open;
            self.ticks_open = 0;
        }
    }

    pub fn allow(&self) -> bool {
        matches!(self.state, CircuitState::Closed | CircuitState::HalfOpen)
    }
}
