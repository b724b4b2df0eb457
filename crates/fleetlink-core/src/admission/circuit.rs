// ── Circuit breaker state machine ──
//
// Closed --(threshold consecutive failures)--> Open
// Open --(open duration elapsed, next caller)--> HalfOpen (caller is the probe)
// HalfOpen --(probe success x success_threshold)--> Closed
// HalfOpen --(probe failure)--> Open (timer restarts)
//
// Pure and clock-injected; callers serialize access with a mutex.

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Read-only view of a circuit for callers and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

/// What kind of admission a call received from a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ticket {
    /// Admitted through a closed circuit.
    Normal,
    /// The single half-open probe.
    Probe,
}

/// Thresholds a circuit is evaluated against.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Thresholds {
    pub failures: u32,
    pub successes: u32,
    pub open_duration: Duration,
}

#[derive(Debug)]
pub(crate) struct Circuit {
    state: CircuitState,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Default for Circuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

impl Circuit {
    pub(crate) fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state,
            consecutive_failures: self.failures,
            consecutive_successes: self.successes,
        }
    }

    /// Decide whether a call may pass. `None` means reject without waiting.
    pub(crate) fn try_admit(&mut self, now: Instant, open_duration: Duration) -> Option<Ticket> {
        match self.state {
            CircuitState::Closed => Some(Ticket::Normal),
            CircuitState::Open => {
                let eligible = self
                    .opened_at
                    .is_none_or(|opened| now.saturating_duration_since(opened) >= open_duration);
                if !eligible {
                    return None;
                }
                self.state = CircuitState::HalfOpen;
                self.successes = 0;
                self.probe_in_flight = true;
                Some(Ticket::Probe)
            }
            CircuitState::HalfOpen if self.probe_in_flight => None,
            CircuitState::HalfOpen => {
                self.probe_in_flight = true;
                Some(Ticket::Probe)
            }
        }
    }

    /// Whether [`try_admit`](Self::try_admit) would let a call through,
    /// without claiming anything.
    pub(crate) fn would_admit(&self, now: Instant, open_duration: Duration) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => self
                .opened_at
                .is_none_or(|opened| now.saturating_duration_since(opened) >= open_duration),
            CircuitState::HalfOpen => !self.probe_in_flight,
        }
    }

    /// Give back a probe claim without an outcome (the call never ran).
    pub(crate) fn abandon(&mut self, ticket: Ticket) {
        if ticket == Ticket::Probe {
            self.probe_in_flight = false;
        }
    }

    /// Feed an outcome. Returns the new state if it changed.
    pub(crate) fn record(
        &mut self,
        ticket: Ticket,
        success: bool,
        now: Instant,
        thresholds: Thresholds,
    ) -> Option<CircuitState> {
        let before = self.state;
        match (self.state, ticket) {
            (CircuitState::HalfOpen, Ticket::Probe) => {
                self.probe_in_flight = false;
                if success {
                    self.successes += 1;
                    if self.successes >= thresholds.successes {
                        self.close();
                    }
                } else {
                    self.failures = self.failures.saturating_add(1);
                    self.open(now);
                }
            }
            (CircuitState::Closed, _) => {
                if success {
                    self.failures = 0;
                } else {
                    self.failures = self.failures.saturating_add(1);
                    if self.failures >= thresholds.failures {
                        self.open(now);
                    }
                }
            }
            // Outcome of a call admitted before the circuit opened. Failures
            // still count; neither kind moves the state or the timer.
            (CircuitState::Open | CircuitState::HalfOpen, _) => {
                if !success {
                    self.failures = self.failures.saturating_add(1);
                }
            }
        }
        (self.state != before).then_some(self.state)
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.successes = 0;
        self.probe_in_flight = false;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failures = 0;
        self.successes = 0;
        self.opened_at = None;
        self.probe_in_flight = false;
    }
}
