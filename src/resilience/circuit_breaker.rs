//! Per-transport circuit breaker.
//!
//! CLOSED passes calls and counts failures. OPEN rejects until the recovery
//! timeout elapses, then admits exactly one HALF_OPEN trial at a time;
//! `success_threshold` consecutive trial successes close the circuit and any
//! counted trial failure reopens it.
//!
//! Failure classes are not counted equally: nonce conflicts are a sequencing
//! problem and never trip the breaker, rate-limit responses only count when
//! they repeat, and authentication failures disable the transport until
//! [`CircuitBreaker::enable`] is called.

use crate::core::config::BreakerConfig;
use crate::core::errors::FailureKind;
use crate::core::types::TransportKind;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub transport: TransportKind,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_age_ms: Option<u64>,
    pub last_failure_kind: Option<FailureKind>,
    pub disabled: bool,
    pub times_opened: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub nonce_conflicts: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    recent_failures: VecDeque<Instant>,
    success_count: u32,
    last_failure_time: Option<Instant>,
    last_failure_kind: Option<FailureKind>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    disabled: bool,
    times_opened: u64,
    total_failures: u64,
    total_successes: u64,
    nonce_conflicts: u64,
}

pub struct CircuitBreaker {
    transport: TransportKind,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    state_tx: watch::Sender<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(transport: TransportKind, config: BreakerConfig) -> Self {
        let (state_tx, _) = watch::channel(CircuitState::Closed);
        Self {
            transport,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                recent_failures: VecDeque::new(),
                success_count: 0,
                last_failure_time: None,
                last_failure_kind: None,
                opened_at: None,
                trial_in_flight: false,
                disabled: false,
                times_opened: 0,
                total_failures: 0,
                total_successes: 0,
                nonce_conflicts: 0,
            }),
            state_tx,
        }
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Stored state; does not advance OPEN to HALF_OPEN
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn is_disabled(&self) -> bool {
        self.inner.lock().disabled
    }

    /// Whether a call may proceed; may move OPEN to HALF_OPEN and claim the trial slot
    pub fn can_execute(&self) -> bool {
        self.can_execute_at(Instant::now())
    }

    pub fn can_execute_at(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        if inner.disabled {
            return false;
        }

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = inner.opened_at.map_or(true, |opened| {
                    now.saturating_duration_since(opened) >= self.config.recovery_timeout()
                });
                if cooled {
                    inner.success_count = 0;
                    inner.trial_in_flight = true;
                    self.transition(&mut inner, CircuitState::HalfOpen);
                }
                cooled
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Give back a HALF_OPEN trial slot that never reached the wire
    pub fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.total_successes += 1;
        inner.last_failure_kind = None;

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.consecutive_failures = 0;
                    inner.success_count = 0;
                    inner.recent_failures.clear();
                    inner.opened_at = None;
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            // Late answers from before the trip; recovery probes decide
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, kind: FailureKind) {
        self.record_failure_at(kind, Instant::now());
    }

    pub fn record_failure_at(&self, kind: FailureKind, now: Instant) {
        let mut inner = self.inner.lock();
        let previous_kind = inner.last_failure_kind.replace(kind);

        match kind {
            FailureKind::NonceConflict => {
                inner.nonce_conflicts += 1;
                if inner.state == CircuitState::HalfOpen {
                    inner.trial_in_flight = false;
                }
                return;
            }
            FailureKind::RateLimited if previous_kind != Some(FailureKind::RateLimited) => {
                if inner.state == CircuitState::HalfOpen {
                    inner.trial_in_flight = false;
                }
                return;
            }
            FailureKind::Authentication => {
                inner.total_failures += 1;
                inner.last_failure_time = Some(now);
                inner.disabled = true;
                inner.trial_in_flight = false;
                warn!(transport = %self.transport, "Authentication failure, transport disabled");
                self.trip(&mut inner, now);
                return;
            }
            _ => {}
        }

        inner.total_failures += 1;
        inner.consecutive_failures += 1;
        inner.last_failure_time = Some(now);
        inner.recent_failures.push_back(now);
        let window = self.config.failure_window();
        while let Some(front) = inner.recent_failures.front() {
            if now.saturating_duration_since(*front) > window {
                inner.recent_failures.pop_front();
            } else {
                break;
            }
        }

        match inner.state {
            CircuitState::Closed => {
                let threshold = self.config.failure_threshold;
                if inner.consecutive_failures >= threshold
                    || inner.recent_failures.len() >= threshold as usize
                {
                    self.trip(&mut inner, now);
                }
            }
            CircuitState::HalfOpen => {
                inner.trial_in_flight = false;
                self.trip(&mut inner, now);
            }
            CircuitState::Open => {}
        }
    }

    /// Re-arm after an authentication disable (new credentials, manual override)
    pub fn enable(&self) {
        let mut inner = self.inner.lock();
        inner.disabled = false;
        inner.consecutive_failures = 0;
        inner.success_count = 0;
        inner.recent_failures.clear();
        inner.trial_in_flight = false;
        inner.opened_at = None;
        inner.last_failure_kind = None;
        self.transition(&mut inner, CircuitState::Closed);
    }

    /// Observe state changes
    pub fn subscribe(&self) -> watch::Receiver<CircuitState> {
        self.state_tx.subscribe()
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            transport: self.transport,
            state: inner.state,
            failure_count: inner.consecutive_failures,
            success_count: inner.success_count,
            last_failure_age_ms: inner
                .last_failure_time
                .map(|at| at.elapsed().as_millis() as u64),
            last_failure_kind: inner.last_failure_kind,
            disabled: inner.disabled,
            times_opened: inner.times_opened,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            nonce_conflicts: inner.nonce_conflicts,
        }
    }

    fn trip(&self, inner: &mut BreakerInner, now: Instant) {
        inner.opened_at = Some(now);
        inner.success_count = 0;
        if inner.state != CircuitState::Open {
            inner.times_opened += 1;
            self.transition(inner, CircuitState::Open);
        }
    }

    fn transition(&self, inner: &mut BreakerInner, next: CircuitState) {
        if inner.state == next {
            return;
        }
        let previous = inner.state;
        inner.state = next;
        info!(
            transport = %self.transport,
            from = %previous,
            to = %next,
            failures = inner.consecutive_failures,
            "Circuit state change"
        );
        self.state_tx.send_replace(next);
    }
}
