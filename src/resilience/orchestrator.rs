//! Service-level classification, operation gating, deferred-work queue and
//! the recovery loop that replays it.

use crate::core::config::OrchestratorConfig;
use crate::core::errors::ConnectivityError;
use crate::core::types::{OperationType, Priority, ServiceLevel, TransportKind};
use crate::resilience::circuit_breaker::CircuitState;
use crate::resilience::router::TransportRouter;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Called with `(previous, current)` on every service-level change
pub type LevelObserver =
    Arc<dyn Fn(ServiceLevel, ServiceLevel) -> anyhow::Result<()> + Send + Sync>;

/// Called with each replayed operation and its outcome
pub type ReplayObserver =
    Arc<dyn Fn(&PendingOperation, &Result<Value, ConnectivityError>) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct PendingOperation {
    pub id: u64,
    pub operation: OperationType,
    pub params: Value,
    pub priority: Priority,
    #[serde(skip)]
    pub enqueued_at: Instant,
    seq: u64,
}

impl PartialEq for PendingOperation {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for PendingOperation {}

impl PartialOrd for PendingOperation {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingOperation {
    // Max-heap: higher priority first, then earlier enqueue
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// What one recovery attempt achieved
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RecoveryReport {
    /// Another recovery run holds the latch
    AlreadyRunning,
    Completed {
        level: ServiceLevel,
        replayed: usize,
        remaining: usize,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub level: ServiceLevel,
    pub override_level: Option<ServiceLevel>,
    pub pending: usize,
    pub transitions: u64,
    pub deferred: u64,
    pub replayed: u64,
    pub discarded: u64,
    pub recovery_runs: u64,
    pub is_recovering: bool,
}

struct RecoveryLatch<'a>(&'a AtomicBool);

impl Drop for RecoveryLatch<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct FallbackOrchestrator {
    router: Arc<TransportRouter>,
    config: OrchestratorConfig,
    override_level: RwLock<Option<ServiceLevel>>,
    published: Mutex<ServiceLevel>,
    pending: Mutex<BinaryHeap<PendingOperation>>,
    next_id: AtomicU64,
    is_recovering: AtomicBool,
    observers: RwLock<Vec<LevelObserver>>,
    replay_observers: RwLock<Vec<ReplayObserver>>,
    transitions: AtomicU64,
    deferred: AtomicU64,
    replayed: AtomicU64,
    discarded: AtomicU64,
    recovery_runs: AtomicU64,
}

impl FallbackOrchestrator {
    pub fn new(router: Arc<TransportRouter>, config: OrchestratorConfig) -> Self {
        Self {
            router,
            config,
            override_level: RwLock::new(None),
            published: Mutex::new(ServiceLevel::FullService),
            pending: Mutex::new(BinaryHeap::new()),
            next_id: AtomicU64::new(1),
            is_recovering: AtomicBool::new(false),
            observers: RwLock::new(Vec::new()),
            replay_observers: RwLock::new(Vec::new()),
            transitions: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
            replayed: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            recovery_runs: AtomicU64::new(0),
        }
    }

    pub fn router(&self) -> &Arc<TransportRouter> {
        &self.router
    }

    /// Level implied by breaker states alone.
    ///
    /// Only CLOSED counts as healthy: a HALF_OPEN breaker is treated like an
    /// OPEN one, so one OPEN and one HALF_OPEN breaker derive `ServiceOutage`.
    pub fn derived_level(&self) -> ServiceLevel {
        let closed = [TransportKind::Rest, TransportKind::Stream]
            .into_iter()
            .filter(|kind| self.router.breaker(*kind).state() == CircuitState::Closed)
            .count();
        match closed {
            2 => ServiceLevel::FullService,
            1 => ServiceLevel::DegradedService,
            _ => ServiceLevel::ServiceOutage,
        }
    }

    /// Effective level: the manual override if set, else derived
    pub fn service_level(&self) -> ServiceLevel {
        (*self.override_level.read()).unwrap_or_else(|| self.derived_level())
    }

    pub fn override_level(&self) -> Option<ServiceLevel> {
        *self.override_level.read()
    }

    /// Force a level (e.g. `EmergencyOnly` during maintenance); `None` clears it
    pub fn set_override(&self, level: Option<ServiceLevel>) {
        *self.override_level.write() = level;
        info!(?level, "Service level override changed");
        self.refresh_level();
    }

    pub fn add_observer(&self, observer: LevelObserver) {
        self.observers.write().push(observer);
    }

    pub fn add_replay_observer(&self, observer: ReplayObserver) {
        self.replay_observers.write().push(observer);
    }

    /// Publish a transition to observers if the effective level changed
    pub fn refresh_level(&self) -> ServiceLevel {
        let current = self.service_level();
        let previous = {
            let mut published = self.published.lock();
            if *published == current {
                return current;
            }
            std::mem::replace(&mut *published, current)
        };

        self.transitions.fetch_add(1, Ordering::Relaxed);
        if current.rank() < previous.rank() {
            warn!(from = %previous, to = %current, "Service level degraded");
        } else {
            info!(from = %previous, to = %current, "Service level improved");
        }
        self.notify(previous, current);
        current
    }

    fn notify(&self, previous: ServiceLevel, current: ServiceLevel) {
        let observers = self.observers.read().clone();
        for observer in observers {
            match catch_unwind(AssertUnwindSafe(|| observer(previous, current))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Service level observer failed"),
                Err(_) => error!("Service level observer panicked"),
            }
        }
    }

    /// Run `operation` if the current level permits it, otherwise queue it
    #[instrument(skip_all, fields(operation = %operation, priority = %priority))]
    pub async fn execute(
        &self,
        operation: OperationType,
        params: Value,
        priority: Priority,
    ) -> Result<Value, ConnectivityError> {
        let level = self.refresh_level();

        if !level.allows(operation.category()) {
            let pending_id = self.enqueue(operation, params, priority)?;
            debug!(%level, pending_id, "Operation deferred");
            return Err(ConnectivityError::OperationDeferred {
                operation,
                level,
                pending_id,
            });
        }

        let result = if self.derived_level() == ServiceLevel::ServiceOutage {
            self.router
                .execute_emergency(operation, params, priority)
                .await
        } else {
            self.router.execute(operation, params, priority).await
        };
        self.refresh_level();
        result
    }

    fn enqueue(
        &self,
        operation: OperationType,
        params: Value,
        priority: Priority,
    ) -> Result<u64, ConnectivityError> {
        let mut pending = self.pending.lock();
        if pending.len() >= self.config.max_pending {
            warn!(capacity = self.config.max_pending, "Pending queue full, rejecting");
            return Err(ConnectivityError::OperationRejected {
                operation,
                reason: format!("pending queue full ({} operations)", pending.len()),
            });
        }

        let seq = self.next_id.fetch_add(1, Ordering::Relaxed);
        pending.push(PendingOperation {
            id: seq,
            operation,
            params,
            priority,
            enqueued_at: Instant::now(),
            seq,
        });
        self.deferred.fetch_add(1, Ordering::Relaxed);
        Ok(seq)
    }

    /// Queued operations in replay order
    pub fn pending_operations(&self) -> Vec<PendingOperation> {
        let mut ops: Vec<PendingOperation> = self.pending.lock().iter().cloned().collect();
        ops.sort_by(|a, b| b.cmp(a));
        ops
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Drop a queued operation; returns it if it was still pending
    pub fn discard_pending(&self, id: u64) -> Option<PendingOperation> {
        let mut pending = self.pending.lock();
        let mut removed = None;
        let remaining: BinaryHeap<PendingOperation> = std::mem::take(&mut *pending)
            .into_iter()
            .filter_map(|op| {
                if op.id == id && removed.is_none() {
                    removed = Some(op);
                    None
                } else {
                    Some(op)
                }
            })
            .collect();
        *pending = remaining;
        if removed.is_some() {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn is_recovering(&self) -> bool {
        self.is_recovering.load(Ordering::Acquire)
    }

    /// Probe unhealthy transports, then replay what the new level allows.
    /// Only one recovery runs at a time.
    #[instrument(skip(self))]
    pub async fn attempt_recovery(&self) -> RecoveryReport {
        if self
            .is_recovering
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return RecoveryReport::AlreadyRunning;
        }
        let _latch = RecoveryLatch(&self.is_recovering);
        self.recovery_runs.fetch_add(1, Ordering::Relaxed);

        let deadline = Instant::now() + self.config.recovery_timeout();
        for round in 1..=self.config.max_recovery_attempts.max(1) {
            if !self.probe_unhealthy().await {
                break;
            }
            if self.refresh_level() == ServiceLevel::FullService || Instant::now() >= deadline {
                break;
            }
            if round < self.config.max_recovery_attempts {
                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::time::sleep(self.config.probe_interval().min(remaining)).await;
            }
        }

        let replayed = self.drain_pending().await;
        RecoveryReport::Completed {
            level: self.refresh_level(),
            replayed,
            remaining: self.pending_count(),
        }
    }

    /// Probe every transport whose breaker admits a trial.
    /// Returns whether any probe was sent.
    async fn probe_unhealthy(&self) -> bool {
        let mut probed = false;
        for kind in [TransportKind::Rest, TransportKind::Stream] {
            let breaker = self.router.breaker(kind);
            if breaker.state() == CircuitState::Closed || breaker.is_disabled() {
                continue;
            }
            if !breaker.can_execute() {
                continue;
            }

            probed = true;
            let started = Instant::now();
            let result = self.router.transport(kind).probe().await;
            match &result {
                Ok(()) => debug!(transport = %kind, "Recovery probe succeeded"),
                Err(e) => debug!(transport = %kind, error = %e, "Recovery probe failed"),
            }
            self.router.record_probe(kind, &result, started.elapsed());
        }
        probed
    }

    /// Replay queued work in priority order until the head is disallowed or fails
    pub async fn drain_pending(&self) -> usize {
        let mut replayed = 0;
        loop {
            let level = self.service_level();
            let next = {
                let mut pending = self.pending.lock();
                match pending.peek() {
                    Some(op) if level.allows(op.operation.category()) => pending.pop(),
                    _ => None,
                }
            };
            let Some(op) = next else {
                break;
            };

            let result = self
                .router
                .execute(op.operation, op.params.clone(), op.priority)
                .await;

            let observers = self.replay_observers.read().clone();
            for observer in observers {
                if catch_unwind(AssertUnwindSafe(|| observer(&op, &result))).is_err() {
                    error!(pending_id = op.id, "Replay observer panicked");
                }
            }

            match &result {
                Err(e) if e.failure_kind().is_some() => {
                    warn!(pending_id = op.id, error = %e, "Replay failed, keeping operation queued");
                    self.pending.lock().push(op);
                    self.refresh_level();
                    break;
                }
                _ => {
                    replayed += 1;
                    self.replayed.fetch_add(1, Ordering::Relaxed);
                    info!(pending_id = op.id, operation = %op.operation, "Replayed deferred operation");
                }
            }
            self.refresh_level();
        }
        replayed
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            level: self.service_level(),
            override_level: self.override_level(),
            pending: self.pending_count(),
            transitions: self.transitions.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            recovery_runs: self.recovery_runs.load(Ordering::Relaxed),
            is_recovering: self.is_recovering(),
        }
    }
}
