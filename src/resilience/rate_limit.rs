//! Local mirror of the exchange's decaying request counter.

use crate::core::config::RateLimitConfig;
use crate::core::types::{OperationType, Priority};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Extra sleep added on top of the computed decay time
const WAIT_EPSILON: Duration = Duration::from_millis(10);

/// Outcome of one admission check
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Granted,
    /// Budget frees up after this long
    Wait(Duration),
    Rejected,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RateUsage {
    pub current: f64,
    pub max: f64,
    pub percent: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GovernorStats {
    pub granted: u64,
    pub reserve_grants: u64,
    pub waits: u64,
    pub rejected: u64,
    pub throttle_events: u64,
}

#[derive(Debug)]
struct Budget {
    current: f64,
    last_update: Instant,
}

impl Budget {
    fn decay(&mut self, now: Instant, rate: f64) {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.current = (self.current - elapsed * rate).max(0.0);
        if now > self.last_update {
            self.last_update = now;
        }
    }
}

pub struct RateLimitGovernor {
    budget: Mutex<Budget>,
    throttles: Mutex<VecDeque<Instant>>,
    config: RateLimitConfig,
    max_counter: f64,
    decay_rate: f64,
    granted: AtomicU64,
    reserve_grants: AtomicU64,
    waits: AtomicU64,
    rejected: AtomicU64,
    throttle_events: AtomicU64,
}

impl RateLimitGovernor {
    pub fn new(config: RateLimitConfig) -> Self {
        let max_counter = config.max_counter();
        let decay_rate = config.decay_rate();
        Self {
            budget: Mutex::new(Budget {
                current: 0.0,
                last_update: Instant::now(),
            }),
            throttles: Mutex::new(VecDeque::new()),
            config,
            max_counter,
            decay_rate,
            granted: AtomicU64::new(0),
            reserve_grants: AtomicU64::new(0),
            waits: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            throttle_events: AtomicU64::new(0),
        }
    }

    pub fn cost_of(&self, operation: OperationType) -> f64 {
        self.config.cost_of(operation).cost
    }

    /// Non-blocking admission check against the budget as of `now`
    pub fn try_acquire_at(&self, cost: f64, priority: Priority, now: Instant) -> Admission {
        let mut budget = self.budget.lock();
        budget.decay(now, self.decay_rate);

        if budget.current + cost <= self.max_counter {
            budget.current += cost;
            self.granted.fetch_add(1, Ordering::Relaxed);
            return Admission::Granted;
        }

        match priority {
            Priority::High | Priority::Critical
                if budget.current < self.max_counter * self.config.reserve_ratio =>
            {
                // Reserve headroom: the counter may briefly exceed the budget
                budget.current += cost;
                self.granted.fetch_add(1, Ordering::Relaxed);
                self.reserve_grants.fetch_add(1, Ordering::Relaxed);
                debug!(current = budget.current, %priority, "Granted from reserve");
                Admission::Granted
            }
            Priority::Low => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Admission::Rejected
            }
            _ => {
                let excess = budget.current + cost - self.max_counter;
                Admission::Wait(Duration::from_secs_f64(excess / self.decay_rate) + WAIT_EPSILON)
            }
        }
    }

    pub fn try_acquire(&self, cost: f64, priority: Priority) -> Admission {
        self.try_acquire_at(cost, priority, Instant::now())
    }

    /// Acquire, sleeping for decay within the default wait bound of `priority`
    pub async fn acquire(&self, cost: f64, priority: Priority) -> bool {
        let max_wait = match priority {
            Priority::Critical | Priority::High => Duration::from_secs(30),
            Priority::Medium => Duration::from_secs(15),
            Priority::Low => Duration::ZERO,
        };
        self.acquire_within(cost, priority, max_wait).await
    }

    /// Acquire, giving up once cumulative waiting would exceed `max_wait`
    pub async fn acquire_within(&self, cost: f64, priority: Priority, max_wait: Duration) -> bool {
        let started = Instant::now();
        loop {
            match self.try_acquire(cost, priority) {
                Admission::Granted => return true,
                Admission::Rejected => return false,
                Admission::Wait(wait) => {
                    if started.elapsed() + wait > max_wait {
                        self.rejected.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            cost,
                            %priority,
                            wait_ms = wait.as_millis() as u64,
                            "Rate budget wait exceeds bound, rejecting"
                        );
                        return false;
                    }
                    self.waits.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Note a throttle reported by the exchange
    pub fn record_throttle(&self) {
        self.record_throttle_at(Instant::now());
    }

    pub fn record_throttle_at(&self, now: Instant) {
        self.throttle_events.fetch_add(1, Ordering::Relaxed);
        let mut throttles = self.throttles.lock();
        throttles.push_back(now);
        self.prune_throttles(&mut throttles, now);
    }

    pub fn should_prefer_streaming(&self) -> bool {
        self.should_prefer_streaming_at(Instant::now())
    }

    pub fn should_prefer_streaming_at(&self, now: Instant) -> bool {
        if self.usage_at(now).percent > self.config.prefer_streaming_usage * 100.0 {
            return true;
        }
        let mut throttles = self.throttles.lock();
        self.prune_throttles(&mut throttles, now);
        throttles.len() >= self.config.throttle_event_threshold
    }

    pub fn usage(&self) -> RateUsage {
        self.usage_at(Instant::now())
    }

    pub fn usage_at(&self, now: Instant) -> RateUsage {
        let mut budget = self.budget.lock();
        budget.decay(now, self.decay_rate);
        RateUsage {
            current: budget.current,
            max: self.max_counter,
            percent: budget.current / self.max_counter * 100.0,
        }
    }

    pub fn stats(&self) -> GovernorStats {
        GovernorStats {
            granted: self.granted.load(Ordering::Relaxed),
            reserve_grants: self.reserve_grants.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            throttle_events: self.throttle_events.load(Ordering::Relaxed),
        }
    }

    fn prune_throttles(&self, throttles: &mut VecDeque<Instant>, now: Instant) {
        let window = Duration::from_secs(self.config.throttle_window_secs);
        while let Some(front) = throttles.front() {
            if now.saturating_duration_since(*front) > window {
                throttles.pop_front();
            } else {
                break;
            }
        }
    }
}
