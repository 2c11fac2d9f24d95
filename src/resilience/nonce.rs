//! Per-connection monotonic nonce sequencing.
//!
//! All connections share one lock so that issuance has a single total order.

use crate::core::config::NonceConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, warn};

/// Counters further than this ahead of wall-clock are treated as corrupt
const MAX_AHEAD_US: i64 = 24 * 60 * 60 * 1_000_000;

#[derive(Debug, Clone)]
pub struct ConnectionNonceState {
    pub connection_id: String,
    pub counter: i64,
    pub last_access: Instant,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct NonceStats {
    pub connections: usize,
    pub issued: u64,
    pub resets: u64,
    pub time_jumps: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct NonceTable {
    connections: HashMap<String, ConnectionNonceState>,
    registrations: i64,
    calls: u64,
    stats: NonceStats,
}

pub struct NonceSequencer {
    table: Mutex<NonceTable>,
    config: NonceConfig,
}

fn wallclock_us() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

impl NonceSequencer {
    pub fn new(config: NonceConfig) -> Self {
        Self {
            table: Mutex::new(NonceTable::default()),
            config,
        }
    }

    /// Next nonce for `connection_id`
    pub fn next(&self, connection_id: &str) -> i64 {
        let mut table = self.table.lock();
        self.maybe_evict(&mut table);
        self.advance(&mut table, connection_id)
    }

    /// `n` consecutive nonces issued atomically
    pub fn next_batch(&self, connection_id: &str, n: usize) -> Vec<i64> {
        let mut table = self.table.lock();
        self.maybe_evict(&mut table);
        (0..n)
            .map(|_| self.advance(&mut table, connection_id))
            .collect()
    }

    /// Push the counter far ahead of wall-clock after a conflict or reconnect
    pub fn reset(&self, connection_id: &str) {
        self.reset_past(connection_id, None);
    }

    /// Reset, also clearing a minimum the exchange told us it expects
    pub fn reset_past(&self, connection_id: &str, expected_minimum: Option<i64>) {
        let mut table = self.table.lock();
        let now = wallclock_us();
        self.ensure_registered(&mut table, connection_id, now);

        let jump = self.config.reset_jump_us;
        if let Some(state) = table.connections.get_mut(connection_id) {
            let floor = state
                .counter
                .max(now)
                .max(expected_minimum.unwrap_or(i64::MIN));
            state.counter = floor.saturating_add(jump);
            state.last_access = Instant::now();
            debug!(connection = %connection_id, counter = state.counter, "Nonce counter reset");
        }
        table.stats.resets += 1;
    }

    /// Forget a connection; returns whether it existed
    pub fn remove(&self, connection_id: &str) -> bool {
        let mut table = self.table.lock();
        let removed = table.connections.remove(connection_id).is_some();
        table.stats.connections = table.connections.len();
        removed
    }

    /// Whether `values` is strictly increasing
    pub fn validate_sequence(values: &[i64]) -> bool {
        values.windows(2).all(|pair| pair[0] < pair[1])
    }

    /// Last issued value without advancing
    pub fn current(&self, connection_id: &str) -> Option<i64> {
        self.table
            .lock()
            .connections
            .get(connection_id)
            .map(|state| state.counter)
    }

    pub fn stats(&self) -> NonceStats {
        let table = self.table.lock();
        NonceStats {
            connections: table.connections.len(),
            ..table.stats
        }
    }

    fn ensure_registered(&self, table: &mut NonceTable, connection_id: &str, now: i64) {
        if table.connections.contains_key(connection_id) {
            return;
        }

        let offset = table
            .registrations
            .saturating_mul(self.config.registration_stagger_us);
        table.registrations += 1;
        table.connections.insert(
            connection_id.to_string(),
            ConnectionNonceState {
                connection_id: connection_id.to_string(),
                counter: now + offset,
                last_access: Instant::now(),
            },
        );
        table.stats.connections = table.connections.len();
    }

    fn advance(&self, table: &mut NonceTable, connection_id: &str) -> i64 {
        let now = wallclock_us();
        self.ensure_registered(table, connection_id, now);

        let mut time_jump = false;
        let value = match table.connections.get_mut(connection_id) {
            Some(state) => {
                let mut candidate = state.counter.saturating_add(1);
                if candidate <= now {
                    candidate = now + self.config.safety_buffer_us;
                }
                if candidate - now > MAX_AHEAD_US {
                    warn!(
                        connection = %connection_id,
                        counter = candidate,
                        wallclock = now,
                        "Nonce counter more than 24h ahead of wall-clock, resetting"
                    );
                    candidate = now + 1;
                    time_jump = true;
                }
                state.counter = candidate;
                state.last_access = Instant::now();
                candidate
            }
            // Registered just above while holding the lock
            None => now + self.config.safety_buffer_us,
        };

        table.stats.issued += 1;
        if time_jump {
            table.stats.time_jumps += 1;
        }
        value
    }

    fn maybe_evict(&self, table: &mut NonceTable) {
        table.calls += 1;
        if self.config.eviction_interval == 0 || table.calls % self.config.eviction_interval != 0 {
            return;
        }

        let ttl = self.config.idle_ttl();
        let before = table.connections.len();
        table
            .connections
            .retain(|_, state| state.last_access.elapsed() < ttl);
        let evicted = before - table.connections.len();
        if evicted > 0 {
            debug!(evicted, "Evicted idle nonce connections");
            table.stats.evictions += evicted as u64;
        }
        table.stats.connections = table.connections.len();
    }

    #[cfg(test)]
    fn force_counter(&self, connection_id: &str, counter: i64) {
        let mut table = self.table.lock();
        self.ensure_registered(&mut table, connection_id, wallclock_us());
        if let Some(state) = table.connections.get_mut(connection_id) {
            state.counter = counter;
        }
    }
}

impl Default for NonceSequencer {
    fn default() -> Self {
        Self::new(NonceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_first_nonce_is_ahead_of_wallclock() {
        let sequencer = NonceSequencer::default();
        let before = wallclock_us();
        let nonce = sequencer.next("rest:primary");
        assert!(nonce > before);
    }

    #[test]
    fn test_concurrent_issuance_is_unique_and_contiguous() {
        // A large buffer keeps wall-clock from overtaking the counter mid-run
        let sequencer = Arc::new(NonceSequencer::new(NonceConfig {
            safety_buffer_us: 60_000_000,
            ..NonceConfig::default()
        }));
        sequencer.next("shared");

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let sequencer = Arc::clone(&sequencer);
                std::thread::spawn(move || {
                    (0..100).map(|_| sequencer.next("shared")).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut values: Vec<i64> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        values.sort_unstable();
        values.dedup();

        assert_eq!(values.len(), 1000);
        assert!(values.windows(2).all(|pair| pair[1] == pair[0] + 1));
    }

    #[test]
    fn test_counter_behind_wallclock_snaps_forward() {
        let sequencer = NonceSequencer::default();
        sequencer.force_counter("rest:primary", 42);

        let now = wallclock_us();
        let nonce = sequencer.next("rest:primary");
        assert!(nonce > now);
        assert_ne!(nonce, 43);
    }

    #[test]
    fn test_counter_far_ahead_records_time_jump() {
        let sequencer = NonceSequencer::default();
        sequencer.force_counter("rest:primary", wallclock_us() + 2 * MAX_AHEAD_US);

        let nonce = sequencer.next("rest:primary");
        assert!(nonce <= wallclock_us() + 1);
        assert_eq!(sequencer.stats().time_jumps, 1);
    }

    #[test]
    fn test_reset_jumps_ahead() {
        let sequencer = NonceSequencer::default();
        let before = sequencer.next("ws:primary");
        sequencer.reset("ws:primary");
        let after = sequencer.next("ws:primary");

        assert!(after > before + NonceConfig::default().reset_jump_us - 1);
        assert_eq!(sequencer.stats().resets, 1);
    }

    #[test]
    fn test_reset_honours_expected_minimum() {
        let sequencer = NonceSequencer::default();
        let floor = wallclock_us() + 10_000_000_000;
        sequencer.reset_past("rest:primary", Some(floor));
        assert!(sequencer.next("rest:primary") > floor);
    }

    #[test]
    fn test_staggered_registration() {
        let sequencer = NonceSequencer::new(NonceConfig {
            registration_stagger_us: 1_000_000,
            ..NonceConfig::default()
        });
        let first = sequencer.next("a");
        let second = sequencer.next("b");
        assert!(second > first);
    }

    #[test]
    fn test_batch_and_sequence_validation() {
        let sequencer = NonceSequencer::default();
        let batch = sequencer.next_batch("rest:primary", 25);
        assert_eq!(batch.len(), 25);
        assert!(NonceSequencer::validate_sequence(&batch));
        assert!(!NonceSequencer::validate_sequence(&[3, 3]));
        assert!(!NonceSequencer::validate_sequence(&[5, 4]));
        assert!(NonceSequencer::validate_sequence(&[]));
    }

    #[test]
    fn test_remove_and_idle_eviction() {
        let sequencer = NonceSequencer::new(NonceConfig {
            idle_ttl_secs: 0,
            eviction_interval: 2,
            ..NonceConfig::default()
        });
        sequencer.next("idle");
        assert!(sequencer.remove("idle"));
        assert!(!sequencer.remove("idle"));

        sequencer.next("a");
        sequencer.next("b");
        assert!(sequencer.stats().evictions >= 1);
    }
}
