//! # Per-Client Circuit Breaker Table
//!
//! Gates delivery attempts per client. A run of consecutive send failures
//! opens the breaker; while open, the pipeline skips the client entirely
//! (skips are not failures). After the cool-down elapses the breaker moves to
//! a half-open probation on the next gate check, letting a single probe
//! through; three consecutive successes close it again, one failure re-opens
//! it with a fresh cool-down.
//!
//! State transitions are re-checked lazily on `is_open` rather than by
//! timers, so the table needs no background task of its own. The maintenance
//! scheduler prunes entries for clients that have left the registry; that
//! pruning is advisory, not correctness-critical.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use crate::clock::Clock;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Consecutive failures required to open a breaker.
const FAILURE_THRESHOLD: u32 = 5;
/// Consecutive half-open successes required to close a breaker.
const CLOSE_THRESHOLD: u32 = 3;
/// Open-state cool-down before a probe is allowed.
const COOL_DOWN_MINUTES: i64 = 5;

/// Breaker states, serialized in snake case for the status surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Deliveries allowed; failures tracked.
    Closed,
    /// Deliveries skipped until the cool-down elapses.
    Open,
    /// Probation after the cool-down; probes allowed.
    HalfOpen,
}

#[derive(Debug)]
struct Breaker {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    next_attempt: Option<DateTime<Utc>>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            next_attempt: None,
        }
    }
}

/// Thread-safe map of client id to breaker state. Entries are created lazily
/// on the first recorded result; `is_open` never creates state.
pub struct CircuitBreakerTable {
    breakers: Mutex<HashMap<String, Breaker>>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerTable {
    /// Creates an empty table reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// # Gate Check
    ///
    /// Returns true while the breaker is open and the cool-down has not
    /// elapsed. When the cool-down has elapsed this transitions the breaker
    /// to half-open before returning false, so the caller's attempt becomes
    /// the probe.
    pub fn is_open(&self, client_id: &str) -> bool {
        let mut breakers = self.breakers.lock().expect("breaker table lock poisoned");
        let Some(breaker) = breakers.get_mut(client_id) else {
            return false;
        };
        if breaker.state != BreakerState::Open {
            return false;
        }

        let cooled_down = breaker
            .next_attempt
            .is_some_and(|at| self.clock.now() >= at);
        if cooled_down {
            breaker.state = BreakerState::HalfOpen;
            breaker.success_count = 0;
            log::info!("Circuit breaker half-open for '{}'", client_id);
            false
        } else {
            true
        }
    }

    /// # Record Result
    ///
    /// Feeds one delivery outcome into the state machine:
    /// - success resets the failure run and, after three consecutive
    ///   half-open successes, closes the breaker;
    /// - failure resets the success run and, at the failure threshold, opens
    ///   the breaker with `next_attempt = now + cool-down`.
    pub fn record_result(&self, client_id: &str, success: bool) {
        let mut breakers = self.breakers.lock().expect("breaker table lock poisoned");
        let breaker = breakers
            .entry(client_id.to_string())
            .or_insert_with(Breaker::new);

        if success {
            breaker.failure_count = 0;
            breaker.success_count += 1;
            if breaker.state == BreakerState::HalfOpen && breaker.success_count >= CLOSE_THRESHOLD {
                breaker.state = BreakerState::Closed;
                breaker.success_count = 0;
                breaker.next_attempt = None;
                log::info!("Circuit breaker closed for '{}'", client_id);
            }
        } else {
            breaker.failure_count += 1;
            breaker.success_count = 0;
            // A half-open probe failure re-opens immediately; a closed
            // breaker opens once the consecutive-failure run hits the
            // threshold.
            if breaker.state == BreakerState::HalfOpen
                || breaker.failure_count >= FAILURE_THRESHOLD
            {
                breaker.state = BreakerState::Open;
                breaker.failure_count = breaker.failure_count.min(FAILURE_THRESHOLD);
                breaker.next_attempt =
                    Some(self.clock.now() + Duration::minutes(COOL_DOWN_MINUTES));
                log::warn!("Circuit breaker opened for '{}'", client_id);
            }
        }
    }

    /// Current state for one client, `None` when no breaker exists yet.
    pub fn state_of(&self, client_id: &str) -> Option<BreakerState> {
        let breakers = self.breakers.lock().expect("breaker table lock poisoned");
        breakers.get(client_id).map(|b| b.state)
    }

    /// Per-client states for the status surface, ordered for stable output.
    pub fn states(&self) -> BTreeMap<String, BreakerState> {
        let breakers = self.breakers.lock().expect("breaker table lock poisoned");
        breakers
            .iter()
            .map(|(id, b)| (id.clone(), b.state))
            .collect()
    }

    /// Drops breakers whose client is no longer registered. Advisory cleanup
    /// run by the maintenance scheduler; returns how many were pruned.
    pub fn prune_absent(&self, live_clients: &HashSet<String>) -> usize {
        let mut breakers = self.breakers.lock().expect("breaker table lock poisoned");
        let before = breakers.len();
        breakers.retain(|id, _| live_clients.contains(id));
        before - breakers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn table_with_clock() -> (CircuitBreakerTable, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (CircuitBreakerTable::new(clock.clone()), clock)
    }

    #[test]
    fn opens_after_exactly_five_consecutive_failures() {
        let (table, _clock) = table_with_clock();

        for _ in 0..4 {
            table.record_result("c1", false);
            assert_eq!(table.state_of("c1"), Some(BreakerState::Closed));
            assert!(!table.is_open("c1"));
        }

        // A success resets the run; four more failures still do not open.
        table.record_result("c1", true);
        for _ in 0..4 {
            table.record_result("c1", false);
        }
        assert_eq!(table.state_of("c1"), Some(BreakerState::Closed));

        table.record_result("c1", false);
        assert_eq!(table.state_of("c1"), Some(BreakerState::Open));
        assert!(table.is_open("c1"));
    }

    #[test]
    fn cool_down_transitions_to_half_open_then_closes_after_three_successes() {
        let (table, clock) = table_with_clock();
        for _ in 0..FAILURE_THRESHOLD {
            table.record_result("c1", false);
        }
        assert!(table.is_open("c1"));

        // Before the cool-down the gate stays shut.
        clock.advance(Duration::minutes(4));
        assert!(table.is_open("c1"));

        // After the cool-down the next gate check is the probe.
        clock.advance(Duration::minutes(1));
        assert!(!table.is_open("c1"));
        assert_eq!(table.state_of("c1"), Some(BreakerState::HalfOpen));

        table.record_result("c1", true);
        table.record_result("c1", true);
        assert_eq!(table.state_of("c1"), Some(BreakerState::HalfOpen));
        table.record_result("c1", true);
        assert_eq!(table.state_of("c1"), Some(BreakerState::Closed));
    }

    #[test]
    fn half_open_failure_reopens_with_a_fresh_cool_down() {
        let (table, clock) = table_with_clock();
        for _ in 0..FAILURE_THRESHOLD {
            table.record_result("c1", false);
        }
        clock.advance(Duration::minutes(5));
        assert!(!table.is_open("c1"));

        table.record_result("c1", false);
        assert_eq!(table.state_of("c1"), Some(BreakerState::Open));

        // The new cool-down starts now, so 4 minutes later it is still open.
        clock.advance(Duration::minutes(4));
        assert!(table.is_open("c1"));
        clock.advance(Duration::minutes(1));
        assert!(!table.is_open("c1"));
    }

    #[test]
    fn pruning_keeps_only_live_clients() {
        let (table, _clock) = table_with_clock();
        table.record_result("alive", false);
        table.record_result("gone", false);

        let live: HashSet<String> = ["alive".to_string()].into_iter().collect();
        assert_eq!(table.prune_absent(&live), 1);
        assert_eq!(table.state_of("gone"), None);
        assert!(table.state_of("alive").is_some());
    }
}
