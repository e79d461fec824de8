//! # Failure Pattern Store
//!
//! A bounded-in-time cache of learned failure→fix associations. Whenever the
//! learning path classifies a failed delivery and dispatches a remediation,
//! the pairing is stored here keyed by the classification's error id.
//!
//! The store is a historical record, not live remediation state: a pattern
//! already present for an error id is left unchanged (first-write-wins), and
//! every pattern is purged 7 days after it was learned. Consolidation only
//! summarizes the stored patterns per root-cause category for the learning
//! processor's logs.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use crate::clock::Clock;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// Retention window for learned patterns.
const PATTERN_TTL_DAYS: i64 = 7;

/// Outcome of one remediation dispatch, stored as the pattern's fix strategy.
#[derive(Debug, Clone, Serialize)]
pub struct RemediationOutcome {
    /// Whether the dispatched action was applied.
    pub successful: bool,
    /// Human-readable actions taken, in order.
    pub actions: Vec<String>,
}

/// One learned failure→fix association.
#[derive(Debug, Clone, Serialize)]
pub struct FailurePattern {
    /// Identifier derived from the originating classification's error id.
    pub pattern_id: String,
    /// Root-cause category string.
    pub pattern_type: String,
    /// Human-readable description of the root cause.
    pub description: String,
    /// Observed symptom strings (the recorded error descriptions).
    pub symptoms: Vec<String>,
    /// Root-cause detail as returned by the analyzer.
    pub root_cause: Value,
    /// The remediation taken when this pattern was first learned.
    pub fix_strategy: RemediationOutcome,
    /// Advisory prevention rule from the analyzer.
    pub prevention: Value,
    /// 1.0 when the first fix applied cleanly, 0.0 otherwise.
    pub success_rate: f64,
    /// When this pattern was learned; drives expiry.
    pub learned_at: DateTime<Utc>,
}

/// Thread-safe pattern cache keyed by error id.
pub struct FailurePatternStore {
    patterns: Mutex<HashMap<String, FailurePattern>>,
    clock: Arc<dyn Clock>,
}

impl FailurePatternStore {
    /// Creates an empty store reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            patterns: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Stores `pattern` unless one already exists for its id. Returns true
    /// when the pattern was newly inserted.
    pub fn insert_if_absent(&self, pattern: FailurePattern) -> bool {
        let mut patterns = self.patterns.lock().expect("pattern store lock poisoned");
        if patterns.contains_key(&pattern.pattern_id) {
            return false;
        }
        log::info!(
            "Learned failure pattern '{}' ({})",
            pattern.pattern_id,
            pattern.pattern_type
        );
        patterns.insert(pattern.pattern_id.clone(), pattern);
        true
    }

    /// Number of stored patterns.
    pub fn len(&self) -> usize {
        let patterns = self.patterns.lock().expect("pattern store lock poisoned");
        patterns.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of one stored pattern.
    pub fn get(&self, pattern_id: &str) -> Option<FailurePattern> {
        let patterns = self.patterns.lock().expect("pattern store lock poisoned");
        patterns.get(pattern_id).cloned()
    }

    /// Per-category pattern counts, used by the learning processor's
    /// consolidation log.
    pub fn consolidate(&self) -> BTreeMap<String, usize> {
        let patterns = self.patterns.lock().expect("pattern store lock poisoned");
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for pattern in patterns.values() {
            *counts.entry(pattern.pattern_type.clone()).or_default() += 1;
        }
        counts
    }

    /// Drops patterns learned more than 7 days ago. Returns how many were
    /// purged.
    pub fn purge_expired(&self) -> usize {
        let cutoff = self.clock.now() - Duration::days(PATTERN_TTL_DAYS);
        let mut patterns = self.patterns.lock().expect("pattern store lock poisoned");
        let before = patterns.len();
        patterns.retain(|_, p| p.learned_at >= cutoff);
        let purged = before - patterns.len();
        if purged > 0 {
            log::info!("Purged {} expired failure patterns", purged);
        }
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn pattern(id: &str, pattern_type: &str, learned_at: DateTime<Utc>) -> FailurePattern {
        FailurePattern {
            pattern_id: id.to_string(),
            pattern_type: pattern_type.to_string(),
            description: "test pattern".into(),
            symptoms: vec!["boom".into()],
            root_cause: json!({"type": pattern_type}),
            fix_strategy: RemediationOutcome {
                successful: true,
                actions: vec!["noop".into()],
            },
            prevention: json!({}),
            success_rate: 1.0,
            learned_at,
        }
    }

    #[test]
    fn first_write_wins_per_pattern_id() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = FailurePatternStore::new(clock.clone());

        let original = pattern("p1", "connection_lost", clock.now());
        let mut replacement = pattern("p1", "network_congestion", clock.now());
        replacement.description = "should not overwrite".into();

        assert!(store.insert_if_absent(original));
        assert!(!store.insert_if_absent(replacement));
        assert_eq!(store.get("p1").unwrap().pattern_type, "connection_lost");
    }

    #[test]
    fn purge_drops_everything_older_than_seven_days() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = FailurePatternStore::new(clock.clone());

        // 1. Ten distinct patterns learned "now".
        for i in 0..10 {
            store.insert_if_absent(pattern(&format!("p{i}"), "connection_lost", clock.now()));
        }
        assert_eq!(store.len(), 10);

        // 2. Nothing expires inside the window.
        clock.advance(Duration::days(6));
        assert_eq!(store.purge_expired(), 0);

        // 3. Fast-forward past 7 days total: everything goes.
        clock.advance(Duration::days(2));
        assert_eq!(store.purge_expired(), 10);
        assert!(store.is_empty());
    }

    #[test]
    fn consolidation_counts_per_category() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = FailurePatternStore::new(clock.clone());
        store.insert_if_absent(pattern("a", "connection_lost", clock.now()));
        store.insert_if_absent(pattern("b", "connection_lost", clock.now()));
        store.insert_if_absent(pattern("c", "message_parsing", clock.now()));

        let counts = store.consolidate();
        assert_eq!(counts.get("connection_lost"), Some(&2));
        assert_eq!(counts.get("message_parsing"), Some(&1));
    }
}
