//! # Performance Counters and Delivery History
//!
//! Central accounting for the hub. Two kinds of state live here:
//!
//! - **Atomic counters** for the cumulative performance metrics exposed on
//!   the status surface (total/failed connections and messages, learning
//!   applications, patterns learned, investigation events). These are plain
//!   `AtomicU64`s updated with `Ordering::Relaxed`: many concurrent tasks
//!   bump them and only the eventual value matters, so no mutex is needed.
//!
//! - **The delivery history ring buffer**: the most recent 1000
//!   [`DeliveryRecord`]s, used by the performance monitor to recompute the
//!   average delivery latency. Records are immutable once pushed and are
//!   never persisted.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Number of delivery records retained for latency accounting.
const HISTORY_CAPACITY: usize = 1000;

/// Immutable result of one delivery attempt.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryRecord {
    /// The broadcast's message identifier.
    pub message_id: String,
    /// The targeted client.
    pub client_id: String,
    /// When the attempt finished.
    pub timestamp: DateTime<Utc>,
    /// Whether the transport accepted the frame.
    pub success: bool,
    /// Error description for failed attempts.
    pub error: Option<String>,
    /// How many times this delivery has been retried.
    pub retry_count: u32,
    /// Wall-clock latency of the attempt in milliseconds, when measured.
    pub delivery_ms: Option<f64>,
}

/// Read-only view of the counters, serialized into the status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Connections accepted since startup.
    pub total_connections: u64,
    /// Currently registered connections.
    pub active_connections: u64,
    /// Connections that ended in an error or stale eviction.
    pub failed_connections: u64,
    /// Delivery attempts made since startup.
    pub total_messages: u64,
    /// Delivery attempts that failed (including acknowledgment timeouts).
    pub failed_messages: u64,
    /// Average delivery latency over the retained history, in milliseconds.
    pub average_latency_ms: f64,
    /// Remediation dispatches applied by the learning path.
    pub learning_applications: u64,
    /// Distinct failure patterns stored so far.
    pub patterns_learned: u64,
    /// Investigation events flagged by the performance monitor.
    pub investigations: u64,
}

/// Thread-safe counter block plus the bounded delivery history.
#[derive(Debug, Default)]
pub struct PerformanceMetrics {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    failed_connections: AtomicU64,
    total_messages: AtomicU64,
    failed_messages: AtomicU64,
    learning_applications: AtomicU64,
    patterns_learned: AtomicU64,
    investigations: AtomicU64,
    average_latency_ms: Mutex<f64>,
    history: Mutex<VecDeque<DeliveryRecord>>,
}

impl PerformanceMetrics {
    /// Creates a zeroed counter block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a newly accepted connection.
    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a connection leaving the registry. `failed` marks error or
    /// stale-eviction exits.
    pub fn connection_closed(&self, failed: bool) {
        // Saturating: eviction is idempotent and must never underflow.
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        if failed {
            self.failed_connections.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Forces the active-connection gauge to the registry's current size.
    /// Called by the connection monitor to self-heal any counter drift.
    pub fn set_active_connections(&self, active: u64) {
        self.active_connections.store(active, Ordering::Relaxed);
    }

    /// Appends one delivery record, trimming the history to its capacity,
    /// and bumps the message counters.
    pub fn record_delivery(&self, record: DeliveryRecord) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        if !record.success {
            self.failed_messages.fetch_add(1, Ordering::Relaxed);
        }

        let mut history = self.history.lock().expect("metrics history lock poisoned");
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(record);
    }

    /// Records an acknowledgment timeout: the delivery was already counted
    /// when it was attempted, so only the failure counter moves, keeping the
    /// failed-exactly-once accounting.
    pub fn record_ack_timeout(&self, record: DeliveryRecord) {
        self.failed_messages.fetch_add(1, Ordering::Relaxed);
        let mut history = self.history.lock().expect("metrics history lock poisoned");
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(record);
    }

    /// Recomputes the average latency from the retained records that carry a
    /// measurement. Returns the new average.
    pub fn recompute_average_latency(&self) -> f64 {
        let history = self.history.lock().expect("metrics history lock poisoned");
        let measured: Vec<f64> = history.iter().filter_map(|r| r.delivery_ms).collect();
        let average = if measured.is_empty() {
            0.0
        } else {
            measured.iter().sum::<f64>() / measured.len() as f64
        };
        drop(history);

        *self
            .average_latency_ms
            .lock()
            .expect("metrics latency lock poisoned") = average;
        average
    }

    /// Bumps the learning-application counter (one per remediation dispatch).
    pub fn learning_applied(&self) {
        self.learning_applications.fetch_add(1, Ordering::Relaxed);
    }

    /// Bumps the stored-pattern counter (one per first-seen failure id).
    pub fn pattern_learned(&self) {
        self.patterns_learned.fetch_add(1, Ordering::Relaxed);
    }

    /// Flags one investigation event from the performance monitor.
    pub fn investigation_flagged(&self) {
        self.investigations.fetch_add(1, Ordering::Relaxed);
    }

    /// Failed-message count so far; the performance monitor diffs this
    /// between ticks.
    pub fn failed_messages(&self) -> u64 {
        self.failed_messages.load(Ordering::Relaxed)
    }

    /// Produces the serializable counter snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            failed_connections: self.failed_connections.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            failed_messages: self.failed_messages.load(Ordering::Relaxed),
            average_latency_ms: *self
                .average_latency_ms
                .lock()
                .expect("metrics latency lock poisoned"),
            learning_applications: self.learning_applications.load(Ordering::Relaxed),
            patterns_learned: self.patterns_learned.load(Ordering::Relaxed),
            investigations: self.investigations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(success: bool, delivery_ms: Option<f64>) -> DeliveryRecord {
        DeliveryRecord {
            message_id: "m".into(),
            client_id: "c".into(),
            timestamp: Utc::now(),
            success,
            error: if success { None } else { Some("boom".into()) },
            retry_count: 0,
            delivery_ms,
        }
    }

    #[test]
    fn history_is_bounded_to_capacity() {
        let metrics = PerformanceMetrics::new();
        for _ in 0..(HISTORY_CAPACITY + 50) {
            metrics.record_delivery(record(true, Some(1.0)));
        }
        let history = metrics.history.lock().unwrap();
        assert_eq!(history.len(), HISTORY_CAPACITY);
    }

    #[test]
    fn average_latency_ignores_unmeasured_records() {
        let metrics = PerformanceMetrics::new();
        metrics.record_delivery(record(true, Some(10.0)));
        metrics.record_delivery(record(true, Some(30.0)));
        metrics.record_delivery(record(false, None));

        assert!((metrics.recompute_average_latency() - 20.0).abs() < f64::EPSILON);
        assert_eq!(metrics.snapshot().failed_messages, 1);
    }

    #[test]
    fn active_gauge_never_underflows() {
        let metrics = PerformanceMetrics::new();
        metrics.connection_closed(false);
        assert_eq!(metrics.snapshot().active_connections, 0);
        assert_eq!(metrics.snapshot().failed_connections, 0);
    }
}
