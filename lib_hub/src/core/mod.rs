//! # Core Engine Module
//!
//! The heart of the RsHub delivery reliability engine. It aggregates the
//! components that manage connection lifecycle, delivery gating, failure
//! learning, and the periodic upkeep that keeps every table bounded. All
//! components are asynchronous-friendly and thread-safe.
//!
//! ## Core Components:
//!
//! - **`registry`**: exclusive owner of the live connection set, holding ids,
//!   activity timestamps, quality scores, and remediation flags.
//!
//! - **`breaker`**: the per-client circuit breaker table gating delivery
//!   attempts after repeated failures.
//!
//! - **`delivery`**: the `DeliveryHub` pipeline: broadcast fan-out,
//!   envelope optimization and compression, acknowledgment tracking, inbound
//!   control messages, and the failure-learning path.
//!
//! - **`maintenance`**: the three self-healing periodic loops (connection,
//!   performance, learning).
//!
//! - **`patterns`**: the time-bounded store of learned failure→fix
//!   associations.
//!
//! - **`metrics`**: cumulative performance counters and the delivery-record
//!   ring buffer.
//!
//! By declaring and re-exporting these components, the `core` module gives
//! the gateway binary and the surrounding platform one clean API surface.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Per-client circuit breaker table gating delivery attempts.
pub mod breaker;
/// The broadcast pipeline, acknowledgment protocol, and learning path.
pub mod delivery;
/// The three self-healing periodic maintenance loops.
pub mod maintenance;
/// Cumulative performance counters and delivery history.
pub mod metrics;
/// Time-bounded store of learned failure patterns.
pub mod patterns;
/// Exclusive owner of the live connection set.
pub mod registry;

// --- Public API Re-exports ---
// Make the primary structs from the core modules directly accessible.
pub use breaker::{BreakerState, CircuitBreakerTable};
pub use delivery::{DeliveryHub, DeliverySummary, HubConfig, HubStatus};
pub use maintenance::{MaintenanceIntervals, MaintenanceScheduler};
pub use metrics::{DeliveryRecord, MetricsSnapshot, PerformanceMetrics};
pub use patterns::{FailurePattern, FailurePatternStore, RemediationOutcome};
pub use registry::{ConnectionRegistry, ConnectionSnapshot};
