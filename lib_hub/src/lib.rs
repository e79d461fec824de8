//! # lib_hub
//!
//! Connection and delivery reliability engine for the RsHub real-time
//! message hub: connection lifecycle tracking, per-client circuit breaking,
//! the acknowledged-delivery protocol with compression and size
//! optimization, failure learning, and the periodic maintenance loops that
//! keep the bookkeeping bounded and self-healing.
//!
//! The `servers` crate wires this engine behind an axum WebSocket gateway;
//! everything here is transport-agnostic behind the `ClientTransport` trait.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

// Declare the modules to re-export
pub mod analysis;
pub mod clock;
pub mod core;
pub mod transport;

// Re-export the primary API surface
pub use analysis::{
    AnalysisError, Classification, FailureAnalysis, FailureContext, HeuristicAnalyzer, RootCause,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use core::{
    BreakerState, CircuitBreakerTable, ConnectionRegistry, ConnectionSnapshot, DeliveryHub,
    DeliveryRecord, DeliverySummary, FailurePattern, FailurePatternStore, HubConfig, HubStatus,
    MaintenanceIntervals, MaintenanceScheduler, MetricsSnapshot, PerformanceMetrics,
    RemediationOutcome,
};
pub use transport::{channel, ChannelTransport, ClientTransport, Frame, TransportError};
