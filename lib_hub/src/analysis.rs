//! # Failure Analysis Service Interface
//!
//! The hub does not own root-cause classification. Every failed delivery is
//! packaged into a [`FailureContext`] and handed to an implementation of
//! [`FailureAnalysis`], an external collaborator in the surrounding platform.
//! The hub only consumes the returned [`Classification`] to drive its
//! remediation dispatch and to key the stored failure patterns.
//!
//! Two hard rules at this seam:
//!
//! 1. Classification must never crash delivery. The trait returns a
//!    `Result`, and the caller logs and swallows errors; the delivery outcome
//!    was already recorded before classification started.
//! 2. The root-cause taxonomy is a closed enum with a default arm, so a new
//!    category is a compile-time-visible extension instead of a stringly
//!    typed branch.
//!
//! [`HeuristicAnalyzer`] is the bundled implementation: a deterministic
//! keyword classifier good enough for wiring, local runs, and tests.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// The closed root-cause taxonomy driving remediation dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootCause {
    /// The peer went away mid-delivery (closed socket, dead writer task).
    ConnectionLost,
    /// The payload exceeded what the client can accept.
    MessageTooLarge,
    /// The client cannot keep up with the delivery rate.
    ClientOverloaded,
    /// The network path is degraded (timeouts, high latency).
    NetworkCongestion,
    /// Everything else, carrying the analyzer's free-form category.
    Other(String),
}

impl RootCause {
    /// The wire/category string for this cause, as stored in patterns and
    /// exposed on the status surface.
    pub fn as_str(&self) -> &str {
        match self {
            RootCause::ConnectionLost => "connection_lost",
            RootCause::MessageTooLarge => "message_too_large",
            RootCause::ClientOverloaded => "client_overloaded",
            RootCause::NetworkCongestion => "network_congestion",
            RootCause::Other(tag) => tag,
        }
    }
}

/// Everything the analyzer gets to see about one failed delivery attempt.
#[derive(Debug, Clone, Serialize)]
pub struct FailureContext {
    /// What the failing operation was: `message_delivery`, `message_parsing`.
    pub kind: String,
    /// The error description recorded on the delivery attempt.
    pub error: String,
    /// The client the attempt targeted.
    pub client_id: String,
    /// The message involved, when one exists.
    pub message_id: Option<String>,
    /// Serialized payload size in bytes.
    pub message_size: usize,
    /// Retry count carried on the delivery record.
    pub retry_count: u32,
    /// The client's quality score at failure time, 0.0 when unknown.
    pub client_quality: f64,
    /// Client-type tag from the connection record, when still registered.
    pub client_type: Option<String>,
}

/// The analyzer's verdict for one failure context.
#[derive(Debug, Clone)]
pub struct Classification {
    /// Stable identifier for this failure signature; keys the pattern store.
    pub error_id: String,
    /// The classified root cause.
    pub root_cause: RootCause,
    /// Human-readable description of the root cause.
    pub description: String,
    /// Advisory prevention rule produced by the analyzer.
    pub prevention_rule: Value,
}

/// Errors a classifier may return. The hub logs these and moves on.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// The analyzer could not produce a classification for this context.
    #[error("classification failed: {0}")]
    Failed(String),
}

/// The external classification boundary.
pub trait FailureAnalysis: Send + Sync {
    /// Classifies one failure context. Must not panic for any well-formed
    /// context.
    fn classify(&self, ctx: &FailureContext) -> Result<Classification, AnalysisError>;
}

/// Deterministic keyword-based classifier.
///
/// Matches the error text against known symptom fragments and falls back to
/// the context's operation kind for the default arm. The error id is a
/// truncated sha-256 of the failure signature (kind + error text + cause), so
/// repeats of the same failure map onto the same stored pattern.
#[derive(Debug, Default)]
pub struct HeuristicAnalyzer;

impl HeuristicAnalyzer {
    fn cause_for(ctx: &FailureContext) -> RootCause {
        let error = ctx.error.to_ascii_lowercase();
        if error.contains("closed")
            || error.contains("lost")
            || error.contains("reset")
            || error.contains("broken pipe")
            || error.contains("not connected")
        {
            RootCause::ConnectionLost
        } else if error.contains("too large") || ctx.message_size > 1024 * 1024 {
            RootCause::MessageTooLarge
        } else if error.contains("overload")
            || error.contains("backpressure")
            || error.contains("buffer full")
        {
            RootCause::ClientOverloaded
        } else if error.contains("timeout") || error.contains("congestion") {
            RootCause::NetworkCongestion
        } else {
            RootCause::Other(ctx.kind.clone())
        }
    }
}

impl FailureAnalysis for HeuristicAnalyzer {
    fn classify(&self, ctx: &FailureContext) -> Result<Classification, AnalysisError> {
        let root_cause = Self::cause_for(ctx);

        let mut hasher = Sha256::new();
        hasher.update(ctx.kind.as_bytes());
        hasher.update(ctx.error.as_bytes());
        hasher.update(root_cause.as_str().as_bytes());
        let digest = hasher.finalize();
        let error_id = format!("err-{}", &hex::encode(digest)[..12]);

        let description = match &root_cause {
            RootCause::ConnectionLost => "client connection was lost during delivery".to_string(),
            RootCause::MessageTooLarge => "payload exceeds the client's acceptable size".to_string(),
            RootCause::ClientOverloaded => "client cannot keep up with the delivery rate".to_string(),
            RootCause::NetworkCongestion => "network path is congested or timing out".to_string(),
            RootCause::Other(tag) => format!("unclassified failure during {tag}"),
        };

        Ok(Classification {
            error_id,
            description,
            prevention_rule: json!({
                "watch_for": ctx.error,
                "category": root_cause.as_str(),
            }),
            root_cause,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(error: &str) -> FailureContext {
        FailureContext {
            kind: "message_delivery".into(),
            error: error.into(),
            client_id: "c1".into(),
            message_id: Some("m1".into()),
            message_size: 128,
            retry_count: 0,
            client_quality: 1.0,
            client_type: Some("websocket".into()),
        }
    }

    #[test]
    fn keyword_classification_covers_the_taxonomy() {
        let analyzer = HeuristicAnalyzer;
        let cases = [
            ("connection closed", RootCause::ConnectionLost),
            ("send buffer full", RootCause::ClientOverloaded),
            ("acknowledgment timeout", RootCause::NetworkCongestion),
            ("payload too large for peer", RootCause::MessageTooLarge),
            (
                "some novel failure",
                RootCause::Other("message_delivery".into()),
            ),
        ];

        for (error, expected) in cases {
            let verdict = analyzer.classify(&ctx(error)).unwrap();
            assert_eq!(verdict.root_cause, expected, "error text: {error}");
        }
    }

    #[test]
    fn identical_failures_share_an_error_id() {
        let analyzer = HeuristicAnalyzer;
        let a = analyzer.classify(&ctx("connection closed")).unwrap();
        let b = analyzer.classify(&ctx("connection closed")).unwrap();
        let c = analyzer.classify(&ctx("something else")).unwrap();

        assert_eq!(a.error_id, b.error_id);
        assert_ne!(a.error_id, c.error_id);
    }
}
