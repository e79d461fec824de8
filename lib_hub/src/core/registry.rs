//! # Connection Registry
//!
//! Exclusive owner of all live connection records. Every inbound or outbound
//! event for a client flows through here: registration on upgrade, activity
//! touches on inbound messages, failure accounting on broken sends, and
//! eviction on disconnect or staleness.
//!
//! ## Core Design:
//!
//! 1. **Single lock, short holds**: the records live in a `HashMap` behind a
//!    `std::sync::Mutex` that is never held across an await. Callers that
//!    need the transport clone the `Arc` out and release the lock before
//!    touching it, so one client's slow send can never serialize the others.
//!
//! 2. **Collision-resistant identifiers**: a client id is a truncated
//!    sha-256 over the remote address, the connect timestamp, and a
//!    process-local counter. Two simultaneously live connections can never
//!    share an id, even when they originate from the same address within the
//!    same tick.
//!
//! 3. **Quality scoring**: each connection carries a multiplicatively
//!    decaying health estimate in `[0.0, 1.0]`: ×0.9 per failed send, ×0.8
//!    when a stale connection is put through a recovery attempt. The score
//!    feeds the failure-analysis context and the status surface.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use crate::clock::Clock;
use crate::transport::ClientTransport;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// One live connection's bookkeeping, owned exclusively by the registry.
struct Connection {
    transport: Arc<dyn ClientTransport>,
    connected_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    total_messages: u64,
    failed_sends: u64,
    quality: f64,
    client_type: String,
    chunked_delivery: bool,
    rate_limited: bool,
    pending_recovery: bool,
}

/// Read-only copy of a connection's metadata, safe to hand to the analyzer
/// and the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    /// The connection's client identifier.
    pub client_id: String,
    /// When the socket was accepted.
    pub connected_at: DateTime<Utc>,
    /// Last inbound activity.
    pub last_activity: DateTime<Utc>,
    /// Messages seen on this connection (inbound and delivered).
    pub total_messages: u64,
    /// Failed delivery attempts to this client.
    pub failed_sends: u64,
    /// Decaying health estimate in `[0.0, 1.0]`.
    pub quality: f64,
    /// Client-type tag supplied at registration.
    pub client_type: String,
    /// Remediation flag: large messages should be chunked for this client.
    pub chunked_delivery: bool,
    /// Remediation flag: deliveries to this client should be rate limited.
    pub rate_limited: bool,
    /// Remediation flag: the connection is marked for a recovery attempt.
    pub pending_recovery: bool,
}

/// Thread-safe owner of the live connection set.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Connection>>,
    clock: Arc<dyn Clock>,
    /// Salt folded into id generation so same-address same-instant connects
    /// still get distinct ids.
    register_seq: AtomicU64,
}

impl ConnectionRegistry {
    /// Creates an empty registry reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            clock,
            register_seq: AtomicU64::new(0),
        }
    }

    /// # Register
    ///
    /// Accepts a new connection, generates a fresh identifier, and stores the
    /// record. The caller (the delivery hub) bumps the connection counters.
    pub fn register(
        &self,
        transport: Arc<dyn ClientTransport>,
        client_type: &str,
        remote: &str,
    ) -> String {
        let now = self.clock.now();
        let seq = self.register_seq.fetch_add(1, Ordering::Relaxed);

        let mut hasher = Sha256::new();
        hasher.update(remote.as_bytes());
        hasher.update(now.to_rfc3339().as_bytes());
        hasher.update(seq.to_le_bytes());
        let client_id = hex::encode(hasher.finalize())[..12].to_string();

        let connection = Connection {
            transport,
            connected_at: now,
            last_activity: now,
            total_messages: 0,
            failed_sends: 0,
            quality: 1.0,
            client_type: client_type.to_string(),
            chunked_delivery: false,
            rate_limited: false,
            pending_recovery: false,
        };

        let mut connections = self.connections.lock().expect("registry lock poisoned");
        connections.insert(client_id.clone(), connection);
        log::info!(
            "Client '{}' registered ({}, {} active)",
            client_id,
            client_type,
            connections.len()
        );
        client_id
    }

    /// Updates last-activity and the inbound message count. Returns false for
    /// unknown clients.
    pub fn touch(&self, client_id: &str) -> bool {
        let mut connections = self.connections.lock().expect("registry lock poisoned");
        match connections.get_mut(client_id) {
            Some(connection) => {
                connection.last_activity = self.clock.now();
                connection.total_messages += 1;
                true
            }
            None => false,
        }
    }

    /// Records a failed send: bumps the failure count and decays quality by
    /// ×0.9, clamped to `[0.0, 1.0]`.
    pub fn record_failure(&self, client_id: &str) {
        let mut connections = self.connections.lock().expect("registry lock poisoned");
        if let Some(connection) = connections.get_mut(client_id) {
            connection.failed_sends += 1;
            connection.quality = (connection.quality * 0.9).clamp(0.0, 1.0);
        }
    }

    /// Records a successful outbound delivery on the connection's counters.
    pub fn record_delivery(&self, client_id: &str) {
        let mut connections = self.connections.lock().expect("registry lock poisoned");
        if let Some(connection) = connections.get_mut(client_id) {
            connection.total_messages += 1;
        }
    }

    /// Multiplies the quality score by `factor`, clamped to `[0.0, 1.0]`.
    /// Used by stale recovery (×0.8) and the connection-lost remediation.
    pub fn scale_quality(&self, client_id: &str, factor: f64) {
        let mut connections = self.connections.lock().expect("registry lock poisoned");
        if let Some(connection) = connections.get_mut(client_id) {
            connection.quality = (connection.quality * factor).clamp(0.0, 1.0);
        }
    }

    /// Marks the connection for a recovery attempt (remediation flag only).
    pub fn mark_recovery(&self, client_id: &str) {
        let mut connections = self.connections.lock().expect("registry lock poisoned");
        if let Some(connection) = connections.get_mut(client_id) {
            connection.pending_recovery = true;
        }
    }

    /// Enables chunked delivery mode for the client (remediation flag only).
    pub fn enable_chunked_delivery(&self, client_id: &str) {
        let mut connections = self.connections.lock().expect("registry lock poisoned");
        if let Some(connection) = connections.get_mut(client_id) {
            connection.chunked_delivery = true;
        }
    }

    /// Enables rate limiting for the client (remediation flag only).
    pub fn enable_rate_limiting(&self, client_id: &str) {
        let mut connections = self.connections.lock().expect("registry lock poisoned");
        if let Some(connection) = connections.get_mut(client_id) {
            connection.rate_limited = true;
        }
    }

    /// # Evict
    ///
    /// Closes the transport if still open and removes the record. Idempotent:
    /// evicting an absent client returns false and is not an error. The hub
    /// removes the client's pending acknowledgments right after.
    pub fn evict(&self, client_id: &str) -> bool {
        let removed = {
            let mut connections = self.connections.lock().expect("registry lock poisoned");
            connections.remove(client_id)
        };
        match removed {
            Some(connection) => {
                if connection.transport.is_open() {
                    connection.transport.close();
                }
                log::info!("Client '{}' evicted", client_id);
                true
            }
            None => false,
        }
    }

    /// Clients whose last activity is older than `idle_threshold`.
    pub fn stale_clients(&self, idle_threshold: Duration) -> Vec<String> {
        let now = self.clock.now();
        let connections = self.connections.lock().expect("registry lock poisoned");
        connections
            .iter()
            .filter(|(_, c)| now - c.last_activity > idle_threshold)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Clones out the transport handle for one client.
    pub fn transport(&self, client_id: &str) -> Option<Arc<dyn ClientTransport>> {
        let connections = self.connections.lock().expect("registry lock poisoned");
        connections.get(client_id).map(|c| Arc::clone(&c.transport))
    }

    /// Read-only metadata copy for one client.
    pub fn snapshot(&self, client_id: &str) -> Option<ConnectionSnapshot> {
        let connections = self.connections.lock().expect("registry lock poisoned");
        connections.get(client_id).map(|c| ConnectionSnapshot {
            client_id: client_id.to_string(),
            connected_at: c.connected_at,
            last_activity: c.last_activity,
            total_messages: c.total_messages,
            failed_sends: c.failed_sends,
            quality: c.quality,
            client_type: c.client_type.clone(),
            chunked_delivery: c.chunked_delivery,
            rate_limited: c.rate_limited,
            pending_recovery: c.pending_recovery,
        })
    }

    /// The client's quality score, `None` when not registered.
    pub fn quality(&self, client_id: &str) -> Option<f64> {
        let connections = self.connections.lock().expect("registry lock poisoned");
        connections.get(client_id).map(|c| c.quality)
    }

    /// Whether the client is currently registered.
    pub fn contains(&self, client_id: &str) -> bool {
        let connections = self.connections.lock().expect("registry lock poisoned");
        connections.contains_key(client_id)
    }

    /// All currently registered client ids.
    pub fn client_ids(&self) -> Vec<String> {
        let connections = self.connections.lock().expect("registry lock poisoned");
        connections.keys().cloned().collect()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        let connections = self.connections.lock().expect("registry lock poisoned");
        connections.len()
    }

    /// Whether no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::transport::channel;

    fn registry_with_clock() -> (ConnectionRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (ConnectionRegistry::new(clock.clone()), clock)
    }

    #[test]
    fn ids_are_unique_for_same_remote_and_instant() {
        let (registry, _clock) = registry_with_clock();
        let (t1, _rx1) = channel();
        let (t2, _rx2) = channel();

        // Same remote, same (frozen) clock instant: the sequence salt must
        // still keep the ids apart.
        let a = registry.register(Arc::new(t1), "websocket", "10.0.0.1:5000");
        let b = registry.register(Arc::new(t2), "websocket", "10.0.0.1:5000");
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn quality_stays_clamped_under_any_failure_sequence() {
        let (registry, _clock) = registry_with_clock();
        let (transport, _rx) = channel();
        let id = registry.register(Arc::new(transport), "websocket", "10.0.0.1:5000");

        for _ in 0..200 {
            registry.record_failure(&id);
            registry.scale_quality(&id, 0.8);
        }
        let quality = registry.quality(&id).unwrap();
        assert!((0.0..=1.0).contains(&quality));

        // Scaling upward must clamp at 1.0 as well.
        registry.scale_quality(&id, 1.0e9);
        assert!(registry.quality(&id).unwrap() <= 1.0);
    }

    #[test]
    fn evict_is_idempotent_and_closes_the_transport() {
        let (registry, _clock) = registry_with_clock();
        let (transport, mut rx) = channel();
        let id = registry.register(Arc::new(transport), "websocket", "10.0.0.1:5000");

        assert!(registry.evict(&id));
        assert!(!registry.evict(&id));
        assert!(!registry.evict("not-a-client"));
        assert_eq!(rx.blocking_recv(), Some(crate::transport::Frame::Close));
    }

    #[test]
    fn stale_detection_uses_the_injected_clock() {
        let (registry, clock) = registry_with_clock();
        let (t1, _rx1) = channel();
        let (t2, _rx2) = channel();
        let idle = registry.register(Arc::new(t1), "websocket", "10.0.0.1:5000");
        let fresh = registry.register(Arc::new(t2), "websocket", "10.0.0.2:5000");

        clock.advance(Duration::seconds(61));
        registry.touch(&fresh);

        let stale = registry.stale_clients(Duration::seconds(60));
        assert_eq!(stale, vec![idle]);
    }
}
