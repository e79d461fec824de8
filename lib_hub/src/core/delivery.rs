//! # Delivery Pipeline
//!
//! The `DeliveryHub` is the central nervous system of the engine. It turns a
//! logical broadcast into independent per-client delivery attempts, gates
//! each attempt through the circuit breaker table, tracks the acknowledged
//! delivery protocol, and feeds every failure into the learning path.
//!
//! ## Core Design Principles:
//!
//! 1. **Independent attempts**: no cross-client lock is held during a
//!    per-client attempt. The pipeline snapshots the target list, clones the
//!    transport `Arc` out of the registry, and releases every lock before
//!    the send. Failures and successes for different clients never block one
//!    another.
//!
//! 2. **Non-blocking sends**: a send is a channel handoff to the client's
//!    writer task. A dead or slow client fails (or back-pressures) only its
//!    own attempt; the socket write itself happens in that client's writer
//!    task, never on the broadcast path.
//!
//! 3. **Failures are never dropped**: every failed attempt produces a
//!    `DeliveryRecord`, is classified by the external Failure Analysis
//!    Service, dispatched to exactly one remediation, and stored as a
//!    `FailurePattern`. A classification failure is logged and swallowed;
//!    the delivery outcome was already recorded.
//!
//! 4. **Shutdown-aware dispatch**: once the shutdown token fires, attempts
//!    already dispatched finish but no new per-client attempt is started.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use crate::analysis::{FailureAnalysis, FailureContext, RootCause};
use crate::clock::Clock;
use crate::core::breaker::CircuitBreakerTable;
use crate::core::metrics::{DeliveryRecord, MetricsSnapshot, PerformanceMetrics};
use crate::core::patterns::{FailurePattern, FailurePatternStore, RemediationOutcome};
use crate::core::registry::ConnectionRegistry;
use crate::transport::{ClientTransport, Frame};
use chrono::Duration as ChronoDuration;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Floor for the adaptive compression threshold.
const COMPRESSION_THRESHOLD_FLOOR: usize = 512;
/// Serialized size above which the size-optimization pass fires.
const SIZE_OPTIMIZATION_THRESHOLD: usize = 10_000;
/// Acknowledgment deadline per delivered message.
const ACK_TIMEOUT_SECONDS: i64 = 30;

/// Tunable pipeline settings. The compression threshold is the only field
/// mutated at runtime (by the network-congestion remediation).
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Gzip-compress envelopes larger than the threshold before sending.
    pub compression_enabled: bool,
    /// Serialized size (bytes) above which envelopes are compressed and the
    /// compression-hint optimization pass fires.
    pub compression_threshold: usize,
    /// Toggle for the size-optimization pass.
    pub size_optimization_enabled: bool,
    /// Toggle for the routing-metadata pass.
    pub routing_optimization_enabled: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            compression_enabled: true,
            compression_threshold: 1024,
            size_optimization_enabled: true,
            routing_optimization_enabled: true,
        }
    }
}

/// Aggregate result of one broadcast.
#[derive(Debug, Clone, Serialize)]
pub struct DeliverySummary {
    /// The broadcast's unique message identifier.
    pub message_id: String,
    /// Clients targeted by the broadcast.
    pub total_clients: usize,
    /// Attempts accepted by the transport.
    pub succeeded: usize,
    /// Attempts that failed.
    pub failed: usize,
    /// Clients skipped because their breaker was open (not failures).
    pub skipped: usize,
    /// Wall-clock duration of the whole fan-out in milliseconds.
    pub latency_ms: f64,
    /// New failure patterns stored while learning from this broadcast.
    pub patterns_learned: usize,
    /// Optimization passes that fired, in order.
    pub optimizations: Vec<String>,
}

/// Read-only status snapshot for the surrounding platform.
#[derive(Debug, Clone, Serialize)]
pub struct HubStatus {
    /// Whether the hub is accepting work (false once shutdown begins).
    pub server_running: bool,
    /// Currently registered connections.
    pub active_connections: usize,
    /// Cumulative performance counters.
    pub performance_metrics: MetricsSnapshot,
    /// Count of stored failure patterns.
    pub failure_patterns: usize,
    /// Circuit breaker state per client id.
    pub circuit_breakers: BTreeMap<String, crate::core::breaker::BreakerState>,
    /// Outstanding acknowledgments awaiting a reply or the timeout sweep.
    pub pending_acknowledgments: usize,
}

#[derive(Debug, Clone)]
struct PendingAck {
    sent_at: DateTime<Utc>,
    timeout_at: DateTime<Utc>,
}

/// The connection and delivery reliability engine.
///
/// Explicitly constructed with its collaborators injected (analyzer, clock);
/// there is no process-global instance. Wrap it in an `Arc` and share it
/// between the gateway handlers and the maintenance scheduler.
pub struct DeliveryHub {
    registry: Arc<ConnectionRegistry>,
    breakers: Arc<CircuitBreakerTable>,
    patterns: Arc<FailurePatternStore>,
    metrics: Arc<PerformanceMetrics>,
    analyzer: Arc<dyn FailureAnalysis>,
    clock: Arc<dyn Clock>,
    config: Mutex<HubConfig>,
    pending_acks: Mutex<HashMap<(String, String), PendingAck>>,
    /// Per-client retry buffer fed by the default remediation arm. Hook
    /// state only: draining it with real backoff is outside this core.
    retry_buffer: Mutex<HashMap<String, Vec<Value>>>,
    message_seq: AtomicU64,
    running: AtomicBool,
    shutdown: CancellationToken,
}

impl DeliveryHub {
    /// Builds a hub with all tables sharing the injected clock.
    pub fn new(
        config: HubConfig,
        analyzer: Arc<dyn FailureAnalysis>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::new(ConnectionRegistry::new(Arc::clone(&clock))),
            breakers: Arc::new(CircuitBreakerTable::new(Arc::clone(&clock))),
            patterns: Arc::new(FailurePatternStore::new(Arc::clone(&clock))),
            metrics: Arc::new(PerformanceMetrics::new()),
            analyzer,
            clock,
            config: Mutex::new(config),
            pending_acks: Mutex::new(HashMap::new()),
            retry_buffer: Mutex::new(HashMap::new()),
            message_seq: AtomicU64::new(0),
            running: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
        })
    }

    /// The connection registry owned by this hub.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The circuit breaker table owned by this hub.
    pub fn breakers(&self) -> &Arc<CircuitBreakerTable> {
        &self.breakers
    }

    /// The failure pattern store owned by this hub.
    pub fn patterns(&self) -> &Arc<FailurePatternStore> {
        &self.patterns
    }

    /// The performance counters owned by this hub.
    pub fn metrics(&self) -> &Arc<PerformanceMetrics> {
        &self.metrics
    }

    /// Token observed by connection loops and the maintenance scheduler.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Whether the hub is still accepting work.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Current compression threshold (mutable via remediation).
    pub fn compression_threshold(&self) -> usize {
        self.config
            .lock()
            .expect("hub config lock poisoned")
            .compression_threshold
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Registers a new connection and returns its client id.
    pub fn register_client(
        &self,
        transport: Arc<dyn ClientTransport>,
        client_type: &str,
        remote: &str,
    ) -> String {
        let client_id = self.registry.register(transport, client_type, remote);
        self.metrics.connection_opened();
        client_id
    }

    /// Evicts a connection: closes the transport, drops the record and all of
    /// the client's pending acknowledgments. Idempotent; `failed` marks the
    /// exit as an error/stale eviction in the counters.
    pub fn disconnect(&self, client_id: &str, failed: bool) {
        if self.registry.evict(client_id) {
            self.metrics.connection_closed(failed);
        }
        let mut pending = self.pending_acks.lock().expect("pending-ack lock poisoned");
        pending.retain(|(owner, _), _| owner != client_id);
    }

    /// Outstanding acknowledgment count (status surface and tests).
    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks
            .lock()
            .expect("pending-ack lock poisoned")
            .len()
    }

    /// Messages buffered for retry-with-backoff for one client.
    pub fn retry_buffer_len(&self, client_id: &str) -> usize {
        self.retry_buffer
            .lock()
            .expect("retry buffer lock poisoned")
            .get(client_id)
            .map_or(0, Vec::len)
    }

    // ------------------------------------------------------------------
    // Broadcast path
    // ------------------------------------------------------------------

    /// # Broadcast
    ///
    /// Fans `message` out to `targets` (all connected clients when `None`),
    /// applying the optimization passes once and gating every client through
    /// its circuit breaker. Returns the aggregate summary; failures have
    /// already been classified, remediated, and stored by the time this
    /// returns.
    pub fn broadcast(&self, message: &Value, targets: Option<&[String]>) -> DeliverySummary {
        let started = Instant::now();
        let message_id = self.next_message_id(message);
        let (optimized, optimizations) = self.apply_optimizations(message);

        let clients: Vec<String> = match targets {
            Some(ids) => ids.to_vec(),
            None => self.registry.client_ids(),
        };
        log::info!(
            "Broadcasting message {} to {} clients",
            message_id,
            clients.len()
        );

        let mut succeeded = 0usize;
        let mut skipped = 0usize;
        let mut failed_records: Vec<DeliveryRecord> = Vec::new();

        for client_id in &clients {
            // In-flight attempts finish, but nothing new starts once
            // shutdown begins.
            if self.shutdown.is_cancelled() {
                log::warn!("Shutdown in progress; halting dispatch of {}", message_id);
                break;
            }
            if self.breakers.is_open(client_id) {
                log::warn!("Circuit breaker open for '{}', skipping", client_id);
                skipped += 1;
                continue;
            }

            let record = self.deliver_to_client(client_id, &optimized, &message_id);
            if record.success {
                succeeded += 1;
            } else {
                failed_records.push(record.clone());
            }
            self.metrics.record_delivery(record);
        }

        let patterns_learned = self.learn_from_delivery_failures(&failed_records, &optimized);

        DeliverySummary {
            message_id,
            total_clients: clients.len(),
            succeeded,
            failed: failed_records.len(),
            skipped,
            latency_ms: started.elapsed().as_secs_f64() * 1000.0,
            patterns_learned,
            optimizations,
        }
    }

    /// One delivery attempt: wrap, serialize, maybe compress, send exactly
    /// once. No implicit retry.
    fn deliver_to_client(&self, client_id: &str, message: &Value, message_id: &str) -> DeliveryRecord {
        let started = Instant::now();
        let now = self.clock.now();

        let failure = |error: String, elapsed: f64| DeliveryRecord {
            message_id: message_id.to_string(),
            client_id: client_id.to_string(),
            timestamp: now,
            success: false,
            error: Some(error),
            retry_count: 0,
            delivery_ms: Some(elapsed),
        };

        let Some(transport) = self.registry.transport(client_id) else {
            let elapsed = started.elapsed().as_secs_f64() * 1000.0;
            self.breakers.record_result(client_id, false);
            return failure(format!("client '{}' not connected", client_id), elapsed);
        };

        let mut envelope = as_object(message);
        envelope.insert("_message_id".into(), json!(message_id));
        envelope.insert("_timestamp".into(), json!(now.to_rfc3339()));
        envelope.insert("_expects_ack".into(), json!(true));

        let (compression_enabled, threshold) = {
            let config = self.config.lock().expect("hub config lock poisoned");
            (config.compression_enabled, config.compression_threshold)
        };

        let serialized = Value::Object(envelope.clone()).to_string();
        let frame = if compression_enabled && serialized.len() > threshold {
            // The flag travels inside the envelope, so an inflated frame
            // still identifies itself as having been compressed.
            envelope.insert("_compressed".into(), json!(true));
            let flagged = Value::Object(envelope).to_string();
            match gzip(flagged.as_bytes()) {
                Ok(bytes) => Frame::Binary(bytes),
                Err(e) => {
                    let elapsed = started.elapsed().as_secs_f64() * 1000.0;
                    self.registry.record_failure(client_id);
                    self.breakers.record_result(client_id, false);
                    return failure(format!("compression failed: {}", e), elapsed);
                }
            }
        } else {
            Frame::Text(serialized)
        };

        match transport.send(frame) {
            Ok(()) => {
                let sent_at = now;
                let timeout_at = sent_at + ChronoDuration::seconds(ACK_TIMEOUT_SECONDS);
                self.pending_acks
                    .lock()
                    .expect("pending-ack lock poisoned")
                    .insert(
                        (client_id.to_string(), message_id.to_string()),
                        PendingAck { sent_at, timeout_at },
                    );
                self.registry.record_delivery(client_id);
                self.breakers.record_result(client_id, true);
                DeliveryRecord {
                    message_id: message_id.to_string(),
                    client_id: client_id.to_string(),
                    timestamp: now,
                    success: true,
                    error: None,
                    retry_count: 0,
                    delivery_ms: Some(started.elapsed().as_secs_f64() * 1000.0),
                }
            }
            Err(e) => {
                let elapsed = started.elapsed().as_secs_f64() * 1000.0;
                log::error!("Delivery to '{}' failed: {}", client_id, e);
                self.registry.record_failure(client_id);
                self.breakers.record_result(client_id, false);
                failure(e.to_string(), elapsed)
            }
        }
    }

    /// Applies the optimization passes in their fixed order. Each pass is
    /// idempotent and independently toggleable; the fired passes are recorded
    /// both in the envelope and in the returned list.
    fn apply_optimizations(&self, message: &Value) -> (Value, Vec<String>) {
        let config = self.config.lock().expect("hub config lock poisoned").clone();
        let mut optimized = as_object(message);
        let mut passes = Vec::new();

        let serialized_len = Value::Object(optimized.clone()).to_string().len();

        if config.compression_enabled && serialized_len > config.compression_threshold {
            optimized.insert("_compress_hint".into(), json!(true));
            passes.push("compression_hint".to_string());
        }
        if config.size_optimization_enabled && serialized_len > SIZE_OPTIMIZATION_THRESHOLD {
            // Flags non-essential fields for stripping downstream; the core
            // does not rewrite payload content.
            optimized.insert("_optimized_for_size".into(), json!(true));
            passes.push("size_optimization".to_string());
        }
        if config.routing_optimization_enabled {
            optimized.insert("_routing_optimized".into(), json!(true));
            passes.push("routing_optimization".to_string());
        }

        optimized.insert("_optimizations".into(), json!(passes));
        (Value::Object(optimized), passes)
    }

    /// Message id from a content hash plus a timestamp-and-sequence salt, so
    /// identical payloads broadcast at different times never collide.
    fn next_message_id(&self, message: &Value) -> String {
        let seq = self.message_seq.fetch_add(1, Ordering::Relaxed);
        let mut hasher = Sha256::new();
        hasher.update(message.to_string().as_bytes());
        hasher.update(self.clock.now().to_rfc3339().as_bytes());
        hasher.update(seq.to_le_bytes());
        hex::encode(hasher.finalize())[..12].to_string()
    }

    // ------------------------------------------------------------------
    // Inbound path
    // ------------------------------------------------------------------

    /// # Inbound Message Handling
    ///
    /// Parses one raw frame from a client. Malformed payloads are isolated to
    /// that message (the connection stays registered) and routed to the
    /// learning path tagged `message_parsing`. Recognized control types:
    /// `ping`, `subscribe`, `ack`; anything else is logged and ignored.
    pub fn on_message(&self, client_id: &str, raw: &str) {
        let message: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                log::error!("Invalid payload from '{}': {}", client_id, e);
                let quality = self.registry.quality(client_id).unwrap_or(0.0);
                let client_type = self.registry.snapshot(client_id).map(|s| s.client_type);
                self.learn_failure(FailureContext {
                    kind: "message_parsing".into(),
                    error: format!("invalid message payload: {}", e),
                    client_id: client_id.to_string(),
                    message_id: None,
                    message_size: raw.len(),
                    retry_count: 0,
                    client_quality: quality,
                    client_type,
                });
                return;
            }
        };

        self.registry.touch(client_id);

        match message.get("type").and_then(Value::as_str).unwrap_or("unknown") {
            "ping" => {
                self.send_control(
                    client_id,
                    &json!({
                        "type": "pong",
                        "timestamp": self.clock.now().to_rfc3339(),
                    }),
                );
            }
            "subscribe" => {
                // Channel filtering itself lives outside this core; the hub
                // only acknowledges the request.
                let channel = message
                    .get("channel")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                self.send_control(
                    client_id,
                    &json!({
                        "type": "subscription_ack",
                        "channel": channel,
                    }),
                );
            }
            "ack" => {
                if let Some(message_id) = message.get("message_id").and_then(Value::as_str) {
                    let removed = self
                        .pending_acks
                        .lock()
                        .expect("pending-ack lock poisoned")
                        .remove(&(client_id.to_string(), message_id.to_string()));
                    if removed.is_some() {
                        log::debug!("Ack for {} from '{}'", message_id, client_id);
                    }
                }
            }
            other => {
                log::info!("Custom message '{}' from '{}'", other, client_id);
            }
        }
    }

    /// Sends a control envelope (pong, subscription ack, welcome) to one
    /// client. Failures are logged, never propagated.
    pub fn send_control(&self, client_id: &str, message: &Value) {
        if let Some(transport) = self.registry.transport(client_id) {
            if let Err(e) = transport.send(Frame::Text(message.to_string())) {
                log::warn!("Control send to '{}' failed: {}", client_id, e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Learning path
    // ------------------------------------------------------------------

    /// Hands every failed record from one broadcast to the learning path.
    /// Returns the number of newly stored patterns.
    fn learn_from_delivery_failures(
        &self,
        failures: &[DeliveryRecord],
        message: &Value,
    ) -> usize {
        if failures.is_empty() {
            return 0;
        }
        log::info!("Learning from {} delivery failures", failures.len());
        let message_size = message.to_string().len();

        let mut learned = 0usize;
        for record in failures {
            let quality = self.registry.quality(&record.client_id).unwrap_or(0.0);
            let client_type = self
                .registry
                .snapshot(&record.client_id)
                .map(|s| s.client_type);
            let inserted = self.learn_failure(FailureContext {
                kind: "message_delivery".into(),
                error: record.error.clone().unwrap_or_default(),
                client_id: record.client_id.clone(),
                message_id: Some(record.message_id.clone()),
                message_size,
                retry_count: record.retry_count,
                client_quality: quality,
                client_type,
            });
            if inserted {
                learned += 1;
            }
        }
        learned
    }

    /// Classifies one failure context, dispatches its remediation, and
    /// stores the resulting pattern (first-write-wins). Returns true when a
    /// new pattern was stored.
    fn learn_failure(&self, ctx: FailureContext) -> bool {
        let classification = match self.analyzer.classify(&ctx) {
            Ok(classification) => classification,
            Err(e) => {
                // The delivery outcome is already recorded; classification is
                // strictly additive and must never take delivery down.
                log::error!("Failure classification failed: {}", e);
                return false;
            }
        };

        let outcome = self.apply_remediation(&classification.root_cause, &ctx.client_id);
        self.metrics.learning_applied();

        let pattern = FailurePattern {
            pattern_id: classification.error_id.clone(),
            pattern_type: classification.root_cause.as_str().to_string(),
            description: classification.description.clone(),
            symptoms: vec![ctx.error.clone()],
            root_cause: json!({
                "type": classification.root_cause.as_str(),
                "description": classification.description,
            }),
            success_rate: if outcome.successful { 1.0 } else { 0.0 },
            fix_strategy: outcome,
            prevention: classification.prevention_rule,
            learned_at: self.clock.now(),
        };

        let inserted = self.patterns.insert_if_absent(pattern);
        if inserted {
            self.metrics.pattern_learned();
        }
        inserted
    }

    /// # Remediation Dispatch
    ///
    /// Maps a classified root cause to exactly one action. Closed match over
    /// the known categories plus the default retry arm; adding a category is
    /// a compile-time-visible change.
    fn apply_remediation(&self, cause: &RootCause, client_id: &str) -> RemediationOutcome {
        let mut actions = Vec::new();
        match cause {
            RootCause::ConnectionLost => {
                self.registry.mark_recovery(client_id);
                self.registry.scale_quality(client_id, 0.8);
                actions.push("initiated connection recovery".to_string());
            }
            RootCause::MessageTooLarge => {
                self.registry.enable_chunked_delivery(client_id);
                actions.push("enabled chunked delivery".to_string());
            }
            RootCause::ClientOverloaded => {
                self.registry.enable_rate_limiting(client_id);
                actions.push("enabled rate limiting".to_string());
            }
            RootCause::NetworkCongestion => {
                let mut config = self.config.lock().expect("hub config lock poisoned");
                config.compression_threshold = COMPRESSION_THRESHOLD_FLOOR
                    .max(config.compression_threshold * 9 / 10);
                actions.push(format!(
                    "lowered compression threshold to {} bytes",
                    config.compression_threshold
                ));
            }
            RootCause::Other(_) => {
                self.retry_buffer
                    .lock()
                    .expect("retry buffer lock poisoned")
                    .entry(client_id.to_string())
                    .or_default()
                    .push(json!({"client_id": client_id}));
                actions.push("queued for retry with backoff".to_string());
            }
        }
        RemediationOutcome {
            successful: true,
            actions,
        }
    }

    // ------------------------------------------------------------------
    // Maintenance hooks
    // ------------------------------------------------------------------

    /// Sweeps acknowledgments past their 30-second deadline. Each expired
    /// entry counts as a failed delivery exactly once and feeds the learning
    /// path with the `acknowledgment timeout` error. Returns the sweep count.
    pub fn sweep_acknowledgments(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<((String, String), PendingAck)> = {
            let mut pending = self.pending_acks.lock().expect("pending-ack lock poisoned");
            let keys: Vec<(String, String)> = pending
                .iter()
                .filter(|(_, ack)| now > ack.timeout_at)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| pending.remove(&key).map(|ack| (key, ack)))
                .collect()
        };

        for ((client_id, message_id), ack) in &expired {
            log::warn!(
                "Acknowledgment timeout for {} to '{}' (sent {})",
                message_id,
                client_id,
                ack.sent_at.to_rfc3339()
            );
            self.metrics.record_ack_timeout(DeliveryRecord {
                message_id: message_id.clone(),
                client_id: client_id.clone(),
                timestamp: now,
                success: false,
                error: Some("acknowledgment timeout".to_string()),
                retry_count: 0,
                delivery_ms: None,
            });
            let quality = self.registry.quality(client_id).unwrap_or(0.0);
            let client_type = self.registry.snapshot(client_id).map(|s| s.client_type);
            self.learn_failure(FailureContext {
                kind: "message_delivery".into(),
                error: "acknowledgment timeout".into(),
                client_id: client_id.clone(),
                message_id: Some(message_id.clone()),
                message_size: 0,
                retry_count: 0,
                client_quality: quality,
                client_type,
            });
        }
        expired.len()
    }

    /// Read-only status snapshot for the surrounding platform.
    pub fn status(&self) -> HubStatus {
        HubStatus {
            server_running: self.is_running(),
            active_connections: self.registry.len(),
            performance_metrics: self.metrics.snapshot(),
            failure_patterns: self.patterns.len(),
            circuit_breakers: self.breakers.states(),
            pending_acknowledgments: self.pending_ack_count(),
        }
    }

    /// Begins shutdown: flips the running flag, fires the token (stopping
    /// maintenance loops and new dispatch), and evicts every connection so
    /// their transports close promptly.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::Relaxed) {
            log::warn!("Delivery hub shutting down");
            self.shutdown.cancel();
            for client_id in self.registry.client_ids() {
                self.disconnect(&client_id, false);
            }
        }
    }
}

/// Clones `message` into a JSON object map, wrapping non-object payloads so
/// envelope metadata always has a home.
fn as_object(message: &Value) -> Map<String, Value> {
    match message {
        Value::Object(map) => map.clone(),
        other => {
            let mut map = Map::new();
            map.insert("payload".into(), other.clone());
            map
        }
    }
}

/// Gzip-compresses one serialized envelope.
fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}
