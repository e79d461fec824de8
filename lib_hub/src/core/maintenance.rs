//! # Maintenance Scheduler
//!
//! Three independent periodic loops keep the hub's bookkeeping bounded and
//! self-healing:
//!
//! - **Connection monitor** (30 s): evicts stale connections and prunes
//!   breakers whose client has left the registry.
//! - **Performance monitor** (60 s): recomputes the average delivery latency
//!   and flags investigation events on latency or failure spikes.
//! - **Learning processor** (300 s): sweeps expired acknowledgments,
//!   consolidates the failure patterns, and purges expired ones.
//!
//! Each loop runs its pass inside a spawned task and joins it, so a panic in
//! one pass is logged and the loop simply runs again on its next tick instead
//! of taking the process down. All three loops stop promptly when the hub's
//! shutdown token fires.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use crate::core::delivery::DeliveryHub;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Idle threshold after which a connection counts as stale.
const STALE_AFTER_SECONDS: i64 = 60;
/// Average latency (ms) above which the performance monitor investigates.
const LATENCY_ALARM_MS: f64 = 1000.0;
/// Failed deliveries per performance tick above which the monitor
/// investigates.
const FAILURE_ALARM_COUNT: u64 = 10;

/// Tick cadences for the three loops. Production uses the defaults; tests
/// inject millisecond intervals.
#[derive(Debug, Clone)]
pub struct MaintenanceIntervals {
    /// Connection monitor cadence.
    pub connection: Duration,
    /// Performance monitor cadence.
    pub performance: Duration,
    /// Learning processor cadence.
    pub learning: Duration,
}

impl Default for MaintenanceIntervals {
    fn default() -> Self {
        Self {
            connection: Duration::from_secs(30),
            performance: Duration::from_secs(60),
            learning: Duration::from_secs(300),
        }
    }
}

/// Spawns and owns the three maintenance loops for one hub.
pub struct MaintenanceScheduler {
    hub: Arc<DeliveryHub>,
    intervals: MaintenanceIntervals,
}

impl MaintenanceScheduler {
    /// Creates a scheduler for `hub` with the given cadences.
    pub fn new(hub: Arc<DeliveryHub>, intervals: MaintenanceIntervals) -> Self {
        Self { hub, intervals }
    }

    /// Spawns the three loops and returns their handles. Each loop exits when
    /// the hub's shutdown token fires.
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        let token = self.hub.shutdown_token();

        let connection = {
            let hub = Arc::clone(&self.hub);
            let token = token.clone();
            let interval = self.intervals.connection;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = sleep(interval) => {}
                    }
                    let pass = tokio::spawn({
                        let hub = Arc::clone(&hub);
                        async move { connection_pass(&hub) }
                    });
                    if let Err(e) = pass.await {
                        log::error!("Connection monitor pass failed: {}; will retry", e);
                    }
                }
                log::info!("Connection monitor stopped");
            })
        };

        let performance = {
            let hub = Arc::clone(&self.hub);
            let token = token.clone();
            let interval = self.intervals.performance;
            tokio::spawn(async move {
                let mut failed_baseline = hub.metrics().failed_messages();
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = sleep(interval) => {}
                    }
                    let pass = tokio::spawn({
                        let hub = Arc::clone(&hub);
                        async move { performance_pass(&hub, failed_baseline) }
                    });
                    match pass.await {
                        Ok(new_baseline) => failed_baseline = new_baseline,
                        Err(e) => {
                            log::error!("Performance monitor pass failed: {}; will retry", e)
                        }
                    }
                }
                log::info!("Performance monitor stopped");
            })
        };

        let learning = {
            let hub = Arc::clone(&self.hub);
            let interval = self.intervals.learning;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = sleep(interval) => {}
                    }
                    let pass = tokio::spawn({
                        let hub = Arc::clone(&hub);
                        async move { learning_pass(&hub) }
                    });
                    if let Err(e) = pass.await {
                        log::error!("Learning processor pass failed: {}; will retry", e);
                    }
                }
                log::info!("Learning processor stopped");
            })
        };

        vec![connection, performance, learning]
    }
}

/// # Connection Monitor Pass
///
/// Evicts connections idle past the stale threshold (this is the only path
/// that proactively removes idle dead connections), applies the stale
/// recovery quality decay first, prunes breakers for absent clients, and
/// refreshes the active-connection gauge.
pub fn connection_pass(hub: &DeliveryHub) {
    let stale = hub
        .registry()
        .stale_clients(chrono::Duration::seconds(STALE_AFTER_SECONDS));
    for client_id in &stale {
        log::warn!("Stale connection '{}', evicting", client_id);
        hub.registry().scale_quality(client_id, 0.8);
        hub.disconnect(client_id, true);
    }

    let live: HashSet<String> = hub.registry().client_ids().into_iter().collect();
    let pruned = hub.breakers().prune_absent(&live);
    if pruned > 0 {
        log::debug!("Pruned {} breakers for departed clients", pruned);
    }

    hub.metrics().set_active_connections(live.len() as u64);
}

/// # Performance Monitor Pass
///
/// Recomputes the average delivery latency from the record ring buffer and
/// flags an investigation event when latency or the per-tick failure delta
/// crosses its alarm threshold. Returns the new failed-message baseline.
pub fn performance_pass(hub: &DeliveryHub, failed_baseline: u64) -> u64 {
    let average = hub.metrics().recompute_average_latency();
    if average > LATENCY_ALARM_MS {
        log::warn!("High delivery latency ({:.1} ms), investigating", average);
        hub.metrics().investigation_flagged();
    }

    let failed_now = hub.metrics().failed_messages();
    if failed_now.saturating_sub(failed_baseline) > FAILURE_ALARM_COUNT {
        log::warn!(
            "{} failed deliveries since last check, investigating",
            failed_now - failed_baseline
        );
        hub.metrics().investigation_flagged();
    }
    failed_now
}

/// # Learning Processor Pass
///
/// Sweeps acknowledgments past their deadline (feeding each into the
/// learning path as a failed delivery), consolidates the stored patterns,
/// and purges patterns past their 7-day retention.
pub fn learning_pass(hub: &DeliveryHub) {
    let swept = hub.sweep_acknowledgments();
    if swept > 0 {
        log::info!("Swept {} expired acknowledgments", swept);
    }

    let counts = hub.patterns().consolidate();
    if !counts.is_empty() {
        log::info!("Failure patterns by category: {:?}", counts);
    }

    hub.patterns().purge_expired();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::HeuristicAnalyzer;
    use crate::clock::ManualClock;
    use crate::core::delivery::HubConfig;
    use crate::core::metrics::DeliveryRecord;
    use crate::transport::channel;
    use chrono::Utc;
    use serde_json::json;

    fn hub_with_clock() -> (Arc<DeliveryHub>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let hub = DeliveryHub::new(
            HubConfig::default(),
            Arc::new(HeuristicAnalyzer),
            clock.clone(),
        );
        (hub, clock)
    }

    #[test]
    fn connection_pass_evicts_stale_and_prunes_breakers() {
        let (hub, clock) = hub_with_clock();
        let (t1, _rx1) = channel();
        let (t2, _rx2) = channel();
        let stale = hub.register_client(Arc::new(t1), "websocket", "10.0.0.1:1");
        let fresh = hub.register_client(Arc::new(t2), "websocket", "10.0.0.2:1");
        hub.breakers().record_result(&stale, false);

        clock.advance(chrono::Duration::seconds(61));
        hub.registry().touch(&fresh);
        connection_pass(&hub);

        assert!(!hub.registry().contains(&stale));
        assert!(hub.registry().contains(&fresh));
        assert_eq!(hub.breakers().state_of(&stale), None);
        assert_eq!(hub.metrics().snapshot().active_connections, 1);
        assert_eq!(hub.metrics().snapshot().failed_connections, 1);
    }

    #[test]
    fn performance_pass_flags_failure_spikes() {
        let (hub, _clock) = hub_with_clock();
        let baseline = hub.metrics().failed_messages();

        // Twelve failed deliveries spread over three unregistered clients,
        // staying under each one's breaker threshold.
        let targets = vec!["g1".to_string(), "g2".to_string(), "g3".to_string()];
        for _ in 0..4 {
            hub.broadcast(&json!({"type": "evt"}), Some(&targets));
        }

        let new_baseline = performance_pass(&hub, baseline);
        assert_eq!(new_baseline, baseline + 12);
        assert_eq!(hub.metrics().snapshot().investigations, 1);

        // Next tick starts from the new baseline: no fresh alarm.
        performance_pass(&hub, new_baseline);
        assert_eq!(hub.metrics().snapshot().investigations, 1);
    }

    #[test]
    fn performance_pass_flags_high_latency() {
        let (hub, _clock) = hub_with_clock();

        // Seed the ring buffer with slow deliveries, average well over the
        // 1000 ms alarm line.
        for i in 0..5 {
            hub.metrics().record_delivery(DeliveryRecord {
                message_id: format!("m{i}"),
                client_id: "c1".into(),
                timestamp: Utc::now(),
                success: true,
                error: None,
                retry_count: 0,
                delivery_ms: Some(1500.0),
            });
        }

        let baseline = hub.metrics().failed_messages();
        performance_pass(&hub, baseline);
        assert_eq!(hub.metrics().snapshot().investigations, 1);
        assert!(hub.metrics().snapshot().average_latency_ms > LATENCY_ALARM_MS);
    }

    #[test]
    fn learning_pass_sweeps_acks_and_purges_patterns() {
        let (hub, clock) = hub_with_clock();
        let (transport, _rx) = channel();
        let id = hub.register_client(Arc::new(transport), "websocket", "10.0.0.1:1");

        hub.broadcast(&json!({"type": "evt"}), Some(&[id.clone()]));
        assert_eq!(hub.pending_ack_count(), 1);

        // Past the ack deadline: swept, counted failed, learned as a pattern.
        clock.advance(chrono::Duration::seconds(31));
        learning_pass(&hub);
        assert_eq!(hub.pending_ack_count(), 0);
        assert_eq!(hub.metrics().snapshot().failed_messages, 1);
        assert_eq!(hub.patterns().len(), 1);

        // Eight days on, the learned pattern expires.
        clock.advance(chrono::Duration::days(8));
        learning_pass(&hub);
        assert!(hub.patterns().is_empty());
    }

    #[tokio::test]
    async fn loops_stop_promptly_on_shutdown() {
        let (hub, _clock) = hub_with_clock();
        let intervals = MaintenanceIntervals {
            connection: Duration::from_millis(5),
            performance: Duration::from_millis(5),
            learning: Duration::from_millis(5),
        };
        let handles = MaintenanceScheduler::new(Arc::clone(&hub), intervals).spawn();

        tokio::time::sleep(Duration::from_millis(20)).await;
        hub.shutdown();

        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .expect("loop did not stop after shutdown")
                .expect("loop task panicked");
        }
    }
}
