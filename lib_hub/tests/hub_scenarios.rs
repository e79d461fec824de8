//! End-to-end scenarios for the delivery engine: a channel-backed client
//! that receives envelopes, acknowledges them, degrades, and recovers, plus
//! the maintenance loops running against a manual clock.

use chrono::{Duration as ChronoDuration, Utc};
use lib_hub::{
    channel, BreakerState, DeliveryHub, Frame, HeuristicAnalyzer, HubConfig, MaintenanceIntervals,
    MaintenanceScheduler, ManualClock,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn hub_with_clock() -> (Arc<DeliveryHub>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let hub = DeliveryHub::new(
        HubConfig::default(),
        Arc::new(HeuristicAnalyzer),
        clock.clone(),
    );
    (hub, clock)
}

#[tokio::test]
async fn delivered_envelope_round_trips_through_an_ack() {
    let (hub, clock) = hub_with_clock();
    let (transport, mut rx) = channel();
    let client_id = hub.register_client(Arc::new(transport), "websocket", "10.1.0.1:4000");

    let summary = hub.broadcast(&json!({"type": "evt", "x": 1}), None);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(hub.pending_ack_count(), 1);

    // The client's writer task would read this frame off the channel.
    let Some(Frame::Text(text)) = rx.recv().await else {
        panic!("expected a text envelope");
    };
    let envelope: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(envelope["_message_id"], json!(summary.message_id));
    assert_eq!(envelope["_expects_ack"], json!(true));
    assert_eq!(envelope["x"], json!(1));

    // Client acknowledges; a later sweep finds nothing to expire.
    hub.on_message(
        &client_id,
        &json!({"type": "ack", "message_id": summary.message_id}).to_string(),
    );
    assert_eq!(hub.pending_ack_count(), 0);
    clock.advance(ChronoDuration::minutes(5));
    assert_eq!(hub.sweep_acknowledgments(), 0);
    assert_eq!(hub.metrics().snapshot().failed_messages, 0);
}

#[tokio::test]
async fn failing_client_trips_its_breaker_without_touching_the_healthy_one() {
    let (hub, _clock) = hub_with_clock();
    let (healthy_transport, mut healthy_rx) = channel();
    let healthy = hub.register_client(Arc::new(healthy_transport), "websocket", "10.1.0.1:1");

    // The failing client's writer task is gone: its receiver is dropped.
    let (dead_transport, dead_rx) = channel();
    drop(dead_rx);
    let dead = hub.register_client(Arc::new(dead_transport), "websocket", "10.1.0.2:1");

    let message = json!({"type": "evt"});
    for _ in 0..5 {
        let summary = hub.broadcast(&message, None);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
    }
    assert_eq!(hub.breakers().state_of(&dead), Some(BreakerState::Open));
    assert_eq!(hub.breakers().state_of(&healthy), None);

    // Sixth broadcast: the dead client is skipped, the healthy one still
    // receives its sixth envelope.
    let summary = hub.broadcast(&message, None);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.succeeded, 1);
    let mut delivered = 0;
    while let Ok(frame) = healthy_rx.try_recv() {
        if matches!(frame, Frame::Text(_) | Frame::Binary(_)) {
            delivered += 1;
        }
    }
    assert_eq!(delivered, 6);

    // The lost connection was classified and stored as a pattern.
    assert!(hub.patterns().len() >= 1);
    let status = hub.status();
    assert!(status.server_running);
    assert_eq!(status.circuit_breakers.get(&dead), Some(&BreakerState::Open));
}

#[tokio::test]
async fn maintenance_loops_evict_idle_clients_while_running() {
    let (hub, clock) = hub_with_clock();
    let (transport, _rx) = channel();
    let idle = hub.register_client(Arc::new(transport), "websocket", "10.1.0.3:1");

    let intervals = MaintenanceIntervals {
        connection: Duration::from_millis(10),
        performance: Duration::from_millis(10),
        learning: Duration::from_millis(10),
    };
    let handles = MaintenanceScheduler::new(Arc::clone(&hub), intervals).spawn();

    // Make the client stale by clock, then give the monitor a few ticks.
    clock.advance(ChronoDuration::seconds(120));
    for _ in 0..50 {
        if !hub.registry().contains(&idle) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!hub.registry().contains(&idle));
    assert_eq!(hub.metrics().snapshot().active_connections, 0);
    assert_eq!(hub.metrics().snapshot().failed_connections, 1);

    hub.shutdown();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("maintenance loop did not stop")
            .expect("maintenance loop panicked");
    }
    assert!(!hub.status().server_running);
}
