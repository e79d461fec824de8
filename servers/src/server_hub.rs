//! # RsHub Gateway
//!
//! The primary production server for the `rshub` project. This binary launches the
//! WebSocket endpoint that fronts the delivery reliability engine in `lib_hub`.
//!
//! ## Core Responsibilities:
//! - **WebSocket Termination:** Uses Axum to upgrade client connections and bridge
//!   each socket to a registered hub transport.
//! - **Client Session Management:** Registers every connection with the
//!   `DeliveryHub`, forwards inbound control messages (acks, pings, subscriptions),
//!   and deregisters on disconnect.
//! - **Operational Surface:** `/health` for liveness probes, `/status` for the
//!   hub's learning and connection snapshot, and `POST /broadcast` for injecting
//!   messages into the acknowledged fan-out path.
//! - **System Health & Lifecycle:** Spawns the three maintenance loops and shuts
//!   the hub down gracefully on `CTRL+C` or `SIGTERM`.
//! - **Configuration:** Bind address and port come from CLI flags or environment
//!   variables, with `.env` files loaded at startup.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, prelude::*, EnvFilter};

// Web Layer (Axum)
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, Stream, StreamExt};

// CORS Middleware
use tower_http::cors::{Any, CorsLayer};

// Internal Library Imports
use lib_hub::{
    channel, DeliveryHub, DeliverySummary, Frame, HeuristicAnalyzer, HubConfig, HubStatus,
    MaintenanceIntervals, MaintenanceScheduler, SystemClock,
};

/// # Command Line Arguments
///
/// Runtime parameters for the gateway. Every flag can also be supplied through
/// the environment, so deployments driven by `.env` files need no CLI at all.
#[derive(Debug, Parser)]
#[command(name = "server_hub", about = "RsHub WebSocket gateway")]
struct Args {
    /// Address the HTTP/WebSocket listener binds to.
    #[arg(long, env = "HUB_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port the HTTP/WebSocket listener binds to.
    #[arg(long, env = "HUB_PORT", default_value_t = 8080)]
    port: u16,

    /// Disable payload compression regardless of message size.
    #[arg(long, env = "HUB_NO_COMPRESSION", default_value_t = false)]
    no_compression: bool,
}

/// # Application State
///
/// Holds all shared state required by the web server's routes. Wrapped in an
/// `Arc` so every handler and background task shares the same hub instance.
struct AppState {
    /// The delivery reliability engine: connection registry, breakers,
    /// acknowledged fan-out, and the failure-learning path.
    hub: Arc<DeliveryHub>,
}

/// # Setup Logging
///
/// Configures the `tracing` subscriber for the gateway.
///
/// The verbosity is read from `RUST_LOG` (defaults to "info"). Console output
/// is human-readable with target information; `log::` records emitted by
/// `lib_hub` are bridged into the same subscriber.
fn setup_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .expect("default env filter is valid");

    let console_layer = fmt::layer().with_target(true).with_ansi(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .init();
}

/// # Main Entry Point
///
/// Initializes and runs the WebSocket gateway.
///
/// ## Execution Flow:
/// 1.  **Load Environment**: Reads `.env` files so flags can come from them.
/// 2.  **Setup Logging**: Installs the `tracing` subscriber.
/// 3.  **Instantiate the Hub**: Builds the `DeliveryHub` with the wall clock and
///     the heuristic failure analyzer.
/// 4.  **Spawn Maintenance**: Starts the connection, performance, and learning
///     loops at their production cadences.
/// 5.  **Build and Run Web Server**: Routes for `/health`, `/ws`, `/status`, and
///     `/broadcast`, with permissive CORS, served over plain TCP.
/// 6.  **Graceful Shutdown**: On `CTRL+C` or `SIGTERM` the hub stops accepting
///     deliveries, disconnects every client, and the maintenance loops exit.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    setup_logging();

    let config = HubConfig {
        compression_enabled: !args.no_compression,
        ..HubConfig::default()
    };
    let hub = DeliveryHub::new(config, Arc::new(HeuristicAnalyzer), Arc::new(SystemClock));

    // The three self-healing loops run for the lifetime of the process and
    // stop when the hub's shutdown token fires.
    let maintenance =
        MaintenanceScheduler::new(Arc::clone(&hub), MaintenanceIntervals::default()).spawn();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let shared_state = Arc::new(AppState {
        hub: Arc::clone(&hub),
    });

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .route("/status", get(status_handler))
        .route("/broadcast", post(broadcast_handler))
        .layer(cors)
        .with_state(shared_state);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("RsHub gateway live at http://{}", addr);

    // Shut the hub down the moment the signal arrives, not after serve
    // returns: this closes every registered transport and fires the token the
    // read loops select on, so live connections terminate promptly instead of
    // waiting for their peers to hang up.
    let signal_hub = Arc::clone(&hub);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        warn!("Shutdown signal received. Closing the hub gracefully...");
        signal_hub.shutdown();
    })
    .await?;

    for handle in maintenance {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }
    info!("Bye!");

    Ok(())
}

/// # Health Check Endpoint
///
/// A simple HTTP GET endpoint that returns "OK". Used by monitoring services
/// to verify that the server process is running and responsive.
async fn health_handler() -> &'static str {
    "OK"
}

/// # Status Endpoint
///
/// Returns the hub's diagnostic snapshot: per-connection state, circuit
/// breaker states, learned-pattern count, and the cumulative metrics.
async fn status_handler(State(state): State<Arc<AppState>>) -> Json<HubStatus> {
    Json(state.hub.status())
}

/// Body accepted by `POST /broadcast`.
#[derive(Debug, Deserialize)]
struct BroadcastRequest {
    /// The message payload to deliver.
    message: Value,
    /// Optional explicit target client ids; all clients when omitted.
    targets: Option<Vec<String>>,
}

/// # Broadcast Endpoint
///
/// Injects a message into the acknowledged fan-out path and returns the
/// per-broadcast delivery summary.
async fn broadcast_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BroadcastRequest>,
) -> Json<DeliverySummary> {
    let summary = state
        .hub
        .broadcast(&request.message, request.targets.as_deref());
    Json(summary)
}

/// # WebSocket Upgrade Handler
///
/// Handles incoming HTTP requests to `/ws` and upgrades them to a WebSocket
/// connection, passing the socket and the client's remote address to
/// `handle_socket`.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

/// # WebSocket Connection Logic
///
/// Manages a single, active WebSocket client session.
///
/// ## Workflow:
/// 1.  **Client Registration**: A channel-backed transport is registered with
///     the hub, which assigns the connection its unique id.
/// 2.  **Welcome Envelope**: The client is told its id and the gateway's
///     capabilities so it can negotiate acks and compression.
/// 3.  **Writer Task**: A dedicated task drains the transport's frame channel
///     into the socket, so broadcasts never block on a slow client.
/// 4.  **Read Loop**: Inbound text frames are handed to the hub's control
///     message handler (acks, pings, subscriptions).
/// 5.  **Deregistration**: On disconnect the hub evicts the connection, drops
///     its pending acknowledgments, and closes the frame channel, which ends
///     the writer task.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, addr: SocketAddr) {
    let (mut socket_tx, mut socket_rx) = socket.split();

    let (transport, mut frames) = channel();
    let client_id = state
        .hub
        .register_client(Arc::new(transport), "websocket", &addr.to_string());
    info!("Client '{}' connected from {}", client_id, addr);

    state.hub.send_control(
        &client_id,
        &json!({
            "type": "connection_established",
            "client_id": client_id,
            "timestamp": Utc::now().to_rfc3339(),
            "capabilities": ["acknowledgments", "compression", "subscriptions"],
        }),
    );

    // Writer task: the only place this socket is written to. It exits when
    // the hub closes the transport or the peer goes away.
    let writer = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let message = match frame {
                Frame::Text(text) => Message::Text(text.into()),
                Frame::Binary(bytes) => Message::Binary(bytes.into()),
                Frame::Close => break,
            };
            if socket_tx.send(message).await.is_err() {
                break;
            }
        }
        let _ = socket_tx.close().await;
    });

    read_loop(&state.hub, &client_id, &mut socket_rx).await;

    info!("Client '{}' disconnected", client_id);
    state.hub.disconnect(&client_id, false);
    let _ = tokio::time::timeout(Duration::from_secs(5), writer).await;
}

/// # Inbound Read Loop
///
/// Drains inbound frames into the hub's control message handler until the
/// peer hangs up or the hub's shutdown token fires. Selecting on the token
/// means a silent peer cannot keep its session task alive through shutdown.
async fn read_loop<S>(hub: &Arc<DeliveryHub>, client_id: &str, stream: &mut S)
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let token = hub.shutdown_token();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => hub.on_message(client_id, text.as_str()),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // Pongs and binary frames from clients carry no control
                // meaning.
                Some(Ok(_)) => {}
            }
        }
    }
}

/// # Graceful Shutdown Signal Handler
///
/// Listens for `CTRL+C` (interrupt) and `SIGTERM` (terminate) signals. On
/// non-UNIX systems only `CTRL+C` is handled. The first signal to arrive
/// resolves the future and starts the graceful shutdown path.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use lib_hub::Frame;

    fn test_hub() -> Arc<DeliveryHub> {
        DeliveryHub::new(
            HubConfig::default(),
            Arc::new(HeuristicAnalyzer),
            Arc::new(SystemClock),
        )
    }

    #[tokio::test]
    async fn shutdown_terminates_the_read_loop_of_a_silent_peer() {
        let hub = test_hub();
        let (transport, mut frames) = channel();
        let client_id = hub.register_client(Arc::new(transport), "websocket", "10.9.0.1:9000");

        // A peer that never sends anything and never hangs up: without the
        // shutdown token this session would run forever.
        let session = tokio::spawn({
            let hub = Arc::clone(&hub);
            async move {
                let mut silent = stream::pending::<Result<Message, axum::Error>>();
                read_loop(&hub, &client_id, &mut silent).await;
            }
        });

        hub.shutdown();
        tokio::time::timeout(Duration::from_secs(1), session)
            .await
            .expect("read loop did not stop after shutdown")
            .expect("session task panicked");

        // Shutdown also closed the transport, which ends the writer task.
        assert_eq!(frames.recv().await, Some(Frame::Close));
    }

    #[tokio::test]
    async fn peer_close_frame_ends_the_read_loop() {
        let hub = test_hub();
        let (transport, _frames) = channel();
        let client_id = hub.register_client(Arc::new(transport), "websocket", "10.9.0.2:9000");

        let mut closing = stream::iter(vec![Ok(Message::Close(None))]);
        tokio::time::timeout(
            Duration::from_secs(1),
            read_loop(&hub, &client_id, &mut closing),
        )
        .await
        .expect("read loop did not stop on a close frame");
        assert!(hub.is_running());
    }
}
