//! # Transport Boundary
//!
//! The hub never touches a socket directly. Every connection is represented
//! by a `ClientTransport` trait object whose `send` hands a frame to the
//! connection's dedicated writer task through an unbounded channel. This is
//! what keeps the broadcast fan-out non-blocking: a slow or dead client can
//! never stall the pipeline, it can only fail its own delivery attempt.
//!
//! ## Core Design:
//!
//! - **`Frame`**: the unit crossing the boundary. Text frames carry UTF-8
//!   JSON envelopes; binary frames carry gzip-compressed envelopes; `Close`
//!   tells the writer task to shut the socket down.
//! - **`ChannelTransport`**: the production implementation. The sending half
//!   lives in the Connection Registry, the receiving half is drained by the
//!   per-connection writer task in the gateway binary. A failed channel send
//!   means the writer task is gone, which the pipeline records as a lost
//!   connection.
//! - Tests substitute their own `ClientTransport` implementations to force
//!   deterministic send failures without any real I/O.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

/// A single outbound unit handed to a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 JSON envelope.
    Text(String),
    /// Gzip-compressed JSON envelope.
    Binary(Vec<u8>),
    /// Instructs the writer task to close the underlying socket and exit.
    Close,
}

/// Errors surfaced by a transport send. These are per-attempt failures; the
/// pipeline records and classifies them, it never propagates them as fatal.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer is gone: the writer task has exited and dropped its receiver.
    #[error("connection closed")]
    Closed,
    /// The transport rejected the frame for some other reason.
    #[error("send failed: {0}")]
    Send(String),
}

/// One live connection's outbound half, as seen by the delivery pipeline.
pub trait ClientTransport: Send + Sync {
    /// Hands a frame to the connection. Must not block.
    fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Requests the underlying socket be closed. Idempotent.
    fn close(&self);

    /// Whether the transport still has a live peer.
    fn is_open(&self) -> bool;
}

/// Production transport backed by an unbounded MPSC channel.
///
/// The gateway creates one per WebSocket upgrade via [`channel`] and spawns a
/// writer task that forwards frames from the receiving half into the socket.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Frame>,
    closed: AtomicBool,
}

/// Creates a connected `(ChannelTransport, frame receiver)` pair.
pub fn channel() -> (ChannelTransport, mpsc::UnboundedReceiver<Frame>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ChannelTransport {
            tx,
            closed: AtomicBool::new(false),
        },
        rx,
    )
}

impl ClientTransport for ChannelTransport {
    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        // First close wins; the Close frame is best-effort since a dropped
        // receiver already means the writer task is gone.
        if !self.closed.swap(true, Ordering::Relaxed) {
            let _ = self.tx.send(Frame::Close);
        }
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Relaxed) && !self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_fails_once_receiver_is_dropped() {
        let (transport, rx) = channel();
        assert!(transport.is_open());
        assert!(transport.send(Frame::Text("hello".into())).is_ok());

        drop(rx);
        assert!(!transport.is_open());
        assert!(matches!(
            transport.send(Frame::Text("hello".into())),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn close_emits_a_close_frame_and_is_idempotent() {
        let (transport, mut rx) = channel();
        transport.close();
        transport.close();

        assert!(!transport.is_open());
        assert_eq!(rx.try_recv().ok(), Some(Frame::Close));
        // Second close must not queue a second frame.
        assert!(rx.try_recv().is_err());
    }
}
