//! Transport session seam.
//!
//! The controller talks to the remote model through the `Connector` trait:
//! `connect` resolves to a `TransportHandle` whose sends are fire-and-forget,
//! while inbound traffic is delivered as epoch-tagged `EngineEvent`s. The
//! real implementation lives in `live_api`; tests substitute their own.

use crate::events::EngineEvent;
use crate::pcm::AudioChunk;
use futures_util::future::BoxFuture;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Failure establishing the duplex channel. Terminal for the session
/// attempt; safe to retry immediately with a fresh `start()`.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("timed out waiting for setup acknowledgment")]
    SetupTimeout,
    #[error("connection closed before setup completed")]
    ClosedDuringSetup,
}

/// Session configuration sent once at connect time.
#[derive(Debug, Clone)]
pub struct SessionSetup {
    pub model: String,
    pub system_instruction: String,
    pub capture_rate: u32,
    pub playback_rate: u32,
}

/// Frames accepted by the transport writer. Configuration is sent once by
/// the connector during `connect`; audio repeats for the life of the session.
#[derive(Debug)]
pub enum OutboundFrame {
    Audio(AudioChunk),
    Close(oneshot::Sender<()>),
}

/// Write half of an open duplex session.
pub struct TransportHandle {
    outbound: mpsc::UnboundedSender<OutboundFrame>,
}

impl TransportHandle {
    pub fn new(outbound: mpsc::UnboundedSender<OutboundFrame>) -> Self {
        Self { outbound }
    }

    /// Fire-and-forget, non-blocking. A chunk sent after the writer has gone
    /// away is dropped silently: outbound frames racing teardown are
    /// expected and must not surface as failures.
    pub fn send_audio(&self, chunk: AudioChunk) {
        let _ = self.outbound.send(OutboundFrame::Audio(chunk));
    }

    /// Graceful close, bounded by a short timeout. Consuming the handle
    /// makes a second close impossible; if the writer is already gone this
    /// resolves immediately.
    pub async fn close(self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.outbound.send(OutboundFrame::Close(ack_tx)).is_ok() {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, ack_rx).await;
        }
    }
}

/// Seam between the controller and the remote endpoint. Exactly one connect
/// is outstanding per controller; the controller's state machine enforces
/// that a second request while one is pending or open is a no-op.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        setup: SessionSetup,
        epoch: u64,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> BoxFuture<'static, Result<TransportHandle, ConnectError>>;
}
