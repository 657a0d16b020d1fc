//! Typed events crossing task boundaries.
//!
//! Every producer (capture callback, transport reader) emits events into the
//! session controller, which dispatches them synchronously to the owning
//! component. Events carry the epoch of the session attempt that produced
//! them; events tagged with a stale epoch are dropped without effect.

use crate::pcm::AudioChunk;
use serde::{Deserialize, Serialize};

/// The exhaustive set of inbound message kinds delivered by the transport.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A synthesized reply chunk to schedule for playback.
    Audio(AudioChunk),
    /// Remote barge-in: the model wants its own prior output cancelled.
    Interrupted,
    /// The remote side closed the session gracefully.
    Closed,
    /// A mid-session transport failure.
    Error(String),
}

/// Events flowing into the session controller.
#[derive(Debug)]
pub enum EngineEvent {
    /// A fixed-size block of mono samples from the capture device.
    Captured { epoch: u64, samples: Vec<f32> },
    /// An inbound transport message.
    Inbound { epoch: u64, event: ServerEvent },
    /// The capture stream failed mid-session.
    CaptureLost { epoch: u64, reason: String },
}

/// Lifecycle state of the one controller per UI session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    /// Transport or device failure; terminal until an explicit retry.
    Error,
    /// Microphone access refused; terminal until an explicit retry.
    PermissionDenied,
}

/// Snapshot published on the controller's read-only status stream, shaped
/// for direct serialization by an embedding UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: SessionState,
    pub is_audible: bool,
}

impl SessionStatus {
    pub fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            is_audible: false,
        }
    }
}
