//! Real-time duplex voice session engine.
//!
//! Streams microphone audio to a conversational model over a WebSocket and
//! schedules the model's spoken replies for playback, with barge-in support:
//! when the remote detects the user speaking over a reply it flushes pending
//! playback immediately. The [`controller::SessionController`] actor owns the
//! session lifecycle; [`capture`], [`playback`], and [`transport`] define the
//! hardware and network seams it drives.

#![forbid(unsafe_code)]

pub mod capture;
pub mod config;
pub mod context;
pub mod controller;
pub mod events;
pub mod live_api;
pub mod pcm;
pub mod playback;
pub mod transport;
