//! Engine configuration.

use std::time::Duration;

/// Configuration for one session engine instance.
///
/// Sample rates are configuration constants, not protocol negotiation: the
/// microphone is streamed at `capture_rate` and replies are rendered at
/// `playback_rate` (or the output device's native rate if it cannot open at
/// that figure — the decode path resamples either way).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// WebSocket endpoint of the remote conversational model.
    pub url: String,
    /// Model identifier sent in the setup message.
    pub model: String,
    /// Outbound microphone rate.
    pub capture_rate: u32,
    /// Frames per capture block; 4096 at 16 kHz is a 256 ms callback period,
    /// under the 300 ms latency ceiling without excessive call overhead.
    pub capture_block: usize,
    /// Preferred output device rate for inbound replies.
    pub playback_rate: u32,
    /// Coalescing window absorbing duplicate start() intents fired in rapid
    /// succession (e.g. a UI re-render triggering the same intent twice).
    pub start_debounce: Duration,
    /// Ceiling on connect + setup handshake.
    pub connect_timeout: Duration,
    /// Specific input device, or the system default.
    pub device_name: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            model: "models/gemini-2.0-flash-live-001".to_string(),
            capture_rate: 16_000,
            capture_block: 4096,
            playback_rate: 24_000,
            start_debounce: Duration::from_millis(150),
            connect_timeout: Duration::from_secs(10),
            device_name: None,
        }
    }
}

impl EngineConfig {
    /// Build a config pointing at the hosted live endpoint.
    pub fn from_api_key(api_key: &str) -> Self {
        Self {
            url: format!(
                "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent?key={}",
                api_key
            ),
            ..Default::default()
        }
    }
}
