//! Live API connector.
//!
//! WebSocket client for the remote conversational model. The connect path
//! performs the setup handshake inline, then splits into a writer task
//! (draining the outbound channel, base64-encoding PCM into realtime-input
//! messages) and a reader task (translating server JSON into `ServerEvent`s
//! for the controller).

use crate::events::{EngineEvent, ServerEvent};
use crate::pcm::AudioChunk;
use crate::transport::{ConnectError, Connector, OutboundFrame, SessionSetup, TransportHandle};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

/// Connector backed by the hosted live endpoint.
pub struct LiveConnector {
    url: String,
}

impl LiveConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Connector for LiveConnector {
    fn connect(
        &self,
        setup: SessionSetup,
        epoch: u64,
        events: UnboundedSender<EngineEvent>,
    ) -> BoxFuture<'static, Result<TransportHandle, ConnectError>> {
        let url = self.url.clone();
        Box::pin(async move { open_session(url, setup, epoch, events).await })
    }
}

async fn open_session(
    url: String,
    setup: SessionSetup,
    epoch: u64,
    events: UnboundedSender<EngineEvent>,
) -> Result<TransportHandle, ConnectError> {
    info!("connecting to live endpoint");
    let (ws, response) = connect_async(&url).await?;
    debug!(status = ?response.status(), "websocket handshake complete");
    let (mut sink, mut stream) = ws.split();

    let setup_message = json!({
        "setup": {
            "model": setup.model,
            "generationConfig": { "responseModalities": ["AUDIO"] },
            "systemInstruction": { "parts": [{ "text": setup.system_instruction }] },
        }
    });
    sink.send(Message::Text(setup_message.to_string().into()))
        .await?;
    wait_for_setup_ack(&mut stream).await?;
    info!("live session setup complete");

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundFrame>();

    // Writer: the single point where outbound frames become wire JSON.
    tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            match frame {
                OutboundFrame::Audio(chunk) => {
                    let payload = json!({
                        "realtimeInput": {
                            "audio": {
                                "data": BASE64.encode(&chunk.bytes),
                                "mimeType": format!("audio/pcm;rate={}", chunk.sample_rate),
                            }
                        }
                    });
                    if let Err(e) = sink.send(Message::Text(payload.to_string().into())).await {
                        debug!("outbound audio dropped, transport gone: {e}");
                        break;
                    }
                }
                OutboundFrame::Close(ack) => {
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = ack.send(());
                    break;
                }
            }
        }
        debug!("transport writer task finished");
    });

    // Reader: server JSON in, typed events out.
    let default_rate = setup.playback_rate;
    tokio::spawn(async move {
        let mut terminated = false;
        while let Some(result) = stream.next().await {
            match result {
                Ok(Message::Text(text)) => dispatch_server_json(&text, default_rate, epoch, &events),
                Ok(Message::Binary(bytes)) => {
                    // The endpoint sometimes frames JSON responses as binary.
                    if let Ok(text) = String::from_utf8(bytes.to_vec()) {
                        dispatch_server_json(&text, default_rate, epoch, &events);
                    }
                }
                Ok(Message::Close(frame)) => {
                    info!(?frame, "remote closed the websocket");
                    let _ = events.send(EngineEvent::Inbound {
                        epoch,
                        event: ServerEvent::Closed,
                    });
                    terminated = true;
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    let _ = events.send(EngineEvent::Inbound {
                        epoch,
                        event: ServerEvent::Error(e.to_string()),
                    });
                    terminated = true;
                    break;
                }
            }
        }
        if !terminated {
            let _ = events.send(EngineEvent::Inbound {
                epoch,
                event: ServerEvent::Closed,
            });
        }
        debug!("transport reader task finished");
    });

    Ok(TransportHandle::new(outbound_tx))
}

async fn wait_for_setup_ack(stream: &mut WsStream) -> Result<(), ConnectError> {
    let wait = async {
        while let Some(result) = stream.next().await {
            let text = match result? {
                Message::Text(text) => text.to_string(),
                Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(_) => continue,
                },
                Message::Close(_) => return Err(ConnectError::ClosedDuringSetup),
                _ => continue,
            };
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
                if value.get("setupComplete").is_some() {
                    return Ok(());
                }
            }
        }
        Err(ConnectError::ClosedDuringSetup)
    };
    match tokio::time::timeout(SETUP_TIMEOUT, wait).await {
        Ok(result) => result,
        Err(_) => Err(ConnectError::SetupTimeout),
    }
}

/// Translate one server message into events. Unknown shapes are ignored;
/// undecodable audio payloads are logged and skipped so a corrupt frame
/// cannot end an otherwise healthy conversation.
fn dispatch_server_json(
    text: &str,
    default_rate: u32,
    epoch: u64,
    events: &UnboundedSender<EngineEvent>,
) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!("unparseable server message: {e}");
            return;
        }
    };

    if value.get("goAway").is_some() {
        let _ = events.send(EngineEvent::Inbound {
            epoch,
            event: ServerEvent::Closed,
        });
        return;
    }

    let Some(content) = value.get("serverContent") else {
        return;
    };

    if content
        .get("interrupted")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        let _ = events.send(EngineEvent::Inbound {
            epoch,
            event: ServerEvent::Interrupted,
        });
    }

    let Some(parts) = content
        .get("modelTurn")
        .and_then(|turn| turn.get("parts"))
        .and_then(|parts| parts.as_array())
    else {
        return;
    };
    for part in parts {
        let Some(inline) = part.get("inlineData") else {
            continue;
        };
        let Some(data) = inline.get("data").and_then(|d| d.as_str()) else {
            warn!("inline data without payload");
            continue;
        };
        match BASE64.decode(data) {
            Ok(bytes) if bytes.is_empty() => {}
            Ok(bytes) => {
                let rate = inline
                    .get("mimeType")
                    .and_then(|m| m.as_str())
                    .and_then(parse_pcm_rate)
                    .unwrap_or(default_rate);
                let _ = events.send(EngineEvent::Inbound {
                    epoch,
                    event: ServerEvent::Audio(AudioChunk::new(bytes, rate)),
                });
            }
            Err(e) => warn!("undecodable audio payload: {e}"),
        }
    }
}

/// Pull the rate out of a mime type like `audio/pcm;rate=24000`.
fn parse_pcm_rate(mime: &str) -> Option<u32> {
    mime.split(";rate=").nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn recv(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> ServerEvent {
        match rx.try_recv().expect("expected an inbound event") {
            EngineEvent::Inbound { epoch, event } => {
                assert_eq!(epoch, 3);
                event
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn parses_pcm_rate_from_mime_type() {
        assert_eq!(parse_pcm_rate("audio/pcm;rate=24000"), Some(24_000));
        assert_eq!(parse_pcm_rate("audio/pcm;rate=16000"), Some(16_000));
        assert_eq!(parse_pcm_rate("audio/pcm"), None);
        assert_eq!(parse_pcm_rate("audio/pcm;rate=abc"), None);
    }

    #[test]
    fn audio_parts_become_audio_events() {
        let (tx, mut rx) = unbounded_channel();
        let pcm = vec![0u8, 1, 2, 3];
        let message = json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [{
                        "inlineData": {
                            "mimeType": "audio/pcm;rate=24000",
                            "data": BASE64.encode(&pcm),
                        }
                    }]
                }
            }
        });
        dispatch_server_json(&message.to_string(), 48_000, 3, &tx);
        match recv(&mut rx) {
            ServerEvent::Audio(chunk) => {
                assert_eq!(chunk.bytes, pcm);
                assert_eq!(chunk.sample_rate, 24_000);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn interrupted_flag_becomes_an_interrupted_event() {
        let (tx, mut rx) = unbounded_channel();
        let message = json!({ "serverContent": { "interrupted": true } });
        dispatch_server_json(&message.to_string(), 24_000, 3, &tx);
        assert!(matches!(recv(&mut rx), ServerEvent::Interrupted));
    }

    #[test]
    fn go_away_becomes_a_closed_event() {
        let (tx, mut rx) = unbounded_channel();
        dispatch_server_json(&json!({ "goAway": {} }).to_string(), 24_000, 3, &tx);
        assert!(matches!(recv(&mut rx), ServerEvent::Closed));
    }

    #[test]
    fn unknown_messages_and_bad_payloads_are_ignored() {
        let (tx, mut rx) = unbounded_channel();
        dispatch_server_json("not json", 24_000, 3, &tx);
        dispatch_server_json(&json!({ "usageMetadata": {} }).to_string(), 24_000, 3, &tx);
        let bad = json!({
            "serverContent": {
                "modelTurn": { "parts": [{ "inlineData": { "data": "!!!" } }] }
            }
        });
        dispatch_server_json(&bad.to_string(), 24_000, 3, &tx);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn missing_mime_rate_falls_back_to_the_configured_rate() {
        let (tx, mut rx) = unbounded_channel();
        let message = json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [{ "inlineData": { "data": BASE64.encode([0u8, 0]) } }]
                }
            }
        });
        dispatch_server_json(&message.to_string(), 24_000, 3, &tx);
        match recv(&mut rx) {
            ServerEvent::Audio(chunk) => assert_eq!(chunk.sample_rate, 24_000),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
