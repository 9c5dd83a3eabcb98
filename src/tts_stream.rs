//! Upstream TTS client (C3).
//!
//! Streams synthesized audio for one piece of text over a per-utterance
//! WebSocket: priming message, text payload, flush + end-of-stream, then
//! inbound base64 audio chunks with a monotonic sequence number.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use crate::backoff;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub url: String,
    pub api_key: String,
    pub voice_id: String,
    pub stability: f32,
    pub similarity_boost: f32,
    pub optimize_streaming_latency: u8,
    pub output_format: String,
    pub reconnect_disabled: bool,
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Complete,
    Barge,
    Error,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Complete => "complete",
            EndReason::Barge => "barge",
            EndReason::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub enum TtsEvent {
    Chunk(Vec<u8>, u32),
    End(EndReason),
}

/// Handle used to cancel an in-flight TTS stream (barge-in).
#[derive(Clone)]
pub struct TtsHandle {
    cancel_flag: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
}

impl TtsHandle {
    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::Relaxed);
        self.cancel_notify.notify_one();
    }
}

#[derive(Serialize)]
struct BosMessage<'a> {
    text: &'a str,
    voice_settings: VoiceSettings,
    prefill: bool,
}

#[derive(Serialize)]
struct VoiceSettings {
    stability: f32,
    similarity_boost: f32,
}

#[derive(Serialize)]
struct TextChunkMessage<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct FlushMessage {
    text: &'static str,
    flush: bool,
}

#[derive(Serialize)]
struct EosMessage {
    text: &'static str,
}

#[derive(Debug, Deserialize)]
struct InboundMessage {
    audio: Option<String>,
    #[serde(rename = "isFinal")]
    is_final: Option<bool>,
    error: Option<String>,
    code: Option<String>,
    message: Option<String>,
}

/// Open a TTS stream for `text`. Returns a cancellation handle plus the
/// event stream of `(chunk, seq)` and a terminal `End` event.
pub fn stream(config: TtsConfig, text: String) -> (TtsHandle, mpsc::UnboundedReceiver<TtsEvent>) {
    let cancel_flag = Arc::new(AtomicBool::new(false));
    let cancel_notify = Arc::new(Notify::new());
    let handle = TtsHandle { cancel_flag: cancel_flag.clone(), cancel_notify: cancel_notify.clone() };

    let (event_tx, event_rx) = mpsc::unbounded_channel();

    tokio::spawn(run(config, text, cancel_flag, cancel_notify, event_tx));

    (handle, event_rx)
}

fn build_url(config: &TtsConfig) -> String {
    let mut url = url::Url::parse(&format!("{}/{}/stream-input", config.url, config.voice_id))
        .unwrap_or_else(|_| url::Url::parse("wss://invalid.example/").expect("static fallback parses"));
    {
        let mut qp = url.query_pairs_mut();
        qp.append_pair(
            "optimize_streaming_latency",
            &config.optimize_streaming_latency.min(4).to_string(),
        );
        qp.append_pair("output_format", &config.output_format);
    }
    url.to_string()
}

async fn run(
    config: TtsConfig,
    text: String,
    cancel_flag: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
    event_tx: mpsc::UnboundedSender<TtsEvent>,
) {
    let mut attempt: u32 = 0;
    let mut chunks_delivered = false;
    let mut seq: u32 = 0;

    loop {
        if cancel_flag.load(Ordering::Relaxed) {
            let _ = event_tx.send(TtsEvent::End(EndReason::Barge));
            return;
        }

        let url = build_url(&config);
        let request = match build_request(&url, &config.api_key) {
            Ok(r) => r,
            Err(_) => {
                let _ = event_tx.send(TtsEvent::End(EndReason::Error));
                return;
            }
        };

        let connect_result =
            tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(request)).await;

        let ws_stream = match connect_result {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                warn!(error = %e, "tts connect failed");
                if chunks_delivered || !should_retry(&config, &mut attempt).await {
                    let reason = if chunks_delivered { EndReason::Complete } else { EndReason::Error };
                    let _ = event_tx.send(TtsEvent::End(reason));
                    return;
                }
                continue;
            }
            Err(_elapsed) => {
                if chunks_delivered || !should_retry(&config, &mut attempt).await {
                    let reason = if chunks_delivered { EndReason::Complete } else { EndReason::Error };
                    let _ = event_tx.send(TtsEvent::End(reason));
                    return;
                }
                continue;
            }
        };

        attempt = 0;
        let (mut write, mut read) = ws_stream.split();

        if let Err(e) = send_opening_messages(&mut write, &config, &text).await {
            warn!(error = %e, "failed to send tts opening messages");
            let _ = event_tx.send(TtsEvent::End(EndReason::Error));
            return;
        }

        let terminal = loop {
            tokio::select! {
                _ = cancel_notify.notified() => {
                    let _ = write.close().await;
                    break Some(EndReason::Barge);
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            match handle_inbound(&text, &mut seq, &event_tx) {
                                InboundOutcome::Continue => {
                                    chunks_delivered = chunks_delivered || seq > 0;
                                }
                                InboundOutcome::Fatal => break Some(EndReason::Error),
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break None,
                        Some(Err(e)) => {
                            warn!(error = %e, "tts read error");
                            break None;
                        }
                        _ => {}
                    }
                }
            }
        };

        match terminal {
            Some(reason) => {
                let _ = event_tx.send(TtsEvent::End(reason));
                return;
            }
            None => {
                // Socket closed without an explicit error or cancellation.
                if chunks_delivered {
                    let _ = event_tx.send(TtsEvent::End(EndReason::Complete));
                    return;
                }
                if !should_retry(&config, &mut attempt).await {
                    let _ = event_tx.send(TtsEvent::End(EndReason::Error));
                    return;
                }
                // retry the outer loop
            }
        }
    }
}

enum InboundOutcome {
    Continue,
    Fatal,
}

fn handle_inbound(
    text: &str,
    seq: &mut u32,
    event_tx: &mpsc::UnboundedSender<TtsEvent>,
) -> InboundOutcome {
    let parsed: InboundMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(_) => return InboundOutcome::Continue,
    };

    if parsed.error.is_some() || parsed.code.is_some() {
        debug!(message = ?parsed.message, "tts reported an error");
        return InboundOutcome::Fatal;
    }

    if let Some(audio_b64) = parsed.audio {
        if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(audio_b64) {
            let _ = event_tx.send(TtsEvent::Chunk(bytes, *seq));
            *seq += 1;
        }
    }

    // `isFinal` marks completion but we keep reading until the socket
    // actually closes, per §4.3.
    let _ = parsed.is_final;

    InboundOutcome::Continue
}

async fn send_opening_messages(
    write: &mut (impl futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    config: &TtsConfig,
    text: &str,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let bos = BosMessage {
        text: " ",
        voice_settings: VoiceSettings {
            stability: config.stability,
            similarity_boost: config.similarity_boost,
        },
        prefill: true,
    };
    write.send(WsMessage::Text(serde_json::to_string(&bos).unwrap())).await?;

    let payload = TextChunkMessage { text };
    write.send(WsMessage::Text(serde_json::to_string(&payload).unwrap())).await?;

    write
        .send(WsMessage::Text(
            serde_json::to_string(&FlushMessage { text: "", flush: true }).unwrap(),
        ))
        .await?;
    write
        .send(WsMessage::Text(serde_json::to_string(&EosMessage { text: "" }).unwrap()))
        .await?;

    Ok(())
}

fn build_request(
    url: &str,
    api_key: &str,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, anyhow::Error> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    let mut request = url.into_client_request()?;
    request.headers_mut().insert("xi-api-key", api_key.parse()?);
    Ok(request)
}

async fn should_retry(config: &TtsConfig, attempt: &mut u32) -> bool {
    if config.reconnect_disabled || *attempt >= config.max_reconnect_attempts {
        return false;
    }
    let delay = backoff::delay_ms(*attempt);
    *attempt += 1;
    tokio::time::sleep(Duration::from_millis(delay)).await;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_url_includes_query_params() {
        let config = TtsConfig {
            url: "wss://api.elevenlabs.io/v1/text-to-speech".into(),
            api_key: "k".into(),
            voice_id: "voice123".into(),
            stability: 0.5,
            similarity_boost: 0.8,
            optimize_streaming_latency: 2,
            output_format: "mp3_22050_32".into(),
            reconnect_disabled: false,
            max_reconnect_attempts: 6,
        };
        let url = build_url(&config);
        assert!(url.contains("voice123/stream-input"));
        assert!(url.contains("optimize_streaming_latency=2"));
        assert!(url.contains("output_format=mp3_22050_32"));
    }

    #[test]
    fn optimize_streaming_latency_is_capped_at_4() {
        let config = TtsConfig {
            url: "wss://example.test".into(),
            api_key: "k".into(),
            voice_id: "v".into(),
            stability: 0.5,
            similarity_boost: 0.8,
            optimize_streaming_latency: 9,
            output_format: "mp3_22050_32".into(),
            reconnect_disabled: false,
            max_reconnect_attempts: 6,
        };
        let url = build_url(&config);
        assert!(url.contains("optimize_streaming_latency=4"));
    }

    #[test]
    fn end_reason_wire_strings_match_spec() {
        assert_eq!(EndReason::Complete.as_str(), "complete");
        assert_eq!(EndReason::Barge.as_str(), "barge");
        assert_eq!(EndReason::Error.as_str(), "error");
    }

    #[test]
    fn handle_inbound_decodes_audio_and_increments_seq() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut seq = 0u32;
        let payload = serde_json::json!({ "audio": base64::engine::general_purpose::STANDARD.encode("hi") });
        handle_inbound(&payload.to_string(), &mut seq, &tx);
        assert_eq!(seq, 1);
        match rx.try_recv().unwrap() {
            TtsEvent::Chunk(bytes, 0) => assert_eq!(bytes, b"hi"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn handle_inbound_treats_error_payload_as_fatal() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut seq = 0u32;
        let payload = serde_json::json!({ "error": "quota_exceeded", "message": "quota exceeded" });
        assert!(matches!(handle_inbound(&payload.to_string(), &mut seq, &tx), InboundOutcome::Fatal));
    }

    #[tokio::test]
    async fn cancel_marks_flag_and_wakes_notify() {
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let cancel_notify = Arc::new(Notify::new());
        let handle = TtsHandle { cancel_flag: cancel_flag.clone(), cancel_notify: cancel_notify.clone() };
        handle.cancel();
        assert!(cancel_flag.load(Ordering::Relaxed));
    }
}
