//! Session supervisor (C7).
//!
//! One per admitted connection: demultiplexes inbound frames to the STT
//! client and turn orchestrator, and serializes their outbound events back
//! onto the client socket. Grounded on `src/server/realtime_voice.rs`'s
//! `OutboundMessage` / `sender_task` split, generalized to this service's
//! wire envelope (§6).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::frame::{self, AudioChunkHeader, Envelope, TtsChunkHeader};
use crate::llm_stream::{LlmConfig, LlmParams};
use crate::pool::{ConnectionPool, PoolSignal};
use crate::stt::{self, Endpointing, SttConfig, SttEvent, SttHandle};
use crate::tts_stream::TtsConfig;
use crate::turn::{self, Command as TurnCommand, OrchestratorConfig, OrchestratorEvent};

const DEFAULT_SPECULATIVE_CONFIDENCE: f32 = 0.85;
const DEFAULT_LLM_STREAMING_DELAY_MS: u64 = 200;
const DEFAULT_HISTORY_WINDOW: usize = 10;

#[derive(Debug, Deserialize)]
struct WireEndpointing {
    #[serde(rename = "waitSeconds", default = "default_wait_seconds")]
    wait_seconds: f64,
    #[serde(rename = "punctuationSeconds", default = "default_punctuation_seconds")]
    punctuation_seconds: f64,
    #[serde(rename = "noPunctSeconds", default = "default_no_punct_seconds")]
    no_punct_seconds: f64,
    #[serde(rename = "numberSeconds", default = "default_number_seconds")]
    number_seconds: f64,
    #[serde(rename = "smartEndpointing", default = "default_true")]
    smart_endpointing: bool,
}

fn default_wait_seconds() -> f64 { 1.0 }
fn default_punctuation_seconds() -> f64 { 0.5 }
fn default_no_punct_seconds() -> f64 { 1.2 }
fn default_number_seconds() -> f64 { 1.0 }
fn default_true() -> bool { true }

impl From<WireEndpointing> for Endpointing {
    fn from(w: WireEndpointing) -> Self {
        Endpointing {
            wait_seconds: w.wait_seconds,
            punctuation_seconds: w.punctuation_seconds,
            no_punct_seconds: w.no_punct_seconds,
            number_seconds: w.number_seconds,
            smart_endpointing: w.smart_endpointing,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SessionStartData {
    #[serde(rename = "systemPrompt")]
    system_prompt: String,
    #[serde(rename = "voiceId")]
    voice_id: Option<String>,
    #[serde(rename = "vadEnabled", default)]
    #[allow(dead_code)]
    vad_enabled: bool,
    #[serde(rename = "pttMode", default)]
    #[allow(dead_code)]
    ptt_mode: bool,
    #[serde(rename = "agentId")]
    #[allow(dead_code)]
    agent_id: Option<String>,
    token: Option<String>,
    #[serde(default)]
    endpointing: Option<WireEndpointing>,
}

#[derive(Debug, Deserialize)]
struct TestUtteranceData {
    text: String,
}

#[derive(Debug, Deserialize)]
struct InboundEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "sessionId", default)]
    session_id: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

/// Outbound messages queued for the dedicated sender task, mirroring the
/// teacher's `OutboundMessage` split between JSON control frames and raw
/// binary payloads.
enum Outbound {
    Json(Value),
    Binary(Vec<u8>),
    Ping,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn json_envelope<T: Serialize>(kind: &str, session_id: &str, turn_id: Option<&str>, data: Option<T>) -> Value {
    let env = Envelope {
        kind: kind.to_string(),
        ts: now_ms(),
        session_id: session_id.to_string(),
        turn_id: turn_id.map(|s| s.to_string()),
        data,
    };
    serde_json::to_value(env).unwrap_or(Value::Null)
}

#[derive(Serialize)]
struct ErrorData {
    code: String,
    message: String,
    recoverable: bool,
}

#[derive(Serialize)]
struct TextData {
    text: String,
}

#[derive(Serialize)]
struct MetricsData {
    #[serde(skip_serializing_if = "Option::is_none")]
    stt_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    llm_first_token_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tts_first_audio_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    e2e_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    alive: Option<bool>,
}

#[derive(Serialize)]
struct TtsEndData {
    reason: &'static str,
}

/// Per-session mutable state owned exclusively by this task (§3, §5).
struct SessionState {
    session_id: String,
    config: Arc<Config>,
    llm_http: reqwest::Client,
    stt: Option<SttHandle>,
    turn_tx: Option<mpsc::UnboundedSender<TurnCommand>>,
    current_turn_id: Option<String>,
    seq: u32,
}

/// Drive one admitted WebSocket connection end to end until disconnect.
pub async fn run(
    socket: WebSocket,
    conn_id: String,
    session_id: String,
    config: Arc<Config>,
    llm_http: reqwest::Client,
    pool: ConnectionPool,
    mut pool_signal_rx: mpsc::UnboundedReceiver<PoolSignal>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();

    let sender_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let result = match msg {
                Outbound::Json(v) => ws_tx.send(Message::Text(v.to_string().into())).await,
                Outbound::Binary(b) => ws_tx.send(Message::Binary(b.into())).await,
                Outbound::Ping => ws_tx.send(Message::Ping(Vec::new().into())).await,
            };
            if result.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut state = SessionState {
        session_id: session_id.clone(),
        config,
        llm_http,
        stt: None,
        turn_tx: None,
        current_turn_id: None,
        seq: 0,
    };

    let (mut stt_event_rx, mut orch_event_rx): (
        Option<mpsc::UnboundedReceiver<SttEvent>>,
        Option<mpsc::UnboundedReceiver<OrchestratorEvent>>,
    ) = (None, None);

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        pool.touch(&conn_id).await;
                        handle_text(&text, &mut state, &out_tx, &pool, &conn_id, &mut stt_event_rx, &mut orch_event_rx).await;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        pool.touch(&conn_id).await;
                        handle_binary(&bytes, &state, &out_tx).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        pool.mark_pong(&conn_id).await;
                    }
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Ok(Message::Close(_))) => break,
                    Some(Err(e)) => {
                        debug!(session_id = %session_id, error = %e, "websocket read error");
                        break;
                    }
                    None => break,
                }
            }
            Some(signal) = pool_signal_rx.recv() => {
                match signal {
                    PoolSignal::Ping => { let _ = out_tx.send(Outbound::Ping); }
                    PoolSignal::Close => break,
                }
            }
            Some(event) = recv_optional(&mut stt_event_rx) => {
                handle_stt_event(event, &mut state);
            }
            Some(event) = recv_optional(&mut orch_event_rx) => {
                handle_orchestrator_event(event, &mut state, &out_tx);
            }
            else => break,
        }
    }

    if let Some(stt) = state.stt.take() {
        stt.close();
    }
    pool.remove(&conn_id).await;
    sender_task.abort();
    info!(session_id = %session_id, "session ended");
}

/// Helper so `tokio::select!` can poll an `Option<Receiver<T>>` uniformly:
/// a `None` receiver simply never becomes ready.
async fn recv_optional<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(r) => r.recv().await,
        None => std::future::pending().await,
    }
}

async fn handle_text(
    text: &str,
    state: &mut SessionState,
    out_tx: &mpsc::UnboundedSender<Outbound>,
    pool: &ConnectionPool,
    conn_id: &str,
    stt_event_rx: &mut Option<mpsc::UnboundedReceiver<SttEvent>>,
    orch_event_rx: &mut Option<mpsc::UnboundedReceiver<OrchestratorEvent>>,
) {
    let envelope: InboundEnvelope = match serde_json::from_str(text) {
        Ok(e) => e,
        Err(e) => {
            send_error(out_tx, state, "protocol_error", &format!("malformed envelope: {e}"), true);
            return;
        }
    };

    match envelope.kind.as_str() {
        "session.start" => {
            if state.turn_tx.is_some() {
                return; // idempotent: session already started
            }
            let data: SessionStartData = match envelope.data.and_then(|d| serde_json::from_value(d).ok()) {
                Some(d) => d,
                None => {
                    send_error(out_tx, state, "protocol_error", "session.start missing required fields", true);
                    return;
                }
            };
            start_session(state, data, pool, conn_id, stt_event_rx, orch_event_rx).await;
        }
        "audio.end" => {
            // STT continues until its own final or silence-promotion timer;
            // no action needed beyond marking intent in logs (§4.7).
            debug!(session_id = %state.session_id, "audio.end received");
        }
        "barge.cancel" => {
            if let Some(tx) = &state.turn_tx {
                let _ = tx.send(TurnCommand::Interrupt);
            }
        }
        "test.utterance" => {
            let data: TestUtteranceData = match envelope.data.and_then(|d| serde_json::from_value(d).ok()) {
                Some(d) => d,
                None => {
                    send_error(out_tx, state, "protocol_error", "test.utterance missing text", true);
                    return;
                }
            };
            if let Some(tx) = &state.turn_tx {
                let _ = tx.send(TurnCommand::StartTurn);
                let _ = tx.send(TurnCommand::SttFinal(data.text));
            }
        }
        other => {
            send_error(out_tx, state, "protocol_error", &format!("unknown envelope type: {other}"), true);
        }
    }
}

async fn start_session(
    state: &mut SessionState,
    data: SessionStartData,
    pool: &ConnectionPool,
    conn_id: &str,
    stt_event_rx: &mut Option<mpsc::UnboundedReceiver<SttEvent>>,
    orch_event_rx: &mut Option<mpsc::UnboundedReceiver<OrchestratorEvent>>,
) {
    pool.bind_session(conn_id, state.session_id.clone()).await;
    let endpointing: Endpointing = data.endpointing.map(Into::into).unwrap_or_default();
    let cfg = &state.config;

    let stt_config = SttConfig {
        url: cfg.stt_url.clone(),
        api_key: data.token.clone().unwrap_or_else(|| cfg.stt_api_key.clone().unwrap_or_default()),
        model: cfg.stt_model.clone(),
        language: "en".to_string(),
        sample_rate: 16_000,
        channels: 1,
        endpointing,
        reconnect_disabled: cfg.ws_reconnect_disabled,
        max_reconnect_attempts: cfg.ws_max_reconnect_attempts,
    };
    let (stt_handle, stt_rx) = stt::open(stt_config, state.session_id.clone());
    state.stt = Some(stt_handle);
    *stt_event_rx = Some(stt_rx);

    let orchestrator_config = OrchestratorConfig {
        system_prompt: data.system_prompt,
        speculative_enabled: true,
        confidence_threshold: DEFAULT_SPECULATIVE_CONFIDENCE,
        llm_streaming_delay_ms: DEFAULT_LLM_STREAMING_DELAY_MS,
        history_window: DEFAULT_HISTORY_WINDOW,
        llm: LlmConfig {
            url: cfg.llm_url.clone(),
            api_key: cfg.llm_api_key.clone().unwrap_or_default(),
            model: cfg.llm_model.clone(),
        },
        llm_params: LlmParams::default(),
        tts: TtsConfig {
            url: cfg.tts_url.clone(),
            api_key: cfg.tts_api_key.clone().unwrap_or_default(),
            voice_id: data.voice_id.unwrap_or_else(|| cfg.voice_id.clone()),
            stability: 0.5,
            similarity_boost: 0.8,
            optimize_streaming_latency: 2,
            output_format: "mp3_22050_32".to_string(),
            reconnect_disabled: cfg.ws_reconnect_disabled,
            max_reconnect_attempts: cfg.ws_max_reconnect_attempts,
        },
    };
    let (turn_tx, turn_rx) = turn::spawn(state.session_id.clone(), orchestrator_config, state.llm_http.clone());
    state.turn_tx = Some(turn_tx.clone());
    *orch_event_rx = Some(turn_rx);

    let _ = turn_tx.send(TurnCommand::StartTurn);
}

async fn handle_binary(bytes: &[u8], state: &SessionState, out_tx: &mpsc::UnboundedSender<Outbound>) {
    let (_header, payload) = match frame::decode_typed::<AudioChunkHeader>(bytes) {
        Ok(v) => v,
        Err(e) => {
            let _ = out_tx.send(Outbound::Json(json_envelope(
                "error",
                &state.session_id,
                None,
                Some(ErrorData { code: "protocol_error".to_string(), message: e.to_string(), recoverable: true }),
            )));
            return;
        }
    };
    if let Some(stt) = &state.stt {
        stt.send_audio(payload.to_vec()).await;
    }
}

fn handle_stt_event(event: SttEvent, state: &mut SessionState) {
    let Some(tx) = &state.turn_tx else { return };
    match event {
        SttEvent::Partial(text) => {
            let _ = tx.send(TurnCommand::SttPartial(text));
        }
        SttEvent::Final(text) => {
            let _ = tx.send(TurnCommand::SttFinal(text));
        }
        SttEvent::Error(message, recoverable) => {
            warn!(session_id = %state.session_id, %message, "stt error");
            if !recoverable {
                let _ = tx.send(TurnCommand::Interrupt);
            }
        }
    }
}

fn handle_orchestrator_event(
    event: OrchestratorEvent,
    state: &mut SessionState,
    out_tx: &mpsc::UnboundedSender<Outbound>,
) {
    let session_id = state.session_id.clone();
    match event {
        OrchestratorEvent::TurnStarted(turn_id) => {
            state.current_turn_id = Some(turn_id);
            state.seq = 0;
        }
        OrchestratorEvent::SttPartial(text) => {
            send_json(out_tx, "stt.partial", &session_id, state.current_turn_id.as_deref(), TextData { text });
        }
        OrchestratorEvent::SttFinal(text) => {
            send_json(out_tx, "stt.final", &session_id, state.current_turn_id.as_deref(), TextData { text });
        }
        OrchestratorEvent::LlmPartial(text) => {
            send_json(out_tx, "llm.partial", &session_id, state.current_turn_id.as_deref(), TextData { text });
        }
        OrchestratorEvent::LlmFinal(text) => {
            send_json(out_tx, "llm.final", &session_id, state.current_turn_id.as_deref(), TextData { text });
        }
        OrchestratorEvent::TtsChunk(bytes, seq) => {
            let header = TtsChunkHeader {
                kind: "tts.chunk".to_string(),
                ts: now_ms(),
                session_id: session_id.clone(),
                turn_id: state.current_turn_id.clone().unwrap_or_default(),
                seq,
                mime: "audio/mpeg".to_string(),
            };
            if let Ok(frame) = frame::encode(&header, &bytes) {
                let _ = out_tx.send(Outbound::Binary(frame));
            }
        }
        OrchestratorEvent::TtsEnd(reason) => {
            send_json(out_tx, "tts.end", &session_id, state.current_turn_id.as_deref(), TtsEndData { reason: reason.as_str() });
        }
        OrchestratorEvent::MetricsUpdate(snapshot) => {
            send_json(
                out_tx,
                "metrics.update",
                &session_id,
                state.current_turn_id.as_deref(),
                MetricsData {
                    stt_ms: snapshot.stt_ms,
                    llm_first_token_ms: snapshot.llm_first_token_ms,
                    tts_first_audio_ms: snapshot.tts_first_audio_ms,
                    e2e_ms: snapshot.e2e_ms,
                    alive: snapshot.alive,
                },
            );
        }
        OrchestratorEvent::Error { code, message, recoverable } => {
            send_json(
                out_tx,
                "error",
                &session_id,
                state.current_turn_id.as_deref(),
                ErrorData { code: code.to_string(), message, recoverable },
            );
        }
    }
}

fn send_json<T: Serialize>(
    out_tx: &mpsc::UnboundedSender<Outbound>,
    kind: &str,
    session_id: &str,
    turn_id: Option<&str>,
    data: T,
) {
    let _ = out_tx.send(Outbound::Json(json_envelope(kind, session_id, turn_id, Some(data))));
}

fn send_error(out_tx: &mpsc::UnboundedSender<Outbound>, state: &SessionState, code: &str, message: &str, recoverable: bool) {
    let _ = out_tx.send(Outbound::Json(json_envelope(
        "error",
        &state.session_id,
        state.current_turn_id.as_deref(),
        Some(ErrorData { code: code.to_string(), message: message.to_string(), recoverable }),
    )));
}
