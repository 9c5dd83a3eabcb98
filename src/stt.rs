//! Upstream STT client (C2).
//!
//! Maintains one long-lived WebSocket per session to the STT provider,
//! forwards audio, and surfaces `(partial, final)` transcripts with
//! final-deduplication, a silence-promotion timer, and reconnect with
//! capped jittered backoff.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::backoff;
use crate::error::AgentError;

const MAX_QUEUE_LEN: usize = 100;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEDUP_WINDOW: Duration = Duration::from_secs(3);
const SILENCE_PROMOTION_CAP: Duration = Duration::from_millis(1500);

/// Endpointing thresholds negotiated at `session.start` (§6).
#[derive(Debug, Clone)]
pub struct Endpointing {
    pub wait_seconds: f64,
    pub punctuation_seconds: f64,
    pub no_punct_seconds: f64,
    pub number_seconds: f64,
    pub smart_endpointing: bool,
}

impl Default for Endpointing {
    fn default() -> Self {
        Self {
            wait_seconds: 1.0,
            punctuation_seconds: 0.5,
            no_punct_seconds: 1.2,
            number_seconds: 1.0,
            smart_endpointing: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SttConfig {
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub language: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub endpointing: Endpointing,
    pub reconnect_disabled: bool,
    pub max_reconnect_attempts: u32,
}

/// Events surfaced by the STT client to the turn orchestrator's mailbox.
#[derive(Debug, Clone)]
pub enum SttEvent {
    Partial(String),
    Final(String),
    Error(String, bool /* recoverable */),
}

/// Handle used by the session supervisor to feed audio into, and close, a
/// running STT client task.
#[derive(Clone)]
pub struct SttHandle {
    queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    notify: Arc<Notify>,
    closed: Arc<AtomicBool>,
    is_open: Arc<AtomicBool>,
}

impl SttHandle {
    /// Forward audio to the upstream. If the socket is not yet OPEN the
    /// frame is queued (bounded, drop-oldest). Always returns `true`: the
    /// contract only rejects audio once the client is closed.
    pub async fn send_audio(&self, bytes: Vec<u8>) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }
        {
            let mut q = self.queue.lock().await;
            if q.len() >= MAX_QUEUE_LEN {
                q.pop_front();
            }
            q.push_back(bytes);
        }
        self.notify.notify_one();
        true
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }
}

/// Open a new STT client for one session. Returns a handle plus the event
/// stream; idempotency of `open()` (§4.2) is the session supervisor's
/// responsibility — it must not call this twice for the same turn.
pub fn open(config: SttConfig, session_id: String) -> (SttHandle, mpsc::UnboundedReceiver<SttEvent>) {
    let queue = Arc::new(Mutex::new(VecDeque::new()));
    let notify = Arc::new(Notify::new());
    let closed = Arc::new(AtomicBool::new(false));
    let is_open = Arc::new(AtomicBool::new(false));

    let handle = SttHandle {
        queue: queue.clone(),
        notify: notify.clone(),
        closed: closed.clone(),
        is_open: is_open.clone(),
    };

    let (event_tx, event_rx) = mpsc::unbounded_channel();

    tokio::spawn(run(config, session_id, queue, notify, closed, is_open, event_tx));

    (handle, event_rx)
}

fn build_url(config: &SttConfig) -> String {
    let no_punct_ms = ((config.endpointing.no_punct_seconds * 1000.0) as u64).max(300);
    let utterance_end_ms = ((config.endpointing.wait_seconds * 1000.0) as u64).max(1000);
    let mut url = url::Url::parse(&config.url).unwrap_or_else(|_| {
        url::Url::parse("wss://invalid.example/").expect("static fallback URL parses")
    });
    {
        let mut qp = url.query_pairs_mut();
        qp.append_pair("encoding", "linear16");
        qp.append_pair("sample_rate", &config.sample_rate.to_string());
        qp.append_pair("channels", &config.channels.to_string());
        qp.append_pair("interim_results", "true");
        qp.append_pair("punctuate", "true");
        qp.append_pair("language", &config.language);
        qp.append_pair("model", &config.model);
        qp.append_pair("smart_format", &config.endpointing.smart_endpointing.to_string());
        qp.append_pair("utterance_end_ms", &utterance_end_ms.to_string());
        qp.append_pair("endpointing", &no_punct_ms.to_string());
    }
    url.to_string()
}

#[derive(Debug, Deserialize)]
struct SttAlternative {
    transcript: String,
}

#[derive(Debug, Deserialize)]
struct SttChannel {
    alternatives: Vec<SttAlternative>,
}

#[derive(Debug, Deserialize)]
struct SttMessage {
    channel: Option<SttChannel>,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    speech_final: bool,
}

/// Normalize a transcript for deduplication (§4.2, §8 property 3): lowercase,
/// collapse any run of whitespace or punctuation into a single space, trim.
pub fn normalize(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut last_was_space = true;
    for ch in text.chars() {
        let lower = ch.to_lowercase().next().unwrap_or(ch);
        if lower.is_whitespace() || lower.is_ascii_punctuation() {
            if !last_was_space {
                result.push(' ');
                last_was_space = true;
            }
        } else {
            result.push(lower);
            last_was_space = false;
        }
    }
    result.trim_end().to_string()
}

struct DedupState {
    last_final: Option<(String, Instant)>,
}

impl DedupState {
    fn new() -> Self {
        Self { last_final: None }
    }

    /// Returns `true` if `text` should be suppressed as a duplicate.
    fn check_and_record(&mut self, text: &str, now: Instant) -> bool {
        let norm = normalize(text);
        if let Some((last_norm, last_at)) = &self.last_final {
            if *last_norm == norm && now.duration_since(*last_at) < DEDUP_WINDOW {
                return true;
            }
        }
        self.last_final = Some((norm, now));
        false
    }
}

async fn run(
    config: SttConfig,
    session_id: String,
    queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    notify: Arc<Notify>,
    closed: Arc<AtomicBool>,
    is_open: Arc<AtomicBool>,
    event_tx: mpsc::UnboundedSender<SttEvent>,
) {
    let mut attempt: u32 = 0;
    let mut dedup = DedupState::new();

    loop {
        if closed.load(Ordering::Relaxed) {
            return;
        }

        let url = build_url(&config);
        let request = match build_request(&url, &config.api_key) {
            Ok(r) => r,
            Err(e) => {
                let err = AgentError::Protocol(format!("invalid stt url: {e}"));
                let _ = event_tx.send(SttEvent::Error(err.to_string(), false));
                return;
            }
        };

        let connect_result =
            tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(request)).await;

        let ws_stream = match connect_result {
            Ok(Ok((stream, response))) => {
                let status = response.status().as_u16();
                if status != 101 {
                    if (400..500).contains(&status) {
                        let err = AgentError::UpstreamFatal {
                            provider: "stt",
                            message: format!("authentication rejected: status {status}"),
                        };
                        let _ = event_tx.send(SttEvent::Error(err.to_string(), false));
                        return;
                    }
                    if !reconnect_or_give_up(&config, &event_tx, &mut attempt, "unexpected upgrade status").await
                    {
                        return;
                    }
                    continue;
                }
                stream
            }
            Ok(Err(e)) => {
                if !reconnect_or_give_up(&config, &event_tx, &mut attempt, &e.to_string()).await {
                    return;
                }
                continue;
            }
            Err(_elapsed) => {
                let err = AgentError::Timeout("stt connect timeout".into());
                let _ = event_tx.send(SttEvent::Error(err.to_string(), true));
                if !reconnect_or_give_up(&config, &event_tx, &mut attempt, "connect timeout").await {
                    return;
                }
                continue;
            }
        };

        attempt = 0;
        is_open.store(true, Ordering::Relaxed);
        info!(session_id = %session_id, "stt upstream open");

        let (mut write, mut read) = ws_stream.split();

        // Drain anything queued while we were connecting/reconnecting.
        drain_queue(&queue, &mut write).await;

        let mut silence_deadline: Option<Instant> = None;
        let mut interim = String::new();

        let disconnect_reason = loop {
            let sleep_fut = async {
                match silence_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = notify.notified() => {
                    if closed.load(Ordering::Relaxed) {
                        let _ = write.send(WsMessage::Text(r#"{"type":"CloseStream"}"#.into())).await;
                        let _ = write.close().await;
                        break DisconnectReason::ClosedByCaller;
                    }
                    drain_queue(&queue, &mut write).await;
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            handle_inbound(
                                &text,
                                &mut interim,
                                &mut silence_deadline,
                                &mut dedup,
                                &config,
                                &event_tx,
                            );
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            break DisconnectReason::UpstreamClosed;
                        }
                        Some(Err(e)) => {
                            warn!(session_id = %session_id, error = %e, "stt read error");
                            break DisconnectReason::UpstreamClosed;
                        }
                        _ => {}
                    }
                }
                _ = sleep_fut => {
                    if !interim.is_empty() {
                        debug!(session_id = %session_id, "stt silence-promotion fired");
                        emit_final(&interim, &mut dedup, &event_tx);
                        interim.clear();
                    }
                    silence_deadline = None;
                }
            }
        };

        is_open.store(false, Ordering::Relaxed);

        match disconnect_reason {
            DisconnectReason::ClosedByCaller => return,
            DisconnectReason::UpstreamClosed => {
                if !reconnect_or_give_up(&config, &event_tx, &mut attempt, "upstream closed").await {
                    return;
                }
            }
        }
    }
}

enum DisconnectReason {
    ClosedByCaller,
    UpstreamClosed,
}

fn build_request(
    url: &str,
    api_key: &str,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, anyhow::Error> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    let mut request = url.into_client_request()?;
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {api_key}").parse()?,
    );
    Ok(request)
}

async fn drain_queue(
    queue: &Arc<Mutex<VecDeque<Vec<u8>>>>,
    write: &mut (impl futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
) {
    let mut q = queue.lock().await;
    while let Some(chunk) = q.pop_front() {
        if write.send(WsMessage::Binary(chunk)).await.is_err() {
            break;
        }
    }
}

fn handle_inbound(
    text: &str,
    interim: &mut String,
    silence_deadline: &mut Option<Instant>,
    dedup: &mut DedupState,
    config: &SttConfig,
    event_tx: &mpsc::UnboundedSender<SttEvent>,
) {
    let parsed: SttMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(_) => return,
    };
    let transcript = parsed
        .channel
        .as_ref()
        .and_then(|c| c.alternatives.first())
        .map(|a| a.transcript.clone())
        .unwrap_or_default();

    if transcript.is_empty() {
        return;
    }

    if parsed.is_final || parsed.speech_final {
        *silence_deadline = None;
        emit_final(&transcript, dedup, event_tx);
        interim.clear();
    } else {
        *interim = transcript.clone();
        let _ = event_tx.send(SttEvent::Partial(transcript));
        let delay_ms = ((config.endpointing.no_punct_seconds * 1000.0) as u64)
            .min(SILENCE_PROMOTION_CAP.as_millis() as u64);
        *silence_deadline = Some(Instant::now() + Duration::from_millis(delay_ms));
    }
}

fn emit_final(text: &str, dedup: &mut DedupState, event_tx: &mpsc::UnboundedSender<SttEvent>) {
    let now = Instant::now();
    if dedup.check_and_record(text, now) {
        debug!("suppressing duplicate final transcript");
        return;
    }
    let _ = event_tx.send(SttEvent::Final(text.to_string()));
}

/// Sleeps the appropriate backoff delay and bumps `attempt`, or reports a
/// fatal error and returns `false` once attempts are exhausted or
/// reconnection is disabled.
async fn reconnect_or_give_up(
    config: &SttConfig,
    event_tx: &mpsc::UnboundedSender<SttEvent>,
    attempt: &mut u32,
    reason: &str,
) -> bool {
    if config.reconnect_disabled || *attempt >= config.max_reconnect_attempts {
        let err = AgentError::UpstreamTransient {
            provider: "stt",
            message: format!("reconnect exhausted: {reason}"),
        };
        let _ = event_tx.send(SttEvent::Error(err.to_string(), false));
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
    fn normalize_collapses_punctuation_and_whitespace() {
        assert_eq!(normalize("Hello, world!"), "hello world");
        assert_eq!(normalize("  Multiple   spaces. "), "multiple spaces");
        assert_eq!(normalize("ALL CAPS!!"), "all caps");
    }

    #[test]
    fn dedup_suppresses_identical_final_within_window() {
        let mut dedup = DedupState::new();
        let t0 = Instant::now();
        assert!(!dedup.check_and_record("Hello.", t0));
        assert!(dedup.check_and_record("hello", t0 + Duration::from_millis(500)));
    }

    #[test]
    fn dedup_allows_repeat_after_window_elapses() {
        let mut dedup = DedupState::new();
        let t0 = Instant::now();
        assert!(!dedup.check_and_record("Hello.", t0));
        assert!(!dedup.check_and_record("hello", t0 + Duration::from_secs(4)));
    }

    #[test]
    fn build_url_encodes_endpointing_with_lower_bounds() {
        let config = SttConfig {
            url: "wss://example.test/listen".into(),
            api_key: "k".into(),
            model: "nova-2".into(),
            language: "en".into(),
            sample_rate: 16000,
            channels: 1,
            endpointing: Endpointing {
                wait_seconds: 0.1,
                punctuation_seconds: 0.1,
                no_punct_seconds: 0.1,
                number_seconds: 0.1,
                smart_endpointing: true,
            },
            reconnect_disabled: false,
            max_reconnect_attempts: 6,
        };
        let url = build_url(&config);
        assert!(url.contains("utterance_end_ms=1000"));
        assert!(url.contains("endpointing=300"));
        assert!(url.contains("interim_results=true"));
    }

    #[tokio::test]
    async fn send_audio_queues_and_drops_oldest_beyond_bound() {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let notify = Arc::new(Notify::new());
        let closed = Arc::new(AtomicBool::new(false));
        let is_open = Arc::new(AtomicBool::new(false));
        let handle = SttHandle { queue: queue.clone(), notify, closed, is_open };

        for i in 0..150u8 {
            handle.send_audio(vec![i]).await;
        }
        let q = queue.lock().await;
        assert_eq!(q.len(), MAX_QUEUE_LEN);
        assert_eq!(q.front().unwrap(), &vec![50u8]);
        assert_eq!(q.back().unwrap(), &vec![149u8]);
    }

    #[tokio::test]
    async fn closed_handle_rejects_audio() {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let notify = Arc::new(Notify::new());
        let closed = Arc::new(AtomicBool::new(false));
        let is_open = Arc::new(AtomicBool::new(false));
        let handle = SttHandle { queue, notify, closed, is_open };
        handle.close();
        assert!(!handle.send_audio(vec![1, 2, 3]).await);
    }
}
