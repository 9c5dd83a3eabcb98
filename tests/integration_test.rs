//! Integration tests spanning module boundaries: the wire envelope, the
//! frame codec, the connection pool's admission rules, and the backoff
//! schedule shared by the upstream clients. Exercises the scenarios from
//! the streaming-orchestrator design that don't require a live upstream
//! (S6, plus the universal properties around framing and backoff).

use std::time::Duration;

use serde_json::json;
use voice_turn_server::frame::{self, AudioChunkHeader, AudioCodec, TtsChunkHeader};
use voice_turn_server::pool::{AdmitError, ConnectionPool, PoolConfig, PoolSignal};

fn unbounded_signal() -> tokio::sync::mpsc::UnboundedSender<PoolSignal> {
    tokio::sync::mpsc::unbounded_channel().0
}

#[test]
fn audio_chunk_frame_round_trips_through_the_wire_codec() {
    let header = AudioChunkHeader {
        kind: "audio.chunk".into(),
        ts: 1_700_000_000_000,
        session_id: "s1".into(),
        turn_id: "t1".into(),
        seq: 7,
        codec: AudioCodec::Pcm16,
        sample_rate: 16_000,
        channels: 1,
    };
    let payload = vec![0u8; 640]; // one S1-sized PCM chunk
    let frame = frame::encode(&header, &payload).expect("encode");
    let (decoded, decoded_payload): (AudioChunkHeader, _) =
        frame::decode_typed(&frame).expect("decode");

    assert_eq!(decoded.session_id, "s1");
    assert_eq!(decoded.seq, 7);
    assert_eq!(decoded_payload.len(), 640);
}

#[test]
fn tts_chunk_header_round_trips_with_monotonic_seq_and_mime() {
    let header = TtsChunkHeader {
        kind: "tts.chunk".into(),
        ts: 1,
        session_id: "s1".into(),
        turn_id: "turn_1".into(),
        seq: 0,
        mime: "audio/mpeg".into(),
    };
    let frame = frame::encode(&header, b"fake-mp3-bytes").unwrap();
    let (decoded, payload): (TtsChunkHeader, _) = frame::decode_typed(&frame).unwrap();
    assert_eq!(decoded.seq, 0);
    assert_eq!(decoded.mime, "audio/mpeg");
    assert_eq!(payload, b"fake-mp3-bytes");
}

#[test]
fn session_start_envelope_matches_the_wire_schema() {
    let raw = json!({
        "type": "session.start",
        "ts": 1_700_000_000_000i64,
        "sessionId": "s1",
        "data": {
            "systemPrompt": "You are a helpful voice assistant.",
            "voiceId": "21m00Tcm4TlvDq8ikWAM",
            "vadEnabled": true,
            "pttMode": false,
            "endpointing": {
                "waitSeconds": 1.0,
                "punctuationSeconds": 0.5,
                "noPunctSeconds": 1.2,
                "numberSeconds": 1.0,
                "smartEndpointing": true
            }
        }
    });
    let parsed: serde_json::Value = serde_json::from_value(raw).unwrap();
    assert_eq!(parsed["type"], "session.start");
    assert_eq!(parsed["data"]["systemPrompt"], "You are a helpful voice assistant.");
}

#[tokio::test]
async fn pool_full_scenario_matches_s6() {
    // S6: maxConnections=2, two active clients, a third handshake is
    // rejected and failedConnections increments by exactly one.
    let pool = ConnectionPool::new(PoolConfig { max_connections: 2, ..PoolConfig::default() });
    assert!(pool.admit("c1".into(), unbounded_signal()).await.is_ok());
    assert!(pool.admit("c2".into(), unbounded_signal()).await.is_ok());

    let before = pool.metrics().await.failed_connections;
    let result = pool.admit("c3".into(), unbounded_signal()).await;
    assert_eq!(result, Err(AdmitError::Full));

    let after = pool.metrics().await;
    assert_eq!(after.failed_connections, before + 1);
    assert_eq!(after.active, 2);
}

#[tokio::test]
async fn rate_limit_and_capacity_are_independent_rejection_reasons() {
    // A pool with plenty of capacity still refuses the 11th admission in
    // under a second (§8 property 8) without touching the capacity cap.
    let pool = ConnectionPool::new(PoolConfig { max_connections: 1000, ..PoolConfig::default() });
    for i in 0..10 {
        assert!(pool.admit(format!("c{i}"), unbounded_signal()).await.is_ok());
    }
    assert_eq!(
        pool.admit("overflow".into(), unbounded_signal()).await,
        Err(AdmitError::RateLimited)
    );
    assert_eq!(pool.active_count().await, 10);
}

#[test]
fn backoff_schedule_stays_within_spec_bounds_for_all_reconnect_attempts() {
    // §8 property 4: delay sequence for attempts 0..5 lies within
    // [300*2^n, 300*2^n + 200] ms, clamped at [_, 5200].
    use voice_turn_server::backoff::{base_delay_ms, delay_ms, MAX_RECONNECT_ATTEMPTS};

    assert_eq!(MAX_RECONNECT_ATTEMPTS, 6);
    for attempt in 0..MAX_RECONNECT_ATTEMPTS {
        let base = base_delay_ms(attempt);
        for _ in 0..20 {
            let d = delay_ms(attempt);
            assert!(d >= base && d <= base + 200);
            assert!(d <= 5200);
        }
    }
}

#[tokio::test]
async fn heartbeat_and_pong_cycle_keeps_active_connections_alive() {
    // A connection that answers every ping survives indefinitely; one that
    // stops answering is pruned on the next tick (§4.6).
    let pool = ConnectionPool::new(PoolConfig {
        heartbeat_interval: Duration::from_millis(10),
        connection_timeout: Duration::from_secs(60),
        ..PoolConfig::default()
    });
    pool.admit("responsive".into(), unbounded_signal()).await.unwrap();
    pool.admit("silent".into(), unbounded_signal()).await.unwrap();

    pool.heartbeat_tick().await; // both pinged
    pool.mark_pong("responsive").await;
    pool.heartbeat_tick().await; // "silent" never answered -> removed

    assert_eq!(pool.active_count().await, 1);
}
