//! Binary frame codec (C1).
//!
//! Wire layout: 4-byte big-endian header length, UTF-8 JSON header, raw
//! payload bytes. Used for both `audio.chunk` (client → server) and
//! `tts.chunk` (server → client).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The JSON envelope shared by every control message (§3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(rename = "type")]
    pub kind: String,
    pub ts: i64,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "turnId", skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

/// Header carried by a binary `audio.chunk` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioChunkHeader {
    #[serde(rename = "type")]
    pub kind: String,
    pub ts: i64,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "turnId")]
    pub turn_id: String,
    pub seq: u32,
    pub codec: AudioCodec,
    #[serde(rename = "sampleRate")]
    pub sample_rate: u32,
    pub channels: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Pcm16,
    Opus,
}

/// Header carried by a binary `tts.chunk` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsChunkHeader {
    #[serde(rename = "type")]
    pub kind: String,
    pub ts: i64,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "turnId")]
    pub turn_id: String,
    pub seq: u32,
    pub mime: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame too short to contain a length prefix")]
    FrameTooShort,
    #[error("declared header length exceeds frame size")]
    HeaderLenInvalid,
    #[error("header is not valid JSON: {0}")]
    HeaderJsonInvalid(String),
}

const LEN_PREFIX_BYTES: usize = 4;

/// Serialize `header` as canonical UTF-8 JSON, prepend its 4-byte
/// big-endian length, and append `payload` verbatim.
pub fn encode<H: Serialize>(header: &H, payload: &[u8]) -> Result<Vec<u8>, serde_json::Error> {
    let header_bytes = serde_json::to_vec(header)?;
    let mut frame = Vec::with_capacity(LEN_PREFIX_BYTES + header_bytes.len() + payload.len());
    frame.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
    frame.extend_from_slice(&header_bytes);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Split a binary frame into its raw header bytes and payload bytes.
pub fn decode(frame: &[u8]) -> Result<(&[u8], &[u8]), DecodeError> {
    if frame.len() < LEN_PREFIX_BYTES {
        return Err(DecodeError::FrameTooShort);
    }
    let header_len = u32::from_be_bytes(frame[..LEN_PREFIX_BYTES].try_into().unwrap()) as usize;
    if frame.len() < LEN_PREFIX_BYTES + header_len {
        return Err(DecodeError::HeaderLenInvalid);
    }
    let header_bytes = &frame[LEN_PREFIX_BYTES..LEN_PREFIX_BYTES + header_len];
    let payload = &frame[LEN_PREFIX_BYTES + header_len..];
    // Validate JSON-ness up front so callers get a structured error instead
    // of discovering it on their own deserialize attempt.
    if let Err(e) = serde_json::from_slice::<serde_json::Value>(header_bytes) {
        return Err(DecodeError::HeaderJsonInvalid(e.to_string()));
    }
    Ok((header_bytes, payload))
}

/// Decode a frame and deserialize its header into `H`.
pub fn decode_typed<H: for<'de> Deserialize<'de>>(
    frame: &[u8],
) -> Result<(H, &[u8]), DecodeError> {
    let (header_bytes, payload) = decode(frame)?;
    let header = serde_json::from_slice(header_bytes)
        .map_err(|e| DecodeError::HeaderJsonInvalid(e.to_string()))?;
    Ok((header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_header_and_payload() {
        let header = AudioChunkHeader {
            kind: "audio.chunk".into(),
            ts: 12345,
            session_id: "s1".into(),
            turn_id: "t1".into(),
            seq: 0,
            codec: AudioCodec::Pcm16,
            sample_rate: 16000,
            channels: 1,
        };
        let payload = vec![1u8, 2, 3, 4, 5];
        let frame = encode(&header, &payload).unwrap();
        let (decoded_header, decoded_payload): (AudioChunkHeader, _) =
            decode_typed(&frame).unwrap();
        assert_eq!(decoded_header.session_id, "s1");
        assert_eq!(decoded_header.seq, 0);
        assert_eq!(decoded_payload, payload.as_slice());
    }

    #[test]
    fn round_trips_empty_payload() {
        let header = serde_json::json!({"type": "audio.chunk"});
        let frame = encode(&header, &[]).unwrap();
        let (h, p) = decode(&frame).unwrap();
        assert_eq!(serde_json::from_slice::<serde_json::Value>(h).unwrap(), header);
        assert!(p.is_empty());
    }

    #[test]
    fn rejects_frame_shorter_than_length_prefix() {
        assert_eq!(decode(&[0, 0, 1]), Err(DecodeError::FrameTooShort));
    }

    #[test]
    fn rejects_header_len_exceeding_frame_size() {
        let mut frame = vec![0, 0, 0, 100];
        frame.extend_from_slice(b"{}");
        assert_eq!(decode(&frame), Err(DecodeError::HeaderLenInvalid));
    }

    #[test]
    fn rejects_invalid_header_json() {
        let mut frame = (4u32).to_be_bytes().to_vec();
        frame.extend_from_slice(b"nope");
        assert!(matches!(decode(&frame), Err(DecodeError::HeaderJsonInvalid(_))));
    }

    #[test]
    fn envelope_skips_absent_turn_and_data() {
        let env: Envelope<serde_json::Value> = Envelope {
            kind: "audio.end".into(),
            ts: 1,
            session_id: "s1".into(),
            turn_id: None,
            data: None,
        };
        let json = serde_json::to_value(&env).unwrap();
        assert!(json.get("turnId").is_none());
        assert!(json.get("data").is_none());
    }
}
