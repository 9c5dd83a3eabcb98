//! voice-turn-server — real-time voice agent streaming orchestrator.
//!
//! Ingests a client's microphone audio over a persistent WebSocket, streams
//! it to an upstream STT provider, drives an LLM completion on recognized
//! utterances, and streams the synthesized TTS reply back as binary audio
//! frames, enforcing turn-taking including barge-in.
//!
//! Module map:
//! - [`frame`] — binary frame codec (C1) and the shared JSON envelope.
//! - [`stt`] — upstream STT client (C2): queueing, dedup, reconnect.
//! - [`tts_stream`] — upstream TTS client (C3): chunked audio, abortable.
//! - [`llm_stream`] — streaming LLM client (C4).
//! - [`turn`] — the turn orchestrator (C5): the hard core.
//! - [`pool`] — the connection pool (C6): the only process-wide shared state.
//! - [`session`] — the session supervisor (C7): per-connection glue.

pub mod backoff;
pub mod cli;
pub mod config;
pub mod error;
pub mod frame;
pub mod llm_stream;
pub mod pool;
pub mod server;
pub mod session;
pub mod stt;
pub mod tts_stream;
pub mod turn;
pub mod types;

pub use config::Config;
pub use error::AgentError;
pub use pool::ConnectionPool;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
