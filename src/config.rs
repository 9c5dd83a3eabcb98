//! Process configuration.
//!
//! Unlike the rest of this codebase's TOML-file configuration, this service
//! is configured entirely from the environment (§6), matching how it is
//! actually deployed: one process per container, env vars injected by the
//! orchestrator. `clap`'s `env` feature binds each setting to both a flag
//! (for local runs) and an environment variable (for everything else).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

/// Top-level subcommand, parsed alongside the env-var-backed settings below
/// so the binary never parses argv twice (see `cli::run`).
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the client-facing WebSocket server (default).
    Serve,
    /// Open a TCP connection to the configured bind address and exit 0/1.
    Healthcheck,
}

/// Server configuration, sourced from CLI flags or environment variables.
#[derive(Parser, Debug, Clone)]
#[command(name = "voice-turn-server", about = "Real-time voice agent turn orchestrator", version)]
pub struct Config {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Address to bind the client-facing WebSocket server on.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: String,

    /// API key for the upstream STT provider.
    #[arg(long, env = "STT_API_KEY")]
    pub stt_api_key: Option<String>,

    /// Base WebSocket URL for the upstream STT provider.
    #[arg(long, env = "STT_URL", default_value = "wss://api.deepgram.com/v1/listen")]
    pub stt_url: String,

    /// STT model name.
    #[arg(long, env = "STT_MODEL", default_value = "nova-2")]
    pub stt_model: String,

    /// API key for the upstream TTS provider.
    #[arg(long, env = "TTS_API_KEY")]
    pub tts_api_key: Option<String>,

    /// Base WebSocket URL for the upstream TTS provider.
    #[arg(long, env = "TTS_URL", default_value = "wss://api.elevenlabs.io/v1/text-to-speech")]
    pub tts_url: String,

    /// Default voice id used for TTS synthesis.
    #[arg(long, env = "VOICE_ID", default_value = "21m00Tcm4TlvDq8ikWAM")]
    pub voice_id: String,

    /// API key for the upstream LLM provider.
    #[arg(long, env = "LLM_API_KEY")]
    pub llm_api_key: Option<String>,

    /// Base HTTP URL for the upstream LLM provider's chat completions endpoint.
    #[arg(long, env = "LLM_URL", default_value = "https://api.openai.com/v1/chat/completions")]
    pub llm_url: String,

    /// LLM model name.
    #[arg(long, env = "LLM_MODEL", default_value = "gpt-4o-mini")]
    pub llm_model: String,

    /// Maximum number of concurrent sessions the pool will admit.
    #[arg(long, env = "MAX_WS_CONNECTIONS", default_value_t = 100)]
    pub max_ws_connections: usize,

    /// Heartbeat ping cadence, in seconds.
    #[arg(long, env = "WS_HEARTBEAT_INTERVAL", default_value_t = 30)]
    pub ws_heartbeat_interval_secs: u64,

    /// Idle timeout before a connection is pruned, in seconds.
    #[arg(long, env = "WS_CONNECTION_TIMEOUT", default_value_t = 60)]
    pub ws_connection_timeout_secs: u64,

    /// Maximum STT/TTS reconnect attempts before giving up.
    #[arg(long, env = "WS_MAX_RECONNECT_ATTEMPTS", default_value_t = 6)]
    pub ws_max_reconnect_attempts: u32,

    /// Disables upstream reconnection entirely (for deterministic testing).
    #[arg(long, env = "WS_RECONNECT_DISABLED", default_value_t = false)]
    pub ws_reconnect_disabled: bool,

    /// Log level / filter directive passed to `tracing_subscriber::EnvFilter`.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Parse configuration from CLI args and environment, failing fast with
    /// a descriptive error on missing mandatory settings (§6 exit-code
    /// contract: non-zero on fatal init failure).
    pub fn load() -> Result<Self> {
        let config = Config::try_parse().context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.stt_api_key.is_none() {
            anyhow::bail!("missing mandatory environment variable: STT_API_KEY");
        }
        if self.tts_api_key.is_none() {
            anyhow::bail!("missing mandatory environment variable: TTS_API_KEY");
        }
        if self.llm_api_key.is_none() {
            anyhow::bail!("missing mandatory environment variable: LLM_API_KEY");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_missing_stt_key() {
        let config = Config {
            command: None,
            bind_addr: "0.0.0.0:8080".into(),
            stt_api_key: None,
            stt_url: "wss://example".into(),
            stt_model: "nova-2".into(),
            tts_api_key: Some("k".into()),
            tts_url: "wss://example".into(),
            voice_id: "v".into(),
            llm_api_key: Some("k".into()),
            llm_url: "https://example".into(),
            llm_model: "m".into(),
            max_ws_connections: 100,
            ws_heartbeat_interval_secs: 30,
            ws_connection_timeout_secs: 60,
            ws_max_reconnect_attempts: 6,
            ws_reconnect_disabled: false,
            log_level: "info".into(),
        };
        assert!(config.validate().is_err());
    }
}
