//! Wire-visible error taxonomy.
//!
//! Distinct from `anyhow::Error`, which is used throughout this crate for
//! process-level and startup failures. These variants are the ones that can
//! reach a client as an `error` envelope (§7 / §6) and therefore carry enough
//! structure to fill `{code, message, recoverable}` mechanically.

use thiserror::Error;

/// Errors that can surface to a connected client as an `error` envelope.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Malformed frame, unknown envelope type, or schema violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// STT/TTS socket closed before completion, DNS hiccup, or similar.
    /// Recoverable: the caller should reconnect.
    #[error("upstream transient error ({provider}): {message}")]
    UpstreamTransient { provider: &'static str, message: String },

    /// Authentication rejection, quota exceeded, or a provider-reported
    /// error payload. Not recoverable for the current turn.
    #[error("upstream fatal error ({provider}): {message}")]
    UpstreamFatal { provider: &'static str, message: String },

    /// Pool is full or the rate limit was exceeded.
    #[error("overloaded: {0}")]
    Overload(String),

    /// Upstream connect or idle timeout.
    #[error("timeout: {0}")]
    Timeout(String),
}

impl AgentError {
    /// Stable machine-readable code for the outbound `error` envelope.
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::Protocol(_) => "protocol_error",
            AgentError::UpstreamTransient { .. } => "upstream_transient",
            AgentError::UpstreamFatal { .. } => "upstream_fatal",
            AgentError::Overload(_) => "overload",
            AgentError::Timeout(_) => "timeout",
        }
    }

    /// Whether the client may reasonably retry (restart a turn or session).
    pub fn recoverable(&self) -> bool {
        match self {
            AgentError::Protocol(_) => true,
            AgentError::UpstreamTransient { .. } => true,
            AgentError::UpstreamFatal { .. } => false,
            AgentError::Overload(_) => true,
            AgentError::Timeout(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_errors_are_not_recoverable() {
        let e = AgentError::UpstreamFatal { provider: "tts", message: "quota exceeded".into() };
        assert!(!e.recoverable());
        assert_eq!(e.code(), "upstream_fatal");
    }

    #[test]
    fn transient_errors_are_recoverable() {
        let e = AgentError::UpstreamTransient { provider: "stt", message: "closed".into() };
        assert!(e.recoverable());
        assert_eq!(e.code(), "upstream_transient");
    }

    #[test]
    fn protocol_errors_keep_connection() {
        let e = AgentError::Protocol("missing field".into());
        assert!(e.recoverable());
        assert_eq!(e.code(), "protocol_error");
    }
}
