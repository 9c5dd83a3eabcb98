//! Streaming LLM client (C4).
//!
//! Produces a streaming token sequence for a prompt over an SSE-style HTTP
//! response: buffered `data: ` lines terminated by `[DONE]`. Generalized
//! from this codebase's OpenRouter chat-completion client to the spec's
//! closed parameter set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub url: String,
    pub api_key: String,
    pub model: String,
}

/// Closed parameter set (§4.4) — no provider specifics leak past this.
#[derive(Debug, Clone)]
pub struct LlmParams {
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub stream_options_include_usage: bool,
}

impl Default for LlmParams {
    fn default() -> Self {
        Self { temperature: 0.0, max_output_tokens: 150, stream_options_include_usage: false }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system", content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user", content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant", content: content.into() }
    }
}

#[derive(Debug, Clone)]
pub enum LlmEvent {
    Delta(String),
    Done,
    Error(String),
}

#[derive(Serialize)]
struct RequestBody {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct Delta {
    content: Option<String>,
}

/// Open a streaming completion. `cancel` aborts the stream within one delta
/// boundary when set.
pub fn stream(
    client: reqwest::Client,
    config: LlmConfig,
    messages: Vec<ChatMessage>,
    params: LlmParams,
    cancel: Arc<AtomicBool>,
) -> mpsc::UnboundedReceiver<LlmEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(client, config, messages, params, cancel, tx));
    rx
}

async fn run(
    client: reqwest::Client,
    config: LlmConfig,
    messages: Vec<ChatMessage>,
    params: LlmParams,
    cancel: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<LlmEvent>,
) {
    let body = RequestBody {
        model: config.model.clone(),
        messages,
        temperature: params.temperature,
        max_tokens: params.max_output_tokens,
        stream: true,
        stream_options: params
            .stream_options_include_usage
            .then_some(StreamOptions { include_usage: true }),
    };

    let response = match client
        .post(&config.url)
        .bearer_auth(&config.api_key)
        .json(&body)
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            let _ = tx.send(LlmEvent::Error(format!("llm request failed: {e}")));
            return;
        }
    };

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let _ = tx.send(LlmEvent::Error(format!("llm provider returned {status}: {text}")));
        return;
    }

    let mut byte_stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = byte_stream.next().await {
        if cancel.load(Ordering::Relaxed) {
            return;
        }
        let bytes = match chunk {
            Ok(b) => b,
            Err(e) => {
                let _ = tx.send(LlmEvent::Error(format!("llm stream read error: {e}")));
                return;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(pos) = buffer.find("\n\n") {
            let event = buffer[..pos].to_string();
            buffer.drain(..pos + 2);

            for line in event.lines() {
                let Some(data) = line.strip_prefix("data: ") else { continue };
                if data.trim() == "[DONE]" {
                    let _ = tx.send(LlmEvent::Done);
                    return;
                }
                match serde_json::from_str::<StreamResponse>(data) {
                    Ok(parsed) => {
                        if let Some(choice) = parsed.choices.first() {
                            if let Some(content) = &choice.delta.content {
                                if !content.is_empty() {
                                    let _ = tx.send(LlmEvent::Delta(content.clone()));
                                }
                            }
                            if choice.finish_reason.is_some() {
                                let _ = tx.send(LlmEvent::Done);
                                return;
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to parse llm stream chunk"),
                }
            }
        }
    }

    let _ = tx.send(LlmEvent::Done);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_constructors_set_role() {
        assert_eq!(ChatMessage::system("hi").role, "system");
        assert_eq!(ChatMessage::user("hi").role, "user");
        assert_eq!(ChatMessage::assistant("hi").role, "assistant");
    }

    #[test]
    fn default_params_favor_latency() {
        let params = LlmParams::default();
        assert_eq!(params.temperature, 0.0);
        assert_eq!(params.max_output_tokens, 150);
    }

    #[test]
    fn parses_stream_response_delta() {
        let json = r#"{"choices":[{"delta":{"content":"It is"},"finish_reason":null}]}"#;
        let parsed: StreamResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.choices[0].delta.content.as_deref(), Some("It is"));
        assert!(parsed.choices[0].finish_reason.is_none());
    }

    #[test]
    fn request_body_omits_stream_options_when_disabled() {
        let body = RequestBody {
            model: "gpt".into(),
            messages: vec![ChatMessage::user("hi")],
            temperature: 0.0,
            max_tokens: 150,
            stream: true,
            stream_options: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("stream_options").is_none());
    }
}
