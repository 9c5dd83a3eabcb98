//! Shared types used across modules.
//!
//! Kept separate to avoid circular dependencies between `turn` and `session`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One turn of the rolling conversation history kept on a `Session` (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub text: String,
    pub ts: DateTime<Utc>,
}

/// Role of a message sender in the conversation history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
