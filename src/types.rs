use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

/// --- IDENTIFIERS ---

/// Opaque per-connection identifier handed to the browser in the `connected`
/// handshake. Unique among concurrently open sessions, including rapid
/// reconnects from the same tab.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 8)
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// --- UPSTREAM DELTAS ---

/// One incremental fragment of model output, as decoded from the provider
/// stream. End-of-stream is the exhaustion of the delta sequence, not a
/// variant: the `[DONE]` sentinel stops production.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamDelta {
    ReasoningChunk(String),
    AnswerChunk(String),
}

/// --- CLIENT WIRE EVENTS ---

/// Events written to the push connection, one JSON object per SSE record.
/// The `type` field discriminates; timestamps are RFC 3339 UTC.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Connected {
        message: String,
        #[serde(rename = "clientId")]
        client_id: ClientId,
    },
    UserMessage {
        content: String,
        timestamp: String,
    },
    AiThinking {
        content: bool,
        timestamp: String,
    },
    AiThinkingProcessStart {
        timestamp: String,
    },
    AiThinkingProcessChunk {
        content: String,
        timestamp: String,
    },
    AiThinkingProcessEnd {
        timestamp: String,
    },
    AiMessageChunk {
        content: String,
        timestamp: String,
    },
    System {
        content: String,
        timestamp: String,
    },
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl ClientEvent {
    pub fn connected(client_id: ClientId) -> Self {
        Self::Connected {
            message: "connected".to_string(),
            client_id,
        }
    }

    pub fn user_message(content: impl Into<String>) -> Self {
        Self::UserMessage {
            content: content.into(),
            timestamp: now_rfc3339(),
        }
    }

    pub fn ai_thinking(active: bool) -> Self {
        Self::AiThinking {
            content: active,
            timestamp: now_rfc3339(),
        }
    }

    pub fn thinking_process_start() -> Self {
        Self::AiThinkingProcessStart {
            timestamp: now_rfc3339(),
        }
    }

    pub fn thinking_process_chunk(content: impl Into<String>) -> Self {
        Self::AiThinkingProcessChunk {
            content: content.into(),
            timestamp: now_rfc3339(),
        }
    }

    pub fn thinking_process_end() -> Self {
        Self::AiThinkingProcessEnd {
            timestamp: now_rfc3339(),
        }
    }

    pub fn message_chunk(content: impl Into<String>) -> Self {
        Self::AiMessageChunk {
            content: content.into(),
            timestamp: now_rfc3339(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
            timestamp: now_rfc3339(),
        }
    }

    /// Wire discriminator, mainly for logs and assertions.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::UserMessage { .. } => "user_message",
            Self::AiThinking { .. } => "ai_thinking",
            Self::AiThinkingProcessStart { .. } => "ai_thinking_process_start",
            Self::AiThinkingProcessChunk { .. } => "ai_thinking_process_chunk",
            Self::AiThinkingProcessEnd { .. } => "ai_thinking_process_end",
            Self::AiMessageChunk { .. } => "ai_message_chunk",
            Self::System { .. } => "system",
        }
    }
}

/// --- CHAT TURN ---

/// One user-message-to-assistant-response cycle. Lives only for the duration
/// of a relay invocation; the accumulated buffers are read once for
/// best-effort persistence.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub user_id: UserId,
    pub client_id: ClientId,
    pub user_text: String,
    pub reasoning: String,
    pub answer: String,
}

impl ChatTurn {
    pub fn new(user_id: UserId, client_id: ClientId, user_text: impl Into<String>) -> Self {
        Self {
            user_id,
            client_id,
            user_text: user_text.into(),
            reasoning: String::new(),
            answer: String::new(),
        }
    }

    pub fn absorb(&mut self, delta: &UpstreamDelta) {
        match delta {
            UpstreamDelta::ReasoningChunk(text) => self.reasoning.push_str(text),
            UpstreamDelta::AnswerChunk(text) => self.answer.push_str(text),
        }
    }
}

/// --- ERRORS ---

#[derive(Error, Debug)]
pub enum HeliographError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(axum::http::StatusCode, String),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        let (status, msg, code) = match &self.inner {
            HeliographError::Unauthorized(m) => (
                axum::http::StatusCode::UNAUTHORIZED,
                m.clone(),
                "UNAUTHORIZED",
            ),
            HeliographError::InvalidRequest(m) => (
                axum::http::StatusCode::BAD_REQUEST,
                m.clone(),
                "INVALID_REQUEST",
            ),
            HeliographError::Conflict(m) => {
                (axum::http::StatusCode::CONFLICT, m.clone(), "CONFLICT")
            }
            HeliographError::Upstream(s, m) => (*s, m.clone(), "UPSTREAM_ERROR"),
            HeliographError::Network(e) => (
                axum::http::StatusCode::BAD_GATEWAY,
                e.to_string(),
                "NETWORK_ERROR",
            ),
            HeliographError::Database(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "DATABASE_ERROR",
            ),
            HeliographError::Serialization(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "SERIALIZATION_ERROR",
            ),
            HeliographError::Io(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "IO_ERROR",
            ),
            HeliographError::Internal(m, _) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                m.clone(),
                "INTERNAL_ERROR",
            ),
        };
        (
            status,
            axum::Json(serde_json::json!({
                "error": msg,
                "code": code,
            })),
        )
            .into_response()
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: HeliographError,
    pub span_trace: SpanTrace,
}

impl fmt::Display for ObservedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<HeliographError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;
