//! Wire protocol for client-server communication.
//!
//! Every WebSocket text message is one JSON [`Frame`], tagged by `type`:
//! `req` (client to server), `res` (the answer to one request) or `event`
//! (unsolicited server push).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "req")]
    Request(RequestFrame),
    #[serde(rename = "res")]
    Response(ResponseFrame),
    #[serde(rename = "event")]
    Event(EventFrame),
}

/// Client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Answer to a [`RequestFrame`], echoing its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// Unsolicited server push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

/// Error vocabulary carried by failed responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidFrame,
    MethodNotFound,
    Unavailable,
    Internal,
    BadParams,
    AbortFailed,
    SessionNotFound,
}

impl ErrorCode {
    /// Wire form of the code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidFrame => "INVALID_FRAME",
            Self::MethodNotFound => "METHOD_NOT_FOUND",
            Self::Unavailable => "UNAVAILABLE",
            Self::Internal => "INTERNAL",
            Self::BadParams => "BAD_PARAMS",
            Self::AbortFailed => "ABORT_FAILED",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
        }
    }
}

/// Error half of a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

/// Successful response to request `id`.
#[must_use]
pub fn ok_response(id: impl Into<String>, payload: Option<Value>) -> Frame {
    Frame::Response(ResponseFrame {
        id: id.into(),
        ok: true,
        payload,
        error: None,
    })
}

/// Failed response to request `id`.
#[must_use]
pub fn error_response(id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Frame {
    Frame::Response(ResponseFrame {
        id: id.into(),
        ok: false,
        payload: None,
        error: Some(ErrorBody {
            code,
            message: message.into(),
        }),
    })
}

/// Event frame.
#[must_use]
pub fn event_frame(event: impl Into<String>, payload: Option<Value>, seq: Option<u64>) -> Frame {
    Frame::Event(EventFrame {
        event: event.into(),
        payload,
        seq,
    })
}

/// Inbound text that is not a well-formed request.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid request frame: {reason}")]
    Invalid {
        /// Request id, when one could be recovered.
        id: Option<String>,
        reason: &'static str,
    },
}

impl FrameError {
    /// Id to answer with, if the frame carried a usable one.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Json(_) => None,
            Self::Invalid { id, .. } => id.as_deref(),
        }
    }
}

fn non_empty_str<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value.get(field).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Parse client text into a request.
///
/// Only the request shape is checked: `type == "req"` with non-empty `id`
/// and `method` strings.
///
/// # Errors
/// Returns error if the text is not JSON or not a request.
pub fn parse_request(raw: &str) -> Result<RequestFrame, FrameError> {
    let value: Value = serde_json::from_str(raw)?;

    if value.get("type").and_then(Value::as_str) != Some("req") {
        return Err(FrameError::Invalid {
            id: None,
            reason: "type must be \"req\"",
        });
    }
    let Some(id) = non_empty_str(&value, "id") else {
        return Err(FrameError::Invalid {
            id: None,
            reason: "id must be a non-empty string",
        });
    };
    let Some(method) = non_empty_str(&value, "method") else {
        return Err(FrameError::Invalid {
            id: Some(id.to_owned()),
            reason: "method must be a non-empty string",
        });
    };

    Ok(RequestFrame {
        id: id.to_owned(),
        method: method.to_owned(),
        params: value.get("params").filter(|p| !p.is_null()).cloned(),
    })
}

/// State of a chat run carried by a chat event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatEventState {
    Delta,
    Final,
    Error,
    Aborted,
}

impl ChatEventState {
    /// Whether no further events follow for the run.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Delta)
    }
}

/// Block of assistant output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text { text: String },
    Thinking { thinking: String },
}

/// Assembled assistant output so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

impl AssistantMessage {
    /// Thinking block (when reasoning is non-empty) followed by the text block.
    #[must_use]
    pub fn assemble(text: &str, reasoning: &str) -> Self {
        let mut content = Vec::with_capacity(2);
        if !reasoning.is_empty() {
            content.push(ContentBlock::Thinking {
                thinking: reasoning.to_owned(),
            });
        }
        content.push(ContentBlock::Text {
            text: text.to_owned(),
        });
        Self {
            role: "assistant".into(),
            content,
        }
    }
}

/// Payload of the `chat` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEventPayload {
    pub run_id: String,
    pub session_key: String,
    pub seq: u64,
    pub state: ChatEventState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<AssistantMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Name of the event carrying chat run output.
pub const CHAT_EVENT: &str = "chat";
