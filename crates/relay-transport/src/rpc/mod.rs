//! RPC method routing for handshaken connections.

mod chat;
mod sessions;
mod system;

use std::{sync::Arc, time::Instant};

use relay_core::{
    Clock, ConversationKind, SessionKey, Skill, config::StreamingConfig,
};
use relay_session::{ChatHistoryStore, DispatchCoordinator};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

pub use chat::{ChatAbortParams, ChatHistoryParams, ChatSendParams};
pub use sessions::SessionListItem;

use crate::{
    protocol::{ErrorCode, Frame, RequestFrame, error_response, ok_response},
    streaming::FrameSink,
};

/// Channel type of WebSocket clients.
pub const WEBCHAT_CHANNEL: &str = "webchat";

/// Failure of one RPC call.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Method \"{0}\" is not supported")]
    MethodNotFound(String),
    #[error("{0}")]
    BadParams(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    AbortFailed(String),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl RpcError {
    /// Wire error code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::MethodNotFound(_) => ErrorCode::MethodNotFound,
            Self::BadParams(_) => ErrorCode::BadParams,
            Self::Unavailable(_) => ErrorCode::Unavailable,
            Self::AbortFailed(_) => ErrorCode::AbortFailed,
            Self::SessionNotFound(_) => ErrorCode::SessionNotFound,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }
}

/// Identity and outbound sink of one connection.
#[derive(Clone)]
pub struct ConnectionInfo {
    pub conn_id: String,
    /// Sender id used for this connection's sessions.
    pub user_id: String,
    pub sink: Arc<dyn FrameSink>,
}

impl ConnectionInfo {
    /// The user is the handshake device id, or derived from the connection id.
    #[must_use]
    pub fn new(conn_id: impl Into<String>, device_id: Option<String>, sink: Arc<dyn FrameSink>) -> Self {
        let conn_id = conn_id.into();
        let user_id = device_id.unwrap_or_else(|| {
            format!("{WEBCHAT_CHANNEL}_{}", conn_id.chars().take(8).collect::<String>())
        });
        Self {
            conn_id,
            user_id,
            sink,
        }
    }

    /// Key of this user's direct conversation.
    #[must_use]
    pub fn default_session_key(&self) -> SessionKey {
        SessionKey::new(WEBCHAT_CHANNEL, &self.user_id, ConversationKind::Direct, None)
    }
}

/// Routes request frames to method handlers.
pub struct RpcDispatcher {
    coordinator: Arc<DispatchCoordinator>,
    history: Arc<ChatHistoryStore>,
    skills: Vec<Arc<dyn Skill>>,
    streaming: StreamingConfig,
    clock: Arc<dyn Clock>,
    started_at: Instant,
}

impl RpcDispatcher {
    #[must_use]
    pub fn new(
        coordinator: Arc<DispatchCoordinator>,
        history: Arc<ChatHistoryStore>,
        skills: Vec<Arc<dyn Skill>>,
        streaming: StreamingConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            coordinator,
            history,
            skills,
            streaming,
            clock,
            started_at: Instant::now(),
        }
    }

    #[must_use]
    pub const fn coordinator(&self) -> &Arc<DispatchCoordinator> {
        &self.coordinator
    }

    /// Handle one request and return its response.
    ///
    /// A run started by `chat.send` is already running when this returns,
    /// so its events may overtake the response. Use
    /// [`RpcDispatcher::handle`] when the response goes to `conn.sink`.
    pub async fn dispatch(&self, request: RequestFrame, conn: &ConnectionInfo) -> Frame {
        let (response, run) = self.route(request, conn).await;
        if let Some(run) = run {
            run.start();
        }
        response
    }

    /// Handle one request, queueing the response on the connection ahead of
    /// any events of the run it starts.
    pub async fn handle(&self, request: RequestFrame, conn: &ConnectionInfo) {
        let (response, run) = self.route(request, conn).await;
        if let Err(e) = conn.sink.send_frame(response) {
            tracing::debug!(conn_id = %conn.conn_id, error = %e, "Dropped RPC response");
        }
        if let Some(run) = run {
            run.start();
        }
    }

    async fn route(&self, request: RequestFrame, conn: &ConnectionInfo) -> (Frame, Option<chat::ChatRun>) {
        let RequestFrame { id, method, params } = request;
        tracing::debug!(method = %method, req_id = %id, conn_id = %conn.conn_id, "Dispatching RPC");

        let mut run = None;
        let result = match method.as_str() {
            "chat.send" => chat::send(self, params, conn).map(|(payload, started)| {
                run = started;
                payload
            }),
            "chat.abort" => chat::abort(self, params),
            "chat.history" => chat::history(self, params, conn).await,
            "sessions.list" => sessions::list(self, conn),
            "sessions.delete" => sessions::delete(self, params),
            "skills.status" => Ok(system::skills_status(self)),
            "health" => Ok(system::health(self)),
            "status" => Ok(system::status(self)),
            _ => Err(RpcError::MethodNotFound(method.clone())),
        };

        let response = match result {
            Ok(payload) => ok_response(id, Some(payload)),
            Err(e) => {
                if matches!(e, RpcError::MethodNotFound(_)) {
                    tracing::warn!(method = %method, "Unknown RPC method");
                }
                error_response(id, e.code(), e.to_string())
            }
        };
        (response, run)
    }
}

/// Decode params; absent or `null` params decode as the default.
fn parse_params<T: DeserializeOwned + Default>(params: Option<Value>) -> Result<T, RpcError> {
    match params {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value).map_err(|e| RpcError::BadParams(e.to_string())),
    }
}
