//! Plain HTTP endpoints.

use std::{sync::Arc, time::Instant};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use relay_core::{Clock, InboundMessage};
use relay_session::DispatchCoordinator;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

/// Channel type of HTTP chat requests.
pub const HTTP_CHANNEL: &str = "http";
/// Sender used when a request names no user.
pub const DEFAULT_HTTP_USER: &str = "http-user";

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    coordinator: Arc<DispatchCoordinator>,
    clock: Arc<dyn Clock>,
    started_at: Instant,
}

impl AppState {
    #[must_use]
    pub fn new(coordinator: Arc<DispatchCoordinator>, clock: Arc<dyn Clock>) -> Self {
        Self {
            coordinator,
            clock,
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

/// `/health`, `/api/status` and `/api/chat`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/chat", post(chat))
        .fallback(not_found)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "ts": state.clock.now_millis() }))
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let coordinator = &state.coordinator;
    let uptime_ms = u64::try_from(state.started_at.elapsed().as_millis()).unwrap_or(u64::MAX);
    Json(json!({
        "status": "running",
        "sessions": coordinator.sessions().size(),
        "inFlight": coordinator.in_flight_count(),
        "activeRuns": coordinator.aborts().len(),
        "engine": coordinator.engine().map(|e| e.name().to_owned()),
        "uptimeMs": uptime_ms,
    }))
}

/// Non-streaming chat through the dispatch coordinator.
async fn chat(State(state): State<AppState>, Json(body): Json<ChatRequest>) -> Response {
    let Some(message) = body.message.filter(|m| !m.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "message is required" })),
        )
            .into_response();
    };
    let user_id = body
        .user_id
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| DEFAULT_HTTP_USER.to_owned());

    let inbound = InboundMessage::direct_text(
        format!("http_{}", Uuid::new_v4()),
        HTTP_CHANNEL,
        user_id,
        message,
        state.clock.now_millis(),
    );
    let response = state.coordinator.handle_message(&inbound, None).await;
    Json(json!({ "response": response })).into_response()
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not Found" })))
}
