//! `sessions.*` methods.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{ConnectionInfo, RpcDispatcher, RpcError, parse_params};

/// Entry of `sessions.list`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListItem {
    pub id: String,
    pub session_key: String,
    pub title: String,
    pub created_at: i64,
    pub last_active_at: i64,
    pub total_cost_usd: f64,
    pub in_flight: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteParams {
    #[serde(default)]
    session_id: Option<String>,
}

/// Live sessions of the calling user, most recently active first.
pub(super) fn list(rpc: &RpcDispatcher, conn: &ConnectionInfo) -> Result<Value, RpcError> {
    let mut sessions: Vec<_> = rpc
        .coordinator
        .sessions()
        .list_all()
        .into_iter()
        .filter(|s| s.key.sender_id() == conn.user_id)
        .collect();
    sessions.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));

    let items: Vec<SessionListItem> = sessions
        .into_iter()
        .map(|s| SessionListItem {
            title: format!("Session {}", s.id.get(5..13).unwrap_or(&s.id)),
            session_key: s.key.to_string(),
            created_at: s.created_at,
            last_active_at: s.last_active_at,
            total_cost_usd: s.total_cost_usd,
            in_flight: rpc.coordinator.is_in_flight(&s.id),
            id: s.id,
        })
        .collect();

    Ok(json!({ "sessions": items }))
}

/// Abort a session's runs and remove it.
pub(super) fn delete(rpc: &RpcDispatcher, params: Option<Value>) -> Result<Value, RpcError> {
    let params: DeleteParams = parse_params(params)?;
    let Some(session_id) = params.session_id.filter(|id| !id.is_empty()) else {
        return Err(RpcError::BadParams("sessionId is required".into()));
    };
    let Some(session) = rpc.coordinator.sessions().get(&session_id) else {
        return Err(RpcError::SessionNotFound(session_id));
    };

    rpc.coordinator.reset_session(&session);
    tracing::info!(session_id = %session_id, "Session deleted by client");
    Ok(json!({ "deleted": true, "sessionId": session_id }))
}
