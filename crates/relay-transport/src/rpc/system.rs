//! `health`, `status` and `skills.status`.

use serde_json::{Value, json};

use super::RpcDispatcher;

pub(super) fn health(rpc: &RpcDispatcher) -> Value {
    json!({ "status": "ok", "ts": rpc.clock.now_millis() })
}

pub(super) fn status(rpc: &RpcDispatcher) -> Value {
    let uptime_ms = u64::try_from(rpc.started_at.elapsed().as_millis()).unwrap_or(u64::MAX);
    json!({
        "sessions": rpc.coordinator.sessions().size(),
        "inFlight": rpc.coordinator.in_flight_count(),
        "activeRuns": rpc.coordinator.aborts().len(),
        "engine": rpc.coordinator.engine().map(|e| e.name().to_owned()),
        "uptimeMs": uptime_ms,
    })
}

pub(super) fn skills_status(rpc: &RpcDispatcher) -> Value {
    let skills: Vec<Value> = rpc
        .skills
        .iter()
        .map(|s| json!({ "name": s.name(), "description": s.description() }))
        .collect();
    json!({ "skills": skills })
}
