//! `chat.*` methods and the driver of streaming runs.

use std::{str::FromStr, sync::Arc};

use relay_core::{AgentEngine, Chunk, EngineError, Session, SessionKey};
use relay_session::{
    AbortRegistry, ChatHistoryStore, DispatchCoordinator, InFlightGuard, MessageRole, RunGuard,
    StoredMessage,
    dispatch::{BUSY_REPLY, NEW_SESSION_COMMAND, RESET_REPLY},
    history::DEFAULT_HISTORY_LIMIT,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{ConnectionInfo, RpcDispatcher, RpcError, parse_params};
use crate::{protocol::ContentBlock, streaming::StreamingDelivery};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendParams {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub session_key: Option<String>,
    /// Used as the run id when present.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatAbortParams {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub session_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatHistoryParams {
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Prepare a streaming run. The caller starts it once the response is out.
pub(super) fn send(
    rpc: &RpcDispatcher,
    params: Option<Value>,
    conn: &ConnectionInfo,
) -> Result<(Value, Option<ChatRun>), RpcError> {
    let params: ChatSendParams = parse_params(params)?;
    let text = params.message.as_deref().map(str::trim).unwrap_or_default();
    if text.is_empty() {
        return Err(RpcError::BadParams("message is required".into()));
    }

    let key = match non_empty(params.session_key) {
        Some(raw) => SessionKey::from_str(&raw).map_err(|e| RpcError::BadParams(e.to_string()))?,
        None => conn.default_session_key(),
    };

    if text == NEW_SESSION_COMMAND {
        let session = rpc.coordinator.sessions().resolve_key(key);
        rpc.coordinator.reset_session(&session);
        tracing::info!(session_id = %session.id, conn_id = %conn.conn_id, "Session reset by command");
        return Ok((json!({ "status": "reset", "message": RESET_REPLY }), None));
    }

    let Some(engine) = rpc.coordinator.engine() else {
        return Err(RpcError::Unavailable("No agent engine configured".into()));
    };

    let session = rpc.coordinator.sessions().resolve_key(key);
    let Some(guard) = rpc.coordinator.try_acquire(&session.id) else {
        tracing::warn!(session_id = %session.id, conn_id = %conn.conn_id, "Session busy, chat.send rejected");
        return Ok((json!({ "status": "busy", "message": BUSY_REPLY }), None));
    };

    let run_id = non_empty(params.idempotency_key).unwrap_or_else(|| Uuid::new_v4().to_string());
    let session_key = session.key.to_string();
    let cancel = CancellationToken::new();
    let Some(registration) =
        rpc.coordinator
            .aborts()
            .track(run_id.clone(), session_key.clone(), Some(cancel.clone()))
    else {
        return Err(RpcError::BadParams(format!(
            "idempotencyKey {run_id} is already in use by a running chat"
        )));
    };

    tracing::info!(run_id = %run_id, session_id = %session.id, conn_id = %conn.conn_id, "Chat run started");

    let run = ChatRun {
        delivery: StreamingDelivery::new(
            Arc::clone(&conn.sink),
            run_id.clone(),
            session_key,
            rpc.streaming.throttle(),
        ),
        run_id: run_id.clone(),
        session,
        text: text.to_owned(),
        engine,
        cancel,
        coordinator: Arc::clone(&rpc.coordinator),
        history: Arc::clone(&rpc.history),
        _registration: registration,
        _guard: guard,
    };

    Ok((json!({ "runId": run_id, "status": "started" }), Some(run)))
}

/// One in-progress streaming run. Dropping it clears the session's busy mark.
pub(super) struct ChatRun {
    run_id: String,
    session: Session,
    text: String,
    engine: Arc<dyn AgentEngine>,
    cancel: CancellationToken,
    delivery: StreamingDelivery,
    coordinator: Arc<DispatchCoordinator>,
    history: Arc<ChatHistoryStore>,
    _registration: RunGuard,
    _guard: InFlightGuard,
}

impl ChatRun {
    pub(super) fn start(self) {
        tokio::spawn(self.drive());
    }

    fn forward(&self, aborts: &AbortRegistry, chunk: Chunk) {
        if aborts.is_aborted(&self.run_id) {
            return;
        }
        match chunk {
            Chunk::Text(text) => self.delivery.push_chunk(&text),
            Chunk::Reasoning(text) => self.delivery.push_reasoning_chunk(&text),
        }
        aborts.record_snapshot(&self.run_id, &self.delivery.buffer());
    }

    async fn drive(self) {
        let session_key = self.session.key.to_string();
        if let Err(e) = self
            .history
            .append(&session_key, MessageRole::User, self.text.as_str(), None, Some(&self.run_id))
            .await
        {
            tracing::warn!(run_id = %self.run_id, error = %e, "Failed to store user message");
        }

        let aborts = Arc::clone(self.coordinator.aborts());
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
        let mut engine_run =
            self.engine
                .run_streaming(&self.session, &self.text, chunk_tx, self.cancel.clone());

        let result = loop {
            tokio::select! {
                biased;
                Some(chunk) = chunk_rx.recv() => self.forward(&aborts, chunk),
                result = &mut engine_run => break result,
            }
        };
        while let Ok(chunk) = chunk_rx.try_recv() {
            self.forward(&aborts, chunk);
        }

        match result {
            _ if aborts.is_aborted(&self.run_id) => self.delivery.send_aborted(),
            Err(EngineError::Cancelled) => self.delivery.send_aborted(),
            Ok(reply) => {
                self.coordinator
                    .sessions()
                    .add_cost(&self.session.id, reply.cost_usd);
                self.delivery.send_final();
                let reasoning = self.delivery.reasoning_buffer();
                if let Err(e) = self
                    .history
                    .append(
                        &session_key,
                        MessageRole::Assistant,
                        self.delivery.buffer(),
                        Some(reasoning),
                        Some(&self.run_id),
                    )
                    .await
                {
                    tracing::warn!(run_id = %self.run_id, error = %e, "Failed to store assistant message");
                }
                if let Err(e) = self
                    .history
                    .store_summary(self.session.key.sender_id(), &self.text, &self.delivery.buffer())
                    .await
                {
                    tracing::warn!(run_id = %self.run_id, error = %e, "Failed to store exchange summary");
                }
            }
            Err(e) => {
                tracing::error!(run_id = %self.run_id, session_id = %self.session.id, error = %e, "Chat run failed");
                self.delivery.send_error(e.to_string());
            }
        }

        tracing::info!(run_id = %self.run_id, "Chat run finished");
    }
}

/// Abort one run by id, or every run of a session.
pub(super) fn abort(rpc: &RpcDispatcher, params: Option<Value>) -> Result<Value, RpcError> {
    let params: ChatAbortParams = parse_params(params)?;
    let aborts = rpc.coordinator.aborts();

    if let Some(run_id) = non_empty(params.run_id) {
        return match aborts.abort(&run_id) {
            Some(_) => Ok(json!({ "aborted": true, "runIds": [run_id] })),
            None => Err(RpcError::AbortFailed(
                "Run not found or already completed".into(),
            )),
        };
    }

    if let Some(session_key) = non_empty(params.session_key) {
        let run_ids = aborts.abort_by_session(&session_key);
        return Ok(json!({ "aborted": !run_ids.is_empty(), "runIds": run_ids }));
    }

    Err(RpcError::BadParams("runId or sessionKey is required".into()))
}

/// Stored message as returned by `chat.history`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryMessage {
    role: MessageRole,
    content: Vec<ContentBlock>,
    timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_id: Option<String>,
}

impl From<StoredMessage> for HistoryMessage {
    fn from(message: StoredMessage) -> Self {
        let mut content = Vec::with_capacity(2);
        if let Some(thinking) = message.thinking {
            content.push(ContentBlock::Thinking { thinking });
        }
        content.push(ContentBlock::Text { text: message.text });
        Self {
            role: message.role,
            content,
            timestamp: message.timestamp,
            run_id: message.run_id,
        }
    }
}

pub(super) async fn history(
    rpc: &RpcDispatcher,
    params: Option<Value>,
    conn: &ConnectionInfo,
) -> Result<Value, RpcError> {
    let params: ChatHistoryParams = parse_params(params)?;
    let session_key =
        non_empty(params.session_key).unwrap_or_else(|| conn.default_session_key().to_string());
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);

    let messages = rpc
        .history
        .get_history(&session_key, limit)
        .await
        .map_err(|e| {
            tracing::error!(session_key = %session_key, error = %e, "Failed to load chat history");
            RpcError::Internal("Failed to load history".into())
        })?;

    let messages: Vec<HistoryMessage> = messages.into_iter().map(HistoryMessage::from).collect();
    Ok(json!({ "messages": messages }))
}

#[cfg(test)]
mod tests {
    use relay_core::{AgentEngine, ConversationKind};
    use serde_json::json;

    use super::super::fixtures::*;
    use crate::protocol::{ChatEventState, ErrorCode};
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_send_streams_to_final_and_records_history() {
        let engine = Arc::new(ScriptedEngine {
            cost: 0.5,
            ..ScriptedEngine::text(&["Hel", "lo"])
        });
        let Fixture { rpc, .. } = fixture(Some(engine as Arc<dyn AgentEngine>));
        let (conn, mut rx) = connection("u1");

        let res = call(&rpc, &conn, "chat.send", json!({"message": "  hi  "})).await;
        let body = payload(&res);
        assert_eq!(body["status"], "started");
        let run_id = body["runId"].as_str().unwrap().to_owned();

        let events = events_until_terminal(&mut rx).await;
        let last = events.last().unwrap();
        assert_eq!(last.state, ChatEventState::Final);
        assert_eq!(text_of(last), "Hello");
        assert!(events.iter().all(|e| e.run_id == run_id));
        assert_eq!(last.session_key, "webchat:dm:u1");
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=seqs.len() as u64).collect::<Vec<_>>());

        settle(&rpc).await;
        assert!(rpc.coordinator().aborts().is_empty());
        let session = rpc.coordinator().sessions().list_all().remove(0);
        assert!((session.total_cost_usd - 0.5).abs() < f64::EPSILON);

        let res = call(&rpc, &conn, "chat.history", json!({})).await;
        let messages = payload(&res)["messages"].clone();
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[0]["content"][0]["text"], "hi");
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[1]["content"][0]["text"], "Hello");
        assert_eq!(messages[1]["runId"], run_id.as_str());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_send_on_busy_session() {
        let engine = Arc::new(ScriptedEngine {
            gated: true,
            ..ScriptedEngine::text(&["working"])
        });
        let Fixture { rpc, .. } = fixture(Some(Arc::clone(&engine) as Arc<dyn AgentEngine>));
        let (conn, mut rx) = connection("u1");

        let first = call(&rpc, &conn, "chat.send", json!({"message": "one"})).await;
        assert_eq!(payload(&first)["status"], "started");
        let busy = call(&rpc, &conn, "chat.send", json!({"message": "two"})).await;
        assert_eq!(payload(&busy)["status"], "busy");
        assert_eq!(payload(&busy)["message"], BUSY_REPLY);

        engine.gate.notify_one();
        let events = events_until_terminal(&mut rx).await;
        assert_eq!(events.last().unwrap().state, ChatEventState::Final);
        settle(&rpc).await;

        engine.gate.notify_one();
        let again = call(&rpc, &conn, "chat.send", json!({"message": "three"})).await;
        assert_eq!(payload(&again)["status"], "started");
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_failure_sends_error_event() {
        let engine = Arc::new(ScriptedEngine {
            fail: true,
            ..ScriptedEngine::text(&["par"])
        });
        let Fixture { rpc, .. } = fixture(Some(engine as Arc<dyn AgentEngine>));
        let (conn, mut rx) = connection("u1");

        call(&rpc, &conn, "chat.send", json!({"message": "hi"})).await;
        let events = events_until_terminal(&mut rx).await;
        let last = events.last().unwrap();
        assert_eq!(last.state, ChatEventState::Error);
        assert!(last.error_message.as_deref().unwrap().contains("model exploded"));

        settle(&rpc).await;
        assert!(rpc.coordinator().aborts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_by_run_id() {
        let engine = Arc::new(ScriptedEngine {
            gated: true,
            ..ScriptedEngine::text(&["partial"])
        });
        let Fixture { rpc, .. } = fixture(Some(Arc::clone(&engine) as Arc<dyn AgentEngine>));
        let (conn, mut rx) = connection("u1");

        let res = call(
            &rpc,
            &conn,
            "chat.send",
            json!({"message": "hi", "idempotencyKey": "run-42"}),
        )
        .await;
        assert_eq!(payload(&res)["runId"], "run-42");

        let Some(crate::protocol::Frame::Event(first)) = rx.recv().await else {
            panic!("expected first delta");
        };
        assert_eq!(first.seq, Some(1));

        let res = call(&rpc, &conn, "chat.abort", json!({"runId": "run-42"})).await;
        assert_eq!(payload(&res), json!({"aborted": true, "runIds": ["run-42"]}));

        engine.gate.notify_one();
        let events = events_until_terminal(&mut rx).await;
        let last = events.last().unwrap();
        assert_eq!(last.state, ChatEventState::Aborted);
        assert_eq!(text_of(last), "partial");

        settle(&rpc).await;
        let res = call(&rpc, &conn, "chat.abort", json!({"runId": "run-42"})).await;
        assert_eq!(error_code(&res), ErrorCode::AbortFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_by_session_key() {
        let engine = Arc::new(ScriptedEngine {
            gated: true,
            ..ScriptedEngine::text(&["x"])
        });
        let Fixture { rpc, .. } = fixture(Some(Arc::clone(&engine) as Arc<dyn AgentEngine>));
        let (conn, mut rx) = connection("u1");

        let res = call(&rpc, &conn, "chat.send", json!({"message": "hi"})).await;
        let run_id = payload(&res)["runId"].clone();

        let res = call(&rpc, &conn, "chat.abort", json!({"sessionKey": "webchat:dm:u1"})).await;
        assert_eq!(payload(&res), json!({"aborted": true, "runIds": [run_id]}));
        let res = call(&rpc, &conn, "chat.abort", json!({"sessionKey": "webchat:dm:u1"})).await;
        assert_eq!(payload(&res), json!({"aborted": false, "runIds": []}));

        engine.gate.notify_one();
        let events = events_until_terminal(&mut rx).await;
        assert_eq!(events.last().unwrap().state, ChatEventState::Aborted);
    }

    #[tokio::test]
    async fn test_abort_requires_target() {
        let Fixture { rpc, .. } = fixture(None);
        let (conn, _rx) = connection("u1");
        let res = call(&rpc, &conn, "chat.abort", json!({})).await;
        assert_eq!(error_code(&res), ErrorCode::BadParams);
        let res = call(&rpc, &conn, "chat.abort", json!({"runId": "nope"})).await;
        assert_eq!(error_code(&res), ErrorCode::AbortFailed);
    }

    #[tokio::test]
    async fn test_send_validation() {
        let Fixture { rpc, .. } = fixture(None);
        let (conn, _rx) = connection("u1");

        let res = call(&rpc, &conn, "chat.send", json!({"message": "   "})).await;
        assert_eq!(error_code(&res), ErrorCode::BadParams);

        let res = call(&rpc, &conn, "chat.send", json!({"message": "hi"})).await;
        assert_eq!(error_code(&res), ErrorCode::Unavailable);

        let engine: Arc<dyn AgentEngine> = Arc::new(ScriptedEngine::text(&["x"]));
        let Fixture { rpc, .. } = fixture(Some(engine));
        let res = call(&rpc, &conn, "chat.send", json!({"message": "hi", "sessionKey": "bogus"})).await;
        assert_eq!(error_code(&res), ErrorCode::BadParams);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_session_key_and_history_limit() {
        let engine: Arc<dyn AgentEngine> = Arc::new(ScriptedEngine::text(&["ok"]));
        let Fixture { rpc, clock } = fixture(Some(engine));
        let (conn, mut rx) = connection("u1");

        for text in ["a", "b"] {
            call(
                &rpc,
                &conn,
                "chat.send",
                json!({"message": text, "sessionKey": "dingtalk:group:g1:u1"}),
            )
            .await;
            events_until_terminal(&mut rx).await;
            settle(&rpc).await;
            clock.advance(std::time::Duration::from_millis(5));
        }

        let res = call(
            &rpc,
            &conn,
            "chat.history",
            json!({"sessionKey": "dingtalk:group:g1:u1", "limit": 2}),
        )
        .await;
        let messages = payload(&res)["messages"].as_array().unwrap().clone();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["content"][0]["text"], "b");
        assert_eq!(messages[1]["content"][0]["text"], "ok");

        let res = call(&rpc, &conn, "chat.history", json!({})).await;
        assert!(payload(&res)["messages"].as_array().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idempotency_key_in_use_is_rejected() {
        let engine = Arc::new(ScriptedEngine {
            gated: true,
            ..ScriptedEngine::text(&["x"])
        });
        let Fixture { rpc, .. } = fixture(Some(Arc::clone(&engine) as Arc<dyn AgentEngine>));
        let (u1, mut rx1) = connection("u1");
        let (u2, _rx2) = connection("u2");

        let res = call(&rpc, &u1, "chat.send", json!({"message": "hi", "idempotencyKey": "k"})).await;
        assert_eq!(payload(&res)["runId"], "k");
        let res = call(&rpc, &u2, "chat.send", json!({"message": "hi", "idempotencyKey": "k"})).await;
        assert_eq!(error_code(&res), ErrorCode::BadParams);
        assert_eq!(rpc.coordinator().aborts().len(), 1);
        assert_eq!(rpc.coordinator().in_flight_count(), 1);

        let res = call(&rpc, &u1, "chat.abort", json!({"sessionKey": "webchat:dm:u1"})).await;
        assert_eq!(payload(&res), json!({"aborted": true, "runIds": ["k"]}));

        engine.gate.notify_one();
        let events = events_until_terminal(&mut rx1).await;
        assert_eq!(events.last().unwrap().state, ChatEventState::Aborted);
        settle(&rpc).await;
        assert!(rpc.coordinator().aborts().is_empty());

        // The key is free again once its run has finished.
        engine.gate.notify_one();
        let res = call(&rpc, &u2, "chat.send", json!({"message": "hi", "idempotencyKey": "k"})).await;
        assert_eq!(payload(&res)["status"], "started");
    }

    #[tokio::test]
    async fn test_new_command_resets_session() {
        let engine: Arc<dyn AgentEngine> = Arc::new(ScriptedEngine::text(&["x"]));
        let Fixture { rpc, .. } = fixture(Some(engine));
        let (conn, mut rx) = connection("u1");
        let before = rpc
            .coordinator()
            .sessions()
            .resolve("webchat", "u1", ConversationKind::Direct, None);
        rpc.coordinator()
            .aborts()
            .register("stale", before.key.to_string(), None);

        let res = call(&rpc, &conn, "chat.send", json!({"message": " /new "})).await;
        assert_eq!(payload(&res), json!({"status": "reset", "message": RESET_REPLY}));
        assert_eq!(rpc.coordinator().sessions().size(), 0);
        assert!(rpc.coordinator().aborts().is_aborted("stale"));
        assert!(rx.try_recv().is_err());

        let res = call(&rpc, &conn, "chat.send", json!({"message": "hello"})).await;
        assert_eq!(payload(&res)["status"], "started");
        settle(&rpc).await;
        let after = rpc.coordinator().sessions().list_all().remove(0);
        assert_ne!(before.id, after.id);
    }
}
