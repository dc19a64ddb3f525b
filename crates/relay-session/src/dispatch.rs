//! Single-flight dispatch of inbound messages to the agent engine.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use relay_core::{
    AgentEngine, ChannelAdapter, ChunkSender, InboundMessage, OutboundMessage, Session, SessionId,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    AbortRegistry, SessionStore,
    history::{ChatHistoryStore, MessageRole},
};

/// Reply when the session is still working on a previous message.
pub const BUSY_REPLY: &str = "Still working on your previous message, please try again shortly.";
/// Reply to a message with no text.
pub const EMPTY_TEXT_REPLY: &str = "Please send a text message.";
/// Reply when no agent engine is configured.
pub const UNAVAILABLE_REPLY: &str = "The assistant is not available right now.";
/// Reply when the engine fails.
pub const FALLBACK_REPLY: &str = "Sorry, something went wrong while handling your message. Please try again later.";
/// Reply confirming a `/new` reset.
pub const RESET_REPLY: &str = "Session reset. Your next message starts a new conversation.";

/// Command that discards the current session.
pub const NEW_SESSION_COMMAND: &str = "/new";

type InFlightSet = Arc<Mutex<HashSet<SessionId>>>;

fn lock(set: &InFlightSet) -> MutexGuard<'_, HashSet<SessionId>> {
    set.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks a session busy until dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: InFlightSet,
    session_id: SessionId,
}

impl InFlightGuard {
    /// Session this guard holds.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.in_flight).remove(&self.session_id);
    }
}

/// Routes inbound messages to the engine, one run per session at a time.
pub struct DispatchCoordinator {
    sessions: Arc<SessionStore>,
    aborts: Arc<AbortRegistry>,
    engine: Option<Arc<dyn AgentEngine>>,
    history: Option<Arc<ChatHistoryStore>>,
    in_flight: InFlightSet,
}

impl DispatchCoordinator {
    /// Create a coordinator. Without an engine every run is answered with
    /// [`UNAVAILABLE_REPLY`].
    #[must_use]
    pub fn new(
        sessions: Arc<SessionStore>,
        aborts: Arc<AbortRegistry>,
        engine: Option<Arc<dyn AgentEngine>>,
    ) -> Self {
        Self {
            sessions,
            aborts,
            engine,
            history: None,
            in_flight: Arc::default(),
        }
    }

    /// Record every completed exchange in `history`.
    #[must_use]
    pub fn with_history(mut self, history: Arc<ChatHistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    #[must_use]
    pub const fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    #[must_use]
    pub const fn aborts(&self) -> &Arc<AbortRegistry> {
        &self.aborts
    }

    #[must_use]
    pub fn engine(&self) -> Option<Arc<dyn AgentEngine>> {
        self.engine.clone()
    }

    #[must_use]
    pub const fn history(&self) -> Option<&Arc<ChatHistoryStore>> {
        self.history.as_ref()
    }

    /// Mark a session busy. Returns `None` if it already is.
    #[must_use]
    pub fn try_acquire(&self, session_id: &str) -> Option<InFlightGuard> {
        if !lock(&self.in_flight).insert(session_id.to_owned()) {
            return None;
        }
        Some(InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            session_id: session_id.to_owned(),
        })
    }

    #[must_use]
    pub fn is_in_flight(&self, session_id: &str) -> bool {
        lock(&self.in_flight).contains(session_id)
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Abort a session's runs and drop it. Returns whether it existed.
    pub fn reset_session(&self, session: &Session) -> bool {
        self.aborts.abort_by_session(&session.key.to_string());
        self.sessions.remove(&session.id)
    }

    /// Handle one inbound message and return the reply text.
    ///
    /// With `chunks`, the engine's streaming entry point is used and
    /// incremental output goes to the sink; the return value is still the
    /// full reply.
    pub async fn handle_message(
        &self,
        inbound: &InboundMessage,
        chunks: Option<ChunkSender>,
    ) -> String {
        let text = inbound.text();
        let session = self.sessions.resolve(
            &inbound.channel_type,
            &inbound.sender_id,
            inbound.conversation,
            inbound.group_id.as_deref(),
        );

        if text.trim() == NEW_SESSION_COMMAND {
            self.reset_session(&session);
            tracing::info!(session_id = %session.id, "Session reset by command");
            return RESET_REPLY.to_owned();
        }

        let Some(_guard) = self.try_acquire(&session.id) else {
            tracing::warn!(session_id = %session.id, "Session busy, message rejected");
            return BUSY_REPLY.to_owned();
        };

        tracing::info!(
            session_id = %session.id,
            sender_id = %inbound.sender_id,
            channel_type = %inbound.channel_type,
            "Routing message to engine"
        );

        if text.trim().is_empty() {
            return EMPTY_TEXT_REPLY.to_owned();
        }

        let Some(engine) = self.engine.clone() else {
            tracing::warn!(session_id = %session.id, "No agent engine configured");
            return UNAVAILABLE_REPLY.to_owned();
        };

        let run_id = Uuid::new_v4().to_string();
        let session_key = session.key.to_string();
        let cancel = CancellationToken::new();
        let Some(run) = self
            .aborts
            .track(run_id.clone(), session_key.clone(), Some(cancel.clone()))
        else {
            tracing::error!(run_id = %run_id, "Run id collision");
            return FALLBACK_REPLY.to_owned();
        };

        let result = match chunks {
            Some(chunks) => engine.run_streaming(&session, text, chunks, cancel).await,
            None => engine.run(&session, text).await,
        };
        drop(run);

        match result {
            Ok(reply) => {
                self.sessions.add_cost(&session.id, reply.cost_usd);
                self.record_exchange(&session_key, &inbound.sender_id, text, &reply.text, &run_id)
                    .await;
                reply.text
            }
            Err(e) => {
                tracing::error!(session_id = %session.id, run_id = %run_id, error = %e, "Engine run failed");
                FALLBACK_REPLY.to_owned()
            }
        }
    }

    async fn record_exchange(
        &self,
        session_key: &str,
        sender_id: &str,
        question: &str,
        answer: &str,
        run_id: &str,
    ) {
        let Some(history) = &self.history else {
            return;
        };
        let stored = async {
            history
                .append(session_key, MessageRole::User, question, None, None)
                .await?;
            history
                .append(session_key, MessageRole::Assistant, answer, None, Some(run_id))
                .await?;
            history.store_summary(sender_id, question, answer).await
        };
        if let Err(e) = stored.await {
            tracing::warn!(session_key, error = %e, "Failed to record chat history");
        }
    }

    /// Install this coordinator as the adapter's inbound handler.
    ///
    /// Replies are pushed back through [`ChannelAdapter::send_message`].
    pub fn bind_channel(self: &Arc<Self>, adapter: &Arc<dyn ChannelAdapter>) {
        let coordinator = Arc::clone(self);
        let channel = Arc::downgrade(adapter);
        let name = adapter.name().to_owned();

        adapter.on_message(Arc::new(move |inbound, chunks| {
            let coordinator = Arc::clone(&coordinator);
            let channel = channel.clone();
            Box::pin(async move {
                let reply = coordinator.handle_message(&inbound, chunks).await;
                let Some(channel) = channel.upgrade() else {
                    tracing::debug!(message_id = %inbound.id, "Channel dropped before reply");
                    return;
                };
                if let Err(e) = channel
                    .send_message(OutboundMessage::reply_to(&inbound, reply))
                    .await
                {
                    tracing::warn!(channel = %channel.name(), error = %e, "Failed to deliver reply");
                }
            })
        }));
        tracing::info!(channel = %name, "Channel bound to dispatcher");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use relay_core::{
        Chunk, ChannelError, Clock, EngineError, EngineReply, ManualClock, MemoryStore,
        MessageHandler, config::SessionConfig,
    };
    use tokio::sync::{Notify, mpsc};

    use super::*;
    use crate::storage::InMemoryStore;

    #[derive(Default)]
    struct GatedEngine {
        calls: AtomicUsize,
        started: Notify,
        gate: Notify,
    }

    #[async_trait]
    impl AgentEngine for GatedEngine {
        fn name(&self) -> &str {
            "gated"
        }

        async fn run(&self, _session: &Session, text: &str) -> Result<EngineReply, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            self.gate.notified().await;
            Ok(EngineReply {
                text: format!("echo: {text}"),
                cost_usd: 0.25,
            })
        }
    }

    struct FailingEngine;

    #[async_trait]
    impl AgentEngine for FailingEngine {
        fn name(&self) -> &str {
            "failing"
        }

        async fn run(&self, _session: &Session, _text: &str) -> Result<EngineReply, EngineError> {
            Err(EngineError::Failed("boom".into()))
        }
    }

    fn coordinator(engine: Option<Arc<dyn AgentEngine>>) -> Arc<DispatchCoordinator> {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000));
        let sessions = Arc::new(SessionStore::new(SessionConfig::default(), clock));
        Arc::new(DispatchCoordinator::new(
            sessions,
            Arc::new(AbortRegistry::new()),
            engine,
        ))
    }

    fn message(text: &str) -> InboundMessage {
        InboundMessage::direct_text("m1", "http", "u1", text, 0)
    }

    #[tokio::test]
    async fn test_overlapping_messages_get_busy_reply() {
        let engine = Arc::new(GatedEngine::default());
        let dispatcher = coordinator(Some(Arc::clone(&engine) as Arc<dyn AgentEngine>));

        let first = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.handle_message(&message("hi"), None).await }
        });
        engine.started.notified().await;

        assert_eq!(dispatcher.handle_message(&message("again"), None).await, BUSY_REPLY);
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.in_flight_count(), 1);

        engine.gate.notify_one();
        assert_eq!(first.await.unwrap(), "echo: hi");
        assert_eq!(dispatcher.in_flight_count(), 0);
        assert!(dispatcher.aborts().is_empty());

        // Free again once the first run finished.
        engine.gate.notify_one();
        assert_eq!(dispatcher.handle_message(&message("third"), None).await, "echo: third");
        assert_eq!(engine.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_engine_failure_returns_fallback_and_clears_busy() {
        let dispatcher = coordinator(Some(Arc::new(FailingEngine)));
        assert_eq!(dispatcher.handle_message(&message("hi"), None).await, FALLBACK_REPLY);

        let session = dispatcher.sessions().list_all().remove(0);
        assert!(!dispatcher.is_in_flight(&session.id));
        assert!(dispatcher.try_acquire(&session.id).is_some());
    }

    #[tokio::test]
    async fn test_empty_text_skips_engine() {
        let engine = Arc::new(GatedEngine::default());
        let dispatcher = coordinator(Some(Arc::clone(&engine) as Arc<dyn AgentEngine>));

        assert_eq!(dispatcher.handle_message(&message("   "), None).await, EMPTY_TEXT_REPLY);
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_engine_is_unavailable() {
        let dispatcher = coordinator(None);
        assert_eq!(dispatcher.handle_message(&message("hi"), None).await, UNAVAILABLE_REPLY);
        assert_eq!(dispatcher.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_new_command_resets_session() {
        let engine = Arc::new(GatedEngine::default());
        let dispatcher = coordinator(Some(Arc::clone(&engine) as Arc<dyn AgentEngine>));
        engine.gate.notify_one();
        dispatcher.handle_message(&message("hi"), None).await;
        let before = dispatcher.sessions().list_all().remove(0);

        assert_eq!(dispatcher.handle_message(&message(" /new "), None).await, RESET_REPLY);
        assert_eq!(dispatcher.sessions().size(), 0);

        engine.gate.notify_one();
        dispatcher.handle_message(&message("hello"), None).await;
        let after = dispatcher.sessions().list_all().remove(0);
        assert_ne!(before.id, after.id);
    }

    #[tokio::test]
    async fn test_cost_accumulates_and_history_recorded() {
        let engine = Arc::new(GatedEngine::default());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000));
        let memory: Arc<dyn MemoryStore> = Arc::new(InMemoryStore::with_clock(Arc::clone(&clock)));
        let history = Arc::new(ChatHistoryStore::new(memory, Arc::clone(&clock)));
        let dispatcher = DispatchCoordinator::new(
            Arc::new(SessionStore::new(SessionConfig::default(), clock)),
            Arc::new(AbortRegistry::new()),
            Some(Arc::clone(&engine) as Arc<dyn AgentEngine>),
        )
        .with_history(Arc::clone(&history));

        for text in ["one", "two"] {
            engine.gate.notify_one();
            dispatcher.handle_message(&message(text), None).await;
        }

        let session = dispatcher.sessions().list_all().remove(0);
        assert!((session.total_cost_usd - 0.5).abs() < f64::EPSILON);
        let stored = history.get_history(&session.key.to_string(), 10).await.unwrap();
        let texts: Vec<&str> = stored.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "echo: one", "two", "echo: two"]);
        assert_eq!(
            history.summaries("u1").await.unwrap(),
            vec!["Q: one → A: echo: one", "Q: two → A: echo: two"]
        );
    }

    #[tokio::test]
    async fn test_dropped_run_releases_bookkeeping() {
        let engine = Arc::new(GatedEngine::default());
        let dispatcher = coordinator(Some(Arc::clone(&engine) as Arc<dyn AgentEngine>));

        let task = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.handle_message(&message("hi"), None).await }
        });
        engine.started.notified().await;
        assert_eq!(dispatcher.aborts().len(), 1);
        assert_eq!(dispatcher.in_flight_count(), 1);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(dispatcher.aborts().is_empty());
        assert_eq!(dispatcher.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_streaming_sink_receives_reply() {
        let engine = Arc::new(GatedEngine::default());
        let dispatcher = coordinator(Some(Arc::clone(&engine) as Arc<dyn AgentEngine>));
        let (tx, mut rx) = mpsc::unbounded_channel();

        engine.gate.notify_one();
        let reply = dispatcher.handle_message(&message("hi"), Some(tx)).await;
        assert_eq!(reply, "echo: hi");
        assert_eq!(rx.recv().await, Some(Chunk::Text("echo: hi".into())));
    }

    #[derive(Default)]
    struct MockChannel {
        handler: Mutex<Option<MessageHandler>>,
        sent: Mutex<Vec<OutboundMessage>>,
    }

    #[async_trait]
    impl ChannelAdapter for MockChannel {
        fn name(&self) -> &str {
            "mock"
        }

        async fn start(&self) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn stop(&self) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn send_message(&self, message: OutboundMessage) -> Result<(), ChannelError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        fn on_message(&self, handler: MessageHandler) {
            *self.handler.lock().unwrap() = Some(handler);
        }

        fn is_healthy(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_bind_channel_routes_replies() {
        let dispatcher = coordinator(None);
        let channel = Arc::new(MockChannel::default());
        let adapter: Arc<dyn ChannelAdapter> = Arc::clone(&channel) as Arc<dyn ChannelAdapter>;
        dispatcher.bind_channel(&adapter);

        let handler = channel.handler.lock().unwrap().clone().unwrap();
        handler(message("hi"), None).await;

        let sent = channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target_id, "u1");
        assert_eq!(sent[0].content.text.as_deref(), Some(UNAVAILABLE_REPLY));
        assert_eq!(sent[0].reply_to_message_id.as_deref(), Some("m1"));
    }
}
