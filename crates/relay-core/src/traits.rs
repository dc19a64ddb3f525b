//! Traits for the collaborators the relay depends on.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{Chunk, ChunkSender, InboundMessage, OutboundMessage, Session};

/// Completed engine output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineReply {
    /// Full reply text.
    pub text: String,
    /// Cost incurred by the run in USD.
    pub cost_usd: f64,
}

impl EngineReply {
    /// Reply with no recorded cost.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            cost_usd: 0.0,
        }
    }
}

/// Engine error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine unavailable: {0}")]
    Unavailable(String),
    #[error("Engine run failed: {0}")]
    Failed(String),
    #[error("Engine run cancelled")]
    Cancelled,
}

/// Trait for agent engines that produce replies.
///
/// The relay never generates content itself; it only schedules calls into
/// an engine and moves the output to clients.
#[async_trait]
pub trait AgentEngine: Send + Sync {
    /// Engine name, used as its provider slot name.
    fn name(&self) -> &str;

    /// Produce a complete reply.
    async fn run(&self, session: &Session, text: &str) -> Result<EngineReply, EngineError>;

    /// Produce a reply while sending incremental output on `chunks`.
    ///
    /// Engines should check `cancel` between chunks. Cancellation is
    /// advisory: the relay keeps waiting for this future to finish.
    ///
    /// The default implementation calls [`AgentEngine::run`] and emits the
    /// whole reply as one chunk.
    async fn run_streaming(
        &self,
        session: &Session,
        text: &str,
        chunks: ChunkSender,
        cancel: CancellationToken,
    ) -> Result<EngineReply, EngineError> {
        let reply = self.run(session, text).await?;
        if !cancel.is_cancelled() {
            let _ = chunks.send(Chunk::Text(reply.text.clone()));
        }
        Ok(reply)
    }
}

/// Channel error.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel not started: {0}")]
    NotStarted(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Channel error: {0}")]
    Internal(String),
}

/// Inbound callback registered on a channel.
///
/// Receives the message and, for channels that can show progressive
/// output, a chunk sink.
pub type MessageHandler =
    Arc<dyn Fn(InboundMessage, Option<ChunkSender>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Trait for front-end channel adapters.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Channel type name, e.g. `"dingtalk"`.
    fn name(&self) -> &str;

    /// Begin receiving messages.
    async fn start(&self) -> Result<(), ChannelError>;

    /// Stop receiving messages.
    async fn stop(&self) -> Result<(), ChannelError>;

    /// Push a message back to the platform.
    async fn send_message(&self, message: OutboundMessage) -> Result<(), ChannelError>;

    /// Register the single inbound handler.
    fn on_message(&self, handler: MessageHandler);

    /// Whether the adapter is connected and healthy.
    fn is_healthy(&self) -> bool;
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Entry not found: {namespace}/{key}")]
    NotFound { namespace: String, key: String },
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Stored key/value entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEntry {
    pub key: String,
    pub value: String,
    /// Creation timestamp (Unix epoch milliseconds).
    pub created_at: i64,
}

/// Trait for namespaced key/value backends.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Get a value.
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StorageError>;

    /// Set a value, optionally expiring after `ttl_secs`.
    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: String,
        ttl_secs: Option<u64>,
    ) -> Result<(), StorageError>;

    /// Delete a value. Returns whether it existed.
    async fn delete(&self, namespace: &str, key: &str) -> Result<bool, StorageError>;

    /// List live entries, optionally restricted to keys starting with `prefix`.
    async fn list(
        &self,
        namespace: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<MemoryEntry>, StorageError>;
}

/// Trait for skills an engine can use.
pub trait Skill: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
}
