//! Built-in engine that streams the message back word by word.

use std::time::Duration;

use async_trait::async_trait;
use relay_core::{AgentEngine, Chunk, ChunkSender, EngineError, EngineReply, Session};
use tokio_util::sync::CancellationToken;

/// Provider name of [`EchoEngine`].
pub const ECHO_PROVIDER: &str = "echo";

/// Replies with the incoming text.
#[derive(Debug, Clone, Default)]
pub struct EchoEngine {
    /// Pause between streamed words.
    chunk_delay: Duration,
}

impl EchoEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }
}

#[async_trait]
impl AgentEngine for EchoEngine {
    fn name(&self) -> &str {
        ECHO_PROVIDER
    }

    async fn run(&self, _session: &Session, text: &str) -> Result<EngineReply, EngineError> {
        Ok(EngineReply::text(text))
    }

    async fn run_streaming(
        &self,
        _session: &Session,
        text: &str,
        chunks: ChunkSender,
        cancel: CancellationToken,
    ) -> Result<EngineReply, EngineError> {
        for word in text.split_inclusive(' ') {
            if !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if chunks.send(Chunk::Text(word.to_owned())).is_err() {
                return Err(EngineError::Failed("chunk receiver dropped".into()));
            }
        }
        Ok(EngineReply::text(text))
    }
}
