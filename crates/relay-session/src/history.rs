//! Per-session chat transcript on top of a [`MemoryStore`].
//!
//! Each message is one entry in the `chat-history:{sessionKey}` namespace.
//! Keys are `msg:{timestamp}:{seq}`, zero-padded so lexical order is
//! insertion order.
//!
//! Each sender also gets a short rolling list of exchange summaries in the
//! `user:{senderId}` namespace, capped at [`MAX_SUMMARIES`] and expiring
//! after [`SUMMARY_TTL_SECS`].

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use relay_core::{Clock, MemoryStore, StorageError};
use serde::{Deserialize, Serialize};

const NAMESPACE_PREFIX: &str = "chat-history:";
const KEY_PREFIX: &str = "msg:";
const SUMMARY_NAMESPACE_PREFIX: &str = "user:";
const SUMMARY_KEY_PREFIX: &str = "summary:";
const SUMMARY_QUESTION_CHARS: usize = 100;
const SUMMARY_ANSWER_CHARS: usize = 200;

/// Lifetime of a stored exchange summary (7 days).
pub const SUMMARY_TTL_SECS: u64 = 7 * 24 * 60 * 60;
/// Summaries kept per sender.
pub const MAX_SUMMARIES: usize = 5;

/// Default number of messages returned by [`ChatHistoryStore::get_history`].
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Author of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One stored transcript message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub role: MessageRole,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub timestamp: i64,
}

/// Chat transcript store.
pub struct ChatHistoryStore {
    memory: Arc<dyn MemoryStore>,
    clock: Arc<dyn Clock>,
    seq: AtomicU64,
}

impl ChatHistoryStore {
    #[must_use]
    pub fn new(memory: Arc<dyn MemoryStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            memory,
            clock,
            seq: AtomicU64::new(0),
        }
    }

    fn namespace(session_key: &str) -> String {
        format!("{NAMESPACE_PREFIX}{session_key}")
    }

    fn next_key(&self, prefix: &str) -> (i64, String) {
        let timestamp = self.clock.now_millis();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) % 1_000_000;
        (timestamp, format!("{prefix}{timestamp:013}:{seq:06}"))
    }

    /// Append a message, stamping it with the current time.
    ///
    /// # Errors
    /// Returns error if the backing store rejects the write.
    pub async fn append(
        &self,
        session_key: &str,
        role: MessageRole,
        text: impl Into<String>,
        thinking: Option<String>,
        run_id: Option<&str>,
    ) -> Result<(), StorageError> {
        let (timestamp, key) = self.next_key(KEY_PREFIX);
        let message = StoredMessage {
            role,
            text: text.into(),
            thinking: thinking.filter(|t| !t.is_empty()),
            run_id: run_id.map(str::to_owned),
            timestamp,
        };
        let value =
            serde_json::to_string(&message).map_err(|e| StorageError::Internal(e.to_string()))?;
        self.memory
            .set(&Self::namespace(session_key), &key, value, None)
            .await
    }

    /// Most recent `limit` messages of a session, oldest first.
    ///
    /// Entries that fail to decode are skipped.
    ///
    /// # Errors
    /// Returns error if the backing store cannot be read.
    pub async fn get_history(
        &self,
        session_key: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StorageError> {
        let mut entries = self
            .memory
            .list(&Self::namespace(session_key), Some(KEY_PREFIX))
            .await?;
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        let skip = entries.len().saturating_sub(limit);
        Ok(entries
            .into_iter()
            .skip(skip)
            .filter_map(|entry| match serde_json::from_str(&entry.value) {
                Ok(message) => Some(message),
                Err(e) => {
                    tracing::warn!(session_key, key = %entry.key, error = %e, "Skipping undecodable history entry");
                    None
                }
            })
            .collect())
    }

    /// Record a truncated summary of one exchange for `sender_id`, dropping
    /// the oldest summaries beyond [`MAX_SUMMARIES`].
    ///
    /// # Errors
    /// Returns error if the backing store fails.
    pub async fn store_summary(
        &self,
        sender_id: &str,
        question: &str,
        answer: &str,
    ) -> Result<(), StorageError> {
        let namespace = format!("{SUMMARY_NAMESPACE_PREFIX}{sender_id}");
        let summary = format!(
            "Q: {} → A: {}",
            truncate_chars(question, SUMMARY_QUESTION_CHARS),
            truncate_chars(answer, SUMMARY_ANSWER_CHARS)
        );
        let (_, key) = self.next_key(SUMMARY_KEY_PREFIX);
        self.memory
            .set(&namespace, &key, summary, Some(SUMMARY_TTL_SECS))
            .await?;

        let mut entries = self.memory.list(&namespace, Some(SUMMARY_KEY_PREFIX)).await?;
        if entries.len() > MAX_SUMMARIES {
            entries.sort_by(|a, b| a.key.cmp(&b.key));
            let excess = entries.len() - MAX_SUMMARIES;
            for entry in entries.into_iter().take(excess) {
                self.memory.delete(&namespace, &entry.key).await?;
            }
        }
        Ok(())
    }

    /// Live summaries of `sender_id`, oldest first.
    ///
    /// # Errors
    /// Returns error if the backing store cannot be read.
    pub async fn summaries(&self, sender_id: &str) -> Result<Vec<String>, StorageError> {
        let namespace = format!("{SUMMARY_NAMESPACE_PREFIX}{sender_id}");
        let mut entries = self.memory.list(&namespace, Some(SUMMARY_KEY_PREFIX)).await?;
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries.into_iter().map(|e| e.value).collect())
    }

    /// Delete every stored message of a session. Returns how many were removed.
    ///
    /// # Errors
    /// Returns error if the backing store fails.
    pub async fn clear(&self, session_key: &str) -> Result<usize, StorageError> {
        let namespace = Self::namespace(session_key);
        let entries = self.memory.list(&namespace, Some(KEY_PREFIX)).await?;
        let mut removed = 0;
        for entry in entries {
            if self.memory.delete(&namespace, &entry.key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn truncate_chars(text: &str, max: usize) -> &str {
    text.char_indices().nth(max).map_or(text, |(end, _)| &text[..end])
}
