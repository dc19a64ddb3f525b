//! Channel message shapes and engine output chunks.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::ConversationKind;

/// Kind of content carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    #[default]
    Text,
    Image,
    Audio,
    File,
    Rich,
}

/// Message body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContent {
    #[serde(rename = "type")]
    pub kind: ContentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
}

impl MessageContent {
    /// Plain text content.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: ContentKind::Text,
            text: Some(text.into()),
            media_url: None,
        }
    }
}

/// Message received from a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub id: String,
    pub channel_type: String,
    pub sender_id: String,
    pub sender_name: String,
    pub conversation: ConversationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub content: MessageContent,
    /// Receive timestamp (Unix epoch milliseconds).
    pub timestamp: i64,
}

impl InboundMessage {
    /// Direct text message from `sender_id` on `channel_type`.
    #[must_use]
    pub fn direct_text(
        id: impl Into<String>,
        channel_type: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        let sender_id = sender_id.into();
        Self {
            id: id.into(),
            channel_type: channel_type.into(),
            sender_name: sender_id.clone(),
            sender_id,
            conversation: ConversationKind::Direct,
            group_id: None,
            content: MessageContent::text(text),
            timestamp,
        }
    }

    /// Text body, empty when the message carries no text.
    #[must_use]
    pub fn text(&self) -> &str {
        self.content.text.as_deref().unwrap_or_default()
    }
}

/// Message pushed back out through a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub conversation: ConversationKind,
    /// Group id for group conversations, sender id otherwise.
    pub target_id: String,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,
}

impl OutboundMessage {
    /// Text reply addressed to the conversation `inbound` came from.
    #[must_use]
    pub fn reply_to(inbound: &InboundMessage, text: impl Into<String>) -> Self {
        let target_id = match (inbound.conversation, &inbound.group_id) {
            (ConversationKind::Group, Some(group)) => group.clone(),
            _ => inbound.sender_id.clone(),
        };
        Self {
            conversation: inbound.conversation,
            target_id,
            content: MessageContent::text(text),
            reply_to_message_id: Some(inbound.id.clone()),
        }
    }
}

/// Incremental engine output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Reply text.
    Text(String),
    /// Reasoning ("thinking") text.
    Reasoning(String),
}

/// Sink for incremental engine output.
pub type ChunkSender = mpsc::UnboundedSender<Chunk>;
