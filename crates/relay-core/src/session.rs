//! Conversation identity.

use std::{borrow::Cow, collections::HashMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Session identifier.
pub type SessionId = String;

/// Kind of conversation a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    /// One-to-one conversation with the sender.
    #[serde(rename = "dm")]
    Direct,
    /// Conversation inside a group.
    Group,
}

impl ConversationKind {
    /// Key segment used in the string form of a [`SessionKey`].
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "dm",
            Self::Group => "group",
        }
    }
}

/// Composite identity of a conversation.
///
/// Direct conversations ignore the group id; group conversations keep it.
/// Renders as `{channel}:dm:{sender}` or `{channel}:group:{group}:{sender}`.
/// `:` and `%` in the channel and group segments render as `%3A` and `%25`,
/// so distinct keys never share a string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SessionKey {
    channel_type: String,
    kind: ConversationKind,
    group_id: Option<String>,
    sender_id: String,
}

/// Failure to parse a [`SessionKey`] from its string form.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionKeyError {
    #[error("Malformed session key: {0}")]
    Malformed(String),
    #[error("Unknown conversation kind: {0}")]
    UnknownKind(String),
}

impl SessionKey {
    /// Build the key for a conversation.
    #[must_use]
    pub fn new(
        channel_type: impl Into<String>,
        sender_id: impl Into<String>,
        kind: ConversationKind,
        group_id: Option<&str>,
    ) -> Self {
        let group_id = match kind {
            ConversationKind::Direct => None,
            ConversationKind::Group => group_id.filter(|g| !g.is_empty()).map(str::to_owned),
        };
        Self {
            channel_type: channel_type.into(),
            kind,
            group_id,
            sender_id: sender_id.into(),
        }
    }

    /// Channel type the conversation arrived on.
    #[must_use]
    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    /// Conversation kind.
    #[must_use]
    pub const fn kind(&self) -> ConversationKind {
        self.kind
    }

    /// Group identifier for group conversations.
    #[must_use]
    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref()
    }

    /// Sender identifier.
    #[must_use]
    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ConversationKind::Direct => write!(
                f,
                "{}:dm:{}",
                escape_segment(&self.channel_type),
                self.sender_id
            ),
            ConversationKind::Group => write!(
                f,
                "{}:group:{}:{}",
                escape_segment(&self.channel_type),
                escape_segment(self.group_id.as_deref().unwrap_or_default()),
                self.sender_id
            ),
        }
    }
}

impl FromStr for SessionKey {
    type Err = SessionKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || SessionKeyError::Malformed(s.to_owned());
        let mut parts = s.splitn(3, ':');
        let channel = parts.next().filter(|c| !c.is_empty()).ok_or_else(malformed)?;
        let kind = parts.next().ok_or_else(malformed)?;
        let rest = parts.next().ok_or_else(malformed)?;

        let (kind, group, sender) = match kind {
            "dm" => (ConversationKind::Direct, None, rest),
            "group" => {
                let (group, sender) = rest.split_once(':').ok_or_else(malformed)?;
                (ConversationKind::Group, Some(group), sender)
            }
            other => return Err(SessionKeyError::UnknownKind(other.to_owned())),
        };

        if sender.is_empty() {
            return Err(malformed());
        }
        let group = group.map(unescape_segment);
        Ok(Self::new(unescape_segment(channel), sender, kind, group.as_deref()))
    }
}

fn escape_segment(segment: &str) -> Cow<'_, str> {
    if segment.contains([':', '%']) {
        Cow::Owned(segment.replace('%', "%25").replace(':', "%3A"))
    } else {
        Cow::Borrowed(segment)
    }
}

// Every `%` in an escaped segment starts a token, so the replacements cannot overlap.
fn unescape_segment(segment: &str) -> String {
    segment.replace("%3A", ":").replace("%25", "%")
}

impl From<SessionKey> for String {
    fn from(key: SessionKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for SessionKey {
    type Error = SessionKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Live conversation state owned by the session store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Unique session identifier.
    pub id: SessionId,
    /// Composite identity.
    pub key: SessionKey,
    /// Accumulated engine cost in USD.
    pub total_cost_usd: f64,
    /// Creation timestamp (Unix epoch milliseconds).
    pub created_at: i64,
    /// Last activity timestamp (Unix epoch milliseconds).
    pub last_active_at: i64,
    /// Arbitrary metadata for engine or channel needs.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Session {
    /// Create a fresh session stamped at `now`.
    #[must_use]
    pub fn new(id: SessionId, key: SessionKey, now: i64) -> Self {
        Self {
            id,
            key,
            total_cost_usd: 0.0,
            created_at: now,
            last_active_at: now,
            metadata: HashMap::new(),
        }
    }

    /// Get a metadata value by key.
    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Set a metadata value.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }
}
