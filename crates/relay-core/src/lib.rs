//! Core data model and collaborator traits for the chat relay.
//!
//! This crate provides the fundamental building blocks:
//! - `Session` - Conversation identity and its composite key
//! - `InboundMessage` / `OutboundMessage` - Channel message shapes
//! - `AgentEngine`, `ChannelAdapter`, `MemoryStore`, `Skill` - External collaborators
//! - `PluginRegistry` - Capability-typed registry of collaborators
//! - `GatewayConfig` - Configuration consumed by every component
//! - `Clock` - Injectable time source

pub mod clock;
pub mod config;
pub mod message;
pub mod plugin;
pub mod session;
pub mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, GatewayConfig};
pub use message::{Chunk, ChunkSender, InboundMessage, MessageContent, OutboundMessage};
pub use plugin::{Capability, Plugin, PluginRegistry, RegistryError};
pub use session::{ConversationKind, Session, SessionId, SessionKey};
pub use traits::{
    AgentEngine, ChannelAdapter, ChannelError, EngineError, EngineReply, MemoryEntry, MemoryStore,
    MessageHandler, Skill, StorageError,
};
