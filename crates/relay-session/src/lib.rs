//! Session orchestration and storage for the chat relay.
//!
//! Provides:
//! - `SessionStore` - Session identity, eviction and expiry
//! - `AbortRegistry` - Per-run cancellation bookkeeping
//! - `DispatchCoordinator` - Single-flight dispatch to the agent engine
//! - `ChatHistoryStore` - Chat transcript over a key/value store
//! - Storage implementations (memory)

pub mod abort;
pub mod dispatch;
pub mod history;
pub mod storage;
pub mod store;

pub use abort::{AbortRegistry, RunGuard};
pub use dispatch::{DispatchCoordinator, InFlightGuard};
pub use history::{ChatHistoryStore, MessageRole, StoredMessage};
pub use store::SessionStore;
