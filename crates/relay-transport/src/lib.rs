//! WebSocket transport for the relay gateway.
//!
//! Provides:
//! - Wire frames (`req` / `res` / `event`) and chat event payloads
//! - The connect handshake with protocol negotiation
//! - Throttled streaming delivery of agent output
//! - RPC method routing
//! - The axum WebSocket endpoint (feature: websocket)

pub mod handshake;
pub mod protocol;
pub mod rpc;
pub mod streaming;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use handshake::{Handshake, HandshakeError, HandshakeStep};
pub use protocol::{ChatEventPayload, ChatEventState, ErrorCode, Frame, RequestFrame};
pub use rpc::{ConnectionInfo, RpcDispatcher, RpcError};
pub use streaming::{FrameSink, SinkError, StreamingDelivery};
