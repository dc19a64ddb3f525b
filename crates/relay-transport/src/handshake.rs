//! Connection handshake.
//!
//! The server opens with a `connect.challenge` event. The client answers
//! with a `connect` request offering a protocol range; the server either
//! accepts with `hello-ok` or rejects and closes with
//! [`CLOSE_VERSION_MISMATCH`]. No other request is served before that.

use relay_core::config::ProtocolConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::{ErrorCode, Frame, error_response, event_frame, ok_response, parse_request};

/// Event opening every connection.
pub const CHALLENGE_EVENT: &str = "connect.challenge";
/// Method completing the handshake.
pub const CONNECT_METHOD: &str = "connect";
/// Close code sent when protocol ranges do not overlap.
pub const CLOSE_VERSION_MISMATCH: u16 = 4002;
/// Close code sent when the client does not finish the handshake in time.
pub const CLOSE_HANDSHAKE_TIMEOUT: u16 = 4001;

/// RPC methods advertised in `hello-ok`.
pub const SUPPORTED_METHODS: &[&str] = &[
    "chat.send",
    "chat.history",
    "chat.abort",
    "sessions.list",
    "sessions.delete",
    "skills.status",
    "health",
    "status",
];

/// Events advertised in `hello-ok`.
pub const SUPPORTED_EVENTS: &[&str] = &["chat"];

/// Handshake error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Protocol range [{client_min}, {client_max}] does not overlap server range [{server_min}, {server_max}]")]
    VersionMismatch {
        client_min: u32,
        client_max: u32,
        server_min: u32,
        server_max: u32,
    },
    #[error("Invalid connect params: {0}")]
    InvalidParams(String),
    #[error("Handshake timed out")]
    Timeout,
    #[error("Connection closed during handshake")]
    Closed,
}

/// `connect.challenge` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengePayload {
    pub nonce: String,
    pub ts: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(default)]
    pub id: Option<String>,
}

/// `connect` request params.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    #[serde(default)]
    pub min_protocol: Option<u32>,
    #[serde(default)]
    pub max_protocol: Option<u32>,
    #[serde(default)]
    pub client: Option<ClientInfo>,
    #[serde(default)]
    pub device: Option<DeviceInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub version: String,
    pub conn_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

/// `hello-ok` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloOk {
    pub protocol: u32,
    pub server: ServerInfo,
    pub features: Features,
}

/// Pick the protocol version for a client offer.
///
/// The highest version both sides support wins. A missing bound defaults
/// to the server's maximum.
///
/// # Errors
/// Returns error if the ranges do not overlap.
pub fn negotiate(params: &ConnectParams, config: &ProtocolConfig) -> Result<u32, HandshakeError> {
    let client_min = params.min_protocol.unwrap_or(config.max_version);
    let client_max = params.max_protocol.unwrap_or(config.max_version);
    let protocol = client_max.min(config.max_version);

    if client_min > client_max || protocol < client_min.max(config.min_version) {
        return Err(HandshakeError::VersionMismatch {
            client_min,
            client_max,
            server_min: config.min_version,
            server_max: config.max_version,
        });
    }
    Ok(protocol)
}

/// Result of feeding one client message to a [`Handshake`].
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeStep {
    /// Handshake complete; send `response` and start serving requests.
    Accepted {
        response: Frame,
        protocol: u32,
        device_id: Option<String>,
    },
    /// Send `response`, then close with [`CLOSE_VERSION_MISMATCH`].
    Rejected { response: Frame, error: HandshakeError },
    /// Send `response` and keep waiting for `connect`.
    Reply(Frame),
    /// Nothing to answer; keep waiting.
    Ignore,
}

/// Server side of one connection's handshake.
#[derive(Debug, Clone)]
pub struct Handshake {
    conn_id: String,
    nonce: String,
    server_version: String,
    config: ProtocolConfig,
}

impl Handshake {
    #[must_use]
    pub fn new(conn_id: impl Into<String>, server_version: impl Into<String>, config: ProtocolConfig) -> Self {
        Self {
            conn_id: conn_id.into(),
            nonce: Uuid::new_v4().to_string(),
            server_version: server_version.into(),
            config,
        }
    }

    #[must_use]
    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    /// Opening `connect.challenge` event.
    #[must_use]
    pub fn challenge(&self, now_millis: i64) -> Frame {
        let payload = ChallengePayload {
            nonce: self.nonce.clone(),
            ts: now_millis,
        };
        event_frame(CHALLENGE_EVENT, serde_json::to_value(payload).ok(), None)
    }

    /// Handle one text message received before the handshake completed.
    #[must_use]
    pub fn handle(&self, raw: &str) -> HandshakeStep {
        let request = match parse_request(raw) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(conn_id = %self.conn_id, error = %e, "Malformed frame during handshake");
                return e.request_id().map_or(HandshakeStep::Ignore, |id| {
                    HandshakeStep::Reply(error_response(id, ErrorCode::InvalidFrame, e.to_string()))
                });
            }
        };

        if request.method != CONNECT_METHOD {
            return HandshakeStep::Reply(error_response(
                request.id,
                ErrorCode::InvalidFrame,
                "Handshake required: send connect first",
            ));
        }

        let params: ConnectParams = match request.params.map(serde_json::from_value).transpose() {
            Ok(params) => params.unwrap_or_default(),
            Err(e) => {
                return HandshakeStep::Reply(error_response(
                    request.id,
                    ErrorCode::BadParams,
                    HandshakeError::InvalidParams(e.to_string()).to_string(),
                ));
            }
        };

        match negotiate(&params, &self.config) {
            Ok(protocol) => {
                let device_id = params
                    .device
                    .and_then(|d| d.id)
                    .filter(|id| !id.is_empty());
                tracing::info!(conn_id = %self.conn_id, protocol, device_id = ?device_id, "Handshake completed");
                HandshakeStep::Accepted {
                    response: ok_response(request.id, Some(self.hello_ok(protocol))),
                    protocol,
                    device_id,
                }
            }
            Err(e) => {
                tracing::warn!(conn_id = %self.conn_id, error = %e, "Handshake rejected");
                HandshakeStep::Rejected {
                    response: error_response(request.id, ErrorCode::BadParams, e.to_string()),
                    error: e,
                }
            }
        }
    }

    fn hello_ok(&self, protocol: u32) -> Value {
        let hello = HelloOk {
            protocol,
            server: ServerInfo {
                version: self.server_version.clone(),
                conn_id: self.conn_id.clone(),
            },
            features: Features {
                methods: SUPPORTED_METHODS.iter().map(|m| (*m).to_owned()).collect(),
                events: SUPPORTED_EVENTS.iter().map(|e| (*e).to_owned()).collect(),
            },
        };
        serde_json::to_value(hello).unwrap_or_else(|_| json!({ "protocol": protocol }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResponseFrame;

    fn config(min: u32, max: u32) -> ProtocolConfig {
        ProtocolConfig {
            min_version: min,
            max_version: max,
            ..ProtocolConfig::default()
        }
    }

    fn offer(min: Option<u32>, max: Option<u32>) -> ConnectParams {
        ConnectParams {
            min_protocol: min,
            max_protocol: max,
            ..ConnectParams::default()
        }
    }

    fn response(frame: &Frame) -> &ResponseFrame {
        match frame {
            Frame::Response(res) => res,
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_negotiate_picks_highest_common_version() {
        assert_eq!(negotiate(&offer(Some(1), Some(9)), &config(3, 5)), Ok(5));
        assert_eq!(negotiate(&offer(Some(2), Some(4)), &config(3, 5)), Ok(4));
        assert_eq!(negotiate(&offer(Some(3), Some(3)), &config(3, 3)), Ok(3));
    }

    #[test]
    fn test_negotiate_defaults_missing_bounds() {
        assert_eq!(negotiate(&offer(None, None), &config(3, 3)), Ok(3));
        assert_eq!(negotiate(&offer(Some(1), None), &config(2, 4)), Ok(4));
    }

    #[test]
    fn test_negotiate_rejects_disjoint_ranges() {
        assert!(matches!(
            negotiate(&offer(Some(1), Some(2)), &config(3, 3)),
            Err(HandshakeError::VersionMismatch { .. })
        ));
        assert!(negotiate(&offer(Some(4), Some(5)), &config(3, 3)).is_err());
        assert!(negotiate(&offer(Some(5), Some(4)), &config(3, 9)).is_err());
    }

    #[test]
    fn test_challenge_frame() {
        let hs = Handshake::new("conn-1", "0.1.0", config(3, 3));
        let Frame::Event(event) = hs.challenge(42) else {
            panic!("expected event");
        };
        assert_eq!(event.event, CHALLENGE_EVENT);
        let payload: ChallengePayload = serde_json::from_value(event.payload.unwrap()).unwrap();
        assert_eq!(payload.ts, 42);
        assert!(!payload.nonce.is_empty());
    }

    #[test]
    fn test_connect_accepted() {
        let hs = Handshake::new("conn-1", "0.1.0", config(3, 3));
        let step = hs.handle(
            r#"{"type":"req","id":"c1","method":"connect","params":{"minProtocol":3,"maxProtocol":3,"device":{"id":"dev-9"}}}"#,
        );
        let HandshakeStep::Accepted {
            response: frame,
            protocol,
            device_id,
        } = step
        else {
            panic!("expected accepted");
        };
        assert_eq!(protocol, 3);
        assert_eq!(device_id.as_deref(), Some("dev-9"));

        let res = response(&frame);
        assert!(res.ok);
        assert_eq!(res.id, "c1");
        let hello: HelloOk = serde_json::from_value(res.payload.clone().unwrap()).unwrap();
        assert_eq!(hello.server.conn_id, "conn-1");
        assert!(hello.features.methods.iter().any(|m| m == "chat.send"));
        assert_eq!(hello.features.events, vec!["chat".to_owned()]);
    }

    #[test]
    fn test_connect_rejected_on_version_mismatch() {
        let hs = Handshake::new("conn-1", "0.1.0", config(3, 3));
        let step = hs.handle(r#"{"type":"req","id":"c1","method":"connect","params":{"minProtocol":1,"maxProtocol":2}}"#);
        let HandshakeStep::Rejected { response: frame, .. } = step else {
            panic!("expected rejection");
        };
        let res = response(&frame);
        assert!(!res.ok);
        assert_eq!(res.error.as_ref().unwrap().code, ErrorCode::BadParams);
    }

    #[test]
    fn test_requests_before_connect_are_invalid() {
        let hs = Handshake::new("conn-1", "0.1.0", config(3, 3));
        let HandshakeStep::Reply(frame) = hs.handle(r#"{"type":"req","id":"r1","method":"health"}"#)
        else {
            panic!("expected reply");
        };
        assert_eq!(response(&frame).error.as_ref().unwrap().code, ErrorCode::InvalidFrame);

        assert_eq!(hs.handle("garbage"), HandshakeStep::Ignore);
    }

    #[test]
    fn test_bad_connect_params() {
        let hs = Handshake::new("conn-1", "0.1.0", config(3, 3));
        let HandshakeStep::Reply(frame) =
            hs.handle(r#"{"type":"req","id":"c1","method":"connect","params":{"minProtocol":"three"}}"#)
        else {
            panic!("expected reply");
        };
        assert_eq!(response(&frame).error.as_ref().unwrap().code, ErrorCode::BadParams);
    }
}
