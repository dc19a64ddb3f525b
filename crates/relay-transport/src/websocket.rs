//! WebSocket endpoint serving the RPC protocol.

use std::sync::Arc;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use relay_core::{Clock, config::ProtocolConfig};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    handshake::{
        CLOSE_HANDSHAKE_TIMEOUT, CLOSE_VERSION_MISMATCH, Handshake, HandshakeError, HandshakeStep,
    },
    protocol::{ErrorCode, Frame, error_response, parse_request},
    rpc::{ConnectionInfo, RpcDispatcher},
};

type WsSender = SplitSink<WebSocket, Message>;
type WsReceiver = SplitStream<WebSocket>;

/// WebSocket handler state.
pub struct WsState {
    pub dispatcher: Arc<RpcDispatcher>,
    pub protocol: ProtocolConfig,
    /// Reported in `hello-ok`.
    pub server_version: String,
    pub clock: Arc<dyn Clock>,
}

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<WsState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<WsState>) {
    let conn_id = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();

    let handshake = Handshake::new(
        conn_id.clone(),
        state.server_version.clone(),
        state.protocol.clone(),
    );
    if send_frame(&mut sender, &handshake.challenge(state.clock.now_millis()))
        .await
        .is_err()
    {
        return;
    }

    let phase = tokio::time::timeout(
        state.protocol.handshake_timeout(),
        await_connect(&handshake, &mut sender, &mut receiver),
    )
    .await;
    let device_id = match phase {
        Ok(Ok(device_id)) => device_id,
        Ok(Err(e)) => {
            tracing::debug!(conn_id = %conn_id, error = %e, "Handshake ended without connecting");
            return;
        }
        Err(_) => {
            tracing::warn!(conn_id = %conn_id, "Handshake timed out");
            let _ = close(&mut sender, CLOSE_HANDSHAKE_TIMEOUT, "Handshake timeout").await;
            return;
        }
    };

    // Channel for sending frames to the client
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if send_frame(&mut sender, &frame).await.is_err() {
                break;
            }
        }
    });

    let conn = ConnectionInfo::new(conn_id, device_id, Arc::new(tx));
    tracing::info!(conn_id = %conn.conn_id, user_id = %conn.user_id, "WebSocket client connected");

    while let Some(text) = next_text(&mut receiver).await {
        match parse_request(&text) {
            Ok(request) => state.dispatcher.handle(request, &conn).await,
            Err(e) => match e.request_id() {
                Some(id) => {
                    let _ = conn
                        .sink
                        .send_frame(error_response(id, ErrorCode::InvalidFrame, e.to_string()));
                }
                None => {
                    tracing::warn!(conn_id = %conn.conn_id, error = %e, "Dropping malformed frame");
                }
            },
        }
    }

    // Runs still streaming hold the sink; their frames are discarded.
    send_task.abort();
    tracing::info!(conn_id = %conn.conn_id, "WebSocket client disconnected");
}

/// Wait for a successful `connect`, answering everything else.
async fn await_connect(
    handshake: &Handshake,
    sender: &mut WsSender,
    receiver: &mut WsReceiver,
) -> Result<Option<String>, HandshakeError> {
    while let Some(text) = next_text(receiver).await {
        match handshake.handle(&text) {
            HandshakeStep::Accepted {
                response, device_id, ..
            } => {
                send_frame(sender, &response).await?;
                return Ok(device_id);
            }
            HandshakeStep::Rejected { response, error } => {
                let _ = send_frame(sender, &response).await;
                let _ = close(sender, CLOSE_VERSION_MISMATCH, "Protocol version mismatch").await;
                return Err(error);
            }
            HandshakeStep::Reply(frame) => send_frame(sender, &frame).await?,
            HandshakeStep::Ignore => {}
        }
    }
    Err(HandshakeError::Closed)
}

/// Next text payload, or `None` once the client is gone.
async fn next_text(receiver: &mut WsReceiver) -> Option<String> {
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => return Some(text.to_string()),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => return Some(s),
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket error: {e}");
                return None;
            }
        }
    }
    None
}

async fn send_frame(sender: &mut WsSender, frame: &Frame) -> Result<(), HandshakeError> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            tracing::error!("Failed to serialize frame: {e}");
            return Ok(());
        }
    };
    sender
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| HandshakeError::Closed)
}

async fn close(sender: &mut WsSender, code: u16, reason: &'static str) -> Result<(), axum::Error> {
    sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await
}

/// Create WebSocket router.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_ws_router(ws_state));
/// ```
#[must_use]
pub fn create_ws_router(state: Arc<WsState>) -> axum::Router {
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state)
}
