//! WebSocket endpoint of the relay.

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    protocol::{CONNECTED, Envelope, ErrorCode, REGISTERED, RelayError, RelayRequest, pong},
    registry::{ConnHandle, ConnId},
    relay::RelayState,
};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut sender, mut receiver) = socket.split();

    // Channel for sending messages to the peer
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let closed = CancellationToken::new();
    let conn = state.registry().attach(ConnHandle::new(tx, closed.clone()));

    let send_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let json = match serde_json::to_string(&envelope) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        let msg = tokio::select! {
            () = closed.cancelled() => break,
            msg = receiver.next() => msg,
        };
        let text = match msg {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s.into(),
                Err(e) => {
                    let mut registry = state.registry();
                    registry.touch(conn);
                    registry.reply(
                        conn,
                        Envelope::error(None, ErrorCode::InvalidPayload, format!("Invalid message: {e}")),
                    );
                    continue;
                }
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {
                state.registry().touch(conn);
                continue;
            }
            Some(Err(e)) => {
                tracing::debug!(conn, "WebSocket error: {e}");
                break;
            }
        };
        handle_frame(&state, conn, &text);
    }

    // Detaching drops the sender, so the send task flushes what is queued and ends.
    state.registry().detach(conn);
    let abort = send_task.abort_handle();
    if tokio::time::timeout(FLUSH_TIMEOUT, send_task).await.is_err() {
        tracing::debug!(conn, "Gave up flushing frames to closed peer");
        abort.abort();
    }
}

/// Route one text frame from `conn`.
fn handle_frame(state: &RelayState, conn: ConnId, text: &str) {
    let mut registry = state.registry();
    registry.touch(conn);

    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(conn, "Invalid message: {e}");
            registry.reply(
                conn,
                Envelope::error(None, ErrorCode::InvalidPayload, format!("Invalid message: {e}")),
            );
            return;
        }
    };
    let id = envelope.id.clone();

    let reply = match RelayRequest::decode(envelope) {
        Ok(RelayRequest::Register(request)) => registry
            .register(conn, &request)
            .and_then(|registered| encode(REGISTERED, &registered))
            .map(Some),
        Ok(RelayRequest::Connect(request)) => registry
            .connect(conn, &request)
            .and_then(|connected| encode(CONNECTED, &connected))
            .map(Some),
        Ok(RelayRequest::Ping { timestamp }) => Ok(Some(pong(None, timestamp))),
        Ok(RelayRequest::Pong) => Ok(None),
        Ok(RelayRequest::Forward(envelope)) => registry.forward(conn, envelope).map(|()| None),
        Err(e) => Err(e),
    };

    match reply {
        Ok(Some(envelope)) => registry.reply(conn, envelope.with_id(id)),
        Ok(None) => {}
        Err(e) => {
            tracing::debug!(conn, error = %e, "Rejected frame");
            registry.reply(conn, e.to_envelope(id));
        }
    }
}

fn encode<T: serde::Serialize>(kind: &str, payload: &T) -> Result<Envelope, RelayError> {
    Envelope::from_payload(kind, payload).map_err(|e| {
        tracing::error!("Failed to serialize {kind}: {e}");
        RelayError::Internal
    })
}
