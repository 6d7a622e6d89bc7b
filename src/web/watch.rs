//! Observer websocket endpoint.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::AppState;
use crate::watch::{Flow, Hub, Session, Signal};

/// Frames above this size are refused by the websocket layer itself.
const MAX_FRAME: usize = 4096;

pub async fn handle_watch(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let hub = state.hub.clone();
    ws.max_message_size(MAX_FRAME)
        .on_upgrade(move |socket| handle_socket(socket, hub))
}

/// Drive one observer connection. A sender task forwards hub signals to the
/// socket while this task feeds inbound frames to the session.
async fn handle_socket(socket: WebSocket, hub: Arc<Hub>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Signal>();
    let mut session = Session::new(hub, tx);
    let conn_id = session.conn_id();
    tracing::debug!(conn_id, "Observer connected");

    let (mut sink, mut stream) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(signal) = rx.recv().await {
            if sink.send(Message::Text(signal.as_str().into())).await.is_err() {
                tracing::debug!(conn_id, "Observer sink closed");
                break;
            }
        }
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if session.handle(text.as_str()).await == Flow::Close {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(conn_id, error = %e, "Observer receive error");
                break;
            }
        }
    }

    session.close().await;
    send_task.abort();
    tracing::debug!(conn_id, "Observer disconnected");
}
