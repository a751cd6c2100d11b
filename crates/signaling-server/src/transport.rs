//! Browser WebSocket connections
//!
//! Each socket becomes one session. Outbound messages are pushed through the
//! session's [`ClientHandle`] and written by a dedicated send task; inbound
//! frames are handled in arrival order.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, info_span, warn, Instrument};

use rvoip_signaling_core::{CallOrchestrator, ClientHandle, ClientMessage, SessionId};

use crate::server::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.orchestrator))
}

async fn handle_socket(socket: WebSocket, orchestrator: Arc<CallOrchestrator>) {
    let session_id = SessionId::new();
    let span = info_span!("session", id = %session_id);
    run_session(socket, orchestrator, session_id).instrument(span).await
}

async fn run_session(socket: WebSocket, orchestrator: Arc<CallOrchestrator>, session_id: SessionId) {
    let (mut sender, mut receiver) = socket.split();
    let (client, mut outbound) = ClientHandle::channel();

    let send_task = tokio::spawn(
        async move {
            while let Some(message) = outbound.recv().await {
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode outbound message: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sender.close().await;
        }
        .in_current_span(),
    );

    if let Err(e) = orchestrator.connect(session_id.clone(), client).await {
        warn!("Rejecting connection: {}", e);
        send_task.abort();
        return;
    }
    info!("Client connected");

    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => match ClientMessage::from_json(&text) {
                Ok(message) => {
                    debug!(event = message.name(), "Received client message");
                    orchestrator.handle_client_message(&session_id, message).await;
                }
                Err(e) => warn!("Ignoring malformed frame: {}", e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("WebSocket read failed: {}", e);
                break;
            }
        }
    }

    orchestrator.disconnect(&session_id).await;
    info!("Client disconnected");
}
