//! Push channel: one WebSocket per UI
//!
//! Every orchestrator event is forwarded as a JSON text frame. The only
//! client message understood is `switch_tab`.

use super::http::AppState;
use crate::orchestration::{ClientEvent, ServerEvent};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    // Subscribe before the upgrade completes so no event after the handshake is missed
    let events = state.orchestrator.subscribe();
    ws.on_upgrade(move |socket| handle_socket(state, socket, events))
}

async fn handle_socket(
    state: Arc<AppState>,
    socket: WebSocket,
    mut events: broadcast::Receiver<ServerEvent>,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    tracing::info!("Push channel connected");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!(kind = event.kind(), "Failed to encode event: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Push channel lagged, events dropped");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => handle_client_message(&state, &text),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!("Push channel read error: {}", e);
                    break;
                }
            },
        }
    }

    tracing::info!("Push channel disconnected");
}

fn handle_client_message(state: &AppState, text: &str) {
    match serde_json::from_str::<ClientEvent>(text) {
        Ok(ClientEvent::SwitchTab { tab_id }) => {
            if let Err(e) = state.orchestrator.switch_tab(&tab_id) {
                tracing::warn!(tab_id = %tab_id, "Tab switch failed: {}", e);
            }
        }
        Err(e) => tracing::warn!("Ignoring client message: {}", e),
    }
}
