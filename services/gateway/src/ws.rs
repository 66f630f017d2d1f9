//! The browser push channel.
//!
//! Each client keeps one websocket to the gateway. Downstream it carries the
//! ordered per-session push stream (chat fragments, events, latency reports,
//! diagrams); upstream it carries microphone audio, typed chat queries and
//! stop-speaking requests. The session outlives the socket: on disconnect the
//! push receiver is parked in the registry so a reconnecting client resumes
//! the stream without losing messages.

use crate::protocol::ClientWsMessage;
use crate::session::events::SessionEvent;
use crate::state::AppState;
use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{Instrument, info, warn};
use uuid::Uuid;

#[derive(Deserialize)]
pub struct WsQuery {
    #[serde(rename = "clientId")]
    client_id: Uuid,
}

/// Axum handler to upgrade an HTTP connection to the push channel.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| {
        let span = tracing::info_span!("push_channel", client_id = %query.client_id);
        handle_socket(socket, state, query.client_id).instrument(span)
    })
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, client_id: Uuid) {
    let Some(handle) = state.registry.get(client_id).await else {
        warn!("Websocket for unknown client; closing.");
        return;
    };
    let Some(mut outbound) = handle.take_outbound() else {
        warn!("Client already has an attached socket; closing.");
        return;
    };
    // Sockets come and go across network flaps; a throwaway id tells
    // successive attachments of the same client apart in the logs.
    let attach_id: u32 = rand::random();
    info!(attach_id, "Push channel attached.");

    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            // Ordered push stream to the browser.
            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                let serialized = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = ?e, "Dropping unserializable push message.");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(serialized.into())).await.is_err() {
                    break;
                }
            }
            // Client traffic.
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientWsMessage>(&text) {
                            Ok(msg) => {
                                if dispatch(&handle, msg).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(error = ?e, "Ignoring malformed client message."),
                        }
                    }
                    // Raw binary frames are microphone audio without the
                    // base64 envelope.
                    Some(Ok(Message::Binary(data))) => {
                        if handle.send(SessionEvent::Audio(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = ?e, "Push channel receive error.");
                        break;
                    }
                }
            }
        }
    }

    // Keep undelivered messages for the next attach.
    handle.restore_outbound(outbound);
    info!(attach_id, "Push channel detached.");
}

async fn dispatch(
    handle: &crate::registry::SessionHandle,
    msg: ClientWsMessage,
) -> anyhow::Result<()> {
    match msg {
        ClientWsMessage::Audio { audio_chunk } => {
            match base64::engine::general_purpose::STANDARD.decode(&audio_chunk) {
                Ok(decoded) => handle.send(SessionEvent::Audio(decoded.into())).await,
                Err(e) => {
                    warn!(error = ?e, "Dropping undecodable audio chunk.");
                    Ok(())
                }
            }
        }
        ClientWsMessage::Chat {
            user_query,
            system_prompt,
        } => {
            handle
                .send(SessionEvent::UserQuery {
                    text: user_query,
                    system_prompt,
                })
                .await
        }
        ClientWsMessage::StopSpeaking => handle.send(SessionEvent::StopSpeaking).await,
    }
}
