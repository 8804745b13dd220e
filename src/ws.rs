//! Client socket server.
//!
//! One reader task and one writer task per live connection. The writer is
//! the socket's single owner for outbound frames: it drains the connection's
//! outbound channel (which already carries the confirmation frame and the
//! offline backlog, in order). The reader parses inbound JSON frames and
//! hands them to the router.
//!
//! Disconnect order matters: the live-registry entry is removed first, then
//! the mission pause is synthesized, so no new frames race the cleanup.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, Utf8Bytes, WebSocket, WebSocketUpgrade, close_code};
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain_types::{AuthToken, ClientId};
use crate::message::{Message, MessageType};
use crate::rest_api::AppState;
use crate::router::MessageOrigin;

/// A socket write that blocks longer than this is treated as failed and the
/// frame is re-queued.
const SOCKET_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Query parameters carried on the upgrade URL.
#[derive(Debug, Deserialize)]
pub struct SocketParams {
    #[serde(rename = "clientId")]
    pub client_id: Option<String>,
    pub token: Option<String>,
}

/// Accepts the upgrade and runs the connection to completion.
pub fn handle_upgrade(
    upgrade: WebSocketUpgrade,
    params: SocketParams,
    state: Arc<AppState>,
) -> Response {
    upgrade.on_upgrade(move |socket| serve_socket(socket, params, state))
}

async fn serve_socket(mut socket: WebSocket, params: SocketParams, state: Arc<AppState>) {
    let client_id = params
        .client_id
        .as_deref()
        .and_then(ClientId::canonicalize);
    let Some(client_id) = client_id else {
        warn!("upgrade without client id refused");
        let _ = socket
            .send(WsMessage::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: Utf8Bytes::from_static("Client ID missing"),
            })))
            .await;
        return;
    };

    let token = params.token.map(AuthToken::new);
    let connection = state.clients.connect(client_id.clone(), token);
    state.missions.refresh(&client_id);
    info!(client = %client_id, "client connected");

    let generation = connection.generation;
    let cancel = connection.cancel.clone();
    let (ws_tx, ws_rx) = socket.split();
    let writer = tokio::spawn(write_loop(ws_tx, connection.outbound, connection.cancel));

    read_loop(&state, &client_id, ws_rx, &cancel).await;

    // Remove the live entry before any downstream side-effect; a superseded
    // connection closing late must leave its successor alone.
    let removed = state.clients.disconnect(&client_id, generation);
    cancel.cancel();
    match writer.await {
        Ok(unsent) => state.clients.requeue_unsent(&client_id, unsent),
        Err(err) => error!(client = %client_id, %err, "socket writer task panicked"),
    }

    if removed {
        info!(client = %client_id, "client disconnected");
        pause_mission_of(&state, &client_id).await;
    }
}

async fn read_loop(
    state: &Arc<AppState>,
    client_id: &ClientId,
    mut ws_rx: SplitStream<WebSocket>,
    cancel: &CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            frame = ws_rx.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    handle_frame(state, client_id, text.as_str()).await;
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {} // binary, ping and pong frames carry no routing
                Some(Err(err)) => {
                    debug!(client = %client_id, %err, "socket read error");
                    break;
                }
            }
        }
    }
}

/// Parses and dispatches one inbound frame. A malformed frame is logged and
/// ignored; it must never close the connection.
async fn handle_frame(state: &Arc<AppState>, client_id: &ClientId, raw: &str) {
    let message: Message = match serde_json::from_str(raw) {
        Ok(message) => message,
        Err(err) => {
            warn!(client = %client_id, %err, "malformed frame ignored");
            return;
        }
    };

    if message.kind == MessageType::ClientConnect {
        // Explicit re-handshake: adopt a carried mission, otherwise just
        // re-assert the existing association.
        match message.addressed_mission() {
            Some(mission_id) => state.missions.associate(client_id.clone(), mission_id),
            None => state.missions.refresh(client_id),
        }
        return;
    }

    if let Err(err) = state
        .router
        .route(message, MessageOrigin::Client(client_id.clone()))
        .await
    {
        warn!(client = %client_id, %err, "socket frame failed to route");
    }
}

/// Single writer per socket. Returns the frames it could not put on the
/// wire so they can be re-queued for the client's next connection.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut outbound: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) -> Vec<Message> {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            maybe = outbound.recv() => {
                let Some(message) = maybe else { break };
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        error!(%err, "outbound frame failed to serialize");
                        continue;
                    }
                };
                let send = tokio::time::timeout(
                    SOCKET_WRITE_TIMEOUT,
                    ws_tx.send(WsMessage::Text(text.into())),
                );
                match send.await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => {
                        let mut unsent = vec![message];
                        unsent.extend(drain_channel(&mut outbound));
                        return unsent;
                    }
                }
            }
        }
    }
    drain_channel(&mut outbound)
}

fn drain_channel(outbound: &mut mpsc::Receiver<Message>) -> Vec<Message> {
    outbound.close();
    let mut remaining = Vec::new();
    while let Ok(message) = outbound.try_recv() {
        remaining.push(message);
    }
    remaining
}

/// Synthesizes the mission pause for a departed client. The association
/// itself is retained so a reconnecting client resumes into its mission.
async fn pause_mission_of(state: &Arc<AppState>, client_id: &ClientId) {
    let Some(mission_id) = state.missions.mission_of(client_id) else {
        return;
    };
    let pause = Message::pause_for_mission(&mission_id);
    match state.router.route(pause, MessageOrigin::Internal).await {
        Ok(_) => info!(client = %client_id, mission = %mission_id, "mission paused on disconnect"),
        Err(err) => {
            warn!(client = %client_id, mission = %mission_id, %err, "mission pause failed");
        }
    }
}
