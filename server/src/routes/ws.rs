//! GET /ws - live attendee counts.
//!
//! # Authentication
//!
//! The upgrade request must carry an access token: the `accessToken`
//! cookie, an `Authorization: Bearer` header, or a `token` query parameter
//! for browser clients that cannot set headers. With
//! `ROLLCALL_PUBLIC_ROOMS=true` the check is skipped.
//!
//! The session behind the token is checked again on every `joinRoom`. Once
//! it has been revoked, joins are refused and existing subscriptions are
//! dropped.
//!
//! # Protocol
//!
//! Clients send `joinRoom` / `leaveRoom` frames naming an event id. The
//! server confirms each with `roomJoined` / `roomLeft`, then forwards every
//! `attendeeUpdated` published to the joined rooms. Malformed frames get an
//! `error` reply; the connection stays open.

use std::collections::HashMap;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast::{error::RecvError, Receiver};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::auth::{authenticate, extract_access_token};
use crate::routes::AppState;
use crate::rooms::{ClientMessage, ServerMessage};

/// Outbound frames buffered per connection before room forwarders wait.
const OUTBOUND_BUFFER: usize = 32;

/// Who opened the connection. `None` in public-rooms mode.
#[derive(Clone, Copy, Debug)]
struct Identity {
    user_id: Uuid,
    session_id: Uuid,
}

/// Query parameters for the WebSocket endpoint.
#[derive(Default, Deserialize)]
pub struct WsQueryParams {
    /// Access token, for clients that cannot send cookies or headers.
    pub token: Option<String>,
}

/// GET /ws
///
/// # Responses
///
/// - `101 Switching Protocols` - upgrade successful
/// - `401 Unauthorized` - missing, invalid, or revoked token
pub async fn get_ws(
    State(state): State<AppState>,
    Query(params): Query<WsQueryParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = if state.config.public_rooms {
        None
    } else {
        let token = extract_access_token(&headers).or(params.token);
        match authenticate(&state, token.as_deref()) {
            Ok(user) => Some(Identity {
                user_id: user.id(),
                session_id: user.session_id,
            }),
            Err(err) => {
                debug!(error = %err, "Rejected WebSocket upgrade");
                return err.into_response();
            }
        }
    };

    let user_id = identity.map(|i| i.user_id);
    info!(user_id = ?user_id, "WebSocket client connecting");

    ws.on_upgrade(move |socket| handle_websocket(socket, state, identity))
}

/// Drives one connection: reads client frames, manages room subscriptions,
/// and funnels all outbound frames through a single writer task.
async fn handle_websocket(socket: WebSocket, state: AppState, identity: Option<Identity>) {
    let user_id = identity.map(|i| i.user_id);
    let _connection = state.rooms.connection_opened();
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(json) => {
                    if let Err(err) = sender.send(Message::Text(json.into())).await {
                        debug!(error = %err, "Failed to send to WebSocket client");
                        break;
                    }
                }
                Err(err) => {
                    error!(error = %err, "Failed to serialize server message");
                }
            }
        }
    });

    let mut subscriptions: HashMap<Uuid, JoinHandle<()>> = HashMap::new();

    while let Some(msg) = receiver.next().await {
        let reply = match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(ClientMessage::JoinRoom { event_id }) => {
                    if session_revoked(&state, identity) {
                        for (_, forwarder) in subscriptions.drain() {
                            forwarder.abort();
                        }
                        debug!(user_id = ?user_id, "Refused join for revoked session");
                        ServerMessage::Error {
                            message: "session has been revoked".to_string(),
                        }
                    } else {
                        join_room(&state, event_id, &out_tx, &mut subscriptions)
                    }
                }
                Ok(ClientMessage::LeaveRoom { event_id }) => {
                    if let Some(forwarder) = subscriptions.remove(&event_id) {
                        forwarder.abort();
                        debug!(event_id = %event_id, user_id = ?user_id, "Left room");
                    }
                    ServerMessage::RoomLeft { event_id }
                }
                Err(err) => {
                    trace!(error = %err, "Malformed client frame");
                    ServerMessage::Error {
                        message: format!("unrecognized message: {err}"),
                    }
                }
            },
            Ok(Message::Close(_)) => {
                debug!("WebSocket client sent close frame");
                break;
            }
            Ok(Message::Ping(data)) => {
                // axum answers pings automatically
                trace!(data_len = data.len(), "Received ping");
                continue;
            }
            Ok(_) => continue,
            Err(err) => {
                debug!(error = %err, "WebSocket error");
                break;
            }
        };

        if out_tx.send(reply).await.is_err() {
            break;
        }
    }

    for (_, forwarder) in subscriptions {
        forwarder.abort();
    }
    drop(out_tx);
    writer.abort();
    info!(user_id = ?user_id, "WebSocket client disconnected");
}

fn session_revoked(state: &AppState, identity: Option<Identity>) -> bool {
    identity.is_some_and(|i| !state.tokens.sessions().is_active(i.session_id))
}

fn join_room(
    state: &AppState,
    event_id: Uuid,
    out_tx: &mpsc::Sender<ServerMessage>,
    subscriptions: &mut HashMap<Uuid, JoinHandle<()>>,
) -> ServerMessage {
    if state.events.get(event_id).is_err() {
        return ServerMessage::Error {
            message: format!("event {event_id} not found"),
        };
    }

    subscriptions.entry(event_id).or_insert_with(|| {
        let rx = state.rooms.join(event_id);
        tokio::spawn(forward_room(event_id, rx, out_tx.clone()))
    });

    ServerMessage::RoomJoined { event_id }
}

/// Copies one room's broadcasts into the connection's outbound queue.
async fn forward_room(
    event_id: Uuid,
    mut rx: Receiver<ServerMessage>,
    out_tx: mpsc::Sender<ServerMessage>,
) {
    loop {
        match rx.recv().await {
            Ok(message) => {
                if out_tx.send(message).await.is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(count)) => {
                warn!(event_id = %event_id, skipped = count, "WebSocket client lagged, skipped updates");
            }
            Err(RecvError::Closed) => {
                debug!(event_id = %event_id, "Room closed");
                break;
            }
        }
    }
}
