use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;
use crate::ws::{
    msg_types, ClientHandle, ExistingMembersPayload, JoinRoomPayload, LeaveRoomPayload,
    LeftRoomPayload, ParticipantJoinedPayload, ParticipantLeftPayload, ScreenShareEventPayload,
    ScreenShareMarkerPayload, SignalSendPayload, WelcomePayload, WireMessage,
};

/// WebSocket routes
pub fn ws_routes() -> Router<AppState> {
    Router::new().route("/ws", get(ws_upgrade))
}

/// WebSocket upgrade handler
async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle one transport connection for its whole lifetime.
///
/// The connection id is assigned here, is unique for the connection's
/// lifetime, and stays stable across every room membership it holds.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4().to_string();

    tracing::info!(connection_id = %connection_id, "WebSocket connected");

    // Create message channel for sending to this client
    let (tx, mut rx) = mpsc::unbounded_channel::<WireMessage>();
    state
        .gateway
        .add_client(ClientHandle::new(connection_id.clone(), String::new(), tx));

    // Split socket into sender and receiver
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Task for sending messages to client
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&msg) {
                if ws_sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    });

    // Tell the client which connection id it was assigned.
    state.relay.send_to(
        &connection_id,
        WireMessage::new(
            msg_types::WELCOME,
            serde_json::to_value(WelcomePayload {
                connection_id: connection_id.clone(),
            })
            .unwrap(),
        ),
    );

    // Process incoming messages strictly in order: a join-room admission is
    // fully applied (and its broadcasts queued) before any later signal
    // from this connection is relayed.
    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if let Err(e) = handle_message(&text, &connection_id, &state) {
                    tracing::error!(
                        connection_id = %connection_id,
                        error = %e,
                        "Error handling message"
                    );
                    state.relay.send_to(
                        &connection_id,
                        WireMessage::error(400, &e.to_string(), None),
                    );
                }
            }
            Ok(Message::Ping(_)) => {
                tracing::trace!(connection_id = %connection_id, "Ping received");
            }
            Ok(Message::Close(_)) => {
                tracing::info!(connection_id = %connection_id, "WebSocket close received");
                break;
            }
            Err(e) => {
                tracing::error!(connection_id = %connection_id, error = %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    disconnect_cleanup(&connection_id, &state);
    send_task.abort();
}

/// Transport disconnect: broadcast participant-left for every room the
/// connection belonged to, then discard its registry entries and handle.
/// This is the one path that must never leave orphaned state.
fn disconnect_cleanup(connection_id: &str, state: &AppState) {
    tracing::info!(connection_id = %connection_id, "WebSocket disconnected, cleaning up");

    let outcomes = state
        .registry
        .lock()
        .expect("registry lock poisoned")
        .leave_all(connection_id);

    for (room_id, outcome) in outcomes {
        state.relay.send_to_many(
            &outcome.notify,
            WireMessage::new(
                msg_types::PARTICIPANT_LEFT,
                serde_json::to_value(ParticipantLeftPayload {
                    room_id,
                    connection_id: connection_id.to_string(),
                })
                .unwrap(),
            ),
        );
    }

    state.gateway.remove_client(connection_id);
}

/// Handle one incoming wire message
fn handle_message(text: &str, connection_id: &str, state: &AppState) -> Result<(), AppError> {
    let msg: WireMessage = serde_json::from_str(text)?;
    let request_id = msg.request_id.clone();

    tracing::debug!(
        msg_type = %msg.msg_type,
        connection_id = %connection_id,
        "Received message"
    );

    match msg.msg_type.as_str() {
        msg_types::JOIN_ROOM => handle_join_room(msg.payload, request_id, connection_id, state),
        msg_types::SIGNAL => handle_signal(msg.payload, connection_id, state),
        msg_types::SCREEN_SHARE_STARTED => {
            handle_screen_share(msg.payload, connection_id, state, true)
        }
        msg_types::SCREEN_SHARE_ENDED => {
            handle_screen_share(msg.payload, connection_id, state, false)
        }
        msg_types::LEAVE_ROOM => handle_leave(msg.payload, request_id, connection_id, state),
        msg_types::PING => {
            state.relay.send_to(
                connection_id,
                WireMessage::new(msg_types::PONG, serde_json::json!({}))
                    .with_request_id(request_id),
            );
            Ok(())
        }
        _ => {
            tracing::warn!(msg_type = %msg.msg_type, "Unknown message type");
            state.relay.send_to(
                connection_id,
                WireMessage::error(400, "Unknown message type", request_id),
            );
            Ok(())
        }
    }
}

/// Handle join-room: admit, reply with the existing-members snapshot, and
/// announce the joiner to the rest of the room.
fn handle_join_room(
    payload: serde_json::Value,
    request_id: Option<String>,
    connection_id: &str,
    state: &AppState,
) -> Result<(), AppError> {
    let join: JoinRoomPayload = serde_json::from_value(payload)?;

    let outcome = state
        .registry
        .lock()
        .expect("registry lock poisoned")
        .join(&join.room_id, connection_id, &join.display_name);

    // The snapshot reply seeds offerer-role links on the joining client.
    state.relay.send_to(
        connection_id,
        WireMessage::new(
            msg_types::EXISTING_MEMBERS,
            serde_json::to_value(ExistingMembersPayload {
                room_id: join.room_id.clone(),
                members: outcome.existing,
            })?,
        )
        .with_request_id(request_id),
    );

    // Re-joins update the display name without a broadcast.
    if outcome.announced {
        state.relay.send_to_many(
            &outcome.notify,
            WireMessage::new(
                msg_types::PARTICIPANT_JOINED,
                serde_json::to_value(ParticipantJoinedPayload {
                    room_id: join.room_id,
                    connection_id: connection_id.to_string(),
                    display_name: join.display_name,
                    joined_at: outcome.joiner.joined_at,
                })?,
            ),
        );
    }

    Ok(())
}

/// Handle signal: forward the opaque payload to its target.
fn handle_signal(
    payload: serde_json::Value,
    connection_id: &str,
    state: &AppState,
) -> Result<(), AppError> {
    let signal: SignalSendPayload = serde_json::from_value(payload)?;
    state
        .relay
        .relay(connection_id, &signal.target_connection_id, signal.payload);
    Ok(())
}

/// Handle screen-share markers: presence only, no media payload crosses
/// the relay. A marker for a room the sender is not in is a silent no-op.
fn handle_screen_share(
    payload: serde_json::Value,
    connection_id: &str,
    state: &AppState,
    started: bool,
) -> Result<(), AppError> {
    let marker: ScreenShareMarkerPayload = serde_json::from_value(payload)?;

    let notify = state
        .registry
        .lock()
        .expect("registry lock poisoned")
        .set_screen_tracks(&marker.room_id, connection_id, started);

    if let Some(notify) = notify {
        let msg_type = if started {
            msg_types::SCREEN_SHARE_STARTED
        } else {
            msg_types::SCREEN_SHARE_ENDED
        };
        state.relay.send_to_many(
            &notify,
            WireMessage::new(
                msg_type,
                serde_json::to_value(ScreenShareEventPayload {
                    room_id: marker.room_id,
                    connection_id: connection_id.to_string(),
                })?,
            ),
        );
    }

    Ok(())
}

/// Handle an explicit leave-room. Leaving a room the connection is not in
/// acks with success=false and is otherwise a silent no-op.
fn handle_leave(
    payload: serde_json::Value,
    request_id: Option<String>,
    connection_id: &str,
    state: &AppState,
) -> Result<(), AppError> {
    let leave: LeaveRoomPayload = serde_json::from_value(payload)?;

    let outcome = state
        .registry
        .lock()
        .expect("registry lock poisoned")
        .leave(connection_id, &leave.room_id);

    if let Some(outcome) = &outcome {
        state.relay.send_to_many(
            &outcome.notify,
            WireMessage::new(
                msg_types::PARTICIPANT_LEFT,
                serde_json::to_value(ParticipantLeftPayload {
                    room_id: leave.room_id.clone(),
                    connection_id: connection_id.to_string(),
                })?,
            ),
        );
    }

    state.relay.send_to(
        connection_id,
        WireMessage::new(
            msg_types::LEFT_ROOM,
            serde_json::to_value(LeftRoomPayload {
                room_id: leave.room_id,
                success: outcome.is_some(),
            })?,
        )
        .with_request_id(request_id),
    );

    Ok(())
}
