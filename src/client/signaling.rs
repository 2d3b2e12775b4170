use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::error::Result;
use crate::mesh::SignalSink;
use crate::models::{MemberInfo, SignalPayload};
use crate::ws::{
    msg_types, ExistingMembersPayload, JoinRoomPayload, LeaveRoomPayload, LeftRoomPayload,
    ParticipantJoinedPayload, ParticipantLeftPayload, ScreenShareEventPayload,
    ScreenShareMarkerPayload, SignalDeliverPayload, SignalSendPayload, WelcomePayload, WireMessage,
};

/// Relay events as seen from the client side of the wire.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    Welcome {
        connection_id: String,
    },
    ExistingMembers {
        room_id: String,
        members: Vec<MemberInfo>,
    },
    ParticipantJoined {
        room_id: String,
        member: MemberInfo,
    },
    ParticipantLeft {
        room_id: String,
        connection_id: String,
    },
    Signal {
        origin: String,
        payload: SignalPayload,
    },
    ScreenShare {
        room_id: String,
        connection_id: String,
        sharing: bool,
    },
    LeftRoom {
        room_id: String,
        success: bool,
    },
    Pong,
    /// The transport dropped; the registry is cleaning us up server-side.
    Disconnected,
}

/// WebSocket signaling client: serializes outbound commands and parses
/// inbound envelopes into `RelayEvent`s.
pub struct SignalingClient {
    outbound: mpsc::UnboundedSender<WireMessage>,
}

impl SignalingClient {
    /// Connect to the relay. Returns the client handle and the ordered
    /// inbound event stream.
    pub async fn connect(url: &str) -> Result<(Self, mpsc::UnboundedReceiver<RelayEvent>)> {
        let (socket, _) = connect_async(url).await?;
        let (mut write, mut read) = socket.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WireMessage>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Writer task: one ordered queue per connection preserves the
        // relay's per-pair ordering guarantee for everything we send.
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if let Ok(json) = serde_json::to_string(&msg) {
                    if write.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
            }
        });

        // Reader task: parse frames, forward events, flag disconnect.
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if let Some(event) = parse_event(&text) {
                            if event_tx.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "Signaling socket error");
                        break;
                    }
                    _ => {}
                }
            }
            let _ = event_tx.send(RelayEvent::Disconnected);
        });

        Ok((
            Self {
                outbound: outbound_tx,
            },
            event_rx,
        ))
    }

    fn send(&self, msg: WireMessage) {
        if self.outbound.send(msg).is_err() {
            tracing::debug!("Signaling connection closed, dropping outbound message");
        }
    }

    pub fn join_room(&self, room_id: &str, display_name: &str) {
        self.send(WireMessage::new(
            msg_types::JOIN_ROOM,
            serde_json::to_value(JoinRoomPayload {
                room_id: room_id.to_string(),
                display_name: display_name.to_string(),
            })
            .unwrap(),
        ));
    }

    pub fn screen_share_marker(&self, room_id: &str, started: bool) {
        let msg_type = if started {
            msg_types::SCREEN_SHARE_STARTED
        } else {
            msg_types::SCREEN_SHARE_ENDED
        };
        self.send(WireMessage::new(
            msg_type,
            serde_json::to_value(ScreenShareMarkerPayload {
                room_id: room_id.to_string(),
            })
            .unwrap(),
        ));
    }

    pub fn leave_room(&self, room_id: &str) {
        self.send(WireMessage::new(
            msg_types::LEAVE_ROOM,
            serde_json::to_value(LeaveRoomPayload {
                room_id: room_id.to_string(),
            })
            .unwrap(),
        ));
    }

    pub fn ping(&self) {
        self.send(WireMessage::new(msg_types::PING, serde_json::json!({})));
    }
}

impl SignalSink for SignalingClient {
    fn send_signal(&self, target_connection_id: &str, payload: SignalPayload) {
        let payload = match serde_json::to_value(&payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode signal payload");
                return;
            }
        };
        self.send(WireMessage::new(
            msg_types::SIGNAL,
            serde_json::to_value(SignalSendPayload {
                target_connection_id: target_connection_id.to_string(),
                payload,
            })
            .unwrap(),
        ));
    }
}

fn parse_event(text: &str) -> Option<RelayEvent> {
    let msg: WireMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(error = %e, "Unparseable signaling frame");
            return None;
        }
    };

    let event = match msg.msg_type.as_str() {
        msg_types::WELCOME => {
            let payload: WelcomePayload = serde_json::from_value(msg.payload).ok()?;
            RelayEvent::Welcome {
                connection_id: payload.connection_id,
            }
        }
        msg_types::EXISTING_MEMBERS => {
            let payload: ExistingMembersPayload = serde_json::from_value(msg.payload).ok()?;
            RelayEvent::ExistingMembers {
                room_id: payload.room_id,
                members: payload.members,
            }
        }
        msg_types::PARTICIPANT_JOINED => {
            let payload: ParticipantJoinedPayload = serde_json::from_value(msg.payload).ok()?;
            RelayEvent::ParticipantJoined {
                room_id: payload.room_id,
                member: MemberInfo {
                    connection_id: payload.connection_id,
                    display_name: payload.display_name,
                    joined_at: payload.joined_at,
                },
            }
        }
        msg_types::PARTICIPANT_LEFT => {
            let payload: ParticipantLeftPayload = serde_json::from_value(msg.payload).ok()?;
            RelayEvent::ParticipantLeft {
                room_id: payload.room_id,
                connection_id: payload.connection_id,
            }
        }
        msg_types::SIGNAL => {
            let payload: SignalDeliverPayload = serde_json::from_value(msg.payload).ok()?;
            let signal: SignalPayload = match serde_json::from_value(payload.payload) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::debug!(
                        origin = %payload.origin_connection_id,
                        error = %e,
                        "Undecodable negotiation payload"
                    );
                    return None;
                }
            };
            RelayEvent::Signal {
                origin: payload.origin_connection_id,
                payload: signal,
            }
        }
        msg_types::SCREEN_SHARE_STARTED | msg_types::SCREEN_SHARE_ENDED => {
            let sharing = msg.msg_type == msg_types::SCREEN_SHARE_STARTED;
            let payload: ScreenShareEventPayload = serde_json::from_value(msg.payload).ok()?;
            RelayEvent::ScreenShare {
                room_id: payload.room_id,
                connection_id: payload.connection_id,
                sharing,
            }
        }
        msg_types::LEFT_ROOM => {
            let payload: LeftRoomPayload = serde_json::from_value(msg.payload).ok()?;
            RelayEvent::LeftRoom {
                room_id: payload.room_id,
                success: payload.success,
            }
        }
        msg_types::PONG => RelayEvent::Pong,
        msg_types::ERROR => {
            tracing::warn!(payload = %msg.payload, "Relay reported an error");
            return None;
        }
        other => {
            tracing::debug!(msg_type = %other, "Unknown signaling event");
            return None;
        }
    };
    Some(event)
}
