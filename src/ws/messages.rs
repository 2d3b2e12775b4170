use serde::{Deserialize, Serialize};

use crate::models::MemberInfo;

/// Wrapper for all WebSocket messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub payload: serde_json::Value,
}

impl WireMessage {
    pub fn new(msg_type: &str, payload: serde_json::Value) -> Self {
        Self {
            msg_type: msg_type.to_string(),
            request_id: None,
            payload,
        }
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn error(code: u16, message: &str, request_id: Option<String>) -> Self {
        Self {
            msg_type: "error".to_string(),
            request_id,
            payload: serde_json::json!({
                "code": code,
                "message": message
            }),
        }
    }
}

// ==================== Client -> Server Messages ====================

/// join-room message payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRoomPayload {
    pub room_id: String,
    pub display_name: String,
}

/// signal message payload as sent by a client. The negotiation payload is
/// opaque to the server: it is forwarded verbatim, never inspected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSendPayload {
    pub target_connection_id: String,
    pub payload: serde_json::Value,
}

/// screen-share-started / screen-share-ended marker payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenShareMarkerPayload {
    pub room_id: String,
}

/// leave-room message payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveRoomPayload {
    pub room_id: String,
}

// ==================== Server -> Client Messages ====================

/// welcome payload, sent once when the transport connects; carries the
/// connection id the server assigned for the lifetime of this connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WelcomePayload {
    pub connection_id: String,
}

/// existing-members reply payload (only to the joining client)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistingMembersPayload {
    pub room_id: String,
    pub members: Vec<MemberInfo>,
}

/// participant-joined broadcast payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantJoinedPayload {
    pub room_id: String,
    pub connection_id: String,
    pub display_name: String,
    /// Unix timestamp (seconds) when the member joined
    pub joined_at: i64,
}

/// participant-left broadcast payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantLeftPayload {
    pub room_id: String,
    pub connection_id: String,
}

/// signal as delivered to the target client, tagged with its origin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalDeliverPayload {
    pub origin_connection_id: String,
    pub payload: serde_json::Value,
}

/// screen-share presence broadcast payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenShareEventPayload {
    pub room_id: String,
    pub connection_id: String,
}

/// left-room ack payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeftRoomPayload {
    pub room_id: String,
    pub success: bool,
}

/// Message types for matching
pub mod msg_types {
    // Client -> Server
    pub const JOIN_ROOM: &str = "join-room";
    pub const SIGNAL: &str = "signal";
    pub const SCREEN_SHARE_STARTED: &str = "screen-share-started";
    pub const SCREEN_SHARE_ENDED: &str = "screen-share-ended";
    pub const LEAVE_ROOM: &str = "leave-room";
    pub const PING: &str = "ping";

    // Server -> Client
    pub const WELCOME: &str = "welcome";
    pub const EXISTING_MEMBERS: &str = "existing-members";
    pub const PARTICIPANT_JOINED: &str = "participant-joined";
    pub const PARTICIPANT_LEFT: &str = "participant-left";
    pub const LEFT_ROOM: &str = "left-room";
    pub const ERROR: &str = "error";
    pub const PONG: &str = "pong";
}
