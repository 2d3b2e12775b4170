/// Crate-wide error taxonomy.
///
/// Media-acquisition failures (`PermissionDenied`, `DeviceUnavailable`,
/// `AlreadySharing`, `UserCancelled`, `NotSupported`) abort the operation
/// that triggered them. `PeerNegotiationFailed` is isolated to one link.
/// `RelayTargetUnreachable` and `RoomNotFound` are expected races and are
/// handled as silent no-ops at the call site rather than propagated.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Microphone permission denied")]
    PermissionDenied,

    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Screen capture already active")]
    AlreadySharing,

    #[error("Screen capture cancelled by user")]
    UserCancelled,

    #[error("Capture not supported: {0}")]
    NotSupported(String),

    #[error("Peer negotiation failed with {remote_id}: {reason}")]
    PeerNegotiationFailed { remote_id: String, reason: String },

    #[error("Relay target not connected: {0}")]
    RelayTargetUnreachable(String),

    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Transport disconnected")]
    TransportDisconnected,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<webrtc::Error> for AppError {
    fn from(err: webrtc::Error) -> Self {
        AppError::WebRtcError(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::WebSocketError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
