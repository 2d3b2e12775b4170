pub mod handler;
pub mod messages;
pub mod session;

pub use handler::ws_routes;
pub use messages::{
    msg_types, ExistingMembersPayload, JoinRoomPayload, LeaveRoomPayload, LeftRoomPayload,
    ParticipantJoinedPayload, ParticipantLeftPayload, ScreenShareEventPayload,
    ScreenShareMarkerPayload, SignalDeliverPayload, SignalSendPayload, WelcomePayload,
    WireMessage,
};
pub use session::{ClientHandle, ConnectionGateway};
