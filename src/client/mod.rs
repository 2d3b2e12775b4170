pub mod session;
pub mod signaling;

pub use session::RoomSession;
pub use signaling::{RelayEvent, SignalingClient};
