pub mod participant;
pub mod signal;

pub use participant::{MemberInfo, Participant, TrackKind, TrackSet};
pub use signal::SignalPayload;
