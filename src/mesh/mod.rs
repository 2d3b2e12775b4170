pub mod coordinator;
pub mod link;
pub mod transport;

pub use coordinator::{MeshConfig, MeshCoordinator, MeshEvent, MeshHandle, MeshNotification, SignalSink};
pub use link::{LinkRole, LinkState, PeerLink};
pub use transport::{CandidateInfo, LinkFactory, LinkNotice, LinkNoticeKind, NoticeSender, PeerTransport};
