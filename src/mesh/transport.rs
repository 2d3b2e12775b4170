use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::models::TrackSet;

/// An ICE candidate as it crosses the signaling channel, in either
/// direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateInfo {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// Out-of-band notification pushed by a transport while a link is open.
#[derive(Debug)]
pub struct LinkNotice {
    pub remote_id: String,
    pub kind: LinkNoticeKind,
}

#[derive(Debug)]
pub enum LinkNoticeKind {
    /// Locally discovered ICE candidate to trickle to the remote side.
    Candidate(CandidateInfo),
    /// The underlying transport failed after setup.
    TransportFailed { reason: String },
}

pub type NoticeSender = mpsc::UnboundedSender<LinkNotice>;

/// One peer link's media transport, as the mesh coordinator sees it.
///
/// The coordinator owns the negotiation state machine; implementations own
/// the actual connection. Calls arrive strictly serialized per link (one
/// negotiation in flight at a time).
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Make the set of outgoing tracks match `tracks`, adding and removing
    /// senders without disturbing tracks present in both sets.
    async fn sync_tracks(&self, tracks: &TrackSet) -> Result<()>;

    /// Produce a local offer describing the current track set.
    async fn create_offer(&self) -> Result<String>;

    /// Apply a remote offer and produce the local answer.
    async fn accept_offer(&self, sdp: &str) -> Result<String>;

    /// Apply the remote answer to our outstanding offer.
    async fn accept_answer(&self, sdp: &str) -> Result<()>;

    /// Apply a remote ICE candidate. Only called once the remote
    /// description has settled; earlier candidates are queued upstream.
    async fn add_remote_candidate(&self, candidate: CandidateInfo) -> Result<()>;

    /// Tear the transport down. Must be safe to call more than once.
    async fn close(&self);
}

/// Opens one transport per peer link.
#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn open_link(
        &self,
        remote_id: &str,
        notices: NoticeSender,
    ) -> Result<Arc<dyn PeerTransport>>;
}
