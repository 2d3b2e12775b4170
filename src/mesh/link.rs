use std::fmt;
use std::sync::Arc;

use crate::mesh::transport::{CandidateInfo, PeerTransport};
use crate::models::TrackSet;

/// Which side initiated the link. The later-joining side always offers:
/// offerer links are created from the existing-members snapshot, answerer
/// links from `participant-joined` events, so exactly one offerer exists
/// per pair without a tie-break round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Offerer,
    Answerer,
}

/// Per-link negotiation state.
///
/// Offerer path: Idle -> Offering -> AwaitingAnswer -> Connected.
/// Answerer path: Idle -> Answering -> Connected.
/// Failed is reachable from any non-terminal state; Closed is terminal,
/// reached on leave, remote disconnect, or once Failed exhausts its retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Offering,
    AwaitingAnswer,
    Answering,
    Connected,
    Failed,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Idle => "idle",
            LinkState::Offering => "offering",
            LinkState::AwaitingAnswer => "awaiting-answer",
            LinkState::Answering => "answering",
            LinkState::Connected => "connected",
            LinkState::Failed => "failed",
            LinkState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One peer link: the state machine record for the unordered pair
/// (local participant, remote participant) within a room.
pub struct PeerLink {
    pub remote_id: String,
    /// Back-filled from `participant-joined` when the link was created on
    /// demand by an early offer.
    pub display_name: String,
    pub role: LinkRole,
    pub state: LinkState,
    pub transport: Arc<dyn PeerTransport>,
    /// The single negotiation token: every attempt bumps it, and spawned
    /// work reports back tagged with the epoch it started under. Stale
    /// completions and watchdogs are discarded on mismatch.
    pub epoch: u64,
    /// True while a negotiation attempt is in flight on this link.
    pub negotiating: bool,
    /// Whether the current attempt already consumed the automatic retry.
    pub retried: bool,
    /// True once the remote description for the current exchange has been
    /// applied; until then inbound candidates are queued here.
    pub remote_settled: bool,
    pub queued_candidates: Vec<CandidateInfo>,
    /// Track set the transport currently carries (last settled sync).
    pub applied_tracks: TrackSet,
    /// Track set the in-flight attempt is applying, promoted to
    /// `applied_tracks` when the attempt settles.
    pub in_flight_tracks: Option<TrackSet>,
}

impl PeerLink {
    pub fn new(
        remote_id: String,
        display_name: String,
        role: LinkRole,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        Self {
            remote_id,
            display_name,
            role,
            state: LinkState::Idle,
            transport,
            epoch: 0,
            negotiating: false,
            retried: false,
            remote_settled: false,
            queued_candidates: Vec::new(),
            applied_tracks: TrackSet::new(),
            in_flight_tracks: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == LinkState::Closed
    }

    /// Start a new negotiation attempt: bump the epoch (orphaning any
    /// in-flight work) and record the track set this attempt will carry.
    pub fn begin_attempt(&mut self, tracks: TrackSet) -> u64 {
        self.epoch += 1;
        self.negotiating = true;
        self.remote_settled = false;
        self.in_flight_tracks = Some(tracks);
        self.epoch
    }

    /// The current exchange settled: promote the in-flight track set and
    /// clear the attempt bookkeeping. Returns true when this transition
    /// newly reached Connected.
    pub fn settle(&mut self) -> bool {
        self.negotiating = false;
        self.retried = false;
        self.remote_settled = true;
        if let Some(tracks) = self.in_flight_tracks.take() {
            self.applied_tracks = tracks;
        }
        let newly_connected = self.state != LinkState::Connected;
        self.state = LinkState::Connected;
        newly_connected
    }

    /// Terminal teardown: orphan in-flight work and mark Closed. The
    /// transport itself is closed by the caller (async).
    pub fn mark_closed(&mut self) {
        self.epoch += 1;
        self.negotiating = false;
        self.in_flight_tracks = None;
        self.queued_candidates.clear();
        self.state = LinkState::Closed;
    }
}
