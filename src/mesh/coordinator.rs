use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::mesh::link::{LinkRole, LinkState, PeerLink};
use crate::mesh::transport::{CandidateInfo, LinkFactory, LinkNotice, LinkNoticeKind, NoticeSender};
use crate::models::{MemberInfo, SignalPayload, TrackSet};

/// Mesh coordinator tuning.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// A negotiation attempt that has not settled within this interval is
    /// failed and retried once.
    pub negotiation_timeout: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: Duration::from_secs(15),
        }
    }
}

impl From<&Config> for MeshConfig {
    fn from(config: &Config) -> Self {
        Self {
            negotiation_timeout: config.negotiation_timeout(),
        }
    }
}

/// Where outbound negotiation payloads go. The signaling client implements
/// this by queueing a `signal` envelope for the relay; tests record sends.
pub trait SignalSink: Send + Sync {
    fn send_signal(&self, target_connection_id: &str, payload: SignalPayload);
}

/// Inputs driving one room's mesh, processed strictly in arrival order.
#[derive(Debug)]
pub enum MeshEvent {
    /// existing-members reply: become offerer toward every member in it.
    Snapshot { members: Vec<MemberInfo> },
    /// participant-joined broadcast: take the answerer role and wait.
    PeerJoined { member: MemberInfo },
    /// participant-left broadcast: tear the link down immediately.
    PeerLeft { connection_id: String },
    /// Relayed negotiation payload from a peer.
    Signal {
        origin: String,
        payload: SignalPayload,
    },
    /// Screen-share presence markers from peers.
    ScreenShare {
        connection_id: String,
        sharing: bool,
    },
    /// The local published track set changed (screen share start/stop).
    SetTracks(TrackSet),
    /// Leave the room: close every link without waiting for round-trips.
    Shutdown,
    /// Internal: a spawned negotiation step finished.
    Negotiated {
        remote_id: String,
        epoch: u64,
        outcome: NegotiationOutcome,
    },
    /// Internal: watchdog for a negotiation attempt fired.
    Timeout { remote_id: String, epoch: u64 },
}

#[derive(Debug)]
pub enum NegotiationOutcome {
    OfferReady(String),
    AnswerReady(String),
    AnswerApplied,
    Failed(String),
}

/// What the coordinator reports to the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshNotification {
    PeerConnected {
        connection_id: String,
        display_name: String,
    },
    /// Negotiation exhausted its retry: the peer is degraded locally, the
    /// room and the other links are unaffected.
    PeerUnreachable { connection_id: String },
    PeerLeft { connection_id: String },
    PeerScreenShare {
        connection_id: String,
        sharing: bool,
    },
}

/// Cloneable handle feeding events into a coordinator.
#[derive(Clone)]
pub struct MeshHandle {
    events: mpsc::UnboundedSender<MeshEvent>,
}

impl MeshHandle {
    pub fn snapshot(&self, members: Vec<MemberInfo>) {
        let _ = self.events.send(MeshEvent::Snapshot { members });
    }

    pub fn peer_joined(&self, member: MemberInfo) {
        let _ = self.events.send(MeshEvent::PeerJoined { member });
    }

    pub fn peer_left(&self, connection_id: &str) {
        let _ = self.events.send(MeshEvent::PeerLeft {
            connection_id: connection_id.to_string(),
        });
    }

    pub fn signal(&self, origin: &str, payload: SignalPayload) {
        let _ = self.events.send(MeshEvent::Signal {
            origin: origin.to_string(),
            payload,
        });
    }

    pub fn screen_share(&self, connection_id: &str, sharing: bool) {
        let _ = self.events.send(MeshEvent::ScreenShare {
            connection_id: connection_id.to_string(),
            sharing,
        });
    }

    pub fn set_tracks(&self, tracks: TrackSet) {
        let _ = self.events.send(MeshEvent::SetTracks(tracks));
    }

    pub fn shutdown(&self) {
        let _ = self.events.send(MeshEvent::Shutdown);
    }
}

/// Peer Mesh Coordinator: one per joined room.
///
/// Maintains one peer-link state machine per other participant, driven by
/// a single ordered event stream. All transport I/O runs in spawned tasks
/// that report back as events, so a slow negotiation on one link never
/// blocks another; the per-link epoch keeps at most one attempt live.
pub struct MeshCoordinator {
    room_id: String,
    links: HashMap<String, PeerLink>,
    factory: Arc<dyn LinkFactory>,
    sink: Arc<dyn SignalSink>,
    config: MeshConfig,
    local_tracks: TrackSet,
    events_tx: mpsc::UnboundedSender<MeshEvent>,
    events_rx: mpsc::UnboundedReceiver<MeshEvent>,
    notices_tx: NoticeSender,
    notices_rx: mpsc::UnboundedReceiver<LinkNotice>,
    notifications: mpsc::UnboundedSender<MeshNotification>,
}

impl MeshCoordinator {
    pub fn new(
        room_id: String,
        local_tracks: TrackSet,
        factory: Arc<dyn LinkFactory>,
        sink: Arc<dyn SignalSink>,
        config: MeshConfig,
    ) -> (
        Self,
        MeshHandle,
        mpsc::UnboundedReceiver<MeshNotification>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let handle = MeshHandle {
            events: events_tx.clone(),
        };
        let coordinator = Self {
            room_id,
            links: HashMap::new(),
            factory,
            sink,
            config,
            local_tracks,
            events_tx,
            events_rx,
            notices_tx,
            notices_rx,
            notifications: notify_tx,
        };
        (coordinator, handle, notify_rx)
    }

    /// Spawn the coordinator's event loop.
    pub fn spawn(
        room_id: String,
        local_tracks: TrackSet,
        factory: Arc<dyn LinkFactory>,
        sink: Arc<dyn SignalSink>,
        config: MeshConfig,
    ) -> (
        MeshHandle,
        mpsc::UnboundedReceiver<MeshNotification>,
        tokio::task::JoinHandle<()>,
    ) {
        let (coordinator, handle, notify_rx) =
            Self::new(room_id, local_tracks, factory, sink, config);
        let task = tokio::spawn(coordinator.run());
        (handle, notify_rx, task)
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(event) => {
                        if self.handle_event(event).await {
                            break;
                        }
                    }
                    None => break,
                },
                Some(notice) = self.notices_rx.recv() => {
                    self.handle_notice(notice);
                }
            }
        }
        self.close_all_links();
    }

    /// Process one input. Returns true on shutdown.
    async fn handle_event(&mut self, event: MeshEvent) -> bool {
        match event {
            MeshEvent::Snapshot { members } => {
                // We are the later joiner toward everyone in the snapshot,
                // so we initiate every one of these links.
                for member in members {
                    if self.ensure_link(&member, LinkRole::Offerer).await {
                        self.start_negotiation(&member.connection_id);
                    }
                }
            }
            MeshEvent::PeerJoined { member } => {
                // The new member joined later than us: it offers, we answer.
                self.ensure_link(&member, LinkRole::Answerer).await;
            }
            MeshEvent::PeerLeft { connection_id } => {
                self.teardown_link(&connection_id, true);
            }
            MeshEvent::Signal { origin, payload } => match payload {
                SignalPayload::Offer { sdp } => self.handle_offer(&origin, sdp).await,
                SignalPayload::Answer { sdp } => self.handle_answer(&origin, sdp),
                SignalPayload::IceCandidate {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                } => self.handle_candidate(
                    &origin,
                    CandidateInfo {
                        candidate,
                        sdp_mid,
                        sdp_mline_index,
                    },
                ),
            },
            MeshEvent::ScreenShare {
                connection_id,
                sharing,
            } => {
                self.notify(MeshNotification::PeerScreenShare {
                    connection_id,
                    sharing,
                });
            }
            MeshEvent::SetTracks(tracks) => self.handle_set_tracks(tracks),
            MeshEvent::Negotiated {
                remote_id,
                epoch,
                outcome,
            } => self.handle_negotiated(&remote_id, epoch, outcome),
            MeshEvent::Timeout { remote_id, epoch } => {
                let stale = match self.links.get(&remote_id) {
                    Some(link) => !link.negotiating || link.epoch != epoch,
                    None => true,
                };
                if !stale {
                    tracing::warn!(
                        room_id = %self.room_id,
                        remote_id = %remote_id,
                        "Negotiation timed out"
                    );
                    self.fail_attempt(&remote_id, "negotiation timed out");
                }
            }
            MeshEvent::Shutdown => return true,
        }
        false
    }

    fn handle_notice(&mut self, notice: LinkNotice) {
        match notice.kind {
            LinkNoticeKind::Candidate(candidate) => {
                // Trickle outbound candidates as they are discovered.
                let live = self
                    .links
                    .get(&notice.remote_id)
                    .map(|l| !l.is_closed())
                    .unwrap_or(false);
                if live {
                    self.sink.send_signal(
                        &notice.remote_id,
                        SignalPayload::IceCandidate {
                            candidate: candidate.candidate,
                            sdp_mid: candidate.sdp_mid,
                            sdp_mline_index: candidate.sdp_mline_index,
                        },
                    );
                }
            }
            LinkNoticeKind::TransportFailed { reason } => {
                tracing::warn!(
                    room_id = %self.room_id,
                    remote_id = %notice.remote_id,
                    reason = %reason,
                    "Transport reported failure"
                );
                self.fail_attempt(&notice.remote_id, &reason);
            }
        }
    }

    /// Create the link for a peer if it does not exist yet. Returns true
    /// when the link exists afterwards. The deterministic role rule makes
    /// re-creation attempts no-ops, which is what prevents duplicate links
    /// for a pair.
    async fn ensure_link(&mut self, member: &MemberInfo, role: LinkRole) -> bool {
        if let Some(link) = self.links.get_mut(&member.connection_id) {
            if link.display_name.is_empty() && !member.display_name.is_empty() {
                link.display_name = member.display_name.clone();
            }
            return !link.is_closed();
        }

        match self
            .factory
            .open_link(&member.connection_id, self.notices_tx.clone())
            .await
        {
            Ok(transport) => {
                tracing::debug!(
                    room_id = %self.room_id,
                    remote_id = %member.connection_id,
                    role = ?role,
                    "Peer link created"
                );
                self.links.insert(
                    member.connection_id.clone(),
                    PeerLink::new(
                        member.connection_id.clone(),
                        member.display_name.clone(),
                        role,
                        transport,
                    ),
                );
                true
            }
            Err(e) => {
                tracing::warn!(
                    room_id = %self.room_id,
                    remote_id = %member.connection_id,
                    error = %e,
                    "Failed to open peer link"
                );
                self.notify(MeshNotification::PeerUnreachable {
                    connection_id: member.connection_id.clone(),
                });
                false
            }
        }
    }

    /// Kick off an offer-side negotiation attempt (initial or renegotiation).
    fn start_negotiation(&mut self, remote_id: &str) {
        let tracks = self.local_tracks.clone();
        let Some(link) = self.links.get_mut(remote_id) else {
            return;
        };
        if link.is_closed() {
            return;
        }
        let epoch = link.begin_attempt(tracks.clone());
        if link.state != LinkState::Connected {
            link.state = LinkState::Offering;
        }
        let transport = link.transport.clone();
        let events = self.events_tx.clone();
        let remote = remote_id.to_string();
        tokio::spawn(async move {
            let result = async {
                transport.sync_tracks(&tracks).await?;
                transport.create_offer().await
            }
            .await;
            let outcome = match result {
                Ok(sdp) => NegotiationOutcome::OfferReady(sdp),
                Err(e) => NegotiationOutcome::Failed(e.to_string()),
            };
            let _ = events.send(MeshEvent::Negotiated {
                remote_id: remote,
                epoch,
                outcome,
            });
        });
        self.arm_watchdog(remote_id, epoch);
    }

    /// A peer's offer arrived: answer it. An offer from an unknown id means
    /// the sender joined later and its offer overtook our copy of the
    /// `participant-joined` broadcast; create the answerer link on demand.
    async fn handle_offer(&mut self, origin: &str, sdp: String) {
        if !self.links.contains_key(origin) {
            let placeholder = MemberInfo {
                connection_id: origin.to_string(),
                display_name: String::new(),
                joined_at: 0,
            };
            if !self.ensure_link(&placeholder, LinkRole::Answerer).await {
                return;
            }
        }

        let tracks = self.local_tracks.clone();
        let Some(link) = self.links.get_mut(origin) else {
            return;
        };
        if link.is_closed() {
            tracing::debug!(remote_id = %origin, "Ignoring offer for closed link");
            return;
        }

        // An in-flight attempt of ours is superseded: the epoch bump
        // orphans it, and the post-settle track comparison re-issues our
        // intent if the answered exchange does not already cover it.
        let epoch = link.begin_attempt(tracks.clone());
        if link.state != LinkState::Connected {
            link.state = LinkState::Answering;
        }
        let transport = link.transport.clone();
        let events = self.events_tx.clone();
        let remote = origin.to_string();
        tokio::spawn(async move {
            let result = async {
                transport.sync_tracks(&tracks).await?;
                transport.accept_offer(&sdp).await
            }
            .await;
            let outcome = match result {
                Ok(answer) => NegotiationOutcome::AnswerReady(answer),
                Err(e) => NegotiationOutcome::Failed(e.to_string()),
            };
            let _ = events.send(MeshEvent::Negotiated {
                remote_id: remote,
                epoch,
                outcome,
            });
        });
        self.arm_watchdog(origin, epoch);
    }

    fn handle_answer(&mut self, origin: &str, sdp: String) {
        let Some(link) = self.links.get(origin) else {
            tracing::debug!(remote_id = %origin, "Answer for unknown link, ignoring");
            return;
        };
        if !link.negotiating || link.is_closed() {
            tracing::debug!(remote_id = %origin, "Stray answer, ignoring");
            return;
        }
        let epoch = link.epoch;
        let transport = link.transport.clone();
        let events = self.events_tx.clone();
        let remote = origin.to_string();
        tokio::spawn(async move {
            let outcome = match transport.accept_answer(&sdp).await {
                Ok(()) => NegotiationOutcome::AnswerApplied,
                Err(e) => NegotiationOutcome::Failed(e.to_string()),
            };
            let _ = events.send(MeshEvent::Negotiated {
                remote_id: remote,
                epoch,
                outcome,
            });
        });
    }

    /// Inbound candidates queue until the remote description settles, then
    /// apply directly (uniform trickle policy on both sides).
    fn handle_candidate(&mut self, origin: &str, candidate: CandidateInfo) {
        let Some(link) = self.links.get_mut(origin) else {
            tracing::debug!(remote_id = %origin, "Candidate for unknown link, ignoring");
            return;
        };
        if link.is_closed() {
            return;
        }
        if link.remote_settled {
            let transport = link.transport.clone();
            let remote = origin.to_string();
            tokio::spawn(async move {
                if let Err(e) = transport.add_remote_candidate(candidate).await {
                    tracing::debug!(remote_id = %remote, error = %e, "Candidate rejected");
                }
            });
        } else {
            link.queued_candidates.push(candidate);
        }
    }

    fn handle_negotiated(&mut self, remote_id: &str, epoch: u64, outcome: NegotiationOutcome) {
        let Some(link) = self.links.get_mut(remote_id) else {
            return; // link torn down while the step ran
        };
        if link.epoch != epoch || link.is_closed() {
            return; // superseded or cancelled attempt
        }

        match outcome {
            NegotiationOutcome::OfferReady(sdp) => {
                if link.state != LinkState::Connected {
                    link.state = LinkState::AwaitingAnswer;
                }
                self.sink
                    .send_signal(remote_id, SignalPayload::Offer { sdp });
            }
            NegotiationOutcome::AnswerReady(sdp) => {
                self.sink
                    .send_signal(remote_id, SignalPayload::Answer { sdp });
                self.settle_link(remote_id);
            }
            NegotiationOutcome::AnswerApplied => {
                self.settle_link(remote_id);
            }
            NegotiationOutcome::Failed(reason) => {
                self.fail_attempt(remote_id, &reason);
            }
        }
    }

    /// The two-way description exchange completed on this link.
    fn settle_link(&mut self, remote_id: &str) {
        let Some(link) = self.links.get_mut(remote_id) else {
            return;
        };
        let newly_connected = link.settle();
        let display_name = link.display_name.clone();
        let applied = link.applied_tracks.clone();

        // Flush candidates that arrived before the exchange settled.
        let transport = link.transport.clone();
        let queued: Vec<CandidateInfo> = link.queued_candidates.drain(..).collect();
        if !queued.is_empty() {
            let remote = remote_id.to_string();
            tokio::spawn(async move {
                for candidate in queued {
                    if let Err(e) = transport.add_remote_candidate(candidate).await {
                        tracing::debug!(remote_id = %remote, error = %e, "Queued candidate rejected");
                    }
                }
            });
        }

        if newly_connected {
            tracing::info!(
                room_id = %self.room_id,
                remote_id = %remote_id,
                "Peer link connected"
            );
            self.notify(MeshNotification::PeerConnected {
                connection_id: remote_id.to_string(),
                display_name,
            });
        }

        // Coalesced renegotiation: only the most recent desired track set
        // is applied once the in-flight exchange settles.
        if applied != self.local_tracks {
            self.start_negotiation(remote_id);
        }
    }

    /// A negotiation attempt failed: retry exactly once, then close the
    /// link and degrade the peer locally. Other links are untouched.
    fn fail_attempt(&mut self, remote_id: &str, reason: &str) {
        let Some(link) = self.links.get_mut(remote_id) else {
            return;
        };
        if link.is_closed() {
            return;
        }
        link.state = LinkState::Failed;
        link.negotiating = false;

        if !link.retried {
            link.retried = true;
            tracing::warn!(
                room_id = %self.room_id,
                remote_id = %remote_id,
                reason = %reason,
                "Negotiation failed, retrying once"
            );
            self.start_negotiation(remote_id);
        } else {
            tracing::warn!(
                room_id = %self.room_id,
                remote_id = %remote_id,
                reason = %reason,
                "Negotiation failed after retry, degrading peer"
            );
            self.teardown_link(remote_id, false);
            self.notify(MeshNotification::PeerUnreachable {
                connection_id: remote_id.to_string(),
            });
        }
    }

    /// The local track set changed. Every live link renegotiates
    /// independently; links with an attempt in flight pick the change up
    /// when they settle (most recent intent wins, no queue of stale ones).
    fn handle_set_tracks(&mut self, tracks: TrackSet) {
        if tracks == self.local_tracks {
            return;
        }
        self.local_tracks = tracks;

        let ready: Vec<String> = self
            .links
            .iter()
            .filter(|(_, link)| link.state == LinkState::Connected && !link.negotiating)
            .map(|(id, _)| id.clone())
            .collect();
        for remote_id in ready {
            self.start_negotiation(&remote_id);
        }
        // Idle answerer links carry the new set in whatever exchange their
        // peer initiates; negotiating links re-check on settle.
    }

    /// Close a link and, when the peer left the room, drop its record.
    fn teardown_link(&mut self, remote_id: &str, peer_left: bool) {
        if peer_left {
            let Some(mut link) = self.links.remove(remote_id) else {
                return;
            };
            link.mark_closed();
            let transport = link.transport;
            tokio::spawn(async move { transport.close().await });
            tracing::info!(
                room_id = %self.room_id,
                remote_id = %remote_id,
                "Peer left, link closed"
            );
            self.notify(MeshNotification::PeerLeft {
                connection_id: remote_id.to_string(),
            });
        } else {
            let Some(link) = self.links.get_mut(remote_id) else {
                return;
            };
            link.mark_closed();
            let transport = link.transport.clone();
            tokio::spawn(async move { transport.close().await });
        }
    }

    fn close_all_links(&mut self) {
        for (_, mut link) in self.links.drain() {
            link.mark_closed();
            let transport = link.transport;
            tokio::spawn(async move { transport.close().await });
        }
        tracing::debug!(room_id = %self.room_id, "All peer links closed");
    }

    fn arm_watchdog(&self, remote_id: &str, epoch: u64) {
        let events = self.events_tx.clone();
        let remote = remote_id.to_string();
        let timeout = self.config.negotiation_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(MeshEvent::Timeout {
                remote_id: remote,
                epoch,
            });
        });
    }

    fn notify(&self, notification: MeshNotification) {
        let _ = self.notifications.send(notification);
    }

    #[cfg(test)]
    fn link(&self, remote_id: &str) -> &PeerLink {
        self.links.get(remote_id).expect("link exists")
    }

    #[cfg(test)]
    fn link_count(&self) -> usize {
        self.links.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::error::{AppError, Result};
    use crate::mesh::transport::PeerTransport;
    use crate::models::TrackKind;

    struct FakeTransport {
        remote_id: String,
        gate: Arc<Semaphore>,
        fail_attempts: AtomicUsize,
        synced: StdMutex<Vec<TrackSet>>,
        applied_candidates: StdMutex<Vec<CandidateInfo>>,
        closed: AtomicUsize,
    }

    impl FakeTransport {
        fn synced_sets(&self) -> Vec<TrackSet> {
            self.synced.lock().unwrap().clone()
        }

        fn candidate_count(&self) -> usize {
            self.applied_candidates.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PeerTransport for FakeTransport {
        async fn sync_tracks(&self, tracks: &TrackSet) -> Result<()> {
            self.gate.acquire().await.expect("gate closed").forget();
            if self.fail_attempts.load(Ordering::SeqCst) > 0 {
                self.fail_attempts.fetch_sub(1, Ordering::SeqCst);
                return Err(AppError::PeerNegotiationFailed {
                    remote_id: self.remote_id.clone(),
                    reason: "transport rigged to fail".into(),
                });
            }
            self.synced.lock().unwrap().push(tracks.clone());
            Ok(())
        }

        async fn create_offer(&self) -> Result<String> {
            Ok(format!("offer-from-{}", self.remote_id))
        }

        async fn accept_offer(&self, _sdp: &str) -> Result<String> {
            Ok(format!("answer-to-{}", self.remote_id))
        }

        async fn accept_answer(&self, _sdp: &str) -> Result<()> {
            Ok(())
        }

        async fn add_remote_candidate(&self, candidate: CandidateInfo) -> Result<()> {
            self.applied_candidates.lock().unwrap().push(candidate);
            Ok(())
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        /// Permits each new transport's gate starts with; 0 blocks
        /// sync_tracks until the test releases it.
        initial_permits: usize,
        transports: StdMutex<HashMap<String, Arc<FakeTransport>>>,
    }

    impl FakeFactory {
        fn open() -> Arc<Self> {
            Arc::new(Self {
                initial_permits: 1024,
                transports: StdMutex::new(HashMap::new()),
            })
        }

        fn gated() -> Arc<Self> {
            Arc::new(Self {
                initial_permits: 0,
                transports: StdMutex::new(HashMap::new()),
            })
        }

        fn transport(&self, remote_id: &str) -> Arc<FakeTransport> {
            self.transports
                .lock()
                .unwrap()
                .get(remote_id)
                .expect("transport opened")
                .clone()
        }
    }

    #[async_trait]
    impl LinkFactory for FakeFactory {
        async fn open_link(
            &self,
            remote_id: &str,
            _notices: NoticeSender,
        ) -> Result<Arc<dyn PeerTransport>> {
            let transport = Arc::new(FakeTransport {
                remote_id: remote_id.to_string(),
                gate: Arc::new(Semaphore::new(self.initial_permits)),
                fail_attempts: AtomicUsize::new(0),
                synced: StdMutex::new(Vec::new()),
                applied_candidates: StdMutex::new(Vec::new()),
                closed: AtomicUsize::new(0),
            });
            self.transports
                .lock()
                .unwrap()
                .insert(remote_id.to_string(), transport.clone());
            Ok(transport)
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: StdMutex<Vec<(String, SignalPayload)>>,
    }

    impl RecordingSink {
        fn sent(&self) -> Vec<(String, SignalPayload)> {
            self.sent.lock().unwrap().clone()
        }

        fn offers_to(&self, target: &str) -> usize {
            self.sent()
                .iter()
                .filter(|(t, p)| t == target && matches!(p, SignalPayload::Offer { .. }))
                .count()
        }
    }

    impl SignalSink for RecordingSink {
        fn send_signal(&self, target_connection_id: &str, payload: SignalPayload) {
            self.sent
                .lock()
                .unwrap()
                .push((target_connection_id.to_string(), payload));
        }
    }

    fn member(id: &str, name: &str) -> MemberInfo {
        MemberInfo {
            connection_id: id.to_string(),
            display_name: name.to_string(),
            joined_at: 0,
        }
    }

    fn setup(
        factory: Arc<FakeFactory>,
        config: MeshConfig,
    ) -> (
        MeshCoordinator,
        Arc<RecordingSink>,
        mpsc::UnboundedReceiver<MeshNotification>,
    ) {
        let sink = Arc::new(RecordingSink::default());
        let (coordinator, _handle, notify_rx) = MeshCoordinator::new(
            "room-1".to_string(),
            TrackSet::audio_only(),
            factory,
            sink.clone(),
            config,
        );
        (coordinator, sink, notify_rx)
    }

    /// Drive the coordinator until no event or notice arrives for a short
    /// idle window, mimicking the run loop deterministically.
    async fn pump(coordinator: &mut MeshCoordinator) {
        loop {
            tokio::select! {
                Some(event) = coordinator.events_rx.recv() => {
                    coordinator.handle_event(event).await;
                }
                Some(notice) = coordinator.notices_rx.recv() => {
                    coordinator.handle_notice(notice);
                }
                _ = tokio::time::sleep(Duration::from_millis(100)) => break,
            }
        }
    }

    fn drain(notify_rx: &mut mpsc::UnboundedReceiver<MeshNotification>) -> Vec<MeshNotification> {
        let mut out = Vec::new();
        while let Ok(n) = notify_rx.try_recv() {
            out.push(n);
        }
        out
    }

    /// Snapshot-connect one offerer link to `id` and settle it.
    async fn connect_offerer(coordinator: &mut MeshCoordinator, id: &str) {
        coordinator
            .handle_event(MeshEvent::Snapshot {
                members: vec![member(id, "Peer")],
            })
            .await;
        pump(coordinator).await;
        coordinator
            .handle_event(MeshEvent::Signal {
                origin: id.to_string(),
                payload: SignalPayload::Answer {
                    sdp: "answer".into(),
                },
            })
            .await;
        pump(coordinator).await;
    }

    #[tokio::test]
    async fn later_joiner_offers_toward_snapshot_members() {
        let factory = FakeFactory::open();
        let (mut coordinator, sink, mut notify_rx) = setup(factory.clone(), MeshConfig::default());

        connect_offerer(&mut coordinator, "peer-b").await;

        assert_eq!(coordinator.link_count(), 1);
        let link = coordinator.link("peer-b");
        assert_eq!(link.role, LinkRole::Offerer);
        assert_eq!(link.state, LinkState::Connected);
        assert_eq!(sink.offers_to("peer-b"), 1);
        assert!(drain(&mut notify_rx).contains(&MeshNotification::PeerConnected {
            connection_id: "peer-b".into(),
            display_name: "Peer".into(),
        }));
        // The initial exchange carried the microphone track.
        assert_eq!(
            factory.transport("peer-b").synced_sets(),
            vec![TrackSet::audio_only()]
        );
    }

    #[tokio::test]
    async fn participant_joined_waits_as_answerer() {
        let factory = FakeFactory::open();
        let (mut coordinator, sink, mut notify_rx) = setup(factory.clone(), MeshConfig::default());

        coordinator
            .handle_event(MeshEvent::PeerJoined {
                member: member("peer-b", "Bora"),
            })
            .await;
        pump(&mut coordinator).await;

        // Answerer side sends nothing until the offer arrives.
        assert_eq!(coordinator.link("peer-b").state, LinkState::Idle);
        assert!(sink.sent().is_empty());

        coordinator
            .handle_event(MeshEvent::Signal {
                origin: "peer-b".into(),
                payload: SignalPayload::Offer { sdp: "offer".into() },
            })
            .await;
        pump(&mut coordinator).await;

        let link = coordinator.link("peer-b");
        assert_eq!(link.role, LinkRole::Answerer);
        assert_eq!(link.state, LinkState::Connected);
        let answers: Vec<_> = sink
            .sent()
            .into_iter()
            .filter(|(_, p)| matches!(p, SignalPayload::Answer { .. }))
            .collect();
        assert_eq!(answers.len(), 1);
        assert_eq!(drain(&mut notify_rx).len(), 1);
    }

    #[tokio::test]
    async fn no_duplicate_link_for_a_pair() {
        let factory = FakeFactory::open();
        let (mut coordinator, _sink, _notify_rx) = setup(factory, MeshConfig::default());

        coordinator
            .handle_event(MeshEvent::Snapshot {
                members: vec![member("peer-b", "Bora")],
            })
            .await;
        // A stray second announcement for the same peer must not create a
        // second link or reset the existing one.
        coordinator
            .handle_event(MeshEvent::PeerJoined {
                member: member("peer-b", "Bora"),
            })
            .await;

        assert_eq!(coordinator.link_count(), 1);
        assert_eq!(coordinator.link("peer-b").role, LinkRole::Offerer);
    }

    #[tokio::test]
    async fn early_offer_creates_answerer_link_on_demand() {
        let factory = FakeFactory::open();
        let (mut coordinator, sink, _notify_rx) = setup(factory, MeshConfig::default());

        // The offer overtook participant-joined: link springs up on demand.
        coordinator
            .handle_event(MeshEvent::Signal {
                origin: "peer-late".into(),
                payload: SignalPayload::Offer { sdp: "offer".into() },
            })
            .await;
        pump(&mut coordinator).await;

        let link = coordinator.link("peer-late");
        assert_eq!(link.role, LinkRole::Answerer);
        assert_eq!(link.state, LinkState::Connected);
        assert!(link.display_name.is_empty());
        assert_eq!(sink.sent().len(), 1);

        // The broadcast arrives afterwards and back-fills the name.
        coordinator
            .handle_event(MeshEvent::PeerJoined {
                member: member("peer-late", "Cem"),
            })
            .await;
        assert_eq!(coordinator.link("peer-late").display_name, "Cem");
        assert_eq!(coordinator.link_count(), 1);
    }

    #[tokio::test]
    async fn candidates_queue_until_descriptions_settle() {
        let factory = FakeFactory::open();
        let (mut coordinator, _sink, _notify_rx) = setup(factory.clone(), MeshConfig::default());

        coordinator
            .handle_event(MeshEvent::PeerJoined {
                member: member("peer-b", "Bora"),
            })
            .await;
        let early = CandidateInfo {
            candidate: "candidate:early".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        coordinator
            .handle_event(MeshEvent::Signal {
                origin: "peer-b".into(),
                payload: SignalPayload::IceCandidate {
                    candidate: early.candidate.clone(),
                    sdp_mid: early.sdp_mid.clone(),
                    sdp_mline_index: early.sdp_mline_index,
                },
            })
            .await;

        // Not yet applied: queued on the link.
        assert_eq!(factory.transport("peer-b").candidate_count(), 0);
        assert_eq!(coordinator.link("peer-b").queued_candidates, vec![early]);

        coordinator
            .handle_event(MeshEvent::Signal {
                origin: "peer-b".into(),
                payload: SignalPayload::Offer { sdp: "offer".into() },
            })
            .await;
        pump(&mut coordinator).await;

        // Flushed on settle; later candidates apply directly.
        assert_eq!(factory.transport("peer-b").candidate_count(), 1);
        coordinator
            .handle_event(MeshEvent::Signal {
                origin: "peer-b".into(),
                payload: SignalPayload::IceCandidate {
                    candidate: "candidate:late".into(),
                    sdp_mid: None,
                    sdp_mline_index: None,
                },
            })
            .await;
        pump(&mut coordinator).await;
        assert_eq!(factory.transport("peer-b").candidate_count(), 2);
    }

    #[tokio::test]
    async fn track_changes_coalesce_to_most_recent() {
        let factory = FakeFactory::gated();
        let (mut coordinator, sink, _notify_rx) = setup(factory.clone(), MeshConfig::default());

        // Initial connect (one permit per sync).
        coordinator
            .handle_event(MeshEvent::Snapshot {
                members: vec![member("peer-b", "Bora")],
            })
            .await;
        let transport = factory.transport("peer-b");
        transport.gate.add_permits(1);
        pump(&mut coordinator).await;
        coordinator
            .handle_event(MeshEvent::Signal {
                origin: "peer-b".into(),
                payload: SignalPayload::Answer { sdp: "a".into() },
            })
            .await;
        pump(&mut coordinator).await;
        assert_eq!(coordinator.link("peer-b").state, LinkState::Connected);

        let with_screen: TrackSet = [TrackKind::Audio, TrackKind::ScreenVideo]
            .into_iter()
            .collect();
        let with_both: TrackSet = [
            TrackKind::Audio,
            TrackKind::ScreenVideo,
            TrackKind::ScreenAudio,
        ]
        .into_iter()
        .collect();
        let audio_only = TrackSet::audio_only();

        // First change starts an attempt that blocks inside sync_tracks.
        coordinator
            .handle_event(MeshEvent::SetTracks(with_screen.clone()))
            .await;
        // Two more changes land while it is in flight: only the last may
        // produce a follow-up attempt.
        coordinator
            .handle_event(MeshEvent::SetTracks(with_both.clone()))
            .await;
        coordinator
            .handle_event(MeshEvent::SetTracks(audio_only.clone()))
            .await;

        // Release the in-flight sync and settle it.
        transport.gate.add_permits(1);
        pump(&mut coordinator).await;
        coordinator
            .handle_event(MeshEvent::Signal {
                origin: "peer-b".into(),
                payload: SignalPayload::Answer { sdp: "a".into() },
            })
            .await;
        // The settle notices the stale track set and renegotiates once more.
        transport.gate.add_permits(1);
        pump(&mut coordinator).await;
        coordinator
            .handle_event(MeshEvent::Signal {
                origin: "peer-b".into(),
                payload: SignalPayload::Answer { sdp: "a".into() },
            })
            .await;
        pump(&mut coordinator).await;

        let synced = transport.synced_sets();
        assert_eq!(synced, vec![TrackSet::audio_only(), with_screen, audio_only]);
        assert!(!synced.contains(&with_both), "intermediate intent must be skipped");
        assert_eq!(coordinator.link("peer-b").applied_tracks, TrackSet::audio_only());
        // Initial offer + two renegotiation offers.
        assert_eq!(sink.offers_to("peer-b"), 3);
    }

    #[tokio::test]
    async fn failure_retries_once_then_degrades_peer_only() {
        let factory = FakeFactory::open();
        let (mut coordinator, _sink, mut notify_rx) = setup(factory.clone(), MeshConfig::default());

        coordinator
            .handle_event(MeshEvent::Snapshot {
                members: vec![member("peer-bad", "Bad"), member("peer-good", "Good")],
            })
            .await;
        // Rig the bad peer's transport to fail the attempt and its retry.
        factory
            .transport("peer-bad")
            .fail_attempts
            .store(2, Ordering::SeqCst);
        pump(&mut coordinator).await;

        // peer-good proceeds normally.
        coordinator
            .handle_event(MeshEvent::Signal {
                origin: "peer-good".into(),
                payload: SignalPayload::Answer { sdp: "a".into() },
            })
            .await;
        pump(&mut coordinator).await;

        assert_eq!(coordinator.link("peer-bad").state, LinkState::Closed);
        assert_eq!(coordinator.link("peer-good").state, LinkState::Connected);
        let notifications = drain(&mut notify_rx);
        assert!(notifications.contains(&MeshNotification::PeerUnreachable {
            connection_id: "peer-bad".into(),
        }));
        assert!(notifications.contains(&MeshNotification::PeerConnected {
            connection_id: "peer-good".into(),
            display_name: "Good".into(),
        }));
    }

    #[tokio::test]
    async fn peer_left_cancels_in_flight_work_and_scheduled_renegotiation() {
        let factory = FakeFactory::gated();
        let (mut coordinator, sink, mut notify_rx) = setup(factory.clone(), MeshConfig::default());

        coordinator
            .handle_event(MeshEvent::Snapshot {
                members: vec![member("peer-b", "Bora")],
            })
            .await;
        let transport = factory.transport("peer-b");
        transport.gate.add_permits(1);
        pump(&mut coordinator).await;
        coordinator
            .handle_event(MeshEvent::Signal {
                origin: "peer-b".into(),
                payload: SignalPayload::Answer { sdp: "a".into() },
            })
            .await;
        pump(&mut coordinator).await;

        // Renegotiation in flight, blocked in sync_tracks...
        let with_screen: TrackSet = [TrackKind::Audio, TrackKind::ScreenVideo]
            .into_iter()
            .collect();
        coordinator
            .handle_event(MeshEvent::SetTracks(with_screen))
            .await;
        let offers_before = sink.offers_to("peer-b");

        // ...when the peer leaves. The link dies immediately.
        coordinator
            .handle_event(MeshEvent::PeerLeft {
                connection_id: "peer-b".into(),
            })
            .await;
        assert_eq!(coordinator.link_count(), 0);

        // Releasing the gate lets the orphaned attempt finish; its outcome
        // must be discarded, with no new offer and no renegotiation.
        transport.gate.add_permits(8);
        pump(&mut coordinator).await;
        assert_eq!(sink.offers_to("peer-b"), offers_before);
        assert!(transport.closed.load(Ordering::SeqCst) > 0);
        assert!(drain(&mut notify_rx).contains(&MeshNotification::PeerLeft {
            connection_id: "peer-b".into(),
        }));
    }

    #[tokio::test]
    async fn stuck_negotiation_times_out_retries_and_degrades() {
        let factory = FakeFactory::gated();
        let config = MeshConfig {
            negotiation_timeout: Duration::from_millis(30),
        };
        let (mut coordinator, _sink, mut notify_rx) = setup(factory.clone(), config);

        coordinator
            .handle_event(MeshEvent::Snapshot {
                members: vec![member("peer-b", "Bora")],
            })
            .await;
        // Never release the gate: the attempt and its retry both time out.
        pump(&mut coordinator).await;

        assert_eq!(coordinator.link("peer-b").state, LinkState::Closed);
        assert!(drain(&mut notify_rx).contains(&MeshNotification::PeerUnreachable {
            connection_id: "peer-b".into(),
        }));
    }

    #[tokio::test]
    async fn screen_share_markers_surface_as_notifications() {
        let factory = FakeFactory::open();
        let (mut coordinator, _sink, mut notify_rx) = setup(factory, MeshConfig::default());

        coordinator
            .handle_event(MeshEvent::ScreenShare {
                connection_id: "peer-b".into(),
                sharing: true,
            })
            .await;
        coordinator
            .handle_event(MeshEvent::ScreenShare {
                connection_id: "peer-b".into(),
                sharing: false,
            })
            .await;

        assert_eq!(
            drain(&mut notify_rx),
            vec![
                MeshNotification::PeerScreenShare {
                    connection_id: "peer-b".into(),
                    sharing: true,
                },
                MeshNotification::PeerScreenShare {
                    connection_id: "peer-b".into(),
                    sharing: false,
                },
            ]
        );
    }

    #[tokio::test]
    async fn shutdown_closes_every_link() {
        let factory = FakeFactory::open();
        let (mut coordinator, _sink, _notify_rx) = setup(factory.clone(), MeshConfig::default());

        connect_offerer(&mut coordinator, "peer-b").await;
        let shutdown = coordinator.handle_event(MeshEvent::Shutdown).await;
        assert!(shutdown);
        coordinator.close_all_links();
        pump(&mut coordinator).await;

        assert!(factory.transport("peer-b").closed.load(Ordering::SeqCst) > 0);
    }
}
