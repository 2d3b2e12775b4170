use std::sync::Arc;

use tokio::sync::mpsc;

use crate::client::signaling::{RelayEvent, SignalingClient};
use crate::error::Result;
use crate::media::capture::{AudioTrackHandle, MediaCaptureManager, ScreenTrackHandle};
use crate::mesh::{
    LinkFactory, MeshConfig, MeshCoordinator, MeshHandle, MeshNotification, SignalSink,
};
use crate::models::{TrackKind, TrackSet};

/// One joined room, tying capture, signaling, and the mesh together.
///
/// Construction order is the propagation policy: the microphone is
/// acquired before anything touches the network, so a participant that
/// cannot publish audio never appears in the registry.
pub struct RoomSession {
    room_id: String,
    signaling: Arc<SignalingClient>,
    capture: Arc<MediaCaptureManager>,
    mesh: MeshHandle,
    notifications: mpsc::UnboundedReceiver<MeshNotification>,
    microphone: AudioTrackHandle,
    screen: Option<ScreenTrackHandle>,
    mesh_task: tokio::task::JoinHandle<()>,
    pump_task: tokio::task::JoinHandle<()>,
}

impl RoomSession {
    pub async fn join(
        url: &str,
        room_id: &str,
        display_name: &str,
        capture: Arc<MediaCaptureManager>,
        factory: Arc<dyn LinkFactory>,
        config: MeshConfig,
    ) -> Result<Self> {
        // Media first: no partial join.
        let microphone = capture.acquire_microphone().await?;

        let (signaling, mut events) = match SignalingClient::connect(url).await {
            Ok(connected) => connected,
            Err(e) => {
                capture.release(&microphone);
                return Err(e);
            }
        };
        let signaling = Arc::new(signaling);

        let (mesh, notifications, mesh_task) = MeshCoordinator::spawn(
            room_id.to_string(),
            TrackSet::audio_only(),
            factory,
            signaling.clone() as Arc<dyn SignalSink>,
            config,
        );

        signaling.join_room(room_id, display_name);

        // Pump relay events into the coordinator's ordered stream.
        let pump_mesh = mesh.clone();
        let pump_room = room_id.to_string();
        let pump_task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    RelayEvent::ExistingMembers { room_id, members } if room_id == pump_room => {
                        pump_mesh.snapshot(members);
                    }
                    RelayEvent::ParticipantJoined { room_id, member } if room_id == pump_room => {
                        pump_mesh.peer_joined(member);
                    }
                    RelayEvent::ParticipantLeft {
                        room_id,
                        connection_id,
                    } if room_id == pump_room => {
                        pump_mesh.peer_left(&connection_id);
                    }
                    RelayEvent::Signal { origin, payload } => {
                        pump_mesh.signal(&origin, payload);
                    }
                    RelayEvent::ScreenShare {
                        room_id,
                        connection_id,
                        sharing,
                    } if room_id == pump_room => {
                        pump_mesh.screen_share(&connection_id, sharing);
                    }
                    RelayEvent::Disconnected => {
                        pump_mesh.shutdown();
                        break;
                    }
                    _ => {}
                }
            }
        });

        Ok(Self {
            room_id: room_id.to_string(),
            signaling,
            capture,
            mesh,
            notifications,
            microphone,
            screen: None,
            mesh_task,
            pump_task,
        })
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn microphone(&self) -> &AudioTrackHandle {
        &self.microphone
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen.is_some()
    }

    /// Next mesh notification (peer connected/unreachable/left,
    /// screen-share presence).
    pub async fn next_notification(&mut self) -> Option<MeshNotification> {
        self.notifications.recv().await
    }

    /// Start sharing the screen: acquire the capture, renegotiate the new
    /// track set on every link, and announce the presence marker.
    /// A second start while one is active fails with `AlreadySharing` and
    /// leaves the existing capture untouched.
    pub async fn start_screen_share(&mut self) -> Result<()> {
        let handle = self.capture.acquire_screen_capture().await?;

        let mut tracks = TrackSet::audio_only();
        tracks.insert(TrackKind::ScreenVideo);
        if handle.audio_track().is_some() {
            tracks.insert(TrackKind::ScreenAudio);
        }
        self.screen = Some(handle);

        self.mesh.set_tracks(tracks);
        self.signaling.screen_share_marker(&self.room_id, true);
        tracing::info!(room_id = %self.room_id, "Screen share started");
        Ok(())
    }

    /// Stop sharing: release the capture, renegotiate back to audio only,
    /// announce the end marker. A no-op when nothing is being shared.
    pub fn stop_screen_share(&mut self) {
        let Some(handle) = self.screen.take() else {
            return;
        };
        self.capture.release(&handle);
        self.mesh.set_tracks(TrackSet::audio_only());
        self.signaling.screen_share_marker(&self.room_id, false);
        tracing::info!(room_id = %self.room_id, "Screen share stopped");
    }

    /// Leave the room: cancel every in-flight negotiation immediately (no
    /// waiting for network round-trips), release every capture, tell the
    /// relay.
    pub fn leave(mut self) {
        tracing::info!(room_id = %self.room_id, "Leaving room");
        self.mesh.shutdown();
        self.signaling.leave_room(&self.room_id);
        self.release_captures();
    }

    fn release_captures(&mut self) {
        if let Some(handle) = self.screen.take() {
            self.capture.release(&handle);
        }
        self.capture.release(&self.microphone);
    }
}

impl Drop for RoomSession {
    /// Process-teardown safety net: handles are idempotent, so this is
    /// harmless after an explicit `leave`.
    fn drop(&mut self) {
        self.release_captures();
        self.mesh.shutdown();
        self.pump_task.abort();
        self.mesh_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::error::AppError;
    use crate::media::capture::{BackendTrack, CaptureBackend};

    struct DeniedBackend;

    #[async_trait]
    impl CaptureBackend for DeniedBackend {
        async fn open_microphone(&self) -> Result<BackendTrack> {
            Err(AppError::PermissionDenied)
        }
        async fn open_screen(&self) -> Result<Vec<BackendTrack>> {
            Err(AppError::NotSupported("no screen".into()))
        }
        fn close_track(&self, _track: &BackendTrack) {}
    }

    struct NoFactory;

    #[async_trait]
    impl LinkFactory for NoFactory {
        async fn open_link(
            &self,
            _remote_id: &str,
            _notices: crate::mesh::NoticeSender,
        ) -> Result<Arc<dyn crate::mesh::PeerTransport>> {
            Err(AppError::NotSupported("test factory".into()))
        }
    }

    #[tokio::test]
    async fn microphone_failure_aborts_join_before_any_network_activity() {
        let capture = Arc::new(MediaCaptureManager::new(Arc::new(DeniedBackend)));

        // The URL is unroutable; if join tried to connect first the error
        // would be a WebSocket error, not PermissionDenied.
        let result = RoomSession::join(
            "ws://127.0.0.1:1/ws",
            "room-1",
            "Ana",
            capture,
            Arc::new(NoFactory),
            MeshConfig::default(),
        )
        .await;

        assert!(matches!(result, Err(AppError::PermissionDenied)));
    }
}
