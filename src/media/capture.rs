use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::models::TrackKind;

/// One hardware track held open by the capture backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// The device layer. Raw capture APIs are external collaborators; this
/// seam is all the protocol core knows about them.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    async fn open_microphone(&self) -> Result<BackendTrack>;

    /// Open a screen capture. Returns the video track and, when the source
    /// carries audio, the screen-audio track. Either the whole set is
    /// opened or the call fails with nothing held.
    async fn open_screen(&self) -> Result<Vec<BackendTrack>>;

    /// Stop one hardware track. Must tolerate repeated calls.
    fn close_track(&self, track: &BackendTrack);
}

/// Common surface of an acquired capture handle.
pub trait CaptureHandle {
    fn tracks(&self) -> &[BackendTrack];

    /// Flip the handle to released. Returns true only on the first call,
    /// which is what makes release idempotent.
    fn mark_released(&self) -> bool;
}

/// A live microphone capture.
#[derive(Debug)]
pub struct AudioTrackHandle {
    track: Vec<BackendTrack>,
    enabled: AtomicBool,
    released: AtomicBool,
}

impl AudioTrackHandle {
    fn new(track: BackendTrack) -> Self {
        Self {
            track: vec![track],
            enabled: AtomicBool::new(true),
            released: AtomicBool::new(false),
        }
    }

    pub fn track(&self) -> &BackendTrack {
        &self.track[0]
    }

    /// Mute toggle: disables the outgoing audio without releasing the
    /// device.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

impl CaptureHandle for AudioTrackHandle {
    fn tracks(&self) -> &[BackendTrack] {
        &self.track
    }

    fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::SeqCst)
    }
}

/// A live screen capture: the video track plus optional screen audio.
#[derive(Debug)]
pub struct ScreenTrackHandle {
    tracks: Vec<BackendTrack>,
    released: AtomicBool,
}

impl ScreenTrackHandle {
    fn new(tracks: Vec<BackendTrack>) -> Self {
        Self {
            tracks,
            released: AtomicBool::new(false),
        }
    }

    pub fn video_track(&self) -> Option<&BackendTrack> {
        self.tracks.iter().find(|t| t.kind == TrackKind::ScreenVideo)
    }

    pub fn audio_track(&self) -> Option<&BackendTrack> {
        self.tracks.iter().find(|t| t.kind == TrackKind::ScreenAudio)
    }
}

impl CaptureHandle for ScreenTrackHandle {
    fn tracks(&self) -> &[BackendTrack] {
        &self.tracks
    }

    fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::SeqCst)
    }
}

/// Media Capture Manager: acquires and releases local capture tracks.
///
/// At most one acquisition request is outstanding per track kind, and at
/// most one screen capture is active at a time: starting a new capture
/// never implicitly replaces an existing one.
pub struct MediaCaptureManager {
    backend: Arc<dyn CaptureBackend>,
    mic_request: Mutex<()>,
    screen_request: Mutex<()>,
    screen_active: AtomicBool,
}

impl MediaCaptureManager {
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            mic_request: Mutex::new(()),
            screen_request: Mutex::new(()),
            screen_active: AtomicBool::new(false),
        }
    }

    pub async fn acquire_microphone(&self) -> Result<AudioTrackHandle> {
        let _guard = self.mic_request.lock().await;
        let track = self.backend.open_microphone().await?;
        tracing::debug!(track_id = %track.id, "Microphone acquired");
        Ok(AudioTrackHandle::new(track))
    }

    pub async fn acquire_screen_capture(&self) -> Result<ScreenTrackHandle> {
        let _guard = self.screen_request.lock().await;
        if self.screen_active.load(Ordering::SeqCst) {
            return Err(AppError::AlreadySharing);
        }

        // The backend hands back either the complete track set or an
        // error with nothing held, so a cancelled picker leaves no
        // partially acquired handle.
        let tracks = self.backend.open_screen().await?;
        self.screen_active.store(true, Ordering::SeqCst);
        tracing::debug!(tracks = tracks.len(), "Screen capture acquired");
        Ok(ScreenTrackHandle::new(tracks))
    }

    /// Stop every underlying hardware track of the handle. Idempotent, and
    /// required on every exit path so no capture indicator stays lit.
    pub fn release<H: CaptureHandle>(&self, handle: &H) {
        if !handle.mark_released() {
            return;
        }
        for track in handle.tracks() {
            self.backend.close_track(track);
            if track.kind == TrackKind::ScreenVideo {
                self.screen_active.store(false, Ordering::SeqCst);
            }
        }
        tracing::debug!(tracks = handle.tracks().len(), "Capture released");
    }
}
