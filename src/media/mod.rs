pub mod capture;
pub mod engine;

pub use capture::{
    AudioTrackHandle, BackendTrack, CaptureBackend, CaptureHandle, MediaCaptureManager,
    ScreenTrackHandle,
};
pub use engine::WebRtcEngine;
