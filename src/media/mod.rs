//! Media pipeline capability
//!
//! Capture, gain and playback live outside this crate. The broadcaster only
//! needs an output track to hand to its transport sessions and a gain knob;
//! the listener only needs somewhere to attach the track it receives.

use async_trait::async_trait;
use thiserror::Error;

/// Error type for media operations
#[derive(Debug, Error)]
pub enum MediaError {
    /// Capture could not be started (device missing, permission refused, ...)
    #[error("capture failed: {0}")]
    Capture(String),

    /// Capture is running but produced no output track
    #[error("no output track available")]
    NoOutputTrack,

    /// A received track could not be played
    #[error("playback failed: {0}")]
    Playback(String),
}

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Opaque handle of a media track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
}

impl MediaTrack {
    pub fn audio(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: TrackKind::Audio,
        }
    }
}

/// Audio pipeline of one participant
#[async_trait]
pub trait MediaPipeline: Send + Sync + 'static {
    /// Start capturing; idempotent
    async fn start_capture(&self) -> Result<(), MediaError>;

    /// Stop capturing and release the output track
    async fn stop_capture(&self);

    /// The post-gain track to send, while capturing
    fn output_track(&self) -> Option<MediaTrack>;

    /// Set the outgoing (or playback) gain in [0, 1]
    fn set_gain(&self, gain: f32);

    /// Play a received track, replacing any previous one
    async fn attach_remote_track(&self, track: MediaTrack) -> Result<(), MediaError>;

    /// Stop playing the received track, if any
    async fn detach_remote_track(&self);
}
