//! Error types shared by the capture, playback, sync and noise-reduction components

use thiserror::Error;

/// Errors surfaced by instance operations.
///
/// Every variant leaves the component that raised it in its last
/// well-defined state; nothing here is retried automatically.
#[derive(Error, Debug)]
pub enum EchoError {
    /// The capture device could not be acquired (permission denied or absent).
    #[error("Audio input unavailable: {0}")]
    DeviceUnavailable(String),

    /// The playback resource refused to start.
    #[error("Playback rejected: {0}")]
    PlaybackRejected(String),

    /// The operation conflicts with the state of a sibling state machine.
    #[error("Operation not allowed while {0}")]
    ConflictingOperation(&'static str),

    /// The operation needs a bound artifact and none is bound.
    #[error("No audio loaded")]
    NoArtifactBound,

    /// The external noise-reduction job failed; the original artifact is kept.
    #[error("Noise reduction failed: {0}")]
    NoiseReductionFailed(String),

    /// Writing, reading or probing an artifact's WAV handle failed.
    #[error("Audio artifact error: {0}")]
    Artifact(String),

    /// The cross-instance channel could not be opened or written.
    #[error("Sync channel error: {0}")]
    Sync(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<hound::Error> for EchoError {
    fn from(e: hound::Error) -> Self {
        EchoError::Artifact(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EchoError>;
