//! Audio capture, artifacts and playback
//!
//! This module provides:
//! - The capture session state machine over a pluggable input device
//! - Audio artifacts and their playable WAV handles
//! - The playback controller and its timeline
//! - PipeWire input and output (feature `pipewire`)

mod artifact;
mod capture;
mod device;
mod output;
mod playback;
#[cfg(feature = "pipewire")]
mod pipewire;

pub use artifact::{load_wav, ArtifactOrigin, ArtifactStore, AudioArtifact, AudioFormat};
pub use capture::{CaptureSession, CaptureState};
pub use device::{CaptureDevice, SyntheticDevice};
pub use output::{AudioOutput, SilentOutput};
pub use playback::{
    format_time, volume_from_percent, PlaybackController, PlaybackSnapshot, TimelineEvent,
    DEFAULT_TICK,
};
#[cfg(feature = "pipewire")]
pub use pipewire::{PipeWireDevice, PipeWireOutput};

#[cfg(test)]
pub use artifact::PlayableHandle;
#[cfg(test)]
pub use device::testing;
