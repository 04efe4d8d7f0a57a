use crate::audio::CaptureState;
use crate::error::{EchoError, Result};

/// Operations that need the instance to be in a compatible state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    StartCapture,
    Play,
    ReduceNoise,
    Import,
}

/// Snapshot of the sibling state machines, checked before either one is driven
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppState {
    pub capture: CaptureState,
    pub is_playing: bool,
    /// A noise-reduction job is pending
    pub busy: bool,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            capture: CaptureState::Idle,
            is_playing: false,
            busy: false,
        }
    }
}

impl AppState {
    pub fn is_recording(&self) -> bool {
        self.capture != CaptureState::Idle
    }

    /// Reject `op` if it would overlap with something already running
    pub fn check(&self, op: Operation) -> Result<()> {
        if self.busy {
            return Err(EchoError::ConflictingOperation("reducing noise"));
        }
        match op {
            Operation::StartCapture => {
                if self.is_playing {
                    return Err(EchoError::ConflictingOperation("playing"));
                }
                if self.is_recording() {
                    return Err(EchoError::ConflictingOperation("recording"));
                }
            }
            Operation::Play => {
                if self.is_recording() {
                    return Err(EchoError::ConflictingOperation("recording"));
                }
            }
            Operation::ReduceNoise | Operation::Import => {
                if self.is_recording() {
                    return Err(EchoError::ConflictingOperation("recording"));
                }
                if self.is_playing {
                    return Err(EchoError::ConflictingOperation("playing"));
                }
            }
        }
        Ok(())
    }
}
