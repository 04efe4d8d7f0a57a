//! User-facing notifications
//!
//! Every visible state transition produces one of these. Presentation is up
//! to the subscriber.

use crate::error::EchoError;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    Info,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub level: Level,
    pub title: String,
    pub description: String,
}

impl Notification {
    pub fn info(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            level: Level::Info,
            title: title.into(),
            description: description.into(),
        }
    }

    pub fn error(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            level: Level::Error,
            title: title.into(),
            description: description.into(),
        }
    }
}

impl From<&EchoError> for Notification {
    fn from(e: &EchoError) -> Self {
        match e {
            EchoError::DeviceUnavailable(_) => {
                Notification::error("Error", "Failed to start recording. Check permissions.")
            }
            EchoError::PlaybackRejected(reason) => Notification::error("Playback failed", reason.clone()),
            EchoError::NoArtifactBound => Notification::error("No audio", "Record or open a clip first"),
            EchoError::NoiseReductionFailed(reason) => {
                Notification::error("Error reducing noise", reason.clone())
            }
            EchoError::ConflictingOperation(_) => Notification::error("Not now", e.to_string()),
            other => Notification::error("Error", other.to_string()),
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.title, self.description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_notifications() {
        let n = Notification::from(&EchoError::DeviceUnavailable("permission denied".into()));
        assert_eq!(n.level, Level::Error);
        assert_eq!(n.to_string(), "[Error] Failed to start recording. Check permissions.");

        let n = Notification::from(&EchoError::ConflictingOperation("recording"));
        assert_eq!(n.to_string(), "[Not now] Operation not allowed while recording");
    }
}
