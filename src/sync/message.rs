//! Wire format of cross-instance sync messages

use crate::error::{EchoError, Result};
use serde::{Deserialize, Serialize};

/// A message broadcast to every other instance on the channel.
///
/// Serialized as `{"type":"timelineUpdate","currentTime":1.5,"isPlaying":true}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncMessage {
    #[serde(rename_all = "camelCase")]
    TimelineUpdate {
        current_time: f64,
        is_playing: bool,
        /// Sender's monotonic clock in ms. Informational; never used for ordering.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sent_at: Option<u64>,
    },
}

impl SyncMessage {
    pub fn timeline(current_time: f64, is_playing: bool) -> Self {
        SyncMessage::TimelineUpdate {
            current_time,
            is_playing,
            sent_at: None,
        }
    }

    pub fn current_time(&self) -> f64 {
        match self {
            SyncMessage::TimelineUpdate { current_time, .. } => *current_time,
        }
    }

    pub fn is_playing(&self) -> bool {
        match self {
            SyncMessage::TimelineUpdate { is_playing, .. } => *is_playing,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| EchoError::Sync(e.to_string()))
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| EchoError::Sync(e.to_string()))
    }
}
