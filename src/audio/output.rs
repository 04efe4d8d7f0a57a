//! Playback resource abstraction
//!
//! One output per instance renders the bound handle. Position bookkeeping
//! lives in the playback controller; the output only has to start, stop and
//! jump when told to.

use super::artifact::PlayableHandle;
use crate::error::{EchoError, Result};
use async_trait::async_trait;
use log::trace;

#[async_trait]
pub trait AudioOutput: Send {
    /// Prepare a handle for playback, replacing whatever was loaded
    async fn load(&mut self, handle: &PlayableHandle) -> Result<()>;

    /// Start rendering at `position` seconds. Suspends until the engine is
    /// running; fails with `PlaybackRejected` if it refuses.
    async fn play(&mut self, position: f64) -> Result<()>;

    fn pause(&mut self);

    fn seek(&mut self, position: f64);

    fn set_volume(&mut self, volume: f32);

    fn unload(&mut self);
}

/// Output that keeps time without producing sound
#[derive(Debug, Default)]
pub struct SilentOutput {
    loaded: Option<PlayableHandle>,
    playing: bool,
    volume: f32,
}

impl SilentOutput {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AudioOutput for SilentOutput {
    async fn load(&mut self, handle: &PlayableHandle) -> Result<()> {
        if !handle.path.exists() {
            return Err(EchoError::Artifact(format!(
                "Handle {:?} does not exist",
                handle.path
            )));
        }
        self.loaded = Some(handle.clone());
        self.playing = false;
        Ok(())
    }

    async fn play(&mut self, position: f64) -> Result<()> {
        if self.loaded.is_none() {
            return Err(EchoError::PlaybackRejected("nothing loaded".into()));
        }
        trace!("Silent output playing from {:.2}s", position);
        self.playing = true;
        Ok(())
    }

    fn pause(&mut self) {
        self.playing = false;
    }

    fn seek(&mut self, position: f64) {
        trace!("Silent output seek to {:.2}s", position);
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume = volume;
    }

    fn unload(&mut self) {
        self.loaded = None;
        self.playing = false;
    }
}
