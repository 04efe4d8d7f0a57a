//! Playback controller
//!
//! Owns the instance's single playback resource, keeps the timeline and
//! publishes position updates at the resource's update granularity.
//! Position is tracked against the tokio clock; the output only renders.

use super::artifact::{probe_duration, AudioArtifact, PlayableHandle, WeakArtifact};
use super::output::AudioOutput;
use crate::error::{EchoError, Result};
use log::{debug, info, trace, warn};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use uuid::Uuid;

/// Default timeline update granularity
pub const DEFAULT_TICK: Duration = Duration::from_millis(250);

/// Timeline events published by the controller
#[derive(Clone, Debug, PartialEq)]
pub enum TimelineEvent {
    DurationKnown(f64),
    Position(f64),
    /// Position reached the end; playback stopped
    Ended,
}

/// Point-in-time view of the playback state
#[derive(Clone, Debug, PartialEq)]
pub struct PlaybackSnapshot {
    pub bound: Option<Uuid>,
    pub is_playing: bool,
    pub position: f64,
    pub duration: Option<f64>,
    pub volume: f32,
}

struct Binding {
    artifact: WeakArtifact,
    handle: PlayableHandle,
}

pub struct PlaybackController {
    output: Box<dyn AudioOutput>,
    binding: Option<Binding>,
    is_playing: bool,
    /// Position at `anchor`, or the frozen position while paused
    base: f64,
    anchor: Option<Instant>,
    duration: Option<f64>,
    volume: f32,
    tick: Duration,
    ticker: Option<Interval>,
    probe: Option<JoinHandle<Result<f64>>>,
    events: broadcast::Sender<TimelineEvent>,
}

enum Step {
    Probed(std::result::Result<Result<f64>, tokio::task::JoinError>),
    Tick,
}

impl PlaybackController {
    pub fn new(output: Box<dyn AudioOutput>, tick: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            output,
            binding: None,
            is_playing: false,
            base: 0.0,
            anchor: None,
            duration: None,
            volume: 1.0,
            tick,
            ticker: None,
            probe: None,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimelineEvent> {
        self.events.subscribe()
    }

    /// Bind a new artifact and reset the timeline.
    ///
    /// The controller only keeps a weak reference; the artifact store owns
    /// the handle and releases whatever this binding supersedes.
    pub async fn bind(&mut self, artifact: &AudioArtifact, handle: PlayableHandle) -> Result<()> {
        self.output.load(&handle).await?;

        if let Some(probe) = self.probe.take() {
            probe.abort();
        }
        self.is_playing = false;
        self.base = 0.0;
        self.anchor = None;
        self.ticker = None;
        self.duration = artifact.duration();
        if self.duration.is_none() {
            self.probe = Some(tokio::spawn(probe_duration(handle.path.clone())));
        }
        info!("Bound artifact {}", artifact.id());
        self.binding = Some(Binding {
            artifact: artifact.downgrade(),
            handle,
        });
        self.output.set_volume(self.volume);
        Ok(())
    }

    /// Start or resume playback from the current position
    pub async fn play(&mut self) -> Result<()> {
        if self.binding.is_none() {
            return Err(EchoError::NoArtifactBound);
        }
        if self.is_playing {
            return Ok(());
        }
        if self.at_end() {
            // Finished clips start over
            self.base = 0.0;
        }

        self.output.play(self.base).await?;

        let now = Instant::now();
        self.is_playing = true;
        self.anchor = Some(now);
        let mut ticker = tokio::time::interval_at(now + self.tick, self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
        debug!("Playback started at {:.2}s", self.base);
        Ok(())
    }

    /// Reload the bound handle into the output, keeping the timeline
    pub async fn reload(&mut self) -> Result<()> {
        let Some(handle) = self.binding.as_ref().map(|b| b.handle.clone()) else {
            return Err(EchoError::NoArtifactBound);
        };
        self.output.load(&handle).await?;
        self.output.set_volume(self.volume);
        self.output.seek(self.position());
        debug!("Reloaded artifact {} at {:.2}s", handle.id, self.position());
        Ok(())
    }

    /// Pause and freeze the position. Calling it while paused changes nothing.
    pub fn pause(&mut self) {
        if !self.is_playing {
            return;
        }
        self.base = self.position();
        self.anchor = None;
        self.ticker = None;
        self.is_playing = false;
        self.output.pause();
        debug!("Playback paused at {:.2}s", self.base);
    }

    /// Jump to `target` seconds, clamped to the clip. Returns the applied position.
    pub fn seek(&mut self, target: f64) -> Result<f64> {
        if self.binding.is_none() {
            return Err(EchoError::NoArtifactBound);
        }
        let position = self.clamp(target);
        self.base = position;
        if self.is_playing {
            self.anchor = Some(Instant::now());
        }
        self.output.seek(position);
        trace!("Seek to {:.2}s", position);
        Ok(position)
    }

    /// Set output volume in [0, 1]. Returns the applied volume.
    pub fn set_volume(&mut self, volume: f32) -> f32 {
        self.volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
        self.output.set_volume(self.volume);
        self.volume
    }

    pub fn position(&self) -> f64 {
        let position = match self.anchor {
            Some(anchor) => self.base + anchor.elapsed().as_secs_f64(),
            None => self.base,
        };
        self.clamp(position)
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    /// Position has reached the known end of the clip
    pub fn at_end(&self) -> bool {
        matches!(self.duration, Some(d) if self.position() >= d)
    }

    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn bound_id(&self) -> Option<Uuid> {
        self.binding.as_ref().map(|b| b.handle.id)
    }

    /// The bound artifact, if it is still alive
    pub fn bound_artifact(&self) -> Option<AudioArtifact> {
        self.binding.as_ref().and_then(|b| b.artifact.upgrade())
    }

    pub fn bound_handle(&self) -> Option<&PlayableHandle> {
        self.binding.as_ref().map(|b| &b.handle)
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            bound: self.bound_id(),
            is_playing: self.is_playing,
            position: self.position(),
            duration: self.duration,
            volume: self.volume,
        }
    }

    /// Drop the binding and silence the output
    pub fn unbind(&mut self) {
        self.pause();
        if let Some(probe) = self.probe.take() {
            probe.abort();
        }
        self.binding = None;
        self.duration = None;
        self.base = 0.0;
        self.output.unload();
    }

    /// Wait for the next timeline event. Pending while idle with nothing to probe.
    pub async fn next_event(&mut self) -> TimelineEvent {
        loop {
            let step = tokio::select! {
                result = wait_probe(&mut self.probe) => Step::Probed(result),
                _ = wait_tick(&mut self.ticker) => Step::Tick,
            };

            match step {
                Step::Probed(result) => {
                    self.probe = None;
                    let seconds = match result {
                        Ok(Ok(seconds)) => seconds,
                        Ok(Err(e)) => {
                            warn!("Duration probe failed: {}", e);
                            match self.fallback_duration() {
                                Some(seconds) => seconds,
                                None => continue,
                            }
                        }
                        // Aborted by a rebind
                        Err(_) => continue,
                    };
                    self.set_duration(seconds);
                    return self.emit(TimelineEvent::DurationKnown(seconds));
                }
                Step::Tick => {
                    let position = self.position();
                    if matches!(self.duration, Some(d) if position >= d) {
                        self.finish();
                        return self.emit(TimelineEvent::Ended);
                    }
                    return self.emit(TimelineEvent::Position(position));
                }
            }
        }
    }

    fn set_duration(&mut self, seconds: f64) {
        self.duration = Some(seconds);
        if let Some(artifact) = self.bound_artifact() {
            artifact.set_duration(seconds);
        }
        if self.base > seconds {
            self.base = seconds;
        }
        debug!("Duration known: {:.2}s", seconds);
    }

    /// Duration computed from the payload when the handle cannot be probed
    fn fallback_duration(&self) -> Option<f64> {
        let artifact = self.bound_artifact()?;
        let rate = artifact.format().sample_rate.max(1);
        Some(artifact.frame_count() as f64 / rate as f64)
    }

    fn finish(&mut self) {
        self.base = self.duration.unwrap_or(self.base);
        self.anchor = None;
        self.ticker = None;
        self.is_playing = false;
        self.output.pause();
        info!("Playback reached the end");
    }

    fn clamp(&self, seconds: f64) -> f64 {
        let seconds = if seconds.is_nan() { 0.0 } else { seconds.max(0.0) };
        match self.duration {
            Some(duration) => seconds.min(duration),
            None => seconds,
        }
    }

    fn emit(&self, event: TimelineEvent) -> TimelineEvent {
        let _ = self.events.send(event.clone());
        event
    }
}

async fn wait_probe(
    probe: &mut Option<JoinHandle<Result<f64>>>,
) -> std::result::Result<Result<f64>, tokio::task::JoinError> {
    match probe {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn wait_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Normalize a 0–100 volume percentage, clamping out-of-range input first
pub fn volume_from_percent(percent: i64) -> f32 {
    percent.clamp(0, 100) as f32 / 100.0
}

/// Format seconds as m:ss
pub fn format_time(seconds: f64) -> String {
    let total = if seconds.is_finite() { seconds.max(0.0) as u64 } else { 0 };
    format!("{}:{:02}", total / 60, total % 60)
}
