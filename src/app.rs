//! One EchoLink instance
//!
//! Composes the capture session, artifact store, playback controller, sync
//! protocol and noise-reduction job, and drives them from a single event
//! loop. Every user-visible transition publishes a [`Notification`].

use crate::audio::{
    format_time, volume_from_percent, ArtifactStore, AudioArtifact, AudioOutput, CaptureDevice,
    CaptureSession, PlaybackController, PlaybackSnapshot, TimelineEvent, DEFAULT_TICK,
};
use crate::denoise::{NoiseReducer, NoiseReductionRequest};
use crate::error::{EchoError, Result};
use crate::notify::Notification;
use crate::state::{AppState, Operation};
use crate::sync::{plan_inbound, SyncChannel, SyncEvent, SyncMessage, SyncProtocol, DEFAULT_INTERVAL};
use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinError, JoinHandle};
use uuid::Uuid;

pub const HELP: &str = "\
record          start recording (or stop if recording)
stop            stop recording
play | pause    control playback
toggle          play or pause
seek <secs>     jump to a position
volume <0-100>  set playback volume
denoise         reduce background noise in the current clip
open <file>     open a WAV file
status          show the current state
quit            exit";

/// User actions accepted by a running instance
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Record,
    Stop,
    Play,
    Pause,
    Toggle,
    Seek(f64),
    Volume(i64),
    Denoise,
    Open(PathBuf),
    Status,
    Help,
    Quit,
}

/// Per-instance settings
#[derive(Clone, Debug)]
pub struct InstanceConfig {
    /// Where playable handles are written; defaults to a per-instance cache dir
    pub artifact_dir: Option<PathBuf>,
    pub tick: Duration,
    pub sync_interval: Duration,
    pub volume_percent: i64,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            artifact_dir: None,
            tick: DEFAULT_TICK,
            sync_interval: DEFAULT_INTERVAL,
            volume_percent: 100,
        }
    }
}

type NoiseJob = JoinHandle<anyhow::Result<AudioArtifact>>;

pub struct EchoLink {
    id: Uuid,
    capture: CaptureSession,
    device: Arc<dyn CaptureDevice>,
    store: ArtifactStore,
    player: PlaybackController,
    sync: SyncProtocol,
    reducer: Arc<dyn NoiseReducer>,
    /// Pending noise-reduction job; the instance is busy while set
    noise_job: Option<NoiseJob>,
    notifications: broadcast::Sender<Notification>,
}

impl EchoLink {
    pub fn new(
        config: InstanceConfig,
        device: Arc<dyn CaptureDevice>,
        output: Box<dyn AudioOutput>,
        channel: Box<dyn SyncChannel>,
        reducer: Arc<dyn NoiseReducer>,
    ) -> Self {
        let id = Uuid::new_v4();
        let dir = config
            .artifact_dir
            .unwrap_or_else(|| ArtifactStore::default_dir(id));
        let mut player = PlaybackController::new(output, config.tick);
        player.set_volume(volume_from_percent(config.volume_percent));
        let (notifications, _) = broadcast::channel(64);

        let sync = SyncProtocol::new(channel, config.sync_interval);
        info!(
            "Instance {} joined sync channel {} (every {:?})",
            id,
            sync.channel_name(),
            sync.interval()
        );
        let store = ArtifactStore::new(dir);
        debug!("Artifacts for {} live in {:?}", id, store.dir());
        Self {
            id,
            capture: CaptureSession::new(),
            device,
            store,
            player,
            sync,
            reducer,
            noise_job: None,
            notifications,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            capture: self.capture.state(),
            is_playing: self.player.is_playing(),
            busy: self.is_busy(),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.noise_job.is_some()
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        self.player.snapshot()
    }

    pub fn active_artifact(&self) -> Option<&AudioArtifact> {
        self.store.active_artifact()
    }

    // Recording

    pub async fn start_recording(&mut self) -> Result<()> {
        self.app_state().check(Operation::StartCapture)?;
        self.capture.start(self.device.as_ref()).await?;
        self.notify(Notification::info("Recording started", "Keep talking"));
        Ok(())
    }

    /// Stop recording and make the take the active artifact. No-op when idle.
    pub async fn stop_recording(&mut self) -> Result<Option<AudioArtifact>> {
        let Some(artifact) = self.capture.stop() else {
            return Ok(None);
        };
        self.adopt(&artifact).await?;
        self.notify(Notification::info(
            "Recording stopped",
            "Recording saved successfully",
        ));
        Ok(Some(artifact))
    }

    fn on_chunk(&mut self, chunk: Option<Bytes>) {
        match chunk {
            Some(chunk) => {
                self.capture.on_data_available(chunk);
            }
            None => {
                self.capture.fail("input device disconnected");
                self.notify(Notification::error(
                    "Recording stopped",
                    "The input device went away; nothing was saved",
                ));
            }
        }
    }

    // Playback

    pub async fn play(&mut self) -> Result<()> {
        self.app_state().check(Operation::Play)?;
        if self.player.is_playing() {
            return Ok(());
        }
        self.player.play().await?;
        self.sync.set_playing(true);
        self.broadcast();
        Ok(())
    }

    pub fn pause(&mut self) {
        if !self.player.is_playing() {
            return;
        }
        self.player.pause();
        self.sync.set_playing(false);
        self.broadcast();
    }

    pub async fn toggle(&mut self) -> Result<()> {
        if self.player.is_playing() {
            self.pause();
            Ok(())
        } else {
            self.play().await
        }
    }

    /// Seek and tell the other instances. Returns the applied position.
    pub fn seek(&mut self, target: f64) -> Result<f64> {
        let position = self.player.seek(target)?;
        self.broadcast();
        Ok(position)
    }

    pub fn set_volume_percent(&mut self, percent: i64) -> f32 {
        self.player.set_volume(volume_from_percent(percent))
    }

    /// Open a WAV file as the active artifact
    pub async fn open(&mut self, path: PathBuf) -> Result<AudioArtifact> {
        self.app_state().check(Operation::Import)?;
        let source = path.clone();
        let artifact = tokio::task::spawn_blocking(move || AudioArtifact::import_wav(source))
            .await
            .map_err(|e| EchoError::Artifact(format!("WAV reader aborted: {}", e)))??;
        self.adopt(&artifact).await?;
        self.notify(Notification::info("Opened", path.display().to_string()));
        Ok(artifact)
    }

    /// Bind `artifact` and make it active; the superseded one is released.
    ///
    /// If the new handle cannot be bound, it is released and the previous
    /// artifact stays bound and active.
    async fn adopt(&mut self, artifact: &AudioArtifact) -> Result<()> {
        self.player.pause();
        self.sync.set_playing(false);

        let handle = self.store.publish(artifact).await?;
        if let Err(e) = self.player.bind(artifact, handle).await {
            error!("Failed to bind artifact {}: {}", artifact.id(), e);
            let active = self.store.active_artifact().map(AudioArtifact::id);
            if active != Some(artifact.id()) {
                self.store.release(artifact.id());
            }
            if self.player.bound_id().is_some() {
                if let Err(e) = self.player.reload().await {
                    warn!("Failed to restore the previous artifact: {}", e);
                }
            }
            return Err(e);
        }
        self.store.commit(artifact);
        debug!(
            "Artifact {} ({:?}, {}) is active",
            artifact.id(),
            artifact.origin(),
            artifact.created_at().format("%H:%M:%S")
        );
        Ok(())
    }

    fn on_timeline(&mut self, event: TimelineEvent) {
        match event {
            TimelineEvent::DurationKnown(seconds) => {
                debug!("Clip length {}", format_time(seconds));
            }
            TimelineEvent::Position(position) => {
                trace!("Position {}", format_time(position));
            }
            TimelineEvent::Ended => {
                self.sync.set_playing(false);
                self.notify(Notification::info("Playback finished", "Reached the end of the clip"));
            }
        }
    }

    // Noise reduction

    /// Start a noise-reduction job on the bound artifact
    pub fn reduce_noise(&mut self) -> Result<()> {
        let Some(artifact) = self.player.bound_artifact() else {
            return Err(EchoError::NoArtifactBound);
        };
        self.app_state().check(Operation::ReduceNoise)?;
        let source = self
            .player
            .bound_handle()
            .map(|handle| handle.path.clone())
            .ok_or(EchoError::NoArtifactBound)?;

        info!("Reducing noise in artifact {}", artifact.id());
        let reducer = self.reducer.clone();
        let request = NoiseReductionRequest { artifact, source };
        self.noise_job = Some(tokio::spawn(async move { reducer.reduce(request).await }));
        self.notify(Notification::info("Noise reduction", "Reducing background noise..."));
        Ok(())
    }

    /// Wait for the pending job, if any, and apply its result
    pub async fn finish_noise_reduction(&mut self) -> Result<Option<AudioArtifact>> {
        let result = match self.noise_job.as_mut() {
            Some(job) => job.await,
            None => return Ok(None),
        };
        self.noise_job = None;
        self.complete_noise_reduction(result).await.map(Some)
    }

    async fn complete_noise_reduction(
        &mut self,
        result: std::result::Result<anyhow::Result<AudioArtifact>, JoinError>,
    ) -> Result<AudioArtifact> {
        let artifact = match result {
            Ok(Ok(artifact)) => artifact,
            Ok(Err(e)) => return Err(EchoError::NoiseReductionFailed(format!("{:#}", e))),
            Err(e) => return Err(EchoError::NoiseReductionFailed(e.to_string())),
        };
        self.adopt(&artifact)
            .await
            .map_err(|e| EchoError::NoiseReductionFailed(e.to_string()))?;
        self.notify(Notification::info("Noise reduction", "Noise Reduction Complete!"));
        Ok(artifact)
    }

    // Sync

    /// Periodic broadcast while playing
    pub fn sync_tick(&mut self) {
        if self.player.is_playing() {
            self.broadcast();
        }
    }

    /// Apply an update from another instance. Never sends anything back.
    pub async fn apply_sync(&mut self, message: &SyncMessage) {
        if self.player.bound_id().is_none() {
            trace!("Ignoring sync update with nothing bound");
            return;
        }
        let action = plan_inbound(message, self.player.is_playing());
        trace!("Applying remote update {:?}", action);

        if action.pause {
            self.player.pause();
            self.sync.set_playing(false);
        }
        if let Err(e) = self.player.seek(action.seek_to) {
            warn!("Remote seek failed: {}", e);
        }
        if action.resume {
            if self.player.at_end() {
                debug!("Remote update is at the end of the clip; staying paused");
                return;
            }
            if let Err(e) = self.app_state().check(Operation::Play) {
                info!("Skipping remote play: {}", e);
                return;
            }
            match self.player.play().await {
                Ok(()) => self.sync.set_playing(true),
                Err(e) => self.report_error(&e),
            }
        }
    }

    fn broadcast(&self) {
        self.sync
            .publish(self.player.position(), self.player.is_playing());
    }

    // Event loop

    pub fn report_error(&self, e: &EchoError) {
        warn!("{}", e);
        self.notify(Notification::from(e));
    }

    fn notify(&self, notification: Notification) {
        debug!("Notification: {}", notification);
        let _ = self.notifications.send(notification);
    }

    async fn handle(&mut self, command: Command) {
        let result = match command {
            Command::Record => {
                if self.capture.is_capturing() {
                    self.stop_recording().await.map(|_| ())
                } else {
                    self.start_recording().await
                }
            }
            Command::Stop => self.stop_recording().await.map(|_| ()),
            Command::Play => self.play().await,
            Command::Pause => {
                self.pause();
                Ok(())
            }
            Command::Toggle => self.toggle().await,
            Command::Seek(target) => self.seek(target).map(|_| ()),
            Command::Volume(percent) => {
                let volume = self.set_volume_percent(percent);
                self.notify(Notification::info("Volume", format!("{:.0}%", volume * 100.0)));
                Ok(())
            }
            Command::Denoise => self.reduce_noise(),
            Command::Open(path) => self.open(path).await.map(|_| ()),
            Command::Status => {
                self.notify(Notification::info("Status", self.status_line()));
                Ok(())
            }
            Command::Help => {
                self.notify(Notification::info("Commands", HELP));
                Ok(())
            }
            // Handled by the loop
            Command::Quit => Ok(()),
        };
        if let Err(e) = result {
            self.report_error(&e);
        }
    }

    fn status_line(&self) -> String {
        let state = self.app_state();
        if state.is_recording() {
            return format!("recording {}", format_time(self.capture.duration()));
        }
        let snapshot = self.player.snapshot();
        let activity = if state.busy {
            "reducing noise"
        } else if snapshot.is_playing {
            "playing"
        } else {
            "idle"
        };
        match snapshot.bound {
            Some(_) => format!(
                "{} {} / {} volume {:.0}%",
                activity,
                format_time(snapshot.position),
                snapshot.duration.map(format_time).unwrap_or_else(|| "-:--".into()),
                snapshot.volume * 100.0
            ),
            None => format!("{}, no audio loaded", activity),
        }
    }

    /// Run until `Quit` arrives or the command sender goes away. Returns the
    /// playback state as it was when the loop stopped.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) -> PlaybackSnapshot {
        info!("Instance {} running", self.id);
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Quit) | None => break,
                    Some(command) => self.handle(command).await,
                },
                chunk = self.capture.next_chunk() => self.on_chunk(chunk),
                event = self.player.next_event() => self.on_timeline(event),
                event = self.sync.next_event() => match event {
                    SyncEvent::Tick => self.sync_tick(),
                    SyncEvent::Received(message) => self.apply_sync(&message).await,
                },
                result = wait_job(&mut self.noise_job) => {
                    self.noise_job = None;
                    if let Err(e) = self.complete_noise_reduction(result).await {
                        self.report_error(&e);
                    }
                }
            }
        }
        let last = self.player.snapshot();
        self.shutdown();
        last
    }

    /// Tear down the timer, channel and every playable handle
    pub fn shutdown(&mut self) {
        if self.capture.is_capturing() {
            self.capture.fail("instance shutting down");
        }
        self.player.unbind();
        self.sync.close();
        self.store.release_all();
        info!("Instance {} stopped", self.id);
    }
}

async fn wait_job(job: &mut Option<NoiseJob>) -> std::result::Result<anyhow::Result<AudioArtifact>, JoinError> {
    match job {
        Some(job) => job.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::ScriptedDevice;
    use crate::audio::{ArtifactOrigin, AudioFormat, CaptureState, PlayableHandle, SilentOutput};
    use crate::notify::Level;
    use crate::sync::{LocalHub, DEFAULT_CHANNEL};
    use async_trait::async_trait;
    use mockall::mock;
    use tokio::time::{advance, timeout};

    mock! {
        Reducer {}

        #[async_trait]
        impl NoiseReducer for Reducer {
            async fn reduce(&self, request: NoiseReductionRequest) -> anyhow::Result<AudioArtifact>;
        }
    }

    mock! {
        Output {}

        #[async_trait]
        impl AudioOutput for Output {
            async fn load(&mut self, handle: &PlayableHandle) -> Result<()>;
            async fn play(&mut self, position: f64) -> Result<()>;
            fn pause(&mut self);
            fn seek(&mut self, position: f64);
            fn set_volume(&mut self, volume: f32);
            fn unload(&mut self);
        }
    }

    struct Fixture {
        instance: EchoLink,
        device: Arc<ScriptedDevice>,
        _dir: tempfile::TempDir,
    }

    fn fixture_with(hub: &LocalHub, reducer: Arc<dyn NoiseReducer>) -> Fixture {
        fixture_full(hub, reducer, Box::new(SilentOutput::new()))
    }

    fn fixture_full(
        hub: &LocalHub,
        reducer: Arc<dyn NoiseReducer>,
        output: Box<dyn AudioOutput>,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let device = Arc::new(ScriptedDevice::new());
        let config = InstanceConfig {
            artifact_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let instance = EchoLink::new(
            config,
            device.clone(),
            output,
            Box::new(hub.open(DEFAULT_CHANNEL)),
            reducer,
        );
        Fixture {
            instance,
            device,
            _dir: dir,
        }
    }

    fn fixture(hub: &LocalHub) -> Fixture {
        fixture_with(hub, Arc::new(MockReducer::new()))
    }

    fn clip(seconds: u32) -> AudioArtifact {
        let format = AudioFormat::new(100, 1);
        let samples = vec![0.1f32; (seconds * format.sample_rate) as usize];
        AudioArtifact::from_samples(&samples, format, ArtifactOrigin::Captured)
    }

    /// Bind a clip and wait until its duration is known
    async fn load(instance: &mut EchoLink, artifact: &AudioArtifact) {
        instance.adopt(artifact).await.unwrap();
        let seconds = artifact.frame_count() as f64 / artifact.format().sample_rate as f64;
        assert_eq!(
            instance.player.next_event().await,
            TimelineEvent::DurationKnown(seconds)
        );
    }

    fn drain(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    #[tokio::test]
    async fn test_recording_becomes_active_artifact() {
        let hub = LocalHub::new();
        let mut f = fixture(&hub);
        let mut notes = f.instance.subscribe_notifications();

        f.instance.start_recording().await.unwrap();
        f.instance.on_chunk(Some(Bytes::from_static(&[1, 0, 0, 0])));
        f.instance.on_chunk(Some(Bytes::from_static(&[2, 0, 0, 0])));
        assert_eq!(f.instance.status_line(), "recording 0:00");
        let artifact = f.instance.stop_recording().await.unwrap().unwrap();

        assert_eq!(artifact.payload().as_ref(), &[1, 0, 0, 0, 2, 0, 0, 0]);
        assert!(f.instance.active_artifact().unwrap().same_as(&artifact));
        assert_eq!(f.instance.snapshot().bound, Some(artifact.id()));
        assert!(f.device.is_stopped());

        let titles: Vec<String> = drain(&mut notes).into_iter().map(|n| n.title).collect();
        assert_eq!(titles, vec!["Recording started", "Recording stopped"]);
    }

    #[tokio::test]
    async fn test_second_recording_releases_first() {
        let hub = LocalHub::new();
        let mut f = fixture(&hub);

        f.instance.start_recording().await.unwrap();
        f.device.push(&[0; 8]);
        let first = f.instance.stop_recording().await.unwrap().unwrap();
        f.instance.start_recording().await.unwrap();
        let second = f.instance.stop_recording().await.unwrap().unwrap();

        assert!(!f.instance.store.is_live(first.id()));
        assert!(f.instance.store.is_live(second.id()));
        assert_eq!(f.instance.store.live_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_while_idle_is_noop() {
        let hub = LocalHub::new();
        let mut f = fixture(&hub);
        assert!(f.instance.stop_recording().await.unwrap().is_none());
        assert!(f.instance.active_artifact().is_none());
    }

    #[tokio::test]
    async fn test_denied_device_notifies() {
        let hub = LocalHub::new();
        let dir = tempfile::tempdir().unwrap();
        let config = InstanceConfig {
            artifact_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let mut instance = EchoLink::new(
            config,
            Arc::new(ScriptedDevice::denying()),
            Box::new(SilentOutput::new()),
            Box::new(hub.open(DEFAULT_CHANNEL)),
            Arc::new(MockReducer::new()),
        );
        let mut notes = instance.subscribe_notifications();

        instance.handle(Command::Record).await;
        assert_eq!(instance.app_state().capture, CaptureState::Idle);
        let notes = drain(&mut notes);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].level, Level::Error);
        assert_eq!(notes[0].description, "Failed to start recording. Check permissions.");
    }

    #[tokio::test(start_paused = true)]
    async fn test_playing_broadcasts_timeline() {
        let hub = LocalHub::new();
        let mut f = fixture(&hub);
        let mut observer = hub.open(DEFAULT_CHANNEL);
        load(&mut f.instance, &clip(10)).await;

        f.instance.play().await.unwrap();
        let edge = observer.recv().await.unwrap();
        assert_eq!(edge.current_time(), 0.0);
        assert!(edge.is_playing());

        advance(Duration::from_secs(1)).await;
        f.instance.sync.next_tick().await;
        f.instance.sync_tick();

        let update = observer.recv().await.unwrap();
        assert!((update.current_time() - 1.0).abs() < 0.01);
        assert!(update.is_playing());
        assert!((f.instance.snapshot().position - 1.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_remote_play_resumes_paused_peer() {
        let hub = LocalHub::new();
        let mut a = fixture(&hub);
        let mut b = fixture(&hub);
        load(&mut a.instance, &clip(10)).await;
        load(&mut b.instance, &clip(10)).await;

        a.instance.seek(2.5).unwrap();
        a.instance.play().await.unwrap();

        for _ in 0..2 {
            let message = b.instance.sync.recv().await;
            b.instance.apply_sync(&message).await;
        }

        let snapshot = b.instance.snapshot();
        assert!(snapshot.is_playing);
        assert!((snapshot.position - 2.5).abs() < 0.1);

        // Applying an update never produces one
        assert!(timeout(Duration::from_millis(100), a.instance.sync.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_remote_pause_and_seek() {
        let hub = LocalHub::new();
        let mut a = fixture(&hub);
        load(&mut a.instance, &clip(10)).await;
        a.instance.play().await.unwrap();

        a.instance.apply_sync(&SyncMessage::timeline(7.0, false)).await;
        let snapshot = a.instance.snapshot();
        assert!(!snapshot.is_playing);
        assert_eq!(snapshot.position, 7.0);
        assert!(!a.instance.sync.is_armed());
    }

    #[tokio::test]
    async fn test_remote_play_at_end_keeps_position() {
        let hub = LocalHub::new();
        let mut b = fixture(&hub);
        load(&mut b.instance, &clip(10)).await;

        b.instance.apply_sync(&SyncMessage::timeline(10.0, true)).await;
        let snapshot = b.instance.snapshot();
        assert_eq!(snapshot.position, 10.0);
        assert!(!snapshot.is_playing);
        assert!(!b.instance.sync.is_armed());

        // A local play still starts a finished clip over
        b.instance.play().await.unwrap();
        assert!(b.instance.snapshot().position < 0.1);
    }

    #[tokio::test]
    async fn test_sync_ignored_without_artifact() {
        let hub = LocalHub::new();
        let mut f = fixture(&hub);
        f.instance.apply_sync(&SyncMessage::timeline(3.0, true)).await;
        assert_eq!(f.instance.snapshot().bound, None);
        assert!(!f.instance.snapshot().is_playing);
    }

    #[tokio::test]
    async fn test_remote_play_skipped_while_recording() {
        let hub = LocalHub::new();
        let mut f = fixture(&hub);
        load(&mut f.instance, &clip(10)).await;
        f.instance.start_recording().await.unwrap();

        f.instance.apply_sync(&SyncMessage::timeline(4.0, true)).await;
        let snapshot = f.instance.snapshot();
        assert!(!snapshot.is_playing);
        assert_eq!(snapshot.position, 4.0);
        assert!(f.instance.capture.is_capturing());
    }

    #[tokio::test]
    async fn test_capture_and_playback_conflict() {
        let hub = LocalHub::new();
        let mut f = fixture(&hub);
        load(&mut f.instance, &clip(10)).await;

        f.instance.start_recording().await.unwrap();
        let before = f.instance.snapshot();
        let err = f.instance.play().await.unwrap_err();
        assert!(matches!(err, EchoError::ConflictingOperation(_)));
        assert_eq!(f.instance.snapshot(), before);
        assert!(f.instance.capture.is_capturing());
        f.instance.stop_recording().await.unwrap();

        load(&mut f.instance, &clip(10)).await;
        f.instance.play().await.unwrap();
        let err = f.instance.start_recording().await.unwrap_err();
        assert!(matches!(err, EchoError::ConflictingOperation(_)));
        assert_eq!(f.instance.app_state().capture, CaptureState::Idle);
    }

    #[tokio::test]
    async fn test_pause_broadcasts_only_on_transition() {
        let hub = LocalHub::new();
        let mut f = fixture(&hub);
        let mut observer = hub.open(DEFAULT_CHANNEL);
        load(&mut f.instance, &clip(10)).await;

        f.instance.pause();
        assert!(timeout(Duration::from_millis(50), observer.recv()).await.is_err());

        f.instance.play().await.unwrap();
        f.instance.pause();
        assert!(observer.recv().await.unwrap().is_playing());
        assert!(!observer.recv().await.unwrap().is_playing());
    }

    #[tokio::test]
    async fn test_noise_reduction_failure_keeps_artifact() {
        let hub = LocalHub::new();
        let mut reducer = MockReducer::new();
        reducer
            .expect_reduce()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("model crashed")));
        let mut f = fixture_with(&hub, Arc::new(reducer));
        let original = clip(2);
        load(&mut f.instance, &original).await;

        f.instance.reduce_noise().unwrap();
        assert!(f.instance.is_busy());
        assert!(matches!(
            f.instance.start_recording().await,
            Err(EchoError::ConflictingOperation("reducing noise"))
        ));

        let err = f.instance.finish_noise_reduction().await.unwrap_err();
        assert!(matches!(err, EchoError::NoiseReductionFailed(_)));
        assert!(!f.instance.is_busy());
        assert!(f.instance.player.bound_artifact().unwrap().same_as(&original));
        assert!(f.instance.active_artifact().unwrap().same_as(&original));
        assert!(f.instance.store.is_live(original.id()));
    }

    #[tokio::test]
    async fn test_noise_reduction_replaces_artifact() {
        let hub = LocalHub::new();
        let replacement = clip(1);
        let returned = replacement.clone();
        let mut reducer = MockReducer::new();
        reducer
            .expect_reduce()
            .times(1)
            .returning(move |_| Ok(returned.clone()));
        let mut f = fixture_with(&hub, Arc::new(reducer));
        let mut notes = f.instance.subscribe_notifications();
        let original = clip(2);
        load(&mut f.instance, &original).await;

        f.instance.reduce_noise().unwrap();
        let result = f.instance.finish_noise_reduction().await.unwrap().unwrap();

        assert!(result.same_as(&replacement));
        assert!(f.instance.player.bound_artifact().unwrap().same_as(&replacement));
        assert!(!f.instance.store.is_live(original.id()));
        let descriptions: Vec<String> = drain(&mut notes).into_iter().map(|n| n.description).collect();
        assert_eq!(
            descriptions,
            vec!["Reducing background noise...", "Noise Reduction Complete!"]
        );
    }

    #[tokio::test]
    async fn test_noise_reduction_bind_failure_restores_original() {
        let hub = LocalHub::new();
        let replacement = clip(1);
        let returned = replacement.clone();
        let mut reducer = MockReducer::new();
        reducer
            .expect_reduce()
            .times(1)
            .returning(move |_| Ok(returned.clone()));

        // Loads: original, replacement (refused), original again
        let mut loads = 0;
        let mut output = MockOutput::new();
        output.expect_load().times(3).returning(move |_| {
            loads += 1;
            if loads == 2 {
                Err(EchoError::Artifact("decoder refused".into()))
            } else {
                Ok(())
            }
        });
        output.expect_set_volume().return_const(());
        output.expect_seek().return_const(());
        output.expect_pause().return_const(());
        output.expect_unload().return_const(());

        let mut f = fixture_full(&hub, Arc::new(reducer), Box::new(output));
        let original = clip(2);
        load(&mut f.instance, &original).await;
        f.instance.seek(1.5).unwrap();

        f.instance.reduce_noise().unwrap();
        let err = f.instance.finish_noise_reduction().await.unwrap_err();

        assert!(matches!(err, EchoError::NoiseReductionFailed(_)));
        assert!(f.instance.player.bound_artifact().unwrap().same_as(&original));
        assert!(f.instance.active_artifact().unwrap().same_as(&original));
        assert!(f.instance.store.is_live(original.id()));
        assert!(!f.instance.store.is_live(replacement.id()));
        assert_eq!(f.instance.store.live_count(), 1);
        assert_eq!(f.instance.snapshot().position, 1.5);
    }

    #[tokio::test]
    async fn test_noise_reduction_needs_artifact_and_idle() {
        let hub = LocalHub::new();
        let mut f = fixture(&hub);
        assert!(matches!(f.instance.reduce_noise(), Err(EchoError::NoArtifactBound)));

        load(&mut f.instance, &clip(3)).await;
        f.instance.play().await.unwrap();
        assert!(matches!(
            f.instance.reduce_noise(),
            Err(EchoError::ConflictingOperation("playing"))
        ));
    }

    #[tokio::test]
    async fn test_run_loop_records_and_quits() {
        let hub = LocalHub::new();
        let f = fixture(&hub);
        let mut notes = f.instance.subscribe_notifications();
        let (tx, rx) = mpsc::channel(8);

        let device = f.device.clone();
        let run = tokio::spawn(f.instance.run(rx));
        tx.send(Command::Record).await.unwrap();
        assert_eq!(notes.recv().await.unwrap().title, "Recording started");

        device.push(&[0; 16]);
        tx.send(Command::Stop).await.unwrap();
        assert_eq!(notes.recv().await.unwrap().title, "Recording stopped");

        tx.send(Command::Status).await.unwrap();
        let status = notes.recv().await.unwrap();
        assert!(status.description.starts_with("idle 0:00 /"), "{}", status.description);

        tx.send(Command::Volume(40)).await.unwrap();
        assert_eq!(notes.recv().await.unwrap().description, "40%");

        tx.send(Command::Quit).await.unwrap();
        let last = timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
        assert_eq!(last.volume, 0.4);
    }
}
