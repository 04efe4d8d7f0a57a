//! Capture session state machine
//!
//! Idle → Capturing → Finalizing → Idle. The device handle only exists while
//! capturing; stopping releases it before the chunks are assembled into an
//! artifact.

use super::artifact::{ArtifactOrigin, AudioArtifact, AudioFormat};
use super::device::{CaptureDevice, DeviceHandle};
use crate::error::{EchoError, Result};
use bytes::{Bytes, BytesMut};
use log::{debug, info, warn};
use tokio::sync::broadcast;

/// Current state of a capture session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Capturing,
    Finalizing,
}

/// Events published by a capture session
#[derive(Clone, Debug)]
pub enum CaptureEvent {
    StateChanged(CaptureState),
    Completed(AudioArtifact),
    /// The device went away mid-capture; nothing was kept
    Failed(String),
}

pub struct CaptureSession {
    state: CaptureState,
    chunks: Vec<Bytes>,
    device: Option<DeviceHandle>,
    format: AudioFormat,
    events: broadcast::Sender<CaptureEvent>,
}

impl CaptureSession {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: CaptureState::Idle,
            chunks: Vec::new(),
            device: None,
            format: AudioFormat::default(),
            events,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn is_capturing(&self) -> bool {
        self.state == CaptureState::Capturing
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.events.subscribe()
    }

    /// Bytes accumulated so far in this take
    pub fn captured_bytes(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    /// Seconds captured so far in this take
    pub fn duration(&self) -> f64 {
        let frames = self.captured_bytes() / self.format.frame_bytes();
        frames as f64 / self.format.sample_rate.max(1) as f64
    }

    /// Acquire the device and start a new take.
    ///
    /// On failure the session stays Idle and nothing is retried.
    pub async fn start(&mut self, device: &dyn CaptureDevice) -> Result<()> {
        if self.state != CaptureState::Idle {
            return Err(EchoError::ConflictingOperation("already recording"));
        }

        let handle = device.acquire().await?;
        self.chunks.clear();
        self.format = handle.format();
        self.device = Some(handle);
        info!(
            "Capture started on {} ({} Hz, {} ch)",
            device.name(),
            self.format.sample_rate,
            self.format.channels
        );
        self.set_state(CaptureState::Capturing);
        Ok(())
    }

    /// Append a chunk delivered by the device. Returns false if rejected.
    pub fn on_data_available(&mut self, chunk: Bytes) -> bool {
        if self.state != CaptureState::Capturing {
            debug!("Dropping {} byte chunk outside of capture", chunk.len());
            return false;
        }
        self.chunks.push(chunk);
        true
    }

    /// Wait for the next chunk from the device. Never resolves when idle.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        match self.device.as_mut() {
            Some(device) => device.next_chunk().await,
            None => std::future::pending().await,
        }
    }

    /// Stop the take and assemble it into an artifact. No-op unless capturing.
    pub fn stop(&mut self) -> Option<AudioArtifact> {
        if self.state != CaptureState::Capturing {
            return None;
        }
        let device = self.device.take()?;

        self.set_state(CaptureState::Finalizing);
        // Chunks the device queued before it was stopped belong to the take
        let queued = device.release();
        self.chunks.extend(queued);

        let mut payload = BytesMut::with_capacity(self.captured_bytes());
        for chunk in self.chunks.drain(..) {
            payload.extend_from_slice(&chunk);
        }
        let artifact = AudioArtifact::new(payload.freeze(), self.format, ArtifactOrigin::Captured);
        info!(
            "Capture finished: {} bytes, {} frames",
            artifact.payload().len(),
            artifact.frame_count()
        );

        let _ = self.events.send(CaptureEvent::Completed(artifact.clone()));
        self.set_state(CaptureState::Idle);
        Some(artifact)
    }

    /// Tear down after the device disappeared mid-capture
    pub fn fail(&mut self, reason: &str) {
        if self.state != CaptureState::Capturing {
            return;
        }
        warn!("Capture aborted: {}", reason);
        self.device = None;
        self.chunks.clear();
        let _ = self.events.send(CaptureEvent::Failed(reason.to_string()));
        self.set_state(CaptureState::Idle);
    }

    fn set_state(&mut self, state: CaptureState) {
        self.state = state;
        let _ = self.events.send(CaptureEvent::StateChanged(state));
    }
}

impl Default for CaptureSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::testing::ScriptedDevice;

    fn drain(rx: &mut broadcast::Receiver<CaptureEvent>) -> Vec<CaptureEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn states(events: &[CaptureEvent]) -> Vec<CaptureState> {
        events
            .iter()
            .filter_map(|e| match e {
                CaptureEvent::StateChanged(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_chunks_concatenate_into_artifact() {
        let device = ScriptedDevice::new();
        let mut session = CaptureSession::new();
        let mut rx = session.subscribe();

        session.start(&device).await.unwrap();
        assert!(session.on_data_available(Bytes::from_static(b"chunk-one|")));
        assert!(session.on_data_available(Bytes::from_static(b"chunk-two")));
        let artifact = session.stop().unwrap();

        assert_eq!(artifact.payload().as_ref(), b"chunk-one|chunk-two");
        assert_eq!(artifact.origin(), ArtifactOrigin::Captured);

        let events = drain(&mut rx);
        let completed = events.iter().find_map(|e| match e {
            CaptureEvent::Completed(a) => Some(a.clone()),
            _ => None,
        });
        assert!(completed.unwrap().same_as(&artifact));
    }

    #[tokio::test]
    async fn test_stop_passes_through_finalizing() {
        let device = ScriptedDevice::new();
        let mut session = CaptureSession::new();
        let mut rx = session.subscribe();

        for _ in 0..3 {
            session.start(&device).await.unwrap();
            session.stop();
        }

        let observed = states(&drain(&mut rx));
        let cycle = [
            CaptureState::Capturing,
            CaptureState::Finalizing,
            CaptureState::Idle,
        ];
        assert_eq!(observed, cycle.repeat(3));
    }

    #[tokio::test]
    async fn test_stop_releases_device_and_keeps_queued_chunks() {
        let device = ScriptedDevice::new();
        let mut session = CaptureSession::new();

        session.start(&device).await.unwrap();
        assert!(device.push(&[1, 2]));
        assert!(device.push(&[3, 4]));
        let artifact = session.stop().unwrap();

        assert!(device.is_stopped());
        assert_eq!(artifact.payload().as_ref(), &[1, 2, 3, 4]);
        assert_eq!(session.state(), CaptureState::Idle);
    }

    #[tokio::test]
    async fn test_late_chunks_rejected() {
        let device = ScriptedDevice::new();
        let mut session = CaptureSession::new();
        session.start(&device).await.unwrap();
        session.stop();

        assert!(!session.on_data_available(Bytes::from_static(b"late")));
        assert_eq!(session.captured_bytes(), 0);
    }

    #[tokio::test]
    async fn test_denied_device_stays_idle() {
        let device = ScriptedDevice::denying();
        let mut session = CaptureSession::new();
        let mut rx = session.subscribe();

        let err = session.start(&device).await.unwrap_err();
        assert!(matches!(err, EchoError::DeviceUnavailable(_)));
        assert_eq!(session.state(), CaptureState::Idle);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_stop_while_idle_is_noop() {
        let mut session = CaptureSession::new();
        let mut rx = session.subscribe();
        assert!(session.stop().is_none());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_next_chunk_delivers_pushed_data() {
        let device = ScriptedDevice::new();
        let mut session = CaptureSession::new();
        session.start(&device).await.unwrap();

        device.push(&[9, 9, 9, 9]);
        let chunk = session.next_chunk().await.unwrap();
        assert!(session.on_data_available(chunk));
        assert_eq!(session.captured_bytes(), 4);
    }

    #[tokio::test]
    async fn test_fail_clears_take() {
        let device = ScriptedDevice::new();
        let mut session = CaptureSession::new();
        session.start(&device).await.unwrap();
        session.on_data_available(Bytes::from_static(&[0; 8]));

        session.fail("device unplugged");
        assert_eq!(session.state(), CaptureState::Idle);
        assert_eq!(session.captured_bytes(), 0);
        assert!(device.is_stopped());
    }
}
