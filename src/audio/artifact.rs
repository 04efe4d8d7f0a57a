//! Audio artifacts and the store that exposes them as playable WAV handles
//!
//! An artifact is the finished payload of a capture (or of a noise-reduction
//! job). The store turns the active artifact into a WAV file on disk and
//! deletes that file again once the artifact is superseded.

use crate::error::{EchoError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use log::{debug, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};
use uuid::Uuid;

const SAMPLE_BYTES: usize = std::mem::size_of::<f32>();

/// PCM layout of a payload: interleaved little-endian f32 frames
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
        }
    }

    /// Bytes per interleaved frame
    pub fn frame_bytes(&self) -> usize {
        SAMPLE_BYTES * self.channels as usize
    }

    fn wav_spec(&self) -> WavSpec {
        WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        }
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::new(48000, 1)
    }
}

/// Where an artifact came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactOrigin {
    Captured,
    Imported,
    NoiseReduced,
}

struct ArtifactInner {
    id: Uuid,
    payload: Bytes,
    format: AudioFormat,
    origin: ArtifactOrigin,
    created_at: DateTime<Utc>,
    /// Filled in once the playable handle has been probed
    duration: OnceLock<f64>,
}

/// A finished, immutable audio clip.
///
/// Cloning is cheap and yields another reference to the same clip; use
/// [`AudioArtifact::same_as`] for identity.
#[derive(Clone)]
pub struct AudioArtifact {
    inner: Arc<ArtifactInner>,
}

impl AudioArtifact {
    pub fn new(payload: Bytes, format: AudioFormat, origin: ArtifactOrigin) -> Self {
        Self {
            inner: Arc::new(ArtifactInner {
                id: Uuid::new_v4(),
                payload,
                format,
                origin,
                created_at: Utc::now(),
                duration: OnceLock::new(),
            }),
        }
    }

    /// Build an artifact from float samples
    pub fn from_samples(samples: &[f32], format: AudioFormat, origin: ArtifactOrigin) -> Self {
        Self::new(encode_samples(samples), format, origin)
    }

    /// Import an existing WAV file as a new artifact
    pub fn import_wav(path: impl AsRef<Path>) -> Result<Self> {
        let (samples, format) = load_wav(path)?;
        Ok(Self::from_samples(&samples, format, ArtifactOrigin::Imported))
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn payload(&self) -> &Bytes {
        &self.inner.payload
    }

    pub fn format(&self) -> AudioFormat {
        self.inner.format
    }

    pub fn origin(&self) -> ArtifactOrigin {
        self.inner.origin
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// Content type of the playable handle
    pub fn content_type(&self) -> &'static str {
        "audio/wav"
    }

    /// Probed duration in seconds, if known yet
    pub fn duration(&self) -> Option<f64> {
        self.inner.duration.get().copied()
    }

    pub(crate) fn set_duration(&self, seconds: f64) {
        let _ = self.inner.duration.set(seconds);
    }

    /// Number of complete frames in the payload; a trailing partial frame is ignored
    pub fn frame_count(&self) -> usize {
        self.inner.payload.len() / self.inner.format.frame_bytes()
    }

    /// Decode the payload into interleaved samples
    pub fn samples(&self) -> Vec<f32> {
        let usable = self.frame_count() * self.inner.format.frame_bytes();
        decode_samples(&self.inner.payload[..usable])
    }

    /// Reference identity
    pub fn same_as(&self, other: &AudioArtifact) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn downgrade(&self) -> WeakArtifact {
        WeakArtifact(Arc::downgrade(&self.inner))
    }

    fn write_wav(&self, path: &Path) -> Result<()> {
        let mut writer = WavWriter::create(path, self.inner.format.wav_spec())?;
        for sample in self.samples() {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
        Ok(())
    }
}

impl std::fmt::Debug for AudioArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioArtifact")
            .field("id", &self.inner.id)
            .field("bytes", &self.inner.payload.len())
            .field("format", &self.inner.format)
            .field("origin", &self.inner.origin)
            .finish()
    }
}

/// Non-owning reference to an artifact, held by the playback controller
#[derive(Clone, Default)]
pub struct WeakArtifact(Weak<ArtifactInner>);

impl WeakArtifact {
    pub fn upgrade(&self) -> Option<AudioArtifact> {
        self.0.upgrade().map(|inner| AudioArtifact { inner })
    }
}

/// Encode float samples as little-endian bytes
pub fn encode_samples(samples: &[f32]) -> Bytes {
    let mut bytes = Vec::with_capacity(samples.len() * SAMPLE_BYTES);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    Bytes::from(bytes)
}

/// Decode little-endian float bytes; a trailing partial sample is dropped
pub fn decode_samples(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(SAMPLE_BYTES)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Load interleaved samples and their layout from a WAV file
pub fn load_wav(path: impl AsRef<Path>) -> Result<(Vec<f32>, AudioFormat)> {
    let reader = WavReader::open(path.as_ref())?;
    let spec = reader.spec();
    let format = AudioFormat::new(spec.sample_rate, spec.channels);

    let samples: std::result::Result<Vec<f32>, _> = match spec.sample_format {
        SampleFormat::Float => reader.into_samples::<f32>().collect(),
        SampleFormat::Int => {
            // Scale integer samples into [-1, 1]
            let max_value = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_value))
                .collect()
        }
    };

    Ok((samples?, format))
}

/// Read the duration of a WAV handle in seconds without blocking the loop
pub async fn probe_duration(path: PathBuf) -> Result<f64> {
    tokio::task::spawn_blocking(move || -> Result<f64> {
        let reader = WavReader::open(&path)?;
        let rate = reader.spec().sample_rate.max(1);
        Ok(reader.duration() as f64 / rate as f64)
    })
    .await
    .map_err(|e| EchoError::Artifact(format!("Duration probe aborted: {}", e)))?
}

/// A short-lived playable handle: the WAV file backing one artifact
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlayableHandle {
    pub id: Uuid,
    pub path: PathBuf,
}

/// Owns the playable handles of this instance's artifacts
pub struct ArtifactStore {
    dir: PathBuf,
    live: HashMap<Uuid, PlayableHandle>,
    /// Strong reference to the artifact currently in use
    active: Option<AudioArtifact>,
}

impl ArtifactStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            live: HashMap::new(),
            active: None,
        }
    }

    /// Default per-instance artifact directory
    pub fn default_dir(instance: Uuid) -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("echolink")
            .join("artifacts")
            .join(instance.to_string())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the artifact's WAV handle without changing which one is active
    pub async fn publish(&mut self, artifact: &AudioArtifact) -> Result<PlayableHandle> {
        if let Some(handle) = self.live.get(&artifact.id()) {
            return Ok(handle.clone());
        }

        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{}.wav", artifact.id()));

        let source = artifact.clone();
        let target = path.clone();
        tokio::task::spawn_blocking(move || source.write_wav(&target))
            .await
            .map_err(|e| EchoError::Artifact(format!("WAV writer aborted: {}", e)))??;

        let handle = PlayableHandle {
            id: artifact.id(),
            path,
        };
        debug!(
            "Published artifact {} as {} at {:?}",
            handle.id,
            artifact.content_type(),
            handle.path
        );
        self.live.insert(handle.id, handle.clone());
        Ok(handle)
    }

    /// Make a published artifact the active one, releasing the one it
    /// supersedes. Call only once the new handle is known to be playable.
    pub fn commit(&mut self, artifact: &AudioArtifact) {
        if let Some(previous) = self.active.replace(artifact.clone()) {
            if !previous.same_as(artifact) {
                self.release(previous.id());
            }
        }
    }

    /// Release a handle. Returns false if it was already released.
    pub fn release(&mut self, id: Uuid) -> bool {
        let Some(handle) = self.live.remove(&id) else {
            return false;
        };
        if self.active.as_ref().map(AudioArtifact::id) == Some(id) {
            self.active = None;
        }
        if let Err(e) = std::fs::remove_file(&handle.path) {
            warn!("Failed to remove artifact file {:?}: {}", handle.path, e);
        }
        debug!("Released artifact {}", id);
        true
    }

    pub fn active(&self) -> Option<&PlayableHandle> {
        self.active.as_ref().and_then(|a| self.live.get(&a.id()))
    }

    pub fn active_artifact(&self) -> Option<&AudioArtifact> {
        self.active.as_ref()
    }

    pub fn is_live(&self, id: Uuid) -> bool {
        self.live.contains_key(&id)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Release every handle; called when the instance shuts down
    pub fn release_all(&mut self) {
        let ids: Vec<Uuid> = self.live.keys().copied().collect();
        for id in ids {
            self.release(id);
        }
        // Only removes the directory if nothing else was left in it
        let _ = std::fs::remove_dir(&self.dir);
    }
}

impl Drop for ArtifactStore {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(seconds: f64, format: AudioFormat) -> AudioArtifact {
        let n = (seconds * format.sample_rate as f64) as usize * format.channels as usize;
        let samples: Vec<f32> = (0..n).map(|i| (i as f32 * 0.01).sin() * 0.5).collect();
        AudioArtifact::from_samples(&samples, format, ArtifactOrigin::Captured)
    }

    #[test]
    fn test_partial_frames_are_ignored() {
        let format = AudioFormat::new(8000, 2);
        let mut bytes = encode_samples(&[0.1, 0.2, 0.3, 0.4]).to_vec();
        bytes.extend_from_slice(&[1, 2, 3]);
        let artifact = AudioArtifact::new(Bytes::from(bytes), format, ArtifactOrigin::Captured);
        assert_eq!(artifact.frame_count(), 2);
        assert_eq!(artifact.samples(), vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn test_clone_shares_identity() {
        let a = tone(0.1, AudioFormat::new(8000, 1));
        let b = tone(0.1, AudioFormat::new(8000, 1));
        assert!(a.same_as(&a.clone()));
        assert!(!a.same_as(&b));

        let weak = a.downgrade();
        assert!(weak.upgrade().is_some());
        drop(a);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_publish_and_probe() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ArtifactStore::new(dir.path());
        let artifact = tone(2.0, AudioFormat::new(4000, 2));

        let handle = store.publish(&artifact).await.unwrap();
        assert!(handle.path.exists());

        let duration = probe_duration(handle.path.clone()).await.unwrap();
        assert!((duration - 2.0).abs() < 1e-6);

        let (samples, format) = load_wav(&handle.path).unwrap();
        assert_eq!(format, AudioFormat::new(4000, 2));
        assert_eq!(samples, artifact.samples());
    }

    #[tokio::test]
    async fn test_superseded_artifact_released_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ArtifactStore::new(dir.path());
        let first = tone(0.5, AudioFormat::new(8000, 1));
        let second = tone(0.5, AudioFormat::new(8000, 1));

        let first_handle = store.publish(&first).await.unwrap();
        store.commit(&first);
        let second_handle = store.publish(&second).await.unwrap();

        // Publishing alone leaves the active artifact in place
        assert!(store.active_artifact().unwrap().same_as(&first));
        assert!(first_handle.path.exists());

        store.commit(&second);
        assert!(!first_handle.path.exists());
        assert!(!store.is_live(first.id()));
        assert!(!store.release(first.id()));
        assert_eq!(store.active(), Some(&second_handle));
        assert!(store.active_artifact().unwrap().same_as(&second));
        assert_eq!(store.live_count(), 1);
    }

    #[tokio::test]
    async fn test_drop_releases_everything() {
        let dir = tempfile::tempdir().unwrap();
        let artifact_dir = dir.path().join("instance");
        let path = {
            let mut store = ArtifactStore::new(&artifact_dir);
            store.publish(&tone(0.1, AudioFormat::default())).await.unwrap().path
        };
        assert!(!path.exists());
        assert!(!artifact_dir.exists());
    }
}
