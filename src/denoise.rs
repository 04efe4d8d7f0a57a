//! Noise reduction jobs
//!
//! A job takes the bound artifact and hands back a replacement. The instance
//! only sees the [`NoiseReducer`] contract; the algorithm lives behind it.

use crate::audio::{load_wav, ArtifactOrigin, AudioArtifact, AudioFormat};
use anyhow::{bail, Context};
use async_trait::async_trait;
use log::{debug, info};
use std::path::PathBuf;
use uuid::Uuid;

/// Default gate threshold (RMS, full scale = 1.0)
pub const DEFAULT_GATE_THRESHOLD: f32 = 0.02;

/// Input of a noise-reduction job
#[derive(Clone, Debug)]
pub struct NoiseReductionRequest {
    pub artifact: AudioArtifact,
    /// The artifact's playable WAV handle
    pub source: PathBuf,
}

#[async_trait]
pub trait NoiseReducer: Send + Sync {
    /// Produce a new artifact. Runs to completion; there is no cancellation.
    async fn reduce(&self, request: NoiseReductionRequest) -> anyhow::Result<AudioArtifact>;
}

/// Built-in reducer: silences 10 ms windows whose RMS level is below a threshold
pub struct NoiseGate {
    threshold: f32,
}

impl NoiseGate {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold.max(0.0),
        }
    }
}

impl Default for NoiseGate {
    fn default() -> Self {
        Self::new(DEFAULT_GATE_THRESHOLD)
    }
}

#[async_trait]
impl NoiseReducer for NoiseGate {
    async fn reduce(&self, request: NoiseReductionRequest) -> anyhow::Result<AudioArtifact> {
        let artifact = request.artifact;
        let threshold = self.threshold;
        tokio::task::spawn_blocking(move || {
            let format = artifact.format();
            let samples = gate(&artifact.samples(), format, threshold);
            AudioArtifact::from_samples(&samples, format, ArtifactOrigin::NoiseReduced)
        })
        .await
        .context("Noise gate task failed")
    }
}

/// Zero every window whose RMS falls below `threshold`
pub fn gate(samples: &[f32], format: AudioFormat, threshold: f32) -> Vec<f32> {
    let channels = format.channels as usize;
    let window = (format.sample_rate as usize / 100).max(1) * channels;

    let mut output = samples.to_vec();
    let mut gated = 0usize;
    for block in output.chunks_mut(window) {
        let sum_squares: f32 = block.iter().map(|s| s * s).sum();
        let rms = (sum_squares / block.len() as f32).sqrt();
        if rms < threshold {
            block.fill(0.0);
            gated += 1;
        }
    }
    debug!("Noise gate silenced {} windows", gated);
    output
}

/// Runs an external program on the WAV handle.
///
/// `{input}` and `{output}` in the arguments are replaced with the source
/// path and a scratch output path.
pub struct CommandReducer {
    program: String,
    args: Vec<String>,
}

impl CommandReducer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Parse a whitespace-separated command line
    pub fn parse(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }
}

#[async_trait]
impl NoiseReducer for CommandReducer {
    async fn reduce(&self, request: NoiseReductionRequest) -> anyhow::Result<AudioArtifact> {
        let output_path = std::env::temp_dir().join(format!("echolink-denoise-{}.wav", Uuid::new_v4()));
        let input = request.source.to_string_lossy().into_owned();
        let output = output_path.to_string_lossy().into_owned();
        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| arg.replace("{input}", &input).replace("{output}", &output))
            .collect();

        info!("Running noise reduction: {} {}", self.program, args.join(" "));
        let result = tokio::process::Command::new(&self.program)
            .args(&args)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.program))?;

        if !result.status.success() {
            let _ = tokio::fs::remove_file(&output_path).await;
            let stderr = String::from_utf8_lossy(&result.stderr);
            bail!("{} exited with {}: {}", self.program, result.status, stderr.trim());
        }

        let path = output_path.clone();
        let loaded = tokio::task::spawn_blocking(move || load_wav(&path))
            .await
            .context("WAV reader task failed")?;
        let _ = tokio::fs::remove_file(&output_path).await;
        let (samples, format) = loaded.with_context(|| format!("{} produced no usable WAV", self.program))?;

        Ok(AudioArtifact::from_samples(&samples, format, ArtifactOrigin::NoiseReduced))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ArtifactStore;

    fn clip() -> AudioArtifact {
        // 20 ms of hiss followed by 20 ms of a loud square wave, at 1 kHz
        let format = AudioFormat::new(1000, 1);
        let mut samples = vec![0.001f32; 20];
        samples.extend((0..20).map(|i| if i % 2 == 0 { 0.5 } else { -0.5 }));
        AudioArtifact::from_samples(&samples, format, ArtifactOrigin::Captured)
    }

    #[test]
    fn test_gate_silences_quiet_windows() {
        let samples = clip().samples();
        let gated = gate(&samples, AudioFormat::new(1000, 1), DEFAULT_GATE_THRESHOLD);
        assert!(gated[..20].iter().all(|s| *s == 0.0));
        assert_eq!(&gated[20..], &samples[20..]);
    }

    #[tokio::test]
    async fn test_gate_returns_new_artifact() {
        let source = clip();
        let request = NoiseReductionRequest {
            artifact: source.clone(),
            source: PathBuf::from("/nonexistent.wav"),
        };
        let result = NoiseGate::default().reduce(request).await.unwrap();
        assert!(!result.same_as(&source));
        assert_eq!(result.origin(), ArtifactOrigin::NoiseReduced);
        assert_eq!(result.frame_count(), source.frame_count());
    }

    #[tokio::test]
    async fn test_command_reducer_round_trips_through_program() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ArtifactStore::new(dir.path());
        let source = clip();
        let handle = store.publish(&source).await.unwrap();

        let reducer = CommandReducer::parse("cp {input} {output}").unwrap();
        let request = NoiseReductionRequest {
            artifact: source.clone(),
            source: handle.path.clone(),
        };
        let result = reducer.reduce(request).await.unwrap();
        assert_eq!(result.samples(), source.samples());
        assert_eq!(result.origin(), ArtifactOrigin::NoiseReduced);
    }

    #[tokio::test]
    async fn test_command_reducer_failure() {
        let reducer = CommandReducer::parse("false").unwrap();
        let request = NoiseReductionRequest {
            artifact: clip(),
            source: PathBuf::from("/nonexistent.wav"),
        };
        assert!(reducer.reduce(request).await.is_err());
    }

    #[test]
    fn test_parse_empty_command() {
        assert!(CommandReducer::parse("   ").is_none());
    }
}
