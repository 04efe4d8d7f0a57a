//! Capture device abstraction
//!
//! A device is acquired for exclusive use and then pushes binary chunks of
//! interleaved little-endian f32 frames until its stream is stopped.

use super::artifact::{encode_samples, AudioFormat};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use std::f32::consts::TAU;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A running input stream. Stopping turns the device off.
pub trait InputStream: Send {
    fn stop(&mut self);
}

/// Exclusive handle on an acquired input device
pub struct DeviceHandle {
    format: AudioFormat,
    chunks: mpsc::UnboundedReceiver<Bytes>,
    stream: Option<Box<dyn InputStream>>,
}

impl DeviceHandle {
    pub fn new(
        format: AudioFormat,
        chunks: mpsc::UnboundedReceiver<Bytes>,
        stream: Box<dyn InputStream>,
    ) -> Self {
        Self {
            format,
            chunks,
            stream: Some(stream),
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Next chunk pushed by the device; `None` once the device went away
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        self.chunks.recv().await
    }

    /// Stop the device and hand back chunks it had already delivered
    pub fn release(mut self) -> Vec<Bytes> {
        self.stop_stream();
        let mut pending = Vec::new();
        while let Ok(chunk) = self.chunks.try_recv() {
            pending.push(chunk);
        }
        pending
    }

    fn stop_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.stop_stream();
    }
}

/// A host audio input that can be acquired for capture
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    fn name(&self) -> &str;

    /// Request exclusive access. Fails with `DeviceUnavailable`.
    async fn acquire(&self) -> Result<DeviceHandle>;
}

/// Tone generator standing in for a microphone on hosts without an audio backend
pub struct SyntheticDevice {
    format: AudioFormat,
    frequency: f32,
    chunk_period: Duration,
}

impl SyntheticDevice {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            frequency: 440.0,
            chunk_period: Duration::from_millis(100),
        }
    }
}

impl Default for SyntheticDevice {
    fn default() -> Self {
        Self::new(AudioFormat::new(16000, 1))
    }
}

struct TaskStream(JoinHandle<()>);

impl InputStream for TaskStream {
    fn stop(&mut self) {
        self.0.abort();
    }
}

#[async_trait]
impl CaptureDevice for SyntheticDevice {
    fn name(&self) -> &str {
        "synthetic"
    }

    async fn acquire(&self) -> Result<DeviceHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        let format = self.format;
        let frequency = self.frequency;
        let period = self.chunk_period;
        let frames = (format.sample_rate as f64 * period.as_secs_f64()) as usize;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut phase = 0.0f32;
            let step = TAU * frequency / format.sample_rate as f32;
            loop {
                ticker.tick().await;
                let mut samples = Vec::with_capacity(frames * format.channels as usize);
                for _ in 0..frames {
                    let value = phase.sin() * 0.25;
                    phase = (phase + step) % TAU;
                    for _ in 0..format.channels {
                        samples.push(value);
                    }
                }
                if tx.send(encode_samples(&samples)).is_err() {
                    break;
                }
            }
        });

        debug!("Synthetic input started ({} Hz)", format.sample_rate);
        Ok(DeviceHandle::new(format, rx, Box::new(TaskStream(task))))
    }
}
