//! PipeWire capture and playback backends
//!
//! Each stream runs its own PipeWire main loop on a dedicated thread and is
//! stopped through a PipeWire channel. The async side waits on a oneshot
//! until the stream is connected, so permission and connection failures
//! surface from `acquire`/`play` instead of later.

use super::artifact::{encode_samples, load_wav, AudioFormat, PlayableHandle};
use super::device::{CaptureDevice, DeviceHandle, InputStream};
use super::output::AudioOutput;
use crate::error::{EchoError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error};
use pipewire as pw;
use pw::spa;
use pw::spa::param::format::{MediaSubtype, MediaType};
use pw::spa::param::format_utils;
use pw::spa::pod::Pod;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, oneshot};

const APP_NAME: &str = "EchoLink";

enum StreamCommand {
    Stop,
}

type Ready = Option<oneshot::Sender<std::result::Result<(), String>>>;

/// A PipeWire stream thread and the channel that stops it
struct StreamThread {
    sender: Option<pw::channel::Sender<StreamCommand>>,
    handle: Option<JoinHandle<()>>,
}

impl StreamThread {
    fn spawn<F>(run: F) -> (Self, oneshot::Receiver<std::result::Result<(), String>>)
    where
        F: FnOnce(pw::channel::Receiver<StreamCommand>, &mut Ready) -> std::result::Result<(), String>
            + Send
            + 'static,
    {
        let (sender, receiver) = pw::channel::channel::<StreamCommand>();
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = thread::spawn(move || {
            let mut ready = Some(ready_tx);
            if let Err(e) = run(receiver, &mut ready) {
                match ready.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(e));
                    }
                    None => error!("PipeWire stream error: {}", e),
                }
            }
        });

        (
            Self {
                sender: Some(sender),
                handle: Some(handle),
            },
            ready_rx,
        )
    }

    fn stop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(StreamCommand::Stop);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl InputStream for StreamThread {
    fn stop(&mut self) {
        StreamThread::stop(self);
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Build the EnumFormat pod requesting F32LE at the given layout
fn format_param(format: AudioFormat) -> std::result::Result<Vec<u8>, String> {
    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(spa::param::audio::AudioFormat::F32LE);
    audio_info.set_rate(format.sample_rate);
    audio_info.set_channels(format.channels as u32);

    let obj = spa::pod::Object {
        type_: spa::utils::SpaTypes::ObjectParamFormat.as_raw(),
        id: spa::param::ParamType::EnumFormat.as_raw(),
        properties: audio_info.into(),
    };

    Ok(spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &spa::pod::Value::Object(obj),
    )
    .map_err(|e| format!("Failed to serialize audio format: {:?}", e))?
    .0
    .into_inner())
}

fn parse_raw_format(param: &Pod, format: &mut spa::param::audio::AudioInfoRaw) {
    let (media_type, media_subtype) = match format_utils::parse_format(param) {
        Ok(v) => v,
        Err(_) => return,
    };
    if media_type != MediaType::Audio || media_subtype != MediaSubtype::Raw {
        return;
    }
    if let Err(e) = format.parse(param) {
        error!("Failed to parse negotiated audio format: {:?}", e);
    }
}

/// Microphone input through PipeWire
pub struct PipeWireDevice {
    format: AudioFormat,
}

impl PipeWireDevice {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            format: AudioFormat::new(sample_rate, 1),
        }
    }
}

#[async_trait]
impl CaptureDevice for PipeWireDevice {
    fn name(&self) -> &str {
        "pipewire"
    }

    async fn acquire(&self) -> Result<DeviceHandle> {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let format = self.format;

        let (stream, ready) = StreamThread::spawn(move |receiver, ready| {
            run_capture_loop(format, chunk_tx, receiver, ready)
        });

        match ready.await {
            Ok(Ok(())) => Ok(DeviceHandle::new(format, chunk_rx, Box::new(stream))),
            Ok(Err(e)) => Err(EchoError::DeviceUnavailable(e)),
            Err(_) => Err(EchoError::DeviceUnavailable(
                "capture thread exited before connecting".into(),
            )),
        }
    }
}

fn run_capture_loop(
    format: AudioFormat,
    chunks: mpsc::UnboundedSender<Bytes>,
    receiver: pw::channel::Receiver<StreamCommand>,
    ready: &mut Ready,
) -> std::result::Result<(), String> {
    pw::init();

    let mainloop = pw::main_loop::MainLoopRc::new(None)
        .map_err(|e| format!("Failed to create PipeWire main loop: {}", e))?;
    let context = pw::context::ContextRc::new(&mainloop, None)
        .map_err(|e| format!("Failed to create PipeWire context: {}", e))?;
    let core = context
        .connect_rc(None)
        .map_err(|e| format!("Failed to connect to PipeWire: {}", e))?;

    let mainloop_weak = mainloop.downgrade();
    let _receiver = receiver.attach(mainloop.loop_(), move |cmd| match cmd {
        StreamCommand::Stop => {
            if let Some(mainloop) = mainloop_weak.upgrade() {
                mainloop.quit();
            }
        }
    });

    struct UserData {
        format: spa::param::audio::AudioInfoRaw,
        chunks: mpsc::UnboundedSender<Bytes>,
    }

    let user_data = UserData {
        format: Default::default(),
        chunks,
    };

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Capture",
        *pw::keys::MEDIA_ROLE => "Communication",
        *pw::keys::APP_NAME => APP_NAME,
    };

    let stream = pw::stream::StreamBox::new(&core, "echolink-capture", props)
        .map_err(|e| format!("Failed to create PipeWire stream: {}", e))?;

    let _listener = stream
        .add_local_listener_with_user_data(user_data)
        .param_changed(|_, user_data, id, param| {
            let Some(param) = param else { return };
            if id != spa::param::ParamType::Format.as_raw() {
                return;
            }
            parse_raw_format(param, &mut user_data.format);
        })
        .process(|stream, user_data| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };
            let datas = buffer.datas_mut();
            if datas.is_empty() {
                return;
            }

            let data = &mut datas[0];
            let n_channels = user_data.format.channels().max(1);
            let n_samples = data.chunk().size() / (std::mem::size_of::<f32>() as u32);

            if let Some(raw) = data.data() {
                // Keep the first channel only; the session records mono
                let mut mono = Vec::with_capacity((n_samples / n_channels) as usize);
                for i in (0..n_samples).step_by(n_channels as usize) {
                    let start = i as usize * std::mem::size_of::<f32>();
                    let end = start + std::mem::size_of::<f32>();
                    if end <= raw.len() {
                        mono.push(f32::from_le_bytes(
                            raw[start..end].try_into().unwrap_or([0; 4]),
                        ));
                    }
                }
                if !mono.is_empty() {
                    let _ = user_data.chunks.send(encode_samples(&mono));
                }
            }
        })
        .register()
        .map_err(|e| format!("Failed to register stream listener: {}", e))?;

    let values = format_param(format)?;
    let pod = Pod::from_bytes(&values).ok_or("Invalid format pod")?;
    let mut params = [pod];

    stream
        .connect(
            spa::utils::Direction::Input,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| format!("Failed to connect stream: {}", e))?;

    if let Some(tx) = ready.take() {
        let _ = tx.send(Ok(()));
    }
    debug!("PipeWire capture stream connected");

    mainloop.run();
    Ok(())
}

/// Samples shared between the async side and the playback thread
#[derive(Default)]
struct OutputBuffer {
    samples: Vec<f32>,
    format: AudioFormat,
    /// Next frame to render
    frame: usize,
    volume: f32,
}

impl OutputBuffer {
    fn frames(&self) -> usize {
        self.samples.len() / self.format.channels as usize
    }

    /// Copy up to `count` frames into interleaved output and advance
    fn take_frames(&mut self, count: usize) -> Option<Vec<f32>> {
        if self.frame >= self.frames() {
            return None;
        }
        let channels = self.format.channels as usize;
        let end = (self.frame + count).min(self.frames());
        let out = self.samples[self.frame * channels..end * channels]
            .iter()
            .map(|s| s * self.volume)
            .collect();
        self.frame = end;
        Some(out)
    }
}

/// Speaker output through PipeWire
pub struct PipeWireOutput {
    buffer: Arc<Mutex<OutputBuffer>>,
    stream: Option<StreamThread>,
}

impl PipeWireOutput {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(Mutex::new(OutputBuffer {
                volume: 1.0,
                ..Default::default()
            })),
            stream: None,
        }
    }

    fn shared(&self) -> std::sync::MutexGuard<'_, OutputBuffer> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stop_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
        }
    }
}

impl Default for PipeWireOutput {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioOutput for PipeWireOutput {
    async fn load(&mut self, handle: &PlayableHandle) -> Result<()> {
        self.stop_stream();
        let path = handle.path.clone();
        let (samples, format) = tokio::task::spawn_blocking(move || load_wav(path))
            .await
            .map_err(|e| EchoError::Artifact(format!("WAV loader aborted: {}", e)))??;

        let mut buffer = self.shared();
        buffer.samples = samples;
        buffer.format = format;
        buffer.frame = 0;
        Ok(())
    }

    async fn play(&mut self, position: f64) -> Result<()> {
        self.stop_stream();
        let format = {
            let mut buffer = self.shared();
            if buffer.samples.is_empty() {
                return Err(EchoError::PlaybackRejected("nothing loaded".into()));
            }
            buffer.frame = (position * buffer.format.sample_rate as f64) as usize;
            buffer.format
        };

        let buffer = self.buffer.clone();
        let (stream, ready) = StreamThread::spawn(move |receiver, ready| {
            run_playback_loop(format, buffer, receiver, ready)
        });

        match ready.await {
            Ok(Ok(())) => {
                self.stream = Some(stream);
                Ok(())
            }
            Ok(Err(e)) => Err(EchoError::PlaybackRejected(e)),
            Err(_) => Err(EchoError::PlaybackRejected(
                "playback thread exited before connecting".into(),
            )),
        }
    }

    fn pause(&mut self) {
        self.stop_stream();
    }

    fn seek(&mut self, position: f64) {
        let mut buffer = self.shared();
        buffer.frame = (position * buffer.format.sample_rate as f64) as usize;
    }

    fn set_volume(&mut self, volume: f32) {
        self.shared().volume = volume;
    }

    fn unload(&mut self) {
        self.stop_stream();
        let mut buffer = self.shared();
        buffer.samples.clear();
        buffer.frame = 0;
    }
}

fn run_playback_loop(
    format: AudioFormat,
    buffer: Arc<Mutex<OutputBuffer>>,
    receiver: pw::channel::Receiver<StreamCommand>,
    ready: &mut Ready,
) -> std::result::Result<(), String> {
    pw::init();

    let mainloop = pw::main_loop::MainLoopRc::new(None)
        .map_err(|e| format!("Failed to create PipeWire main loop: {}", e))?;
    let context = pw::context::ContextRc::new(&mainloop, None)
        .map_err(|e| format!("Failed to create PipeWire context: {}", e))?;
    let core = context
        .connect_rc(None)
        .map_err(|e| format!("Failed to connect to PipeWire: {}", e))?;

    let mainloop_weak = mainloop.downgrade();
    let _receiver = receiver.attach(mainloop.loop_(), move |cmd| match cmd {
        StreamCommand::Stop => {
            if let Some(mainloop) = mainloop_weak.upgrade() {
                mainloop.quit();
            }
        }
    });

    struct UserData {
        format: spa::param::audio::AudioInfoRaw,
        buffer: Arc<Mutex<OutputBuffer>>,
    }

    let user_data = UserData {
        format: Default::default(),
        buffer,
    };

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Playback",
        *pw::keys::MEDIA_ROLE => "Music",
        *pw::keys::APP_NAME => APP_NAME,
    };

    let stream = pw::stream::StreamBox::new(&core, "echolink-playback", props)
        .map_err(|e| format!("Failed to create PipeWire stream: {}", e))?;

    let _listener = stream
        .add_local_listener_with_user_data(user_data)
        .param_changed(|_, user_data, id, param| {
            let Some(param) = param else { return };
            if id != spa::param::ParamType::Format.as_raw() {
                return;
            }
            parse_raw_format(param, &mut user_data.format);
        })
        .process(|stream, user_data| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };
            let datas = buffer.datas_mut();
            if datas.is_empty() {
                return;
            }

            let data = &mut datas[0];
            let n_channels = user_data.format.channels().max(1) as usize;
            let stride = std::mem::size_of::<f32>() * n_channels;

            let Some(slice) = data.data() else {
                return;
            };
            let n_frames = slice.len() / stride;

            let frames = match user_data.buffer.lock() {
                Ok(mut shared) => shared.take_frames(n_frames),
                Err(_) => None,
            };

            // Past the end the stream keeps writing silence until paused
            let written = match frames {
                Some(samples) => {
                    for (i, sample) in samples.iter().enumerate() {
                        let offset = i * std::mem::size_of::<f32>();
                        if offset + 4 <= slice.len() {
                            slice[offset..offset + 4].copy_from_slice(&sample.to_le_bytes());
                        }
                    }
                    samples.len() * std::mem::size_of::<f32>()
                }
                None => 0,
            };
            if written < slice.len() {
                slice[written..].fill(0);
            }

            let chunk = data.chunk_mut();
            *chunk.offset_mut() = 0;
            *chunk.stride_mut() = stride as i32;
            *chunk.size_mut() = (n_frames * stride) as u32;
        })
        .register()
        .map_err(|e| format!("Failed to register stream listener: {}", e))?;

    let values = format_param(format)?;
    let pod = Pod::from_bytes(&values).ok_or("Invalid format pod")?;
    let mut params = [pod];

    stream
        .connect(
            spa::utils::Direction::Output,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| format!("Failed to connect stream: {}", e))?;

    if let Some(tx) = ready.take() {
        let _ = tx.send(Ok(()));
    }
    debug!("PipeWire playback stream connected");

    mainloop.run();
    Ok(())
}
