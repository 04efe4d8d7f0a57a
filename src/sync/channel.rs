//! Named broadcast channels between instances
//!
//! Delivery is at-most-once and unordered across senders. A channel never
//! hands an endpoint its own messages back.

use super::message::SyncMessage;
use crate::error::{EchoError, Result};
use async_trait::async_trait;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::os::unix::net::UnixDatagram as StdUnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::net::UnixDatagram;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

const HUB_CAPACITY: usize = 32;
const MAX_DATAGRAM: usize = 2048;

#[async_trait]
pub trait SyncChannel: Send {
    fn name(&self) -> &str;

    /// Broadcast to every other endpoint. Unreachable peers are skipped.
    fn post(&self, message: &SyncMessage) -> Result<()>;

    /// Next message from another endpoint; `None` once closed
    async fn recv(&mut self) -> Option<SyncMessage>;

    fn close(&mut self);
}

#[derive(Clone, Debug)]
struct Envelope {
    origin: Uuid,
    payload: String,
}

/// In-process registry of named channels, for instances sharing a process
#[derive(Clone, Default)]
pub struct LocalHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Envelope>>>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new endpoint on the named channel
    pub fn open(&self, name: &str) -> LocalChannel {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let sender = channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(HUB_CAPACITY).0)
            .clone();
        let receiver = sender.subscribe();
        LocalChannel {
            name: name.to_string(),
            id: Uuid::new_v4(),
            sender: Some(sender),
            receiver,
        }
    }
}

pub struct LocalChannel {
    name: String,
    id: Uuid,
    sender: Option<broadcast::Sender<Envelope>>,
    receiver: broadcast::Receiver<Envelope>,
}

#[async_trait]
impl SyncChannel for LocalChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn post(&self, message: &SyncMessage) -> Result<()> {
        let Some(sender) = self.sender.as_ref() else {
            return Err(EchoError::Sync("channel closed".into()));
        };
        let envelope = Envelope {
            origin: self.id,
            payload: message.to_json()?,
        };
        // Only our own receiver may be listening; that is not an error
        let _ = sender.send(envelope);
        Ok(())
    }

    async fn recv(&mut self) -> Option<SyncMessage> {
        loop {
            if self.sender.is_none() {
                return None;
            }
            match self.receiver.recv().await {
                Ok(envelope) if envelope.origin == self.id => continue,
                Ok(envelope) => match SyncMessage::from_json(envelope.payload.as_bytes()) {
                    Ok(message) => return Some(message),
                    Err(e) => warn!("Dropping malformed sync message: {}", e),
                },
                Err(RecvError::Lagged(n)) => warn!("Sync channel lagged, dropped {} messages", n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    fn close(&mut self) {
        self.sender = None;
    }
}

/// Cross-process channel: one Unix datagram socket per endpoint, all in a
/// directory named after the channel.
///
/// Sends go through a non-blocking std clone of the socket so a post never
/// depends on the reactor having polled the socket yet.
pub struct SocketChannel {
    name: String,
    path: PathBuf,
    dir: PathBuf,
    socket: Option<UnixDatagram>,
    sender: Option<StdUnixDatagram>,
}

impl SocketChannel {
    /// Open an endpoint under the user's runtime directory
    pub fn open(name: &str) -> Result<Self> {
        let base = dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("echolink");
        Self::open_in(&base, name)
    }

    pub fn open_in(base: &Path, name: &str) -> Result<Self> {
        let dir = base.join(sanitize(name));
        std::fs::create_dir_all(&dir)
            .map_err(|e| EchoError::Sync(format!("Failed to create {:?}: {}", dir, e)))?;
        let path = dir.join(format!("{}.sock", Uuid::new_v4()));
        let bind_error = |e: std::io::Error| EchoError::Sync(format!("Failed to bind {:?}: {}", path, e));

        let std_socket = StdUnixDatagram::bind(&path).map_err(bind_error)?;
        std_socket.set_nonblocking(true).map_err(bind_error)?;
        let sender = std_socket.try_clone().map_err(bind_error)?;
        let socket = UnixDatagram::from_std(std_socket).map_err(bind_error)?;

        debug!("Joined sync channel {:?} at {:?}", name, path);
        Ok(Self {
            name: name.to_string(),
            path,
            dir,
            socket: Some(socket),
            sender: Some(sender),
        })
    }

    fn peers(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().map(|ext| ext == "sock").unwrap_or(false))
            .filter(|path| *path != self.path)
            .collect()
    }
}

#[async_trait]
impl SyncChannel for SocketChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn post(&self, message: &SyncMessage) -> Result<()> {
        let Some(sender) = self.sender.as_ref() else {
            return Err(EchoError::Sync("channel closed".into()));
        };
        let payload = message.to_json()?;

        for peer in self.peers() {
            match sender.send_to(payload.as_bytes(), &peer) {
                Ok(_) => trace!("Sent sync message to {:?}", peer),
                Err(e) if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::NotFound) => {
                    // Left behind by an instance that did not shut down cleanly
                    debug!("Removing stale sync endpoint {:?}", peer);
                    let _ = std::fs::remove_file(&peer);
                }
                Err(e) => warn!("Sync message to {:?} dropped: {}", peer, e),
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<SyncMessage> {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let socket = self.socket.as_ref()?;
            match socket.recv(&mut buf).await {
                Ok(n) => match SyncMessage::from_json(&buf[..n]) {
                    Ok(message) => return Some(message),
                    Err(e) => warn!("Dropping malformed sync message: {}", e),
                },
                Err(e) => {
                    warn!("Sync channel receive failed: {}", e);
                    return None;
                }
            }
        }
    }

    fn close(&mut self) {
        self.sender = None;
        if self.socket.take().is_some() {
            let _ = std::fs::remove_file(&self.path);
            debug!("Left sync channel {:?}", self.name);
        }
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
