//! Timeline sync between instances
//!
//! While playing, an instance broadcasts its position once per interval plus
//! once on every play/pause/seek. Receivers apply updates as they arrive and
//! never answer them, so two instances cannot ping-pong.

use super::channel::SyncChannel;
use super::message::SyncMessage;
use log::{debug, warn};
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

pub const DEFAULT_CHANNEL: &str = "audio-stream-channel";
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1000);

/// What a received update asks of the local player
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InboundAction {
    pub seek_to: f64,
    pub resume: bool,
    pub pause: bool,
}

/// Decide how to apply a remote update given the local play state.
///
/// The position is always taken; play state only changes on a mismatch.
pub fn plan_inbound(message: &SyncMessage, locally_playing: bool) -> InboundAction {
    let remote_playing = message.is_playing();
    InboundAction {
        seek_to: message.current_time().max(0.0),
        resume: remote_playing && !locally_playing,
        pause: !remote_playing && locally_playing,
    }
}

/// Something the instance has to react to
#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    /// The periodic broadcast is due
    Tick,
    Received(SyncMessage),
}

pub struct SyncProtocol {
    channel: Box<dyn SyncChannel>,
    interval: Duration,
    timer: Option<Interval>,
    started: Instant,
    closed: bool,
}

impl SyncProtocol {
    pub fn new(channel: Box<dyn SyncChannel>, interval: Duration) -> Self {
        Self {
            channel,
            interval,
            timer: None,
            started: Instant::now(),
            closed: false,
        }
    }

    pub fn channel_name(&self) -> &str {
        self.channel.name()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Arm or disarm the periodic broadcast
    pub fn set_playing(&mut self, playing: bool) {
        if playing && !self.closed {
            if self.timer.is_none() {
                let mut timer = interval_at(Instant::now() + self.interval, self.interval);
                timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.timer = Some(timer);
            }
        } else {
            self.timer = None;
        }
    }

    pub fn is_armed(&self) -> bool {
        self.timer.is_some()
    }

    /// Broadcast the local timeline. Failures are logged, never surfaced.
    pub fn publish(&self, current_time: f64, is_playing: bool) {
        if self.closed {
            return;
        }
        let message = SyncMessage::TimelineUpdate {
            current_time,
            is_playing,
            sent_at: Some(self.started.elapsed().as_millis() as u64),
        };
        match self.channel.post(&message) {
            Ok(()) => debug!("Broadcast position {:.2}s playing={}", current_time, is_playing),
            Err(e) => warn!("Failed to broadcast timeline: {}", e),
        }
    }

    /// Resolves when the periodic broadcast is due. Never resolves while disarmed.
    pub async fn next_tick(&mut self) {
        wait_timer(&mut self.timer).await
    }

    /// Next update from a peer. Never resolves once the channel is gone.
    pub async fn recv(&mut self) -> SyncMessage {
        recv_from(self.channel.as_mut(), &mut self.closed).await
    }

    /// Whichever comes first: a due broadcast or a peer update
    pub async fn next_event(&mut self) -> SyncEvent {
        tokio::select! {
            _ = wait_timer(&mut self.timer) => SyncEvent::Tick,
            message = recv_from(self.channel.as_mut(), &mut self.closed) => SyncEvent::Received(message),
        }
    }

    pub fn close(&mut self) {
        self.timer = None;
        if !self.closed {
            self.closed = true;
            self.channel.close();
        }
    }
}

async fn wait_timer(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn recv_from(channel: &mut dyn SyncChannel, closed: &mut bool) -> SyncMessage {
    if !*closed {
        if let Some(message) = channel.recv().await {
            return message;
        }
        debug!("Sync channel {} closed", channel.name());
        *closed = true;
    }
    std::future::pending().await
}
