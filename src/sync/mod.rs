pub mod channel;
pub mod message;
pub mod protocol;

pub use channel::{LocalHub, SocketChannel, SyncChannel};
pub use message::SyncMessage;
pub use protocol::{plan_inbound, InboundAction, SyncEvent, SyncProtocol, DEFAULT_CHANNEL, DEFAULT_INTERVAL};
