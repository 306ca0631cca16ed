//! Channel abstraction shared by the relay and direct transports.

use crate::dispatcher::EventDispatcher;
use crate::identity::PeerIdentity;
use mesh_wire::event::{CLOSE, ERROR, MESSAGE, OPEN};
use mesh_wire::NodeId;
use std::fmt;
use std::sync::Arc;

/// Channel lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChannelState {
    /// Not connected
    Closed = 1,
    /// Connection in progress
    Opening = 2,
    /// Ready to send
    Open = 3,
}

/// Transport behind a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Multiplexed over the shared relay connection; reliable and ordered
    Relay,
    /// Peer-to-peer; unreliable and unordered
    Direct,
}

/// Inbound data on a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    /// Sender id, if known
    pub from: Option<NodeId>,
    /// Seconds since the unix epoch
    pub timestamp: f64,
    /// Event message JSON text
    pub data: String,
}

/// Event emitted by a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Channel became usable
    Open,
    /// Data arrived
    Message(Incoming),
    /// Channel closed
    Close,
    /// Transport fault
    Error(String),
}

impl ChannelEvent {
    /// Dispatcher key for this event
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelEvent::Open => OPEN,
            ChannelEvent::Message(_) => MESSAGE,
            ChannelEvent::Close => CLOSE,
            ChannelEvent::Error(_) => ERROR,
        }
    }
}

/// Point-to-point link between the local peer and one remote peer.
///
/// Every variant exposes the same surface; callers pick the next channel
/// when `send` reports failure.
pub trait Channel: Send + Sync {
    /// Transport kind
    fn kind(&self) -> ChannelKind;

    /// Current state
    fn state(&self) -> ChannelState;

    /// Local end
    fn local(&self) -> &Arc<PeerIdentity>;

    /// Remote end
    fn remote(&self) -> &Arc<PeerIdentity>;

    /// Start connecting
    fn open(&self);

    /// Close and release transport resources
    fn close(&self);

    /// Send one event message. Returns `false` when it could not be sent now.
    fn send(&self, message: &str) -> bool;

    /// Channel events, keyed by [`ChannelEvent::kind`]
    fn events(&self) -> &EventDispatcher<ChannelEvent>;

    /// Emit `event` to every handler bound for its kind.
    fn emit(&self, event: ChannelEvent) {
        self.events().trigger(event.kind(), &event);
    }
}

impl fmt::Debug for dyn Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("kind", &self.kind())
            .field("state", &self.state())
            .field("local", &self.local().uid())
            .field("remote", &self.remote().uid())
            .finish()
    }
}

/// Current time as fractional unix seconds.
pub fn unix_timestamp() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
