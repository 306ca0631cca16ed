//! Channels, multiplexing and reliability for the peer mesh.
//!
//! This crate provides the transport half of the mesh: everything between a
//! node's event API and the bytes on a relay socket or a peer-to-peer data
//! channel.
//!
//! ## Features
//!
//! - **Event dispatch**: name-keyed handler registry with synchronous fan-out
//! - **State gating**: calls queued until an object reaches a required state
//! - **Relay channels**: per-peer logical channels multiplexed over one relay link
//! - **Direct channels**: peer-to-peer data channels negotiated over signaling
//! - **NetChannel**: acknowledged, retransmitted delivery over a lossy transport
//! - **SDP rewriting**: Opus preference and bandwidth ceilings
//!
//! ## Example
//!
//! ```rust,no_run
//! use mesh_session::{Channel, ChannelEvent, Handler, Multiplexer, PeerIdentity, RelayChannel, WsConnector};
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let mux = Multiplexer::new(Arc::new(WsConnector::new()));
//! mux.set_endpoint("wss://relay.example.com/room");
//!
//! let me = Arc::new(PeerIdentity::local());
//! let signaling = RelayChannel::new(me.clone(), me, &mux);
//! signaling.events().bind(
//!     "open",
//!     Handler::new(|_: &ChannelEvent| println!("connected to relay")),
//! );
//! signaling.open();
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod direct;
pub mod dispatcher;
pub mod error;
pub mod identity;
pub mod multiplexer;
pub mod relay;
pub mod reliability;
pub mod state;
pub mod transport;

pub use channel::{unix_timestamp, Channel, ChannelEvent, ChannelKind, ChannelState, Incoming};
pub use direct::{
    DirectChannel, DirectConfig, IceCandidate, IceServer, LoopbackNetwork, PeerConfig,
    PeerConnection, PeerConnector, PeerEvent, PeerSink, SdpKind, SessionDescription, Signaler,
    DEFAULT_BANDWIDTH_KBPS, DEFAULT_STUN,
};
pub use dispatcher::{EventDispatcher, Handler};
pub use error::ChannelError;
pub use identity::PeerIdentity;
pub use multiplexer::Multiplexer;
pub use relay::RelayChannel;
pub use reliability::{NetChannel, NetChannelConfig, PacketTransport, DEFAULT_RESEND_INTERVAL};
pub use state::StateDrive;
pub use transport::{LinkEvent, LinkSink, RelayConnector, RelayLink, WsConnector};
