//! Peer-to-peer transport: the direct channel, its transport contract, and
//! the session description rewrites applied during negotiation.

pub mod channel;
pub mod loopback;
pub mod peer;
pub mod sdp;

pub use channel::{DirectChannel, DirectConfig, Signaler, DATA_CHANNEL_LABEL};
pub use loopback::LoopbackNetwork;
pub use peer::{
    IceCandidate, IceServer, PeerConfig, PeerConnection, PeerConnector, PeerEvent, PeerSink,
    SdpKind, SessionDescription, DEFAULT_STUN,
};
pub use sdp::{prefer_opus, set_bandwidth, DEFAULT_BANDWIDTH_KBPS};
