//! Relay envelopes, event messages and reliability packet framing for mesh.
//!
//! This crate holds everything that crosses a process boundary: the JSON
//! frames exchanged with the relay, the `[type, ...args]` event messages
//! nodes send each other, and the binary packets of the NetChannel
//! reliability layer.
//!
//! ## Relay Frames
//!
//! ```text
//! client -> relay   [[targetId, ...], "<event message json>"]
//!                   [[[targetId, ...], "<json>"], [[...], "<json>"]]   (batch)
//! relay  -> client  [senderId, unixSeconds, "<event message json>"]
//! ```
//!
//! ## NetChannel Packets
//!
//! ```text
//! +-------------+------------+-----------+-------------+-----
//! | u16 ack     | u16 seq    | u8 len    | len bytes   | ...
//! +-------------+------------+-----------+-------------+-----
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod envelope;
pub mod error;
pub mod event;
pub mod id;
pub mod packet;

// Re-export main types
pub use envelope::{InboundEnvelope, OutboundEnvelope};
pub use error::WireError;
pub use event::{
    is_control, is_negotiation, is_protected, to_args, EventMessage, CONTROL_EVENTS,
    NEGOTIATION_EVENTS,
};
pub use id::NodeId;
pub use packet::{
    seq_after, Packet, Record, ACK_SENTINEL, MAX_RECORD_PAYLOAD, PACKET_HEADER_SIZE,
    RECORD_HEADER_SIZE,
};
