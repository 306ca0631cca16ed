//! Session layer error types.

use mesh_wire::WireError;
use thiserror::Error;

/// Channel and transport errors
#[derive(Error, Debug)]
pub enum ChannelError {
    /// NetChannel payload does not fit in one record
    #[error("message too large: {0} bytes (max {max})", max = mesh_wire::MAX_RECORD_PAYLOAD)]
    Oversize(usize),

    /// Channel already closed
    #[error("channel closed")]
    Closed,

    /// Direct transport rejected an operation
    #[error("peer connection: {0}")]
    Peer(String),

    /// Malformed frame or packet
    #[error(transparent)]
    Wire(#[from] WireError),
}
