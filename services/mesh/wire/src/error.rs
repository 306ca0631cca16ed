//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Text frame is not valid JSON for the expected shape
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame decoded but does not have the expected structure
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Packet ended in the middle of a record
    #[error("incomplete packet")]
    Incomplete,

    /// Record payload exceeds the one-byte length field
    #[error("size limit exceeded: {0}")]
    Size(usize),
}
