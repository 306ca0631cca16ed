//! Overlay error types.

use mesh_wire::WireError;
use thiserror::Error;

/// Errors returned by Mesh, Peers and Node operations
#[derive(Error, Debug)]
pub enum MeshError {
    /// Reserved control or negotiation event type used from application code
    #[error("event type '{0}' is protected")]
    ProtectedEvent(String),

    /// Trigger arguments could not be serialized
    #[error("trigger not serializable: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Options do not describe a way to reach a relay
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// Connecting was attempted outside a tokio runtime
    #[error("no tokio runtime: {0}")]
    NoRuntime(String),

    /// Discovery endpoint failed or returned garbage
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// Wire encoding failure
    #[error(transparent)]
    Wire(WireError),
}

impl From<WireError> for MeshError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Json(e) => MeshError::Serialization(e),
            other => MeshError::Wire(other),
        }
    }
}
