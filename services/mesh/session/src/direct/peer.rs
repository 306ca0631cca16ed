//! Direct transport contract.
//!
//! The direct channel drives a peer connection through this minimal
//! surface. Completion of asynchronous work (gathered ICE candidates, the
//! data channel opening, inbound data) is reported through a [`PeerSink`].

use crate::error::ChannelError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Session description as exchanged over signaling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// SDP text
    pub sdp: String,
}

/// ICE candidate as exchanged over signaling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// Media stream id
    #[serde(default)]
    pub sdp_mid: Option<String>,
    /// Media line index
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u32>,
}

/// STUN/TURN server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server url (`stun:` or `turn:`)
    pub url: String,
    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// STUN server
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    /// TURN server with credentials
    pub fn turn(url: impl Into<String>, username: Option<String>, credential: Option<String>) -> Self {
        Self {
            url: url.into(),
            username,
            credential,
        }
    }
}

/// Public STUN server appended after any configured TURN server
pub const DEFAULT_STUN: &str = "stun:stun.l.google.com:19302";

/// Peer connection settings
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerConfig {
    /// ICE servers, in preference order
    pub ice_servers: Vec<IceServer>,
}

/// Asynchronous peer connection notifications
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Local ICE candidate gathered; forward to the remote peer
    IceCandidate(IceCandidate),
    /// Data channel is open
    DataOpen,
    /// Data received on the data channel
    DataMessage(Bytes),
    /// Data channel closed
    DataClose,
    /// Transport fault
    Error(String),
}

/// Receiver of peer connection events
pub type PeerSink = Arc<dyn Fn(PeerEvent) + Send + Sync>;

/// One peer-to-peer connection.
pub trait PeerConnection: Send + Sync {
    /// Create an offer
    fn create_offer(&self) -> Result<SessionDescription, ChannelError>;

    /// Create an answer to the remote offer
    fn create_answer(&self) -> Result<SessionDescription, ChannelError>;

    /// Apply the local description
    fn set_local_description(&self, desc: &SessionDescription) -> Result<(), ChannelError>;

    /// Apply the remote description
    fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), ChannelError>;

    /// Add a remote ICE candidate
    fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), ChannelError>;

    /// Create the data channel
    fn create_data_channel(&self, label: &str, reliable: bool) -> Result<(), ChannelError>;

    /// Send on the data channel. Returns `false` when it is not open.
    fn send(&self, data: Bytes) -> bool;

    /// Close the connection
    fn close(&self);
}

/// Factory for peer connections.
pub trait PeerConnector: Send + Sync {
    /// Create a connection reporting to `sink`.
    fn create(
        &self,
        config: &PeerConfig,
        sink: PeerSink,
    ) -> Result<Arc<dyn PeerConnection>, ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signaling_json_shape() {
        let desc = SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0".to_string(),
        };
        assert_eq!(serde_json::to_value(&desc).unwrap(), json!({"type": "offer", "sdp": "v=0"}));

        let candidate: IceCandidate = serde_json::from_value(json!({
            "candidate": "candidate:1 1 udp 1 127.0.0.1 5000 typ host",
            "sdpMid": "audio",
            "sdpMLineIndex": 0
        }))
        .unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("audio"));
        assert_eq!(candidate.sdp_m_line_index, Some(0));
    }
}
