//! Mesh configuration.

use crate::error::MeshError;
use mesh_session::{DirectConfig, IceServer, NetChannelConfig, DEFAULT_BANDWIDTH_KBPS, DEFAULT_STUN};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default discovery path
pub const DEFAULT_API: &str = "/api/mesh";

/// Delay between discovery attempts after a failure
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Artificial delay injected before every outbound node send.
#[derive(Clone)]
pub enum Delay {
    /// Same delay for every send
    Fixed(Duration),
    /// Delay computed per send
    Dynamic(Arc<dyn Fn() -> Duration + Send + Sync>),
}

impl Delay {
    /// Delay for the next send
    pub fn next(&self) -> Duration {
        match self {
            Delay::Fixed(d) => *d,
            Delay::Dynamic(f) => f(),
        }
    }
}

impl fmt::Debug for Delay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delay::Fixed(d) => write!(f, "Fixed({:?})", d),
            Delay::Dynamic(_) => write!(f, "Dynamic(..)"),
        }
    }
}

/// Mesh options. JSON keys are camelCase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MeshOptions {
    /// Relay WebSocket URL; its last path segment becomes the mesh id
    pub ws: Option<String>,
    /// Discovery endpoint returning relay options
    pub api: Option<String>,
    /// Use the configured channel transport keyed by `name` instead of `ws`
    pub channel: bool,
    /// Mesh name for channel transport
    pub name: Option<String>,
    /// Connect as soon as the mesh is built
    pub auto_connect: bool,
    /// Connect to peers as they are discovered
    pub auto_peer_connect: bool,
    /// Attempt direct channels to remote peers
    #[serde(rename = "useWebRTC")]
    pub use_webrtc: bool,
    /// Artificial send delay, for testing
    #[serde(skip)]
    pub delay: Option<Delay>,
    /// TURN server url
    pub turn: Option<String>,
    /// TURN username
    pub username: Option<String>,
    /// TURN password
    pub password: Option<String>,
    /// Bandwidth ceiling for direct channel descriptions, in kbps
    pub bandwidth: u32,
    /// Layer a NetChannel over direct channels
    pub reliable_direct: bool,
    /// NetChannel resend interval
    #[serde(with = "millis")]
    pub resend_interval: Duration,
    /// Discovery retry interval
    #[serde(with = "millis")]
    pub retry_interval: Duration,
}

impl Default for MeshOptions {
    fn default() -> Self {
        Self {
            ws: None,
            api: Some(DEFAULT_API.to_string()),
            channel: false,
            name: None,
            auto_connect: true,
            auto_peer_connect: true,
            use_webrtc: true,
            delay: None,
            turn: None,
            username: None,
            password: None,
            bandwidth: DEFAULT_BANDWIDTH_KBPS,
            reliable_direct: false,
            resend_interval: mesh_session::DEFAULT_RESEND_INTERVAL,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

impl MeshOptions {
    /// Options for a relay WebSocket url
    pub fn with_ws(ws: impl Into<String>) -> Self {
        Self {
            ws: Some(ws.into()),
            ..Self::default()
        }
    }

    /// Options for a discovery endpoint
    pub fn with_api(api: impl Into<String>) -> Self {
        Self {
            api: Some(api.into()),
            ..Self::default()
        }
    }

    /// Merge a JSON object over these options.
    ///
    /// Keys missing from `patch` keep their current value. `delay` accepts a
    /// number of milliseconds or `null`.
    pub fn merge_json(&mut self, patch: &Value) -> Result<(), MeshError> {
        let Value::Object(patch) = patch else {
            return Err(MeshError::InvalidOptions(format!(
                "expected a JSON object, got {}",
                patch
            )));
        };

        let mut current = serde_json::to_value(&*self)?;
        if let Value::Object(fields) = &mut current {
            for (key, value) in patch.iter().filter(|(k, _)| k.as_str() != "delay") {
                fields.insert(key.clone(), value.clone());
            }
        }
        let mut merged: MeshOptions = serde_json::from_value(current)
            .map_err(|e| MeshError::InvalidOptions(e.to_string()))?;

        merged.delay = match patch.get("delay") {
            None => self.delay.take(),
            Some(Value::Null) => None,
            Some(value) => match value.as_u64() {
                Some(ms) => Some(Delay::Fixed(Duration::from_millis(ms))),
                None => {
                    return Err(MeshError::InvalidOptions(format!(
                        "delay must be milliseconds, got {}",
                        value
                    )))
                }
            },
        };
        *self = merged;
        Ok(())
    }

    /// ICE servers: the TURN server, if any, then the public STUN server.
    pub fn ice_servers(&self) -> Vec<IceServer> {
        let mut servers = Vec::new();
        if let Some(turn) = &self.turn {
            servers.push(IceServer::turn(
                turn.clone(),
                self.username.clone(),
                self.password.clone(),
            ));
        }
        servers.push(IceServer::stun(DEFAULT_STUN));
        servers
    }

    /// Settings for direct channels created under these options
    pub fn direct_config(&self) -> DirectConfig {
        DirectConfig {
            ice_servers: self.ice_servers(),
            bandwidth: Some(self.bandwidth),
            reliable: self.reliable_direct.then(|| NetChannelConfig {
                resend_interval: self.resend_interval,
            }),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let options = MeshOptions::default();
        assert_eq!(options.api.as_deref(), Some("/api/mesh"));
        assert!(options.auto_connect && options.auto_peer_connect && options.use_webrtc);
        assert_eq!(options.bandwidth, 64);
        assert_eq!(options.resend_interval, Duration::from_millis(500));
        assert_eq!(options.retry_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_merge_keeps_unset_fields() {
        let mut options = MeshOptions::with_api("/api/mesh");
        options.merge_json(&json!({"ws": "wss://relay/room1", "useWebRTC": false}))
            .unwrap();
        assert_eq!(options.ws.as_deref(), Some("wss://relay/room1"));
        assert_eq!(options.api.as_deref(), Some("/api/mesh"));
        assert!(!options.use_webrtc);
        assert!(options.auto_peer_connect);
    }

    #[test]
    fn test_merge_delay() {
        let mut options = MeshOptions {
            delay: Some(Delay::Dynamic(Arc::new(|| Duration::from_millis(3)))),
            ..MeshOptions::default()
        };
        options.merge_json(&json!({"bandwidth": 128})).unwrap();
        assert_eq!(options.delay.as_ref().map(Delay::next), Some(Duration::from_millis(3)));

        options.merge_json(&json!({"delay": 250})).unwrap();
        assert_eq!(options.delay.as_ref().map(Delay::next), Some(Duration::from_millis(250)));

        options.merge_json(&json!({"delay": null})).unwrap();
        assert!(options.delay.is_none());
        assert!(options.merge_json(&json!({"delay": "soon"})).is_err());
    }

    #[test]
    fn test_merge_rejects_bad_input() {
        let mut options = MeshOptions::default();
        assert!(matches!(
            options.merge_json(&json!(["ws"])),
            Err(MeshError::InvalidOptions(_))
        ));
        assert!(matches!(
            options.merge_json(&json!({"bandwidth": "lots"})),
            Err(MeshError::InvalidOptions(_))
        ));
        assert_eq!(options.bandwidth, 64);
    }

    #[test]
    fn test_ice_servers() {
        let mut options = MeshOptions::default();
        assert_eq!(options.ice_servers(), vec![IceServer::stun(DEFAULT_STUN)]);

        options.turn = Some("turn:turn.example.com".to_string());
        options.username = Some("u".to_string());
        options.password = Some("p".to_string());
        let servers = options.ice_servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].credential.as_deref(), Some("p"));
        assert_eq!(servers[1].url, DEFAULT_STUN);
    }

    #[test]
    fn test_direct_config() {
        let mut options = MeshOptions::default();
        assert!(options.direct_config().reliable.is_none());
        options.reliable_direct = true;
        options.resend_interval = Duration::from_millis(50);
        let config = options.direct_config();
        assert_eq!(config.bandwidth, Some(64));
        assert_eq!(
            config.reliable.map(|r| r.resend_interval),
            Some(Duration::from_millis(50))
        );
    }
}
