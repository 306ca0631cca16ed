//! Configuration handling for the peer-mesh binary.
//!
//! Values come from a YAML file with `relay` and `client` sections, then
//! from `MESH_*` environment variables, and finally from command line flags
//! (applied in `main`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Binary configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerMeshConfig {
    /// Relay server settings
    pub relay: RelayConfig,
    /// Mesh client settings
    pub client: ClientConfig,
}

/// Relay server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Listen address
    pub bind: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Mesh client settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay WebSocket url
    pub ws: Option<String>,
    /// Discovery endpoint
    pub api: Option<String>,
    /// Mesh name; also the discovery id
    pub name: Option<String>,
    /// Base url that relative discovery endpoints resolve against
    pub discovery_base: Option<String>,
    /// Event type exchanged by `join`
    pub event: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws: None,
            api: None,
            name: None,
            discovery_base: None,
            event: "chat".to_string(),
        }
    }
}

impl PeerMeshConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: Self = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides(|key| std::env::var(key).ok());

        info!(
            "Final configuration: relay.bind={}, client.ws={:?}, client.api={:?}, client.name={:?}",
            config.relay.bind, config.client.ws, config.client.api, config.client.name
        );
        Ok(config)
    }

    /// Apply `MESH_*` overrides read through `lookup`
    fn apply_environment_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(ws) = lookup("MESH_WS") {
            info!("Relay url overridden by environment: {}", ws);
            self.client.ws = Some(ws);
        }
        if let Some(api) = lookup("MESH_API") {
            info!("Discovery endpoint overridden by environment: {}", api);
            self.client.api = Some(api);
        }
        if let Some(name) = lookup("MESH_NAME") {
            info!("Mesh name overridden by environment: {}", name);
            self.client.name = Some(name);
        }
        if let Some(bind) = lookup("MESH_RELAY_BIND") {
            info!("Relay bind address overridden by environment: {}", bind);
            self.relay.bind = bind;
        }
        if let Some(base) = lookup("MESH_DISCOVERY_BASE") {
            info!("Discovery base overridden by environment: {}", base);
            self.client.discovery_base = Some(base);
        }
    }
}
