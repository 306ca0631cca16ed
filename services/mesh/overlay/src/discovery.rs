//! Relay discovery.
//!
//! A discovery endpoint answers `GET {api}/{mesh id}` with a JSON object of
//! mesh options (typically `{"ws": "wss://relay.example.com/<id>"}`) that is
//! merged into the mesh's options before connecting.

use crate::error::MeshError;
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use url::Url;

/// Source of relay connection options.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Fetch the options document at `path`.
    async fn fetch(&self, path: &str) -> Result<Value, MeshError>;
}

/// Discovery over HTTP GET.
///
/// Relative paths are resolved against `base`; absolute URLs are used as is.
#[derive(Debug, Clone)]
pub struct HttpDiscovery {
    client: reqwest::Client,
    base: Url,
}

impl HttpDiscovery {
    /// Create a client resolving paths against `base`.
    pub fn new(base: &str) -> Result<Self, MeshError> {
        let base = Url::parse(base)
            .map_err(|e| MeshError::InvalidOptions(format!("bad discovery base '{}': {}", base, e)))?;
        Ok(Self {
            client: reqwest::Client::new(),
            base,
        })
    }

    /// URL requested for `path`
    pub fn resolve(&self, path: &str) -> Result<Url, MeshError> {
        self.base
            .join(path)
            .map_err(|e| MeshError::Discovery(format!("bad discovery path '{}': {}", path, e)))
    }
}

#[async_trait]
impl Discovery for HttpDiscovery {
    async fn fetch(&self, path: &str) -> Result<Value, MeshError> {
        let url = self.resolve(path)?;
        debug!("Discovery GET {}", url);

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| MeshError::Discovery(format!("GET {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(MeshError::Discovery(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| MeshError::Discovery(format!("GET {} returned bad JSON: {}", url, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        let discovery = HttpDiscovery::new("http://lb.example.com:8080/").unwrap();
        assert_eq!(
            discovery.resolve("/api/mesh/").unwrap().as_str(),
            "http://lb.example.com:8080/api/mesh/"
        );
        assert_eq!(
            discovery.resolve("/api/mesh/room1").unwrap().as_str(),
            "http://lb.example.com:8080/api/mesh/room1"
        );
        assert_eq!(
            discovery.resolve("https://other.example.com/api/mesh/").unwrap().as_str(),
            "https://other.example.com/api/mesh/"
        );
    }

    #[test]
    fn test_bad_base() {
        assert!(matches!(
            HttpDiscovery::new("not a url"),
            Err(MeshError::InvalidOptions(_))
        ));
    }
}
