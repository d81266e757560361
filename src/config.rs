//! Sidecar configuration, loaded from JSON.
//!
//! ```json
//! {
//!   "app_id": "checkout",
//!   "namespace": "prod.",
//!   "app": { "protocol": "http", "address": "http://127.0.0.1:3000", "timeout_ms": 5000 },
//!   "resiliency": {
//!     "default": { "max_retries": 2, "timeout_ms": 1000 },
//!     "components": { "orders": { "outbound": { "max_retries": 5 } } }
//!   },
//!   "pubsubs": [
//!     { "name": "orders", "scoped_publishings": ["created"], "namespace_scoped": true }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::access::ScopingRule;
use crate::delivery::AppProtocol;
use crate::resiliency::ResiliencyConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How the sidecar reaches the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppChannelConfig {
    #[serde(default)]
    pub protocol: AppProtocol,
    /// Base URL (HTTP) or endpoint (gRPC) of the app.
    pub address: String,
    /// Per-delivery timeout. Unset = no timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl AppChannelConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// One pub/sub component as declared for this app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubSubSpec {
    pub name: String,
    #[serde(flatten)]
    pub scoping: ScopingRule,
    #[serde(default)]
    pub namespace_scoped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarConfig {
    pub app_id: String,
    #[serde(default)]
    pub namespace: String,
    /// `tracing` filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub app: AppChannelConfig,
    #[serde(default)]
    pub resiliency: ResiliencyConfig,
    #[serde(default)]
    pub pubsubs: Vec<PubSubSpec>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl SidecarConfig {
    /// Parse and validate.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: SidecarConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_id.trim().is_empty() {
            return Err(ConfigError::Invalid("app_id is empty".into()));
        }
        if self.app.address.trim().is_empty() {
            return Err(ConfigError::Invalid("app.address is empty".into()));
        }
        let mut names = HashSet::new();
        for pubsub in &self.pubsubs {
            if pubsub.name.trim().is_empty() {
                return Err(ConfigError::Invalid("pubsub name is empty".into()));
            }
            if !names.insert(pubsub.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "pubsub {} declared more than once",
                    pubsub.name
                )));
            }
        }
        Ok(())
    }

    pub fn pubsub(&self, name: &str) -> Option<&PubSubSpec> {
        self.pubsubs.iter().find(|p| p.name == name)
    }
}
