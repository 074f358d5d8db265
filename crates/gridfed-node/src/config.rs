//! Node configuration.
//!
//! Loaded from a TOML file:
//! - Node identity (name and public service URL)
//! - Ingress listen address
//! - Seed peers joined at startup
//! - Log output format
//! - Federation tuning (gossip, probing, per-peer delivery)

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use gridfed_core::config::DEFAULT_SERVICE_PATH;
use gridfed_core::{FederationConfig, GossipConfig, PeerConfig};
use serde::{Deserialize, Serialize};

use crate::error::{NodeError, Result};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// A peer joined at startup, before any registry update arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedPeer {
    /// Peer name. Defaults to the service URL when omitted.
    #[serde(default)]
    pub name: Option<String>,
    /// Peer service URL.
    pub service_url: String,
}

/// Federation tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationSettings {
    /// Path appended to discovered hostnames.
    pub service_path: String,
    /// Seconds between liveness probe sweeps.
    pub probe_interval_secs: u64,
    /// Gossip parameters.
    pub gossip: GossipConfig,
    /// Capacity of each peer's outbound queue.
    pub outbound_queue_capacity: usize,
    /// Seconds before a single send is abandoned.
    pub send_timeout_secs: u64,
    /// Seconds before a single probe is abandoned.
    pub probe_timeout_secs: u64,
}

impl Default for FederationSettings {
    fn default() -> Self {
        let peer = PeerConfig::default();
        Self {
            service_path: DEFAULT_SERVICE_PATH.to_string(),
            probe_interval_secs: 5,
            gossip: GossipConfig::default(),
            outbound_queue_capacity: peer.outbound_queue_capacity,
            send_timeout_secs: peer.send_timeout.as_secs(),
            probe_timeout_secs: peer.probe_timeout.as_secs(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Main node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Human-readable node name.
    pub name: String,
    /// This node's public service URL, as peers reach it.
    pub service_url: String,
    /// Address the ingress server binds.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Peers joined at startup.
    #[serde(default)]
    pub seed_peers: Vec<SeedPeer>,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
    /// Federation tuning.
    #[serde(default)]
    pub federation: FederationSettings,
}

impl NodeConfig {
    /// Creates a configuration with defaults for everything but identity.
    #[must_use]
    pub fn new(name: impl Into<String>, service_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service_url: service_url.into(),
            listen_addr: default_listen_addr(),
            seed_peers: Vec::new(),
            log_format: LogFormat::default(),
            federation: FederationSettings::default(),
        }
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            NodeError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| NodeError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Serializes the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| NodeError::Config(format!("failed to serialize config: {e}")))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(NodeError::Config("node name cannot be empty".to_string()));
        }

        validate_http_url("service_url", &self.service_url)?;

        for (i, seed) in self.seed_peers.iter().enumerate() {
            validate_http_url(&format!("seed_peers[{i}].service_url"), &seed.service_url)?;
            if seed.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
                return Err(NodeError::Config(format!(
                    "seed_peers[{i}].name cannot be empty"
                )));
            }
        }

        if self.federation.send_timeout_secs == 0 || self.federation.probe_timeout_secs == 0 {
            return Err(NodeError::Config(
                "federation timeouts must be greater than 0".to_string(),
            ));
        }

        self.federation_config()
            .validate()
            .map_err(|e| NodeError::Config(e.to_string()))
    }

    /// Builds the control-plane configuration.
    #[must_use]
    pub fn federation_config(&self) -> FederationConfig {
        let settings = &self.federation;
        FederationConfig::new(self.service_url.clone())
            .with_service_path(settings.service_path.clone())
            .with_probe_interval(Duration::from_secs(settings.probe_interval_secs))
            .with_gossip(settings.gossip)
            .with_peer(
                PeerConfig::new()
                    .with_outbound_queue_capacity(settings.outbound_queue_capacity)
                    .with_send_timeout(Duration::from_secs(settings.send_timeout_secs))
                    .with_probe_timeout(Duration::from_secs(settings.probe_timeout_secs)),
            )
    }

    /// Path component of the service URL, without a trailing slash.
    ///
    /// The ingress server serves its endpoints below this path.
    #[must_use]
    pub fn base_path(&self) -> String {
        url::Url::parse(&self.service_url)
            .map(|u| u.path().trim_end_matches('/').to_string())
            .unwrap_or_default()
    }
}

fn validate_http_url(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(NodeError::Config(format!("{field} cannot be empty")));
    }
    let parsed = url::Url::parse(value)
        .map_err(|e| NodeError::Config(format!("{field} '{value}' is not a valid url: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(NodeError::Config(format!(
            "{field} must start with http:// or https://"
        )));
    }
    Ok(())
}
