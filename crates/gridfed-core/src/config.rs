//! Federation configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FederationError, Result};

/// Default number of peers notified per gossip dispatch.
pub const DEFAULT_BRANCH_FACTOR: usize = 2;

/// Default number of gossip rounds before giving up.
pub const DEFAULT_RETRIES: usize = 3;

/// Default number of redraws allowed per round when the same index repeats.
pub const DEFAULT_RECHOOSE_LIMIT: usize = 4;

/// Default upper bound of the uniform draw, later reduced modulo the roster size.
pub const DEFAULT_NETWORK_SIZE_LIMIT: usize = 10_000;

/// Default path appended to a hostname to form a peer's service URL.
pub const DEFAULT_SERVICE_PATH: &str = "/esg-node/datanode";

/// Parameters of the gossip dispatch algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// Peers to notify per dispatch.
    pub branch_factor: usize,
    /// Rounds to attempt before giving up on reaching `branch_factor` peers.
    pub retries: usize,
    /// Redraws allowed per round when a draw repeats the previous index.
    pub rechoose_limit: usize,
    /// Exclusive upper bound of the uniform draw.
    pub network_size_limit: usize,
    /// Fixed RNG seed; `None` seeds from entropy.
    pub rng_seed: Option<u64>,
}

impl GossipConfig {
    /// Creates the default gossip parameters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            branch_factor: DEFAULT_BRANCH_FACTOR,
            retries: DEFAULT_RETRIES,
            rechoose_limit: DEFAULT_RECHOOSE_LIMIT,
            network_size_limit: DEFAULT_NETWORK_SIZE_LIMIT,
            rng_seed: None,
        }
    }

    /// Sets the branch factor.
    #[must_use]
    pub const fn with_branch_factor(mut self, branch_factor: usize) -> Self {
        self.branch_factor = branch_factor;
        self
    }

    /// Sets the number of rounds.
    #[must_use]
    pub const fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    /// Sets the per-round redraw limit.
    #[must_use]
    pub const fn with_rechoose_limit(mut self, limit: usize) -> Self {
        self.rechoose_limit = limit;
        self
    }

    /// Sets the draw upper bound.
    #[must_use]
    pub const fn with_network_size_limit(mut self, limit: usize) -> Self {
        self.network_size_limit = limit;
        self
    }

    /// Fixes the RNG seed, making peer selection reproducible.
    #[must_use]
    pub const fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Validates the parameters.
    pub fn validate(&self) -> Result<()> {
        if self.branch_factor == 0 {
            return Err(FederationError::Config(
                "gossip.branch_factor must be greater than 0".to_string(),
            ));
        }
        if self.retries == 0 {
            return Err(FederationError::Config(
                "gossip.retries must be greater than 0".to_string(),
            ));
        }
        if self.rechoose_limit == 0 {
            return Err(FederationError::Config(
                "gossip.rechoose_limit must be greater than 0".to_string(),
            ));
        }
        if self.network_size_limit == 0 {
            return Err(FederationError::Config(
                "gossip.network_size_limit must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-peer delivery settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerConfig {
    /// Capacity of each peer's outbound queue.
    pub outbound_queue_capacity: usize,
    /// Upper bound on a single transport send.
    pub send_timeout: Duration,
    /// Upper bound on a single liveness probe.
    pub probe_timeout: Duration,
}

impl PeerConfig {
    /// Creates the default per-peer settings.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            outbound_queue_capacity: 64,
            send_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
        }
    }

    /// Sets the outbound queue capacity.
    #[must_use]
    pub const fn with_outbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.outbound_queue_capacity = capacity;
        self
    }

    /// Sets the send timeout.
    #[must_use]
    pub const fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Sets the probe timeout.
    #[must_use]
    pub const fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for a federation node's control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FederationConfig {
    /// This node's own service URL. Inbound events claiming it as their
    /// source are dropped, and it is stamped on outbound gossip.
    pub local_service_url: String,
    /// Path appended to a discovered hostname to form its service URL.
    pub service_path: String,
    /// Interval between liveness probe sweeps.
    pub probe_interval: Duration,
    /// Gossip parameters.
    pub gossip: GossipConfig,
    /// Per-peer delivery settings.
    pub peer: PeerConfig,
}

impl FederationConfig {
    /// Creates a configuration for a node reachable at `local_service_url`.
    #[must_use]
    pub fn new(local_service_url: impl Into<String>) -> Self {
        Self {
            local_service_url: local_service_url.into(),
            service_path: DEFAULT_SERVICE_PATH.to_string(),
            probe_interval: Duration::from_secs(5),
            gossip: GossipConfig::new(),
            peer: PeerConfig::new(),
        }
    }

    /// Sets the service path used when deriving peer URLs.
    #[must_use]
    pub fn with_service_path(mut self, path: impl Into<String>) -> Self {
        self.service_path = path.into();
        self
    }

    /// Sets the probe interval.
    #[must_use]
    pub const fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Sets the gossip parameters.
    #[must_use]
    pub const fn with_gossip(mut self, gossip: GossipConfig) -> Self {
        self.gossip = gossip;
        self
    }

    /// Sets the per-peer settings.
    #[must_use]
    pub const fn with_peer(mut self, peer: PeerConfig) -> Self {
        self.peer = peer;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.local_service_url.is_empty() {
            return Err(FederationError::Config(
                "local_service_url cannot be empty".to_string(),
            ));
        }
        url::Url::parse(&self.local_service_url).map_err(|e| {
            FederationError::Config(format!(
                "local_service_url '{}' is not a valid url: {e}",
                self.local_service_url
            ))
        })?;
        if !self.service_path.starts_with('/') {
            return Err(FederationError::Config(
                "service_path must start with '/'".to_string(),
            ));
        }
        if self.probe_interval.is_zero() {
            return Err(FederationError::Config(
                "probe_interval must be greater than 0".to_string(),
            ));
        }
        if self.peer.outbound_queue_capacity == 0 {
            return Err(FederationError::Config(
                "peer.outbound_queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.peer.send_timeout.is_zero() || self.peer.probe_timeout.is_zero() {
            return Err(FederationError::Config(
                "peer timeouts must be greater than 0".to_string(),
            ));
        }
        self.gossip.validate()
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self::new("https://localhost/esg-node/datanode")
    }
}
