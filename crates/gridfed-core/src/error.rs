//! Error types for gridfed-core.

use thiserror::Error;

/// Errors that can occur inside the federation control plane.
///
/// These are produced by internal helpers and the transport seam. The public
/// membership and ingress operations log them and report plain booleans.
#[derive(Debug, Error)]
pub enum FederationError {
    /// A service URL could not be derived or parsed.
    #[error("invalid service url '{url}': {reason}")]
    InvalidServiceUrl {
        /// The offending URL text.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// No peer is known under the given name or address.
    #[error("peer not found: {0}")]
    UnknownPeer(String),

    /// The peer is known but currently unavailable.
    #[error("peer unavailable: {0}")]
    UnavailablePeer(String),

    /// The transport failed to deliver to the peer.
    #[error("transport error: {0}")]
    Transport(String),

    /// The transport did not complete within its bound.
    #[error("transport timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The peer's outbound queue is closed.
    #[error("outbound queue closed for peer {0}")]
    QueueClosed(String),

    /// The peer's outbound queue is full.
    #[error("outbound queue full for peer {0}")]
    QueueFull(String),

    /// Configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for federation operations.
pub type Result<T> = std::result::Result<T, FederationError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_invalid_service_url_display() {
        let err = FederationError::InvalidServiceUrl {
            url: "https://bad host/".to_string(),
            reason: "invalid domain character".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("bad host"));
        assert!(msg.contains("invalid domain character"));
    }

    #[test]
    fn test_unknown_peer_display() {
        let err = FederationError::UnknownPeer("http://x".to_string());
        assert_eq!(err.to_string(), "peer not found: http://x");
    }

    #[test]
    fn test_timeout_display() {
        let err = FederationError::Timeout(Duration::from_secs(3));
        assert_eq!(err.to_string(), "transport timed out after 3s");
    }

    #[test]
    fn test_queue_full_display() {
        let err = FederationError::QueueFull("b".to_string());
        assert!(err.to_string().contains("full"));
    }
}
