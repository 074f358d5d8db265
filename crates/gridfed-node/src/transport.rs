//! HTTP peer transport.
//!
//! Events are delivered as `POST <service url>/event` with a JSON body, and
//! liveness is checked with `GET <service url>/ping`, which answers a JSON
//! boolean.

use std::time::Duration;

use futures::future::BoxFuture;
use gridfed_core::{FederationError, PeerIdentity, PeerStateKind, PeerTransport, RemoteEvent};
use tracing::{debug, trace};

use crate::error::Result;

/// Path of the event endpoint below a service URL.
pub const EVENT_PATH: &str = "/event";

/// Path of the liveness endpoint below a service URL.
pub const PING_PATH: &str = "/ping";

/// Path of the membership status endpoint below a service URL.
pub const STATUS_PATH: &str = "/status";

/// Joins a service URL and an endpoint path.
#[must_use]
pub fn endpoint(service_url: &str, path: &str) -> String {
    format!("{}{path}", service_url.trim_end_matches('/'))
}

/// [`PeerTransport`] over HTTP using `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpPeerTransport {
    client: reqwest::Client,
}

impl HttpPeerTransport {
    /// Creates a transport whose requests are abandoned after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("gridfed-node/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// Probes a service URL directly, without a peer handle.
    pub async fn probe_url(&self, service_url: &str) -> PeerStateKind {
        let url = endpoint(service_url, PING_PATH);
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %url, error = %e, "probe failed");
                return PeerStateKind::Failed;
            }
        };

        let status = response.status();
        if status.is_server_error() {
            debug!(url = %url, status = %status, "peer busy");
            return PeerStateKind::Busy;
        }
        if !status.is_success() {
            debug!(url = %url, status = %status, "probe rejected");
            return PeerStateKind::Failed;
        }

        match response.json::<bool>().await {
            Ok(true) => PeerStateKind::Available,
            Ok(false) => PeerStateKind::Busy,
            Err(e) => {
                debug!(url = %url, error = %e, "unreadable probe response");
                PeerStateKind::Failed
            }
        }
    }

    /// Fetches a peer's membership status document.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the body is not JSON.
    pub async fn fetch_status(&self, service_url: &str) -> Result<serde_json::Value> {
        let url = endpoint(service_url, STATUS_PATH);
        let value = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(value)
    }
}

impl PeerTransport for HttpPeerTransport {
    fn send<'a>(
        &'a self,
        peer: &'a PeerIdentity,
        event: RemoteEvent,
    ) -> BoxFuture<'a, gridfed_core::Result<()>> {
        Box::pin(async move {
            let service_url = peer
                .service_url()
                .ok_or_else(|| FederationError::UnknownPeer(peer.name().to_string()))?;
            let url = endpoint(service_url, EVENT_PATH);
            trace!(url = %url, event = %event, "posting event");

            let response = self
                .client
                .post(&url)
                .json(&event)
                .send()
                .await
                .map_err(|e| FederationError::Transport(format!("{url}: {e}")))?;

            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(FederationError::Transport(format!("{url}: status {status}")))
            }
        })
    }

    fn probe<'a>(&'a self, peer: &'a PeerIdentity) -> BoxFuture<'a, PeerStateKind> {
        Box::pin(async move {
            match peer.service_url() {
                Some(url) => self.probe_url(url).await,
                None => PeerStateKind::Failed,
            }
        })
    }
}
