//! Network capability used to reach a remote peer.

use std::collections::{HashMap, HashSet};

use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::error::{FederationError, Result};
use crate::event::RemoteEvent;
use crate::peer::{PeerIdentity, PeerStateKind};

/// Delivers events to, and probes, remote peers.
///
/// Implementations may block or fail; callers bound every call with a
/// timeout and translate failures into peer state changes rather than
/// propagating them.
pub trait PeerTransport: Send + Sync {
    /// Sends `event` to `peer`'s ingress endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer could not be reached.
    fn send<'a>(&'a self, peer: &'a PeerIdentity, event: RemoteEvent) -> BoxFuture<'a, Result<()>>;

    /// Checks whether `peer` is accepting events.
    fn probe<'a>(&'a self, peer: &'a PeerIdentity) -> BoxFuture<'a, PeerStateKind>;
}

/// In-process transport that records deliveries instead of using a network.
///
/// Peers marked unreachable fail every send and probe as
/// [`PeerStateKind::Failed`]; other probes answer with the configured outcome
/// (default [`PeerStateKind::Available`]).
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<(String, RemoteEvent)>>,
    probe_outcomes: Mutex<HashMap<String, PeerStateKind>>,
    unreachable: Mutex<HashSet<String>>,
}

impl MemoryTransport {
    /// Creates an empty transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets what probing the named peer reports.
    pub fn set_probe_outcome(&self, peer: impl Into<String>, outcome: PeerStateKind) {
        self.probe_outcomes.lock().insert(peer.into(), outcome);
    }

    /// Marks the named peer as unreachable (or reachable again).
    pub fn set_unreachable(&self, peer: impl Into<String>, unreachable: bool) {
        let peer = peer.into();
        let mut set = self.unreachable.lock();
        if unreachable {
            set.insert(peer);
        } else {
            set.remove(&peer);
        }
    }

    /// Returns every delivered `(peer name, event)` pair in delivery order.
    #[must_use]
    pub fn sent(&self) -> Vec<(String, RemoteEvent)> {
        self.sent.lock().clone()
    }

    /// Returns the events delivered to the named peer.
    #[must_use]
    pub fn sent_to(&self, peer: &str) -> Vec<RemoteEvent> {
        self.sent
            .lock()
            .iter()
            .filter(|(name, _)| name == peer)
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Returns the number of delivered events.
    #[must_use]
    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl PeerTransport for MemoryTransport {
    fn send<'a>(&'a self, peer: &'a PeerIdentity, event: RemoteEvent) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.unreachable.lock().contains(peer.name()) {
                return Err(FederationError::Transport(format!(
                    "{} is unreachable",
                    peer.name()
                )));
            }
            self.sent.lock().push((peer.name().to_string(), event));
            Ok(())
        })
    }

    fn probe<'a>(&'a self, peer: &'a PeerIdentity) -> BoxFuture<'a, PeerStateKind> {
        Box::pin(async move {
            if self.unreachable.lock().contains(peer.name()) {
                return PeerStateKind::Failed;
            }
            self.probe_outcomes
                .lock()
                .get(peer.name())
                .copied()
                .unwrap_or(PeerStateKind::Available)
        })
    }
}
