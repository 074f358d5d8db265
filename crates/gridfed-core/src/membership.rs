//! Peer membership management.
//!
//! [`PeerMembership`] owns the two disjoint peer collections. A peer name is
//! in at most one of them at any time; every insert, remove and transfer
//! happens under a single lock covering both.
//!
//! Peers enter through join notifications on the event bus and always start
//! unavailable. Connectivity signals from their handles arrive through the
//! membership inbox and move them between the collections.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::bus::{Component, EventBus, JoinListener};
use crate::config::FederationConfig;
use crate::error::{FederationError, Result};
use crate::event::{EventData, NodeDescriptor, NodeEvent, RegistryUpdateDigest};
use crate::gossip::GossipDispatcher;
use crate::peer::{
    same_url, Availability, PeerHandle, PeerIdentity, PeerInbox, PeerStateChange, PeerStateKind,
};
use crate::transport::PeerTransport;

/// Name the membership manager registers under on the event bus.
pub const MEMBERSHIP_COMPONENT: &str = "CONN_MGR";

#[derive(Debug, Default)]
struct PeerSets {
    available: HashMap<String, Arc<PeerHandle>>,
    unavailable: HashMap<String, Arc<PeerHandle>>,
}

impl PeerSets {
    fn contains(&self, name: &str) -> bool {
        self.available.contains_key(name) || self.unavailable.contains_key(name)
    }

    fn handles(&self) -> impl Iterator<Item = &Arc<PeerHandle>> {
        self.available.values().chain(self.unavailable.values())
    }
}

/// Point-in-time view of one known peer.
#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    /// Peer name.
    pub name: String,
    /// Peer service URL.
    pub service_url: Option<String>,
    /// Which collection the peer is in.
    pub availability: Availability,
    /// When the peer's handle last changed availability.
    pub last_state_change: DateTime<Utc>,
}

/// Point-in-time view of the membership.
#[derive(Debug, Clone, Serialize)]
pub struct MembershipStatus {
    /// Number of available peers.
    pub available: usize,
    /// Number of unavailable peers.
    pub unavailable: usize,
    /// Whether the federation is currently reachable.
    pub reachable: bool,
    /// Every known peer, sorted by name.
    pub peers: Vec<PeerStatus>,
}

/// Owns the available and unavailable peer collections.
pub struct PeerMembership {
    config: FederationConfig,
    peers: RwLock<PeerSets>,
    bus: Arc<dyn EventBus>,
    transport: Arc<dyn PeerTransport>,
    gossip: GossipDispatcher,
    inbox: PeerInbox,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerStateChange>>>,
}

impl std::fmt::Debug for PeerMembership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let peers = self.peers.read();
        f.debug_struct("PeerMembership")
            .field("local_service_url", &self.config.local_service_url)
            .field("available", &peers.available.len())
            .field("unavailable", &peers.unavailable.len())
            .finish_non_exhaustive()
    }
}

impl PeerMembership {
    /// Creates the membership manager and subscribes it to `bus` lifecycle
    /// events.
    #[must_use]
    pub fn new(
        config: FederationConfig,
        bus: Arc<dyn EventBus>,
        transport: Arc<dyn PeerTransport>,
    ) -> Arc<Self> {
        let (inbox, receiver) = PeerInbox::channel();
        let gossip = GossipDispatcher::new(config.gossip, config.local_service_url.clone());
        let membership = Arc::new(Self {
            config,
            peers: RwLock::new(PeerSets::default()),
            bus,
            transport,
            gossip,
            inbox,
            inbox_rx: Mutex::new(Some(receiver)),
        });

        let listener: Weak<dyn JoinListener> = Arc::downgrade(&membership) as Weak<dyn JoinListener>;
        membership.bus.add_listener(listener);
        membership
    }

    /// The configuration in use.
    #[must_use]
    pub const fn config(&self) -> &FederationConfig {
        &self.config
    }

    /// Number of available peers.
    #[must_use]
    pub fn available_peer_count(&self) -> usize {
        self.peers.read().available.len()
    }

    /// Number of unavailable peers.
    #[must_use]
    pub fn unavailable_peer_count(&self) -> usize {
        self.peers.read().unavailable.len()
    }

    /// True iff at least one peer in the available collection reports
    /// itself available.
    #[must_use]
    pub fn is_federation_reachable(&self) -> bool {
        self.peers
            .read()
            .available
            .values()
            .any(|peer| peer.is_available())
    }

    /// Returns true if `name` is in either collection.
    #[must_use]
    pub fn is_known(&self, name: &str) -> bool {
        self.peers.read().contains(name)
    }

    /// Every known peer handle, sorted by name.
    ///
    /// This is the full roster gossip draws from, regardless of availability.
    #[must_use]
    pub fn roster(&self) -> Vec<Arc<PeerHandle>> {
        let mut roster: Vec<_> = self.peers.read().handles().cloned().collect();
        roster.sort_by(|a, b| a.name().cmp(b.name()));
        roster
    }

    /// Current counts and per-peer state.
    #[must_use]
    pub fn status(&self) -> MembershipStatus {
        let peers = self.peers.read();
        let describe = |handle: &Arc<PeerHandle>, availability| PeerStatus {
            name: handle.name().to_string(),
            service_url: handle.service_url().map(str::to_string),
            availability,
            last_state_change: handle.last_state_change(),
        };

        let mut listed: Vec<_> = peers
            .available
            .values()
            .map(|h| describe(h, Availability::Available))
            .chain(
                peers
                    .unavailable
                    .values()
                    .map(|h| describe(h, Availability::Unavailable)),
            )
            .collect();
        listed.sort_by(|a, b| a.name.cmp(&b.name));

        MembershipStatus {
            available: peers.available.len(),
            unavailable: peers.unavailable.len(),
            reachable: peers.available.values().any(|peer| peer.is_available()),
            peers: listed,
        }
    }

    // ========== Join / Leave ==========

    fn peer_joined(&self, handle: &Arc<PeerHandle>) {
        if handle.service_url().is_none() {
            warn!(peer = %handle.name(), "dropping peer join without a service url");
            return;
        }

        let replaced = {
            let mut peers = self.peers.write();
            let name = handle.name().to_string();
            let previous = peers
                .available
                .remove(&name)
                .or_else(|| peers.unavailable.remove(&name));
            handle.reset_unavailable();
            handle.add_state_listener(self.inbox.clone());
            peers.unavailable.insert(name, Arc::clone(handle));
            previous
        };

        if let Some(previous) = replaced {
            if !Arc::ptr_eq(&previous, handle) {
                previous.remove_state_listener();
            }
            debug!(peer = %handle.name(), "peer re-joined, reset to unavailable");
        } else {
            info!(peer = %handle.name(), "peer joined");
        }
        trace!(
            available = self.available_peer_count(),
            unavailable = self.unavailable_peer_count(),
            "membership updated"
        );
    }

    fn peer_left(&self, name: &str) {
        let removed = {
            let mut peers = self.peers.write();
            let from_available = peers.available.remove(name);
            let from_unavailable = peers.unavailable.remove(name);
            from_available.or(from_unavailable)
        };

        match removed {
            Some(handle) => {
                handle.remove_state_listener();
                info!(peer = %name, "peer left");
            }
            None => trace!(peer = %name, "leave for unknown peer ignored"),
        }
    }

    // ========== State Changes ==========

    /// Moves a peer between collections in response to a connectivity
    /// signal. Signals for peers not in the source collection are ignored.
    pub fn on_peer_state_change(&self, change: &PeerStateChange) {
        let name = change.peer.name();
        let moved = {
            let mut guard = self.peers.write();
            let peers = &mut *guard;
            let (from, to) = match change.kind {
                PeerStateKind::Failed | PeerStateKind::Busy => {
                    (&mut peers.available, &mut peers.unavailable)
                }
                PeerStateKind::Available => (&mut peers.unavailable, &mut peers.available),
            };
            match from.remove(name) {
                Some(handle) => {
                    to.insert(name.to_string(), handle);
                    true
                }
                None => false,
            }
        };

        if moved {
            info!(
                peer = %name,
                kind = ?change.kind,
                now = ?change.kind.availability(),
                "peer changed collections"
            );
        } else {
            trace!(peer = %name, kind = ?change.kind, "no status change");
        }
    }

    /// Processes every state change already waiting in the inbox.
    ///
    /// Returns the number processed. Does nothing once [`run`](Self::run)
    /// has taken the inbox.
    pub fn drain_inbox(&self) -> usize {
        let mut guard = self.inbox_rx.lock();
        let Some(receiver) = guard.as_mut() else {
            return 0;
        };
        let mut changes = Vec::new();
        while let Ok(change) = receiver.try_recv() {
            changes.push(change);
        }
        drop(guard);

        for change in &changes {
            self.on_peer_state_change(change);
        }
        changes.len()
    }

    // ========== Registry Updates ==========

    /// Joins every newly listed node, then gossips the digest.
    ///
    /// Nodes whose service URL cannot be derived are logged and skipped.
    /// Returns the gossip dispatch status, which is always true.
    pub fn on_registry_updated(&self, digest: &RegistryUpdateDigest) -> bool {
        for node in digest.updated_nodes() {
            let url = match self.derive_service_url(node) {
                Ok(url) => url,
                Err(e) => {
                    warn!(host = %node.hostname, error = %e, "skipping node with malformed service url");
                    continue;
                }
            };

            if same_url(&url, &self.config.local_service_url) {
                trace!(url = %url, "skipping self in registry update");
                continue;
            }
            if self.resolve(&url).is_some() {
                continue;
            }

            info!(peer = %url, host = %node.hostname, "discovered new peer");
            let handle = PeerHandle::spawn(
                PeerIdentity::from_service_url(url),
                Arc::clone(&self.transport),
                &self.config.peer,
            );
            self.bus.register_component(Component::Peer(handle));
        }

        self.dispatch_gossip(digest)
    }

    /// Sends `digest` to peers drawn from the full roster.
    pub fn dispatch_gossip(&self, digest: &RegistryUpdateDigest) -> bool {
        let roster = self.roster();
        self.gossip.dispatch(&roster, digest)
    }

    /// Derives the service URL for a registry node.
    ///
    /// An explicit endpoint wins; otherwise the URL is built from the
    /// hostname and the configured service path.
    ///
    /// # Errors
    ///
    /// Returns [`FederationError::InvalidServiceUrl`] if the result is not an
    /// absolute http(s) URL with a host.
    pub fn derive_service_url(&self, node: &NodeDescriptor) -> Result<String> {
        let candidate = match &node.service_endpoint {
            Some(endpoint) => endpoint.clone(),
            None if node.hostname.trim().is_empty() => {
                return Err(FederationError::InvalidServiceUrl {
                    url: String::new(),
                    reason: "empty hostname".to_string(),
                });
            }
            None => format!("https://{}{}", node.hostname, self.config.service_path),
        };

        let invalid = |reason: String| FederationError::InvalidServiceUrl {
            url: candidate.clone(),
            reason,
        };
        let parsed = url::Url::parse(&candidate).map_err(|e| invalid(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme '{}'", parsed.scheme())));
        }
        if parsed.host_str().is_none_or(str::is_empty) {
            return Err(invalid("missing host".to_string()));
        }
        Ok(candidate)
    }

    // ========== Outbound Routing ==========

    /// Looks a peer up by name or service URL in either collection.
    fn resolve(&self, address: &str) -> Option<(Arc<PeerHandle>, Availability)> {
        let peers = self.peers.read();
        let find = |set: &HashMap<String, Arc<PeerHandle>>| {
            set.get(address)
                .or_else(|| set.values().find(|h| h.identity().matches_address(address)))
                .cloned()
        };
        find(&peers.available)
            .map(|h| (h, Availability::Available))
            .or_else(|| find(&peers.unavailable).map(|h| (h, Availability::Unavailable)))
    }

    /// Resolves the peer an outbound event names, which must be available.
    fn resolve_target(&self, address: &str) -> Result<Arc<PeerHandle>> {
        match self.resolve(address) {
            Some((handle, Availability::Available)) => Ok(handle),
            Some((handle, Availability::Unavailable)) => {
                Err(FederationError::UnavailablePeer(handle.name().to_string()))
            }
            None => Err(FederationError::UnknownPeer(address.to_string())),
        }
    }

    /// Sends the event's remote payload to the peer it names.
    ///
    /// Only an available peer accepts delivery. Returns false when the event
    /// carries no remote event or the target is unknown or unavailable.
    pub fn route_outbound(&self, event: &NodeEvent) -> bool {
        let Some(remote) = event.remote_event() else {
            warn!(origin = %event.origin(), "event carries no remote event for outbound routing [event dropped]");
            return false;
        };

        let target = remote.source();
        match self.resolve_target(target) {
            Ok(handle) => {
                let proxied = remote.proxied_outbound(&self.config.local_service_url);
                debug!(peer = %handle.name(), event = %proxied, "routing outbound");
                handle.send(proxied);
                true
            }
            Err(e @ FederationError::UnavailablePeer(_)) => {
                warn!(error = %e, "cannot route outbound [event dropped]");
                false
            }
            Err(e) => {
                error!(error = %e, "cannot route outbound [event dropped]");
                false
            }
        }
    }

    /// Handles an event delivered from a bus channel.
    ///
    /// Registry updates trigger discovery and gossip; anything else is
    /// routed outbound.
    pub fn handle_queued_event(&self, event: &NodeEvent) -> bool {
        trace!(origin = %event.origin(), "queued event received");
        match event.data() {
            Some(EventData::RegistryUpdate(digest)) => self.on_registry_updated(digest),
            None => self.route_outbound(event),
        }
    }

    // ========== Background Work ==========

    /// Probes every known peer. Results arrive through the inbox.
    ///
    /// Must be called from within a tokio runtime.
    pub fn probe_all(&self) {
        let roster = self.roster();
        trace!(peers = roster.len(), "probing peers");
        for handle in roster {
            tokio::spawn(async move {
                handle.probe().await;
            });
        }
    }

    /// Drains the inbox and probes peers every `probe_interval` until
    /// `shutdown` flips to true, then shuts the membership down.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let receiver = self.inbox_rx.lock().take();
        let Some(mut inbox) = receiver else {
            warn!("membership loop already running");
            return;
        };

        let mut ticker = tokio::time::interval(self.config.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(probe_interval = ?self.config.probe_interval, "membership loop started");

        loop {
            tokio::select! {
                Some(change) = inbox.recv() => self.on_peer_state_change(&change),
                _ = ticker.tick() => self.probe_all(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("membership loop stopping");
        self.shutdown();
    }

    /// Forgets every peer and detaches the inbox. Idempotent.
    ///
    /// Each removed peer is unregistered from the bus, which closes its
    /// outbound queue once the last reference is gone.
    pub fn shutdown(&self) {
        let handles: Vec<_> = {
            let mut guard = self.peers.write();
            let peers = &mut *guard;
            peers
                .available
                .drain()
                .chain(peers.unavailable.drain())
                .map(|(_, handle)| handle)
                .collect()
        };
        self.inbox_rx.lock().take();

        if handles.is_empty() {
            return;
        }
        info!(peers = handles.len(), "shutting down peer membership");
        for handle in handles {
            handle.remove_state_listener();
            self.bus.unregister_component(handle.name());
        }
    }
}

impl JoinListener for PeerMembership {
    fn on_join(&self, component: &Component, has_joined: bool) {
        let Component::Peer(handle) = component else {
            return;
        };
        if has_joined {
            self.peer_joined(handle);
        } else {
            self.peer_left(handle.name());
        }
    }
}
