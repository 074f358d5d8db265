//! End-to-end scenarios for the federation control plane.
//!
//! These tests verify:
//! 1. Peers join distrusted and become available on a positive signal
//! 2. Registry digests discover new nodes and gossip across the full roster
//! 3. Ingress routes each message type to exactly one channel
//! 4. Two nodes wired through an in-memory network exchange gossip

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use gridfed_core::{
    Channel, Component, Disposition, EventBus, FederationConfig, GossipConfig, IngressDispatcher,
    JoinListener, LocalEventBus, MemoryTransport, MessageType, NodeDescriptor, NodeEvent,
    PeerHandle, PeerIdentity, PeerMembership, PeerStateKind, PeerTransport, RegistryUpdateDigest,
    RemoteEvent, MEMBERSHIP_COMPONENT,
};
use parking_lot::Mutex;

/// Event bus double that records every enqueue and delegates lifecycle
/// handling to a [`LocalEventBus`].
#[derive(Default)]
struct RecordingBus {
    inner: LocalEventBus,
    enqueued: Mutex<Vec<(Channel, NodeEvent)>>,
}

impl RecordingBus {
    fn enqueued_on(&self, channel: Channel) -> usize {
        self.enqueued
            .lock()
            .iter()
            .filter(|(c, _)| *c == channel)
            .count()
    }

    fn total(&self) -> usize {
        self.enqueued.lock().len()
    }
}

impl EventBus for RecordingBus {
    fn enqueue(&self, channel: Channel, event: NodeEvent) {
        self.enqueued.lock().push((channel, event.clone()));
        self.inner.enqueue(channel, event);
    }

    fn broadcast_join(&self, component: &Component, has_joined: bool) {
        self.inner.broadcast_join(component, has_joined);
    }

    fn register_component(&self, component: Component) {
        self.inner.register_component(component);
    }

    fn unregister_component(&self, name: &str) {
        self.inner.unregister_component(name);
    }

    fn component(&self, name: &str) -> Option<Component> {
        self.inner.component(name)
    }

    fn add_listener(&self, listener: Weak<dyn JoinListener>) {
        self.inner.add_listener(listener);
    }
}

struct Node {
    bus: Arc<RecordingBus>,
    transport: Arc<MemoryTransport>,
    membership: Arc<PeerMembership>,
    ingress: Arc<IngressDispatcher>,
}

impl Node {
    fn new(url: &str) -> Self {
        let bus = Arc::new(RecordingBus::default());
        let transport = Arc::new(MemoryTransport::new());
        let config =
            FederationConfig::new(url).with_gossip(GossipConfig::new().with_rng_seed(1234));
        let membership = PeerMembership::new(
            config,
            Arc::clone(&bus) as Arc<dyn EventBus>,
            Arc::clone(&transport) as Arc<dyn PeerTransport>,
        );
        let ingress = IngressDispatcher::new(url, Arc::clone(&bus) as Arc<dyn EventBus>);
        bus.register_component(Component::Membership(Arc::clone(&membership)));
        bus.inner.broadcast_all_loaded();
        Self {
            bus,
            transport,
            membership,
            ingress,
        }
    }

    fn join(&self, url: &str) -> Arc<PeerHandle> {
        let handle = PeerHandle::spawn(
            PeerIdentity::from_service_url(url),
            Arc::clone(&self.transport) as Arc<dyn PeerTransport>,
            &self.membership.config().peer,
        );
        self.bus
            .register_component(Component::Peer(Arc::clone(&handle)));
        handle
    }

    fn counts(&self) -> (usize, usize) {
        (
            self.membership.available_peer_count(),
            self.membership.unavailable_peer_count(),
        )
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

// ============================================================================
// Membership Scenarios
// ============================================================================

#[tokio::test]
async fn test_peer_joins_unavailable_then_becomes_available() {
    let a = Node::new("http://a");
    assert_eq!(a.counts(), (0, 0));
    assert!(a.ingress.is_bound());

    let b = a.join("http://b");
    assert_eq!(a.counts(), (0, 1));
    assert!(!a.membership.is_federation_reachable());
    assert!(!a.ingress.ping());

    b.signal(PeerStateKind::Available);
    a.membership.drain_inbox();

    assert_eq!(a.counts(), (1, 0));
    assert!(a.membership.is_federation_reachable());
    assert!(a.ingress.ping());
}

#[tokio::test]
async fn test_peer_leave_removes_from_both_collections() {
    let a = Node::new("http://a");
    let b = a.join("http://b");
    a.join("http://c");
    b.signal(PeerStateKind::Available);
    a.membership.drain_inbox();

    a.bus.unregister_component("http://b");
    a.bus.unregister_component("http://c");
    a.bus.unregister_component("http://c");

    assert_eq!(a.counts(), (0, 0));
    assert!(!a.membership.is_federation_reachable());
}

#[tokio::test]
async fn test_unreachable_peer_self_heals_to_unavailable() {
    let a = Node::new("http://a");
    let b = a.join("http://b");
    b.signal(PeerStateKind::Available);
    a.membership.drain_inbox();
    a.transport.set_unreachable("http://b", true);

    assert!(a.membership.route_outbound(&NodeEvent::remote(
        "test",
        RemoteEvent::new("http://b", MessageType::Health, None, "", 1, 0),
    )));

    wait_until(|| {
        a.membership.drain_inbox();
        a.counts() == (0, 1)
    })
    .await;
}

// ============================================================================
// Gossip Scenarios
// ============================================================================

#[tokio::test]
async fn test_digest_discovers_new_node_and_gossips_over_full_roster() {
    let a = Node::new("http://a");
    for url in ["http://b", "http://c"] {
        let peer = a.join(url);
        peer.signal(PeerStateKind::Available);
    }
    a.membership.drain_inbox();
    assert_eq!(a.counts(), (2, 0));

    let digest = RegistryUpdateDigest::new(
        vec![NodeDescriptor::new("d.example.org", "d", "10.0.0.4")],
        "<registration/>",
        "c0ffee",
    );
    assert!(a.membership.on_registry_updated(&digest));

    let d = "https://d.example.org/esg-node/datanode";
    assert_eq!(a.counts(), (2, 1));
    assert!(a.membership.is_known(d));

    let roster: Vec<_> = a
        .membership
        .roster()
        .iter()
        .map(|h| h.name().to_string())
        .collect();
    assert_eq!(roster, vec!["http://b", "http://c", d]);

    wait_until(|| a.transport.sent_count() >= 2).await;
    let sent = a.transport.sent();
    assert_eq!(sent.len(), 2);
    assert_ne!(sent[0].0, sent[1].0);
    for (peer, event) in &sent {
        assert!(roster.contains(peer));
        assert_eq!(event.message_type(), MessageType::Register);
        assert_eq!(event.payload(), Some("<registration/>"));
        assert_eq!(event.checksum(), "c0ffee");
        assert_eq!(event.time_to_live(), 0);
        assert_eq!(event.source(), "http://a");
    }
}

#[tokio::test]
async fn test_unavailable_peer_is_eligible_for_gossip() {
    let a = Node::new("http://a");
    a.join("http://d");
    assert_eq!(a.counts(), (0, 1));

    let digest = RegistryUpdateDigest::new(vec![], "<registration/>", "sum");
    assert!(a.membership.dispatch_gossip(&digest));

    wait_until(|| a.transport.sent_count() == 1).await;
    assert_eq!(a.transport.sent_to("http://d").len(), 1);
}

#[tokio::test]
async fn test_gossip_with_single_peer_terminates() {
    let a = Node::new("http://a");
    a.join("http://b");

    let digest = RegistryUpdateDigest::new(vec![], "<registration/>", "sum");
    for _ in 0..10 {
        assert!(a.membership.dispatch_gossip(&digest));
    }

    wait_until(|| a.transport.sent_count() == 10).await;
}

// ============================================================================
// Ingress Scenarios
// ============================================================================

#[tokio::test]
async fn test_health_and_metrics_never_reach_registry() {
    let a = Node::new("http://a");

    let health = RemoteEvent::new("http://b", MessageType::Health, Some("up".into()), "", 1, 0);
    let metrics = RemoteEvent::new("http://b", MessageType::Metrics, Some("cpu".into()), "", 2, 0);

    assert_eq!(
        a.ingress.handle_inbound(health),
        Disposition::Enqueued(Channel::Monitor)
    );
    assert_eq!(
        a.ingress.handle_inbound(metrics),
        Disposition::Enqueued(Channel::Metrics)
    );

    assert_eq!(a.bus.enqueued_on(Channel::Monitor), 1);
    assert_eq!(a.bus.enqueued_on(Channel::Metrics), 1);
    assert_eq!(a.bus.enqueued_on(Channel::Registry), 0);
}

#[tokio::test]
async fn test_self_sourced_and_payloadless_register_are_never_enqueued() {
    let a = Node::new("http://a");

    a.ingress.handle_inbound(RemoteEvent::new(
        "http://A",
        MessageType::Register,
        Some("<doc/>".into()),
        "",
        1,
        0,
    ));
    a.ingress
        .handle_inbound(RemoteEvent::new("http://b", MessageType::Register, None, "", 2, 0));
    assert_eq!(a.bus.total(), 0);

    a.ingress.handle_inbound(RemoteEvent::new(
        "http://b",
        MessageType::Register,
        Some("<doc/>".into()),
        "",
        3,
        0,
    ));
    assert_eq!(a.bus.enqueued_on(Channel::Registry), 1);
    assert_eq!(a.bus.total(), 1);
}

#[tokio::test]
async fn test_leaving_membership_makes_ingress_unreachable() {
    let a = Node::new("http://a");
    let b = a.join("http://b");
    b.signal(PeerStateKind::Available);
    a.membership.drain_inbox();
    assert!(a.ingress.ping());

    a.bus.unregister_component(MEMBERSHIP_COMPONENT);
    assert!(!a.ingress.ping());
}

// ============================================================================
// Two-Node Exchange
// ============================================================================

/// Transport that hands events straight to the target node's ingress.
struct LoopbackTransport {
    nodes: Mutex<Vec<(String, Arc<IngressDispatcher>)>>,
}

impl PeerTransport for LoopbackTransport {
    fn send<'a>(
        &'a self,
        peer: &'a PeerIdentity,
        event: RemoteEvent,
    ) -> BoxFuture<'a, gridfed_core::Result<()>> {
        Box::pin(async move {
            let target = self
                .nodes
                .lock()
                .iter()
                .find(|(url, _)| peer.matches_address(url))
                .map(|(_, ingress)| Arc::clone(ingress));
            match target {
                Some(ingress) => {
                    ingress.handle_inbound(event);
                    Ok(())
                }
                None => Err(gridfed_core::FederationError::UnknownPeer(
                    peer.name().to_string(),
                )),
            }
        })
    }

    fn probe<'a>(&'a self, _peer: &'a PeerIdentity) -> BoxFuture<'a, PeerStateKind> {
        Box::pin(async { PeerStateKind::Available })
    }
}

#[tokio::test]
async fn test_gossip_arrives_on_remote_registry_channel() {
    let network = Arc::new(LoopbackTransport {
        nodes: Mutex::new(Vec::new()),
    });

    let b_bus = Arc::new(LocalEventBus::new());
    let mut b_registry = b_bus.subscribe(Channel::Registry);
    let b_ingress = IngressDispatcher::new("http://b", Arc::clone(&b_bus) as Arc<dyn EventBus>);
    network
        .nodes
        .lock()
        .push(("http://b".to_string(), Arc::clone(&b_ingress)));

    let a_bus = Arc::new(LocalEventBus::new());
    let a = PeerMembership::new(
        FederationConfig::new("http://a"),
        Arc::clone(&a_bus) as Arc<dyn EventBus>,
        Arc::clone(&network) as Arc<dyn PeerTransport>,
    );
    let handle = PeerHandle::spawn(
        PeerIdentity::from_service_url("http://b"),
        Arc::clone(&network) as Arc<dyn PeerTransport>,
        &a.config().peer,
    );
    a_bus.register_component(Component::Peer(handle));

    let digest = RegistryUpdateDigest::new(vec![], "<registration/>", "sum");
    assert!(a.dispatch_gossip(&digest));

    let received = tokio::time::timeout(Duration::from_secs(5), b_registry.recv())
        .await
        .expect("gossip in time")
        .expect("channel open");
    let remote = received.remote_event().expect("remote event");
    assert_eq!(remote.source(), "http://a");
    assert_eq!(remote.payload(), Some("<registration/>"));

    // The successful delivery marks b available on a.
    wait_until(|| {
        a.drain_inbox();
        a.available_peer_count() == 1
    })
    .await;
}
