//! Process wiring for a federation node.
//!
//! Builds the event bus, peer membership and ingress dispatcher, registers
//! them as components, joins seed peers, and runs the background loops:
//! the membership inbox/probe loop, the ingress outbound queue, the HTTP
//! ingress server, and one logging consumer per internal channel.

use std::sync::Arc;

use gridfed_core::{
    Channel, Component, EventBus, IngressDispatcher, LocalEventBus, MembershipStatus, NodeEvent,
    PeerHandle, PeerIdentity, PeerMembership, PeerTransport, RegistryUpdateDigest,
    INGRESS_COMPONENT, MEMBERSHIP_COMPONENT,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::server::IngressServer;

/// Component name used when the node itself publishes registry updates.
pub const REGISTRY_COMPONENT: &str = "REGISTRY_SVC";

/// A wired, not yet running, federation node.
pub struct FederationNode {
    config: NodeConfig,
    bus: Arc<LocalEventBus>,
    membership: Arc<PeerMembership>,
    ingress: Arc<IngressDispatcher>,
    consumers: Vec<(Channel, mpsc::UnboundedReceiver<NodeEvent>)>,
}

impl std::fmt::Debug for FederationNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederationNode")
            .field("name", &self.config.name)
            .field("service_url", &self.config.service_url)
            .finish_non_exhaustive()
    }
}

impl FederationNode {
    /// Validates `config` and wires the control plane on top of `transport`.
    ///
    /// Seed peers are joined immediately, so this must be called from within
    /// a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: NodeConfig, transport: Arc<dyn PeerTransport>) -> Result<Self> {
        config.validate()?;
        let federation = config.federation_config();

        let bus = Arc::new(LocalEventBus::new());
        let consumers = Channel::ALL
            .into_iter()
            .map(|channel| (channel, bus.subscribe(channel)))
            .collect();

        let membership = PeerMembership::new(
            federation.clone(),
            Arc::clone(&bus) as Arc<dyn EventBus>,
            Arc::clone(&transport),
        );
        let ingress = IngressDispatcher::new(
            config.service_url.clone(),
            Arc::clone(&bus) as Arc<dyn EventBus>,
        );

        bus.register_component(Component::Membership(Arc::clone(&membership)));
        bus.register_component(Component::Ingress(Arc::clone(&ingress)));

        for seed in &config.seed_peers {
            let name = seed
                .name
                .clone()
                .unwrap_or_else(|| seed.service_url.clone());
            let handle = PeerHandle::spawn(
                PeerIdentity::new(name, Some(seed.service_url.clone())),
                Arc::clone(&transport),
                &federation.peer,
            );
            bus.register_component(Component::Peer(handle));
        }

        bus.broadcast_all_loaded();
        info!(
            name = %config.name,
            service_url = %config.service_url,
            seeds = config.seed_peers.len(),
            "federation node wired"
        );

        Ok(Self {
            config,
            bus,
            membership,
            ingress,
            consumers,
        })
    }

    /// The node configuration.
    #[must_use]
    pub const fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The event bus.
    #[must_use]
    pub fn bus(&self) -> Arc<LocalEventBus> {
        Arc::clone(&self.bus)
    }

    /// The peer membership manager.
    #[must_use]
    pub fn membership(&self) -> Arc<PeerMembership> {
        Arc::clone(&self.membership)
    }

    /// The ingress dispatcher.
    #[must_use]
    pub fn ingress(&self) -> Arc<IngressDispatcher> {
        Arc::clone(&self.ingress)
    }

    /// Current membership status.
    #[must_use]
    pub fn status(&self) -> MembershipStatus {
        self.membership.status()
    }

    /// Queues a local event for the membership: registry updates trigger
    /// discovery and gossip, remote events are routed to the peer they name.
    pub fn submit(&self, event: NodeEvent) -> bool {
        self.ingress.submit(event)
    }

    /// Queues a registry update from the registry subsystem.
    pub fn publish_registry_update(&self, digest: RegistryUpdateDigest) -> bool {
        self.submit(NodeEvent::registry_update(REGISTRY_COMPONENT, digest))
    }

    /// Binds the ingress server on the configured address.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(&self) -> Result<IngressServer> {
        IngressServer::bind(self.config.listen_addr, self.config.base_path()).await
    }

    /// Runs the node on an already bound server until `shutdown` flips to
    /// true, then stops every loop and forgets all peers.
    ///
    /// # Errors
    ///
    /// Returns an error if the ingress server fails.
    pub async fn run_with(
        self,
        server: IngressServer,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        for (channel, receiver) in self.consumers {
            tasks.push(tokio::spawn(log_channel(channel, receiver, shutdown.clone())));
        }

        let membership_task = tokio::spawn(Arc::clone(&self.membership).run(shutdown.clone()));
        tasks.push(tokio::spawn(Arc::clone(&self.ingress).run(shutdown.clone())));

        let served = server
            .serve(Arc::clone(&self.ingress), Arc::clone(&self.membership), shutdown)
            .await;

        if let Err(e) = membership_task.await {
            warn!(error = %e, "membership loop panicked");
        }
        for task in tasks {
            task.abort();
        }
        self.bus.unregister_component(INGRESS_COMPONENT);
        self.bus.unregister_component(MEMBERSHIP_COMPONENT);
        info!(name = %self.config.name, "federation node stopped");
        served
    }

    /// Binds the configured address and runs until `shutdown` flips to true.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound or the server fails.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let server = self.bind().await.map_err(|e| {
            NodeError::Server(format!("failed to bind {}: {e}", self.config.listen_addr))
        })?;
        self.run_with(server, shutdown).await
    }
}

/// Stand-in for the subsystem that owns `channel`: logs each event.
async fn log_channel(
    channel: Channel,
    mut receiver: mpsc::UnboundedReceiver<NodeEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = receiver.recv() => {
                let Some(event) = event else { break };
                match event.remote_event() {
                    Some(remote) => info!(
                        channel = %channel,
                        source = %remote.source(),
                        kind = %remote.message_type(),
                        seq = remote.sequence_number(),
                        "channel event"
                    ),
                    None => debug!(channel = %channel, origin = %event.origin(), "channel event"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!(channel = %channel, "channel consumer stopped");
}
