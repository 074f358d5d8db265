//! Entry point for events arriving from remote peers.
//!
//! [`IngressDispatcher::handle_inbound`] validates each [`RemoteEvent`],
//! classifies it by message type and enqueues it on the matching internal
//! channel. Nothing is reported back to the remote caller; the returned
//! [`Disposition`] exists for the local caller and for tests.
//!
//! The dispatcher also owns the node's outbound event queue. Local
//! subsystems [`submit`](IngressDispatcher::submit) events to it, and while a
//! membership manager is bound each queued event is handed to
//! [`PeerMembership::handle_queued_event`].

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::bus::{Component, EventBus, JoinListener};
use crate::event::{Channel, MessageType, NodeEvent, RemoteEvent};
use crate::membership::{PeerMembership, MEMBERSHIP_COMPONENT};
use crate::peer::same_url;

/// Name the ingress dispatcher registers under on the event bus.
pub const INGRESS_COMPONENT: &str = "DNODE_SVC";

/// Why an inbound event was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The event claims to come from this node.
    SelfSourced,
    /// A register event arrived without a payload.
    MissingPayload,
    /// The message type code is not known.
    Unrecognized(u8),
}

/// What ingress did with an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Enqueued on the given channel.
    Enqueued(Channel),
    /// Logged without being dispatched anywhere.
    Logged(MessageType),
    /// Dropped.
    Dropped(DropReason),
}

/// Routes inbound remote events onto internal channels.
pub struct IngressDispatcher {
    local_service_url: String,
    bus: Arc<dyn EventBus>,
    membership: RwLock<Option<Arc<PeerMembership>>>,
    outbound_tx: mpsc::UnboundedSender<NodeEvent>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<NodeEvent>>>,
}

impl std::fmt::Debug for IngressDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngressDispatcher")
            .field("local_service_url", &self.local_service_url)
            .field("bound", &self.is_bound())
            .finish_non_exhaustive()
    }
}

impl IngressDispatcher {
    /// Creates a dispatcher for the node at `local_service_url` and
    /// subscribes it to `bus` lifecycle events.
    #[must_use]
    pub fn new(local_service_url: impl Into<String>, bus: Arc<dyn EventBus>) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Self {
            local_service_url: local_service_url.into(),
            bus,
            membership: RwLock::new(None),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
        });
        let listener: Weak<dyn JoinListener> = Arc::downgrade(&dispatcher) as Weak<dyn JoinListener>;
        dispatcher.bus.add_listener(listener);
        dispatcher
    }

    /// This node's service URL.
    #[must_use]
    pub fn local_service_url(&self) -> &str {
        &self.local_service_url
    }

    /// Binds the membership manager used for reachability. Idempotent.
    pub fn bind_membership(&self, membership: &Arc<PeerMembership>) {
        let mut bound = self.membership.write();
        if bound
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, membership))
        {
            return;
        }
        *bound = Some(Arc::clone(membership));
        drop(bound);
        info!("ingress bound to peer membership");
    }

    /// Forgets the bound membership manager.
    pub fn unbind_membership(&self) {
        if self.membership.write().take().is_some() {
            info!("ingress unbound from peer membership");
        }
    }

    /// Returns true once a membership manager is bound.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.membership.read().is_some()
    }

    /// Reports whether the federation is reachable. False until bound.
    #[must_use]
    pub fn ping(&self) -> bool {
        let membership = self.membership.read().clone();
        membership.is_some_and(|m| m.is_federation_reachable())
    }

    /// Validates, classifies and routes one inbound event.
    pub fn handle_inbound(&self, event: RemoteEvent) -> Disposition {
        trace!(event = %event, "inbound event");

        if same_url(event.source(), &self.local_service_url) {
            warn!(source = %event.source(), "dropping event sourced from this node");
            return Disposition::Dropped(DropReason::SelfSourced);
        }

        // Processing continues even when unreachable.
        if !self.ping() {
            warn!(source = %event.source(), "federation unreachable, processing inbound event anyway");
        }

        let kind = event.message_type();
        let channel = match kind {
            MessageType::Register => {
                if event.payload().is_none() {
                    warn!(source = %event.source(), seq = event.sequence_number(), "register event without payload [event dropped]");
                    return Disposition::Dropped(DropReason::MissingPayload);
                }
                Channel::Registry
            }
            MessageType::Unregister => Channel::Registry,
            MessageType::Health => Channel::Monitor,
            MessageType::Metrics => Channel::Metrics,
            MessageType::Noop => {
                debug!(source = %event.source(), "noop event received");
                return Disposition::Logged(kind);
            }
            MessageType::Application => {
                debug!(source = %event.source(), "application event received, not handled");
                return Disposition::Logged(kind);
            }
            MessageType::Unrecognized(code) => {
                warn!(source = %event.source(), code, "unrecognized message type [event dropped]");
                return Disposition::Dropped(DropReason::Unrecognized(code));
            }
        };

        debug!(source = %event.source(), channel = %channel, kind = %kind, "enqueueing inbound event");
        self.bus
            .enqueue(channel, NodeEvent::remote(INGRESS_COMPONENT, event));
        Disposition::Enqueued(channel)
    }

    // ========== Outbound Queue ==========

    /// Queues a locally produced event for the bound membership manager.
    ///
    /// Returns false once the queue is closed.
    pub fn submit(&self, event: NodeEvent) -> bool {
        trace!(origin = %event.origin(), "event queued for membership");
        if self.outbound_tx.send(event).is_err() {
            warn!("outbound queue closed [event dropped]");
            return false;
        }
        true
    }

    /// Hands every event already queued to the membership manager without
    /// waiting. Returns how many were taken off the queue.
    pub fn drain_outbound(&self) -> usize {
        let mut guard = self.outbound_rx.lock();
        let Some(receiver) = guard.as_mut() else {
            return 0;
        };
        let mut drained = 0;
        while let Ok(event) = receiver.try_recv() {
            self.deliver_queued(&event);
            drained += 1;
        }
        drained
    }

    /// Delivers queued events until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let receiver = self.outbound_rx.lock().take();
        let Some(mut queue) = receiver else {
            warn!("outbound queue loop already running");
            return;
        };
        debug!("outbound queue loop started");

        loop {
            tokio::select! {
                event = queue.recv() => {
                    let Some(event) = event else { break };
                    self.deliver_queued(&event);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("outbound queue loop stopped");
    }

    fn deliver_queued(&self, event: &NodeEvent) -> bool {
        let membership = self.membership.read().clone();
        match membership {
            Some(membership) => membership.handle_queued_event(event),
            None => {
                warn!(origin = %event.origin(), "no peer membership bound [event dropped]");
                false
            }
        }
    }
}

impl JoinListener for IngressDispatcher {
    fn on_join(&self, component: &Component, has_joined: bool) {
        let Component::Membership(membership) = component else {
            return;
        };
        if has_joined {
            self.bind_membership(membership);
        } else {
            self.unbind_membership();
        }
    }

    fn on_all_loaded(&self, bus: &dyn EventBus) {
        if self.is_bound() {
            return;
        }
        match bus
            .component(MEMBERSHIP_COMPONENT)
            .as_ref()
            .and_then(Component::as_membership)
        {
            Some(membership) => self.bind_membership(membership),
            None => warn!("no peer membership registered, federation will report unreachable"),
        }
    }
}
