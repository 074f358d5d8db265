//! Event bus seam.
//!
//! The control plane consumes three primitives from its host: channel
//! addressed enqueue, join/leave broadcast, and component registration.
//! [`LocalEventBus`] is an in-process implementation built on tokio channels.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::event::{Channel, NodeEvent};
use crate::ingress::{IngressDispatcher, INGRESS_COMPONENT};
use crate::membership::{PeerMembership, MEMBERSHIP_COMPONENT};
use crate::peer::PeerHandle;

/// A component announced on the bus.
///
/// Join listeners match on the variant instead of inspecting concrete types.
#[derive(Clone)]
pub enum Component {
    /// A remote peer proxy.
    Peer(Arc<PeerHandle>),
    /// The peer membership manager.
    Membership(Arc<PeerMembership>),
    /// The ingress dispatcher.
    Ingress(Arc<IngressDispatcher>),
    /// Any other named component.
    Other(String),
}

impl Component {
    /// The name the component is registered under.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Peer(handle) => handle.name(),
            Self::Membership(_) => MEMBERSHIP_COMPONENT,
            Self::Ingress(_) => INGRESS_COMPONENT,
            Self::Other(name) => name,
        }
    }

    /// Returns the membership manager if this component is one.
    #[must_use]
    pub const fn as_membership(&self) -> Option<&Arc<PeerMembership>> {
        match self {
            Self::Membership(membership) => Some(membership),
            _ => None,
        }
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Peer(handle) => f.debug_tuple("Peer").field(&handle.name()).finish(),
            Self::Membership(_) => f.write_str("Membership"),
            Self::Ingress(_) => f.write_str("Ingress"),
            Self::Other(name) => f.debug_tuple("Other").field(name).finish(),
        }
    }
}

/// Receives component lifecycle notifications.
pub trait JoinListener: Send + Sync {
    /// Called when `component` joins (`has_joined == true`) or leaves.
    fn on_join(&self, component: &Component, has_joined: bool);

    /// Called once every startup component has been registered.
    fn on_all_loaded(&self, _bus: &dyn EventBus) {}
}

/// Primitives the control plane needs from its host.
pub trait EventBus: Send + Sync {
    /// Queues `event` on `channel`. FIFO per channel.
    fn enqueue(&self, channel: Channel, event: NodeEvent);

    /// Notifies every join listener that `component` joined or left.
    fn broadcast_join(&self, component: &Component, has_joined: bool);

    /// Registers `component` under its name and broadcasts its join.
    fn register_component(&self, component: Component);

    /// Removes the named component and broadcasts its leave.
    fn unregister_component(&self, name: &str);

    /// Looks up a registered component by name.
    fn component(&self, name: &str) -> Option<Component>;

    /// Adds a lifecycle listener. Implementations hold it weakly.
    fn add_listener(&self, listener: Weak<dyn JoinListener>);
}

/// In-process [`EventBus`].
///
/// Channel subscribers receive events through unbounded tokio channels.
/// Join listeners are held weakly and are never invoked while a bus lock is
/// held, so a listener may call back into the bus.
#[derive(Default)]
pub struct LocalEventBus {
    subscribers: RwLock<HashMap<Channel, Vec<mpsc::UnboundedSender<NodeEvent>>>>,
    listeners: RwLock<Vec<Weak<dyn JoinListener>>>,
    components: RwLock<HashMap<String, Component>>,
}

impl fmt::Debug for LocalEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalEventBus")
            .field("components", &self.components.read().len())
            .field("listeners", &self.listeners.read().len())
            .finish_non_exhaustive()
    }
}

impl LocalEventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to `channel`. Every subscriber receives every event.
    pub fn subscribe(&self, channel: Channel) -> mpsc::UnboundedReceiver<NodeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().entry(channel).or_default().push(tx);
        rx
    }

    /// Tells every listener that startup registration is complete.
    pub fn broadcast_all_loaded(&self) {
        info!(components = self.components.read().len(), "all components loaded");
        for listener in self.live_listeners() {
            listener.on_all_loaded(self);
        }
    }

    /// Upgrades the live listeners and prunes dead ones.
    fn live_listeners(&self) -> Vec<Arc<dyn JoinListener>> {
        let mut listeners = self.listeners.write();
        listeners.retain(|weak| weak.strong_count() > 0);
        listeners.iter().filter_map(Weak::upgrade).collect()
    }
}

impl EventBus for LocalEventBus {
    fn enqueue(&self, channel: Channel, event: NodeEvent) {
        let mut subscribers = self.subscribers.write();
        let Some(queue) = subscribers.get_mut(&channel) else {
            trace!(channel = %channel, origin = %event.origin(), "no subscribers, event discarded");
            return;
        };
        queue.retain(|tx| tx.send(event.clone()).is_ok());
        trace!(channel = %channel, subscribers = queue.len(), "event enqueued");
    }

    fn broadcast_join(&self, component: &Component, has_joined: bool) {
        debug!(component = %component.name(), has_joined, "broadcasting lifecycle event");
        for listener in self.live_listeners() {
            listener.on_join(component, has_joined);
        }
    }

    fn register_component(&self, component: Component) {
        let previous = self
            .components
            .write()
            .insert(component.name().to_string(), component.clone());
        if previous.is_some() {
            debug!(component = %component.name(), "component re-registered");
        }
        self.broadcast_join(&component, true);
    }

    fn unregister_component(&self, name: &str) {
        let removed = self.components.write().remove(name);
        match removed {
            Some(component) => self.broadcast_join(&component, false),
            None => trace!(component = %name, "unregister of unknown component ignored"),
        }
    }

    fn component(&self, name: &str) -> Option<Component> {
        self.components.read().get(name).cloned()
    }

    fn add_listener(&self, listener: Weak<dyn JoinListener>) {
        self.listeners.write().push(listener);
    }
}
