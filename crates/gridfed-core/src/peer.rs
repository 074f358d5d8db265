//! Local proxies for remote federation nodes.
//!
//! A [`PeerHandle`] owns a bounded outbound queue drained by a background
//! worker. Sends never block and never report errors to the caller: delivery
//! failures, timeouts and probe results become [`PeerStateChange`] messages
//! posted to whichever [`PeerInbox`] is registered as the handle's listener.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::config::PeerConfig;
use crate::error::{FederationError, Result};
use crate::event::RemoteEvent;
use crate::transport::PeerTransport;

/// Immutable identity of a remote node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentity {
    name: String,
    service_url: Option<String>,
}

impl PeerIdentity {
    /// Creates an identity.
    #[must_use]
    pub fn new(name: impl Into<String>, service_url: Option<String>) -> Self {
        Self {
            name: name.into(),
            service_url,
        }
    }

    /// Creates an identity named after its service URL.
    #[must_use]
    pub fn from_service_url(service_url: impl Into<String>) -> Self {
        let url = service_url.into();
        Self::new(url.clone(), Some(url))
    }

    /// Unique peer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Service URL of the peer's ingress endpoint, if known.
    #[must_use]
    pub fn service_url(&self) -> Option<&str> {
        self.service_url.as_deref()
    }

    /// Returns true if `address` names this peer, either by its name or by
    /// its service URL (case-insensitive, ignoring a trailing slash).
    #[must_use]
    pub fn matches_address(&self, address: &str) -> bool {
        if self.name == address {
            return true;
        }
        self.service_url
            .as_deref()
            .is_some_and(|url| same_url(url, address))
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.service_url {
            Some(url) if *url != self.name => write!(f, "{} ({url})", self.name),
            _ => f.write_str(&self.name),
        }
    }
}

/// Compares two URLs case-insensitively, ignoring a trailing slash.
pub(crate) fn same_url(a: &str, b: &str) -> bool {
    a.trim_end_matches('/')
        .eq_ignore_ascii_case(b.trim_end_matches('/'))
}

/// Whether a peer is currently trusted to accept events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    /// Not (yet) confirmed reachable.
    Unavailable,
    /// Confirmed reachable.
    Available,
}

/// Connectivity signal reported by a peer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStateKind {
    /// The peer could not be reached.
    Failed,
    /// The peer was reachable but did not accept the work in time.
    Busy,
    /// The peer is reachable.
    Available,
}

impl PeerStateKind {
    /// The availability this signal implies.
    #[must_use]
    pub const fn availability(self) -> Availability {
        match self {
            Self::Available => Availability::Available,
            Self::Failed | Self::Busy => Availability::Unavailable,
        }
    }
}

/// Notification that a peer's connectivity changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStateChange {
    /// The peer the signal concerns.
    pub peer: PeerIdentity,
    /// What was observed.
    pub kind: PeerStateKind,
}

/// Sending half of a membership inbox.
///
/// Handles hold one of these as a non-owning route back to their owner.
#[derive(Debug, Clone)]
pub struct PeerInbox {
    sender: mpsc::UnboundedSender<PeerStateChange>,
}

impl PeerInbox {
    /// Creates an inbox and its receiving half.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PeerStateChange>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Posts a state change. Returns false if the receiver is gone.
    pub fn post(&self, change: PeerStateChange) -> bool {
        self.sender.send(change).is_ok()
    }
}

#[derive(Debug)]
struct PeerState {
    availability: Availability,
    last_change: DateTime<Utc>,
}

/// Local proxy for one remote node.
///
/// Starts [`Availability::Unavailable`]. Events passed to [`send`](Self::send)
/// are queued and delivered by a background worker with a bounded timeout.
pub struct PeerHandle {
    identity: PeerIdentity,
    state: RwLock<PeerState>,
    listener: Mutex<Option<PeerInbox>>,
    outbound: Option<mpsc::Sender<RemoteEvent>>,
    transport: Arc<dyn PeerTransport>,
    probe_timeout: Duration,
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("identity", &self.identity)
            .field("availability", &self.availability())
            .finish_non_exhaustive()
    }
}

impl PeerHandle {
    /// Creates a handle and spawns its outbound worker.
    ///
    /// A handle without a service URL has no worker; anything sent to it is
    /// reported as a failure.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn(
        identity: PeerIdentity,
        transport: Arc<dyn PeerTransport>,
        config: &PeerConfig,
    ) -> Arc<Self> {
        let has_url = identity.service_url().is_some();
        let (outbound, receiver) = if has_url {
            let (tx, rx) = mpsc::channel(config.outbound_queue_capacity.max(1));
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let handle = Arc::new(Self {
            identity,
            state: RwLock::new(PeerState {
                availability: Availability::Unavailable,
                last_change: Utc::now(),
            }),
            listener: Mutex::new(None),
            outbound,
            transport,
            probe_timeout: config.probe_timeout,
        });

        if let Some(receiver) = receiver {
            let worker = OutboundWorker {
                identity: handle.identity.clone(),
                receiver,
                transport: Arc::clone(&handle.transport),
                send_timeout: config.send_timeout,
                handle: Arc::downgrade(&handle),
            };
            tokio::spawn(worker.run());
        }

        handle
    }

    /// The peer's identity.
    #[must_use]
    pub const fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// The peer's unique name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.identity.name()
    }

    /// The peer's service URL, if known.
    #[must_use]
    pub fn service_url(&self) -> Option<&str> {
        self.identity.service_url()
    }

    /// Current availability as last observed by this handle.
    #[must_use]
    pub fn availability(&self) -> Availability {
        self.state.read().availability
    }

    /// Returns true if the peer last reported itself available.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.availability() == Availability::Available
    }

    /// When the availability last changed.
    #[must_use]
    pub fn last_state_change(&self) -> DateTime<Utc> {
        self.state.read().last_change
    }

    /// Registers the inbox that receives this handle's state changes,
    /// replacing any previous one.
    pub fn add_state_listener(&self, inbox: PeerInbox) {
        *self.listener.lock() = Some(inbox);
    }

    /// Removes the registered inbox.
    pub fn remove_state_listener(&self) {
        self.listener.lock().take();
    }

    /// Returns true if a state listener is registered.
    #[must_use]
    pub fn has_state_listener(&self) -> bool {
        self.listener.lock().is_some()
    }

    /// Queues `event` for delivery without waiting.
    ///
    /// A full queue is reported as [`PeerStateKind::Busy`], a closed or
    /// missing queue as [`PeerStateKind::Failed`].
    pub fn send(&self, event: RemoteEvent) {
        let seq = event.sequence_number();
        match self.enqueue(event) {
            Ok(()) => trace!(peer = %self.identity, seq, "queued outbound event"),
            Err(e) => {
                warn!(peer = %self.identity, seq, error = %e, "outbound event not queued [event dropped]");
                self.signal(state_for(&e));
            }
        }
    }

    fn enqueue(&self, event: RemoteEvent) -> Result<()> {
        let Some(outbound) = &self.outbound else {
            return Err(FederationError::InvalidServiceUrl {
                url: String::new(),
                reason: format!("peer {} has no service url", self.identity.name()),
            });
        };
        outbound.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                FederationError::QueueFull(self.identity.name().to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                FederationError::QueueClosed(self.identity.name().to_string())
            }
        })
    }

    /// Marks the handle unavailable without notifying the listener.
    ///
    /// Used when the owner resets a peer on its own, so that the next
    /// successful delivery reports the peer available again.
    pub fn reset_unavailable(&self) {
        let mut state = self.state.write();
        if state.availability != Availability::Unavailable {
            state.availability = Availability::Unavailable;
            state.last_change = Utc::now();
        }
    }

    /// Probes the peer and reports the outcome as a state change.
    ///
    /// A probe that exceeds its timeout counts as [`PeerStateKind::Busy`].
    pub async fn probe(&self) -> PeerStateKind {
        let kind = if self.identity.service_url().is_none() {
            PeerStateKind::Failed
        } else {
            match tokio::time::timeout(self.probe_timeout, self.transport.probe(&self.identity))
                .await
            {
                Ok(kind) => kind,
                Err(_) => {
                    let e = FederationError::Timeout(self.probe_timeout);
                    debug!(peer = %self.identity, error = %e, "probe timed out");
                    state_for(&e)
                }
            }
        };
        self.signal(kind);
        kind
    }

    /// Records a connectivity signal and forwards it to the listener.
    pub fn signal(&self, kind: PeerStateKind) {
        {
            let mut state = self.state.write();
            let availability = kind.availability();
            if state.availability != availability {
                state.availability = availability;
                state.last_change = Utc::now();
            }
        }

        let listener = self.listener.lock().clone();
        if let Some(inbox) = listener {
            let delivered = inbox.post(PeerStateChange {
                peer: self.identity.clone(),
                kind,
            });
            if !delivered {
                trace!(peer = %self.identity, "state listener gone");
            }
        }
    }
}

/// Connectivity signal a delivery or probe error implies.
///
/// Timeouts and a full queue mean the peer is slow; anything else means it
/// could not be reached.
fn state_for(error: &FederationError) -> PeerStateKind {
    match error {
        FederationError::Timeout(_) | FederationError::QueueFull(_) => PeerStateKind::Busy,
        _ => PeerStateKind::Failed,
    }
}

/// Drains one peer's outbound queue.
struct OutboundWorker {
    identity: PeerIdentity,
    receiver: mpsc::Receiver<RemoteEvent>,
    transport: Arc<dyn PeerTransport>,
    send_timeout: Duration,
    handle: Weak<PeerHandle>,
}

impl OutboundWorker {
    async fn run(mut self) {
        while let Some(event) = self.receiver.recv().await {
            let seq = event.sequence_number();
            let outcome =
                tokio::time::timeout(self.send_timeout, self.transport.send(&self.identity, event))
                    .await
                    .unwrap_or_else(|_| Err(FederationError::Timeout(self.send_timeout)));

            let Some(handle) = self.handle.upgrade() else {
                break;
            };

            match outcome {
                Ok(()) => {
                    trace!(peer = %self.identity, seq, "delivered");
                    if !handle.is_available() {
                        handle.signal(PeerStateKind::Available);
                    }
                }
                Err(e) => {
                    debug!(peer = %self.identity, seq, error = %e, "delivery failed");
                    handle.signal(state_for(&e));
                }
            }
        }
        trace!(peer = %self.identity, "outbound worker stopped");
    }
}
