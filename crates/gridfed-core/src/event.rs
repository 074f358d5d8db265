//! Wire and internal event types.
//!
//! - [`RemoteEvent`]: immutable message exchanged between nodes
//! - [`NodeEvent`]: internal envelope carried on the event bus
//! - [`RegistryUpdateDigest`]: registry snapshot that triggers gossip
//! - [`Channel`]: the named internal channels ingress routes onto

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Classification of a [`RemoteEvent`].
///
/// Serialized as its numeric code. Codes this node does not know are kept as
/// [`MessageType::Unrecognized`] so ingress can log and drop them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum MessageType {
    /// No operation.
    Noop,
    /// Registry state registration (carries a digest payload).
    Register,
    /// Registry state withdrawal.
    Unregister,
    /// Health report.
    Health,
    /// Metrics report.
    Metrics,
    /// Application message (reserved).
    Application,
    /// A code outside the known set.
    Unrecognized(u8),
}

impl MessageType {
    /// Returns the wire code.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Noop => 0,
            Self::Register => 1,
            Self::Unregister => 2,
            Self::Health => 3,
            Self::Metrics => 4,
            Self::Application => 5,
            Self::Unrecognized(code) => code,
        }
    }
}

impl From<u8> for MessageType {
    fn from(code: u8) -> Self {
        match code {
            0 => Self::Noop,
            1 => Self::Register,
            2 => Self::Unregister,
            3 => Self::Health,
            4 => Self::Metrics,
            5 => Self::Application,
            other => Self::Unrecognized(other),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(kind: MessageType) -> Self {
        kind.code()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Noop => write!(f, "NOOP"),
            Self::Register => write!(f, "REGISTER"),
            Self::Unregister => write!(f, "UNREGISTER"),
            Self::Health => write!(f, "HEALTH"),
            Self::Metrics => write!(f, "METRICS"),
            Self::Application => write!(f, "APPLICATION"),
            Self::Unrecognized(code) => write!(f, "UNRECOGNIZED({code})"),
        }
    }
}

/// A message exchanged between federation nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEvent {
    source: String,
    message_type: MessageType,
    payload: Option<String>,
    checksum: String,
    sequence_number: u64,
    time_to_live: u32,
}

impl RemoteEvent {
    /// Creates a remote event.
    #[must_use]
    pub fn new(
        source: impl Into<String>,
        message_type: MessageType,
        payload: Option<String>,
        checksum: impl Into<String>,
        sequence_number: u64,
        time_to_live: u32,
    ) -> Self {
        Self {
            source: source.into(),
            message_type,
            payload,
            checksum: checksum.into(),
            sequence_number,
            time_to_live,
        }
    }

    /// Service URL of the node that sent this event.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Message classification.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Opaque payload, if any.
    #[must_use]
    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }

    /// Payload checksum.
    #[must_use]
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Monotonic sequence number, unique per source.
    #[must_use]
    pub const fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// Remaining relay hops.
    #[must_use]
    pub const fn time_to_live(&self) -> u32 {
        self.time_to_live
    }

    /// Builds the copy of this event that this node sends on to a peer.
    ///
    /// The source is restamped with `local_source` and the TTL is zeroed;
    /// this node never relays beyond one hop.
    #[must_use]
    pub fn proxied_outbound(&self, local_source: &str) -> Self {
        Self {
            source: local_source.to_string(),
            time_to_live: 0,
            ..self.clone()
        }
    }
}

impl fmt::Display for RemoteEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{} from {} (ttl {})",
            self.message_type, self.sequence_number, self.source, self.time_to_live
        )
    }
}

/// Descriptor of a federation node, as listed in a registry update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Fully qualified hostname.
    pub hostname: String,
    /// Short display name.
    pub short_name: String,
    /// IP address as reported by the registry.
    pub ip: String,
    /// Explicit service endpoint, when the registry knows one.
    #[serde(default)]
    pub service_endpoint: Option<String>,
}

impl NodeDescriptor {
    /// Creates a descriptor without an explicit endpoint.
    #[must_use]
    pub fn new(
        hostname: impl Into<String>,
        short_name: impl Into<String>,
        ip: impl Into<String>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            short_name: short_name.into(),
            ip: ip.into(),
            service_endpoint: None,
        }
    }

    /// Sets the explicit service endpoint.
    #[must_use]
    pub fn with_service_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.service_endpoint = Some(endpoint.into());
        self
    }
}

/// A serialized registry snapshot plus the nodes that changed.
///
/// Produced by the registry subsystem; consumed by
/// [`PeerMembership`](crate::PeerMembership) to discover peers and gossip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryUpdateDigest {
    updated_nodes: Vec<NodeDescriptor>,
    xml_document: String,
    xml_checksum: String,
}

impl RegistryUpdateDigest {
    /// Creates a digest.
    #[must_use]
    pub fn new(
        updated_nodes: Vec<NodeDescriptor>,
        xml_document: impl Into<String>,
        xml_checksum: impl Into<String>,
    ) -> Self {
        Self {
            updated_nodes,
            xml_document: xml_document.into(),
            xml_checksum: xml_checksum.into(),
        }
    }

    /// Nodes that changed, in registry order.
    #[must_use]
    pub fn updated_nodes(&self) -> &[NodeDescriptor] {
        &self.updated_nodes
    }

    /// The serialized registry document.
    #[must_use]
    pub fn xml_document(&self) -> &str {
        &self.xml_document
    }

    /// Checksum of the serialized registry document.
    #[must_use]
    pub fn xml_checksum(&self) -> &str {
        &self.xml_checksum
    }
}

/// Named internal delivery queues.
///
/// These names are the internal wire contract; no other channel receives
/// anything from ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Registry subsystem (register/unregister).
    Registry,
    /// Health monitor.
    Monitor,
    /// Metrics collector.
    Metrics,
}

impl Channel {
    /// All recognized channels.
    pub const ALL: [Self; 3] = [Self::Registry, Self::Monitor, Self::Metrics];

    /// Returns the channel's wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Registry => "REGISTRY",
            Self::Monitor => "MONITOR",
            Self::Metrics => "METRICS",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REGISTRY" => Ok(Self::Registry),
            "MONITOR" => Ok(Self::Monitor),
            "METRICS" => Ok(Self::Metrics),
            other => Err(format!("unrecognized channel: {other}")),
        }
    }
}

/// Structured data an internal event may carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventData {
    /// A registry update that should trigger discovery and gossip.
    RegistryUpdate(RegistryUpdateDigest),
}

/// Internal event envelope carried on the event bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEvent {
    origin: String,
    remote: Option<RemoteEvent>,
    data: Option<EventData>,
}

impl NodeEvent {
    /// Creates an empty event from the named component.
    #[must_use]
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            remote: None,
            data: None,
        }
    }

    /// Creates an event wrapping a remote event.
    #[must_use]
    pub fn remote(origin: impl Into<String>, remote: RemoteEvent) -> Self {
        Self {
            remote: Some(remote),
            ..Self::new(origin)
        }
    }

    /// Creates an event carrying a registry update.
    #[must_use]
    pub fn registry_update(origin: impl Into<String>, digest: RegistryUpdateDigest) -> Self {
        Self {
            data: Some(EventData::RegistryUpdate(digest)),
            ..Self::new(origin)
        }
    }

    /// Name of the component that produced this event.
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// The wrapped remote event, if any.
    #[must_use]
    pub const fn remote_event(&self) -> Option<&RemoteEvent> {
        self.remote.as_ref()
    }

    /// The carried data, if any.
    #[must_use]
    pub const fn data(&self) -> Option<&EventData> {
        self.data.as_ref()
    }
}

/// Source of monotonically increasing sequence numbers.
///
/// Seeded from the wall clock so numbers keep increasing across restarts.
#[derive(Debug)]
pub struct SequenceGenerator {
    next: AtomicU64,
}

impl SequenceGenerator {
    /// Creates a generator seeded from the current time in milliseconds.
    #[must_use]
    pub fn new() -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self::starting_at(u64::try_from(now).unwrap_or(0))
    }

    /// Creates a generator whose first value is `first`.
    #[must_use]
    pub const fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Returns the next sequence number.
    pub fn next_seq(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}
