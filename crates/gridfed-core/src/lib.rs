//! # gridfed-core
//!
//! Control plane of a federated data-grid node.
//!
//! A node keeps track of its sibling nodes ("peers") without any central
//! coordinator, routes inbound remote calls onto named internal channels,
//! and propagates registry digests to a random subset of peers by gossip.
//!
//! ## Architecture
//!
//! ```text
//!  remote call ──▶ IngressDispatcher ──▶ EventBus channel ──▶ subscriber
//!                     (validate,            ("REGISTRY",       (registry
//!                      classify)             "MONITOR",         subsystem)
//!                                            "METRICS")             │
//!                                                                   ▼
//!  remote peer ◀── PeerHandle::send ◀── PeerMembership ◀── RegistryUpdateDigest
//!                   (bounded queue,       (gossip dispatch)
//!                    fire-and-forget)
//! ```
//!
//! ## Core Types
//!
//! - [`PeerHandle`]: local proxy for one remote node with its own outbound queue
//! - [`PeerMembership`]: owns the available/unavailable peer collections and runs gossip
//! - [`IngressDispatcher`]: single entry point for inbound [`RemoteEvent`]s
//! - [`EventBus`]: channel-addressed enqueue and lifecycle broadcast seam
//! - [`PeerTransport`]: the network capability used to reach a peer
//!
//! Delivery is best-effort throughout. Nothing in this crate surfaces a
//! per-message error to a remote caller: malformed input, unknown targets
//! and unreachable peers are logged and dropped.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bus;
pub mod config;
pub mod error;
pub mod event;
pub mod gossip;
pub mod ingress;
pub mod membership;
pub mod peer;
pub mod transport;

pub use bus::{Component, EventBus, JoinListener, LocalEventBus};
pub use config::{FederationConfig, GossipConfig, PeerConfig};
pub use error::{FederationError, Result};
pub use event::{
    Channel, EventData, MessageType, NodeDescriptor, NodeEvent, RegistryUpdateDigest,
    RemoteEvent, SequenceGenerator,
};
pub use gossip::{select_targets, GossipDispatcher};
pub use ingress::{Disposition, DropReason, IngressDispatcher, INGRESS_COMPONENT};
pub use membership::{MembershipStatus, PeerMembership, PeerStatus, MEMBERSHIP_COMPONENT};
pub use peer::{Availability, PeerHandle, PeerIdentity, PeerInbox, PeerStateChange, PeerStateKind};
pub use transport::{MemoryTransport, PeerTransport};
