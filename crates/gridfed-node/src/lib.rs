//! gridfed-node - federated data-grid node
//!
//! Hosts the federation control plane from `gridfed-core` behind an HTTP
//! ingress endpoint and talks to peers over HTTP.
//!
//! # Modules
//!
//! - [`config`]: TOML node configuration
//! - [`node`]: process wiring and background loops
//! - [`server`]: HTTP ingress endpoint
//! - [`transport`]: HTTP peer transport

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod node;
pub mod server;
pub mod transport;

pub use config::{FederationSettings, LogFormat, NodeConfig, SeedPeer};
pub use error::{NodeError, Result};
pub use node::FederationNode;
pub use server::IngressServer;
pub use transport::HttpPeerTransport;
