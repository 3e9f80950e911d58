//! # Gossip Layer
//!
//! Eventually-consistent directory of nodes, their roles, service manifests,
//! and opaque per-node metadata, plus the anti-entropy protocol that keeps
//! every node's view converging.

pub mod protocol;
pub mod registry;

pub use protocol::GossipProtocol;
pub use registry::{GossipRegistry, Liveness, NodeRecord, ServiceDescriptor, ServiceStatus};
