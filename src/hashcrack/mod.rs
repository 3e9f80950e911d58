//! # Distributed Hash Cracking
//!
//! The coordinator/worker pair that rides on the control plane: adaptive
//! chunking, gossip-driven assignment, orphan recovery, and worker-side
//! parallel hashing.

pub mod compute;
pub mod coordinator;
pub mod keyspace;
pub mod worker;

pub use coordinator::HashCoordinatorService;
pub use worker::HashWorkerService;
