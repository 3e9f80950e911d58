//! # Persistent Storage
//!
//! The secure archive: an opaque, file-backed key/value store for node
//! state, configuration, and key material.

pub mod archive;

pub use archive::SecureArchive;
