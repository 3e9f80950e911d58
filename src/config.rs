//! # Node Configuration
//!
//! Typed configuration for every subsystem of a fabric node. Defaults encode
//! the operational constants of the control plane: gossip cadence, liveness
//! thresholds, RPC timeouts, and the hash-cracking chunk parameters.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::types::{NodeId, NodeRole};

/// Main node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Stable node identifier.
    pub node_id: NodeId,

    /// Role this node plays in the fabric.
    pub role: NodeRole,

    /// Bind address for the transport server.
    pub bind_address: String,

    /// Listening port.
    pub port: u16,

    /// Endpoint advertised to peers (defaults to `http://{bind}:{port}`).
    pub advertise_endpoint: Option<String>,

    /// Coordinator endpoint a worker handshakes with on startup.
    pub coordinator_endpoint: Option<String>,

    /// Root directory of the secure archive.
    pub archive_dir: PathBuf,

    /// Transport configuration.
    pub transport: TransportConfig,

    /// Authentication configuration.
    pub auth: AuthConfig,

    /// Gossip configuration.
    pub gossip: GossipConfig,

    /// Service runtime configuration.
    pub runtime: RuntimeConfig,

    /// Rate limiting configuration.
    pub rate_limit: RateLimitConfig,

    /// Hash-cracking subsystem configuration.
    pub hashcrack: HashCrackConfig,
}

impl NodeConfig {
    pub fn new(node_id: impl Into<NodeId>, role: NodeRole, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            role,
            bind_address: "0.0.0.0".to_string(),
            port,
            advertise_endpoint: None,
            coordinator_endpoint: None,
            archive_dir: PathBuf::from("archive"),
            transport: TransportConfig::default(),
            auth: AuthConfig::default(),
            gossip: GossipConfig::default(),
            runtime: RuntimeConfig::default(),
            rate_limit: RateLimitConfig::default(),
            hashcrack: HashCrackConfig::default(),
        }
    }

    /// Endpoint peers should use to reach this node.
    pub fn endpoint(&self) -> String {
        self.advertise_endpoint
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.bind_address, self.port))
    }
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Default RPC deadline in seconds.
    pub rpc_timeout_secs: u64,

    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// Maximum pooled idle connections per peer.
    pub pool_max_idle_per_host: usize,

    /// Initial retry backoff in milliseconds.
    pub backoff_initial_ms: u64,

    /// Retry backoff cap in milliseconds.
    pub backoff_max_ms: u64,

    /// Maximum internal retries for idempotent methods.
    pub max_retries: u32,

    /// Long-poll park duration in seconds.
    pub lp_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_secs: 30,
            connect_timeout_ms: 5_000,
            pool_max_idle_per_host: 8,
            backoff_initial_ms: 250,
            backoff_max_ms: 10_000,
            max_retries: 3,
            lp_timeout_secs: 60,
        }
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Bearer token lifetime in seconds.
    pub token_ttl_secs: u64,

    /// Allowed clock skew when checking expiry, in seconds.
    pub clock_skew_secs: u64,

    /// Blacklist sweep interval in seconds.
    pub blacklist_sweep_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: 3_600,
            clock_skew_secs: 30,
            blacklist_sweep_secs: 60,
        }
    }
}

/// Gossip configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Gossip tick interval in milliseconds.
    pub tick_interval_ms: u64,

    /// Number of peers contacted per round.
    pub fanout: usize,

    /// A node is alive while `now - last_seen` stays below this, in seconds.
    pub alive_threshold_secs: u64,

    /// Beyond this a node is dead, in seconds.
    pub dead_threshold_secs: u64,

    /// Dead records are kept this long before eviction, in seconds.
    pub eviction_grace_secs: u64,

    /// Snapshot-to-archive interval in seconds.
    pub snapshot_interval_secs: u64,

    /// Per-round deadline in seconds.
    pub round_timeout_secs: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            fanout: 3,
            alive_threshold_secs: 30,
            dead_threshold_secs: 90,
            eviction_grace_secs: 300,
            snapshot_interval_secs: 60,
            round_timeout_secs: 2,
        }
    }
}

/// Service runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Deadline for `initialize` of a service, in seconds.
    pub init_timeout_secs: u64,

    /// Deadline for `cleanup` of a service, in seconds.
    pub cleanup_timeout_secs: u64,

    /// Maximum in-flight legs of a broadcast.
    pub broadcast_max_in_flight: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            init_timeout_secs: 30,
            cleanup_timeout_secs: 30,
            broadcast_max_in_flight: 64,
        }
    }
}

/// Rate limiting configuration (per source IP x endpoint token buckets).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,

    /// Default requests per minute.
    pub default_rate: u32,

    /// Default burst size.
    pub default_burst: u32,

    /// Stricter limit for `/rpc`.
    pub rpc_rate: u32,
    pub rpc_burst: u32,

    /// Looser limit for `/health` and `/metrics`.
    pub health_rate: u32,
    pub health_burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_rate: 200,
            default_burst: 30,
            rpc_rate: 120,
            rpc_burst: 20,
            health_rate: 600,
            health_burst: 60,
        }
    }
}

/// Hash-cracking subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashCrackConfig {
    /// Base chunk size before adaptive scaling.
    pub base_chunk_size: u64,

    /// Active batch pipeline depth.
    pub lookahead_batches: usize,

    /// Coordinator progress-ingestion interval in seconds.
    pub monitor_interval_secs: u64,

    /// Orphan scan interval in seconds.
    pub orphan_scan_interval_secs: u64,

    /// A working chunk older than this is an orphan candidate, in seconds.
    pub orphan_timeout_secs: u64,

    /// Completed batch versions retained before cleanup.
    pub batch_retention: usize,

    /// Worker progress publication throttle in milliseconds.
    pub progress_update_interval_ms: u64,

    /// Worker work-discovery tick in milliseconds.
    pub discovery_interval_ms: u64,
}

impl Default for HashCrackConfig {
    fn default() -> Self {
        Self {
            base_chunk_size: 1_000_000,
            lookahead_batches: 3,
            monitor_interval_secs: 10,
            orphan_scan_interval_secs: 60,
            orphan_timeout_secs: 300,
            batch_retention: 20,
            progress_update_interval_ms: 1_000,
            discovery_interval_ms: 1_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_control_plane_constants() {
        let gossip = GossipConfig::default();
        assert_eq!(gossip.tick_interval_ms, 1_000);
        assert_eq!(gossip.fanout, 3);
        assert_eq!(gossip.alive_threshold_secs, 30);
        assert_eq!(gossip.dead_threshold_secs, 90);

        let transport = TransportConfig::default();
        assert_eq!(transport.rpc_timeout_secs, 30);
        assert_eq!(transport.backoff_initial_ms, 250);
        assert_eq!(transport.backoff_max_ms, 10_000);
        assert_eq!(transport.lp_timeout_secs, 60);

        let hc = HashCrackConfig::default();
        assert_eq!(hc.base_chunk_size, 1_000_000);
        assert_eq!(hc.lookahead_batches, 3);
        assert_eq!(hc.orphan_timeout_secs, 300);
    }

    #[test]
    fn test_endpoint_derivation() {
        let mut config = NodeConfig::new("node-1", NodeRole::Worker, 9100);
        config.bind_address = "10.0.0.5".to_string();
        assert_eq!(config.endpoint(), "http://10.0.0.5:9100");

        config.advertise_endpoint = Some("http://worker.example:9100".to_string());
        assert_eq!(config.endpoint(), "http://worker.example:9100");
    }
}
