//! # Gossip Protocol
//!
//! Anti-entropy rounds over the registry. Each tick the node picks up to
//! `fanout` random alive peers, pulls records it is behind on, and pushes
//! back records the peer is behind on. Snapshot and eviction run on their
//! own cadence.

use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::GossipConfig;
use crate::gossip::registry::GossipRegistry;
use crate::storage::SecureArchive;
use crate::transport::client::TransportClient;

/// Background gossip driver.
pub struct GossipProtocol {
    registry: Arc<GossipRegistry>,
    client: Arc<TransportClient>,
    archive: Arc<SecureArchive>,
    config: GossipConfig,
}

impl GossipProtocol {
    pub fn new(
        registry: Arc<GossipRegistry>,
        client: Arc<TransportClient>,
        archive: Arc<SecureArchive>,
        config: GossipConfig,
    ) -> Self {
        Self {
            registry,
            client,
            archive,
            config,
        }
    }

    /// Start the gossip tick and the snapshot/eviction loop.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) {
        let tick = Arc::clone(&self);
        let tick_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(tick.config.tick_interval_ms.max(10)));
            loop {
                tokio::select! {
                    _ = interval.tick() => tick.run_round().await,
                    _ = tick_cancel.cancelled() => {
                        info!("Gossip protocol stopped");
                        break;
                    }
                }
            }
        });

        let housekeeping = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                housekeeping.config.snapshot_interval_secs.max(1),
            ));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        housekeeping.registry.evict_dead();
                        housekeeping.registry.snapshot_to(&housekeeping.archive);
                    }
                    _ = cancel.cancelled() => {
                        // Final snapshot on shutdown.
                        housekeeping.registry.snapshot_to(&housekeeping.archive);
                        break;
                    }
                }
            }
        });
    }

    /// One gossip round: pull from up to `fanout` random alive peers, then
    /// push back whatever they are behind on. Failures are logged and never
    /// escape the loop.
    pub async fn run_round(&self) {
        let peers = {
            let mut peers = self.registry.alive_peers();
            peers.shuffle(&mut rand::thread_rng());
            peers.truncate(self.config.fanout);
            peers
        };

        for peer in peers {
            let round = tokio::time::timeout(
                Duration::from_secs(self.config.round_timeout_secs),
                self.exchange_with(&peer.endpoint),
            );
            match round.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!("Gossip round with {} failed: {}", peer.node_id, err),
                Err(_) => debug!("Gossip round with {} timed out", peer.node_id),
            }
        }
    }

    /// One direct exchange against a known endpoint, used by workers to
    /// seed their registry right after the coordinator handshake.
    pub async fn bootstrap(&self, endpoint: &str) -> crate::types::FabricResult<()> {
        self.exchange_with(endpoint).await
    }

    async fn exchange_with(&self, endpoint: &str) -> crate::types::FabricResult<()> {
        let summary = self.registry.summary();
        let pulled = self.client.gossip_pull(endpoint, &summary).await?;

        let mut merged = 0usize;
        for record in pulled.records {
            if self.registry.merge(record) {
                merged += 1;
            }
        }
        if merged > 0 {
            debug!("Merged {} records from {}", merged, endpoint);
        }

        // Push back records the peer has not seen yet.
        let to_push = self.registry.deltas_since(&pulled.summary);
        if !to_push.is_empty() {
            if let Err(err) = self.client.gossip_push(endpoint, to_push).await {
                error!("Gossip push to {} failed: {}", endpoint, err);
            }
        }
        Ok(())
    }
}
