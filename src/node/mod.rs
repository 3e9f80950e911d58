//! # Node Assembly
//!
//! Wires the subsystems into a running fabric node: archive, auth, gossip
//! registry and protocol, service runtime, dispatcher, mailbox, and the
//! transport server. Startup order matters: state is warm-loaded before
//! services come up, and a worker completes its coordinator handshake
//! before gossip starts.

use ed25519_dalek::SigningKey;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::auth::AuthManager;
use crate::config::NodeConfig;
use crate::dispatch::Dispatcher;
use crate::gossip::protocol::GossipProtocol;
use crate::gossip::registry::{GossipRegistry, NodeRecord};
use crate::hashcrack::{HashCoordinatorService, HashWorkerService};
use crate::mailbox::Mailbox;
use crate::services::runtime::{ServiceContext, ServiceRuntime};
use crate::services::system::SystemService;
use crate::storage::SecureArchive;
use crate::transport::client::TransportClient;
use crate::transport::server::{self, ServerState, SharedState};
use crate::types::{FabricError, NodeRole};

/// Node lifecycle errors, mapped onto the CLI exit codes.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("archive unreadable: {0}")]
    Archive(#[source] anyhow::Error),

    #[error("coordinator handshake failed: {0}")]
    Handshake(#[source] FabricError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl NodeError {
    pub fn exit_code(&self) -> i32 {
        match self {
            NodeError::Archive(_) => 4,
            NodeError::Handshake(_) => 3,
            NodeError::Other(_) => 1,
        }
    }
}

/// A fully wired fabric node.
pub struct Node {
    config: Arc<NodeConfig>,
    archive: Arc<SecureArchive>,
    auth: Arc<AuthManager>,
    registry: Arc<GossipRegistry>,
    runtime: Arc<ServiceRuntime>,
    dispatcher: Arc<Dispatcher>,
    client: Arc<TransportClient>,
    mailbox: Arc<Mailbox>,
    gossip: Arc<GossipProtocol>,
    cancel: CancellationToken,
    server_state: SharedState,
    server_handle: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Result<Self, NodeError> {
        let config = Arc::new(config);
        let cancel = CancellationToken::new();

        let archive = Arc::new(
            SecureArchive::open(&config.archive_dir).map_err(NodeError::Archive)?,
        );
        let auth = Arc::new(
            AuthManager::new(Arc::clone(&archive), config.auth.clone())
                .map_err(|e| NodeError::Archive(anyhow::anyhow!(e)))?,
        );

        let self_record = NodeRecord::new(
            config.node_id.clone(),
            config.role,
            config.endpoint(),
        );
        let registry = Arc::new(GossipRegistry::new(self_record, config.gossip.clone()));
        registry.load_snapshot(&archive);

        let client = Arc::new(
            TransportClient::new(config.transport.clone())
                .map_err(|e| NodeError::Other(anyhow::anyhow!(e)))?,
        );

        let runtime = Arc::new(ServiceRuntime::new(Arc::clone(&config), Arc::clone(&registry)));
        runtime.register(Arc::new(SystemService::new()));
        match config.role {
            NodeRole::Coordinator => {
                runtime.register(Arc::new(HashCoordinatorService::new()));
            }
            NodeRole::Worker => {
                runtime.register(Arc::new(HashWorkerService::new()));
            }
        }

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&runtime),
            Arc::clone(&registry),
            Arc::clone(&client),
            Arc::clone(&config),
        ));

        let mailbox = Arc::new(Mailbox::new(config.transport.lp_timeout_secs));
        let gossip = Arc::new(GossipProtocol::new(
            Arc::clone(&registry),
            Arc::clone(&client),
            Arc::clone(&archive),
            config.gossip.clone(),
        ));

        let server_state = ServerState::new(
            Arc::clone(&config),
            Arc::clone(&auth),
            Arc::clone(&runtime),
            Arc::clone(&registry),
            Arc::clone(&mailbox),
            cancel.clone(),
        );

        Ok(Self {
            config,
            archive,
            auth,
            registry,
            runtime,
            dispatcher,
            client,
            mailbox,
            gossip,
            cancel,
            server_state,
            server_handle: parking_lot::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn registry(&self) -> Arc<GossipRegistry> {
        Arc::clone(&self.registry)
    }

    /// Load (or mint on first start) this node's ed25519 identity key.
    fn identity_key(&self) -> Result<SigningKey, NodeError> {
        match self.archive.read_cert("node_key") {
            Some(bytes) => {
                let seed: [u8; 32] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| NodeError::Archive(anyhow::anyhow!("node_key is not 32 bytes")))?;
                Ok(SigningKey::from_bytes(&seed))
            }
            None => {
                let key = SigningKey::generate(&mut rand::rngs::OsRng);
                self.archive
                    .write_cert("node_key", key.to_bytes().as_slice())
                    .map_err(NodeError::Archive)?;
                Ok(key)
            }
        }
    }

    /// Bring the node up: background maintenance, outbound credentials,
    /// services, gossip, and the transport server.
    pub async fn start(&self) -> Result<(), NodeError> {
        info!(
            "Starting {} node {} on {}",
            self.config.role,
            self.config.node_id,
            self.config.endpoint()
        );

        self.archive
            .spawn_autosave(self.config.gossip.snapshot_interval_secs, self.cancel.clone());
        self.auth.spawn_sweep(self.cancel.clone());

        match self.config.role {
            NodeRole::Coordinator => {
                // The coordinator mints its own outbound credential.
                let token = self
                    .auth
                    .issue_token(&self.config.node_id, NodeRole::Coordinator)
                    .map_err(NodeError::Handshake)?;
                self.client.set_token(token);
            }
            NodeRole::Worker => {
                let endpoint = self.config.coordinator_endpoint.clone().ok_or_else(|| {
                    NodeError::Handshake(FabricError::bad_request(
                        "worker requires a coordinator endpoint",
                    ))
                })?;
                let key = self.identity_key()?;
                self.client
                    .handshake(&endpoint, &self.config.node_id, NodeRole::Worker, &key)
                    .await
                    .map_err(NodeError::Handshake)?;
                info!("Handshake with coordinator at {} complete", endpoint);

                // Seed the registry through one direct exchange so the
                // first gossip tick has a peer to talk to.
                if let Err(err) = self.gossip.bootstrap(&endpoint).await {
                    warn!("Initial gossip exchange failed: {}", err);
                }
            }
        }

        // Services come up with a handle to the dispatcher injected.
        let node_id = self.config.node_id.clone();
        let role = self.config.role;
        let config = Arc::clone(&self.config);
        let registry = Arc::clone(&self.registry);
        let dispatcher = Arc::clone(&self.dispatcher);
        let cancel = self.cancel.clone();
        self.runtime
            .start_all(&move |_name, metrics| ServiceContext {
                node_id: node_id.clone(),
                role,
                config: Arc::clone(&config),
                registry: Arc::clone(&registry),
                dispatcher: Arc::clone(&dispatcher),
                metrics,
                cancel: cancel.clone(),
            })
            .await;

        Arc::clone(&self.gossip).start(self.cancel.clone());

        let state = Arc::clone(&self.server_state);
        let handle = tokio::spawn(async move {
            if let Err(err) = server::serve(state).await {
                error!("Transport server exited: {}", err);
            }
        });
        *self.server_handle.lock() = Some(handle);

        info!("Node {} is up", self.config.node_id);
        Ok(())
    }

    /// Graceful shutdown: services first, then a final snapshot and flush.
    pub async fn shutdown(&self) {
        info!("Shutting down node {}", self.config.node_id);
        self.runtime.shutdown_all(&self.archive).await;
        self.registry.snapshot_to(&self.archive);
        self.cancel.cancel();

        if let Some(handle) = self.server_handle.lock().take() {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
        }
        if let Err(err) = self.archive.flush() {
            error!("Final archive flush failed: {}", err);
        }
        info!("Node {} stopped", self.config.node_id);
    }

    /// Run until the process receives ctrl-c, then shut down.
    pub async fn run_until_signal(&self) {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
            }
            _ = self.cancel.cancelled() => {}
        }
        self.shutdown().await;
    }

    pub fn mailbox(&self) -> Arc<Mailbox> {
        Arc::clone(&self.mailbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;

    #[tokio::test]
    async fn test_node_wiring_registers_role_services() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::new("coord-test", NodeRole::Coordinator, 19_100);
        config.archive_dir = dir.path().to_path_buf();

        let node = Node::new(config).unwrap();
        assert_eq!(node.config().node_id, NodeId::from("coord-test"));
        // Services are registered but not yet running.
        assert!(!node.runtime.has_running("hash_coordinator"));

        let record = node.registry().self_record();
        assert_eq!(record.role, NodeRole::Coordinator);
    }

    #[tokio::test]
    async fn test_worker_without_coordinator_fails_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::new("w-test", NodeRole::Worker, 19_101);
        config.archive_dir = dir.path().to_path_buf();

        let node = Node::new(config).unwrap();
        let err = node.start().await.unwrap_err();
        assert_eq!(err.exit_code(), 3);
        node.shutdown().await;
    }
}
