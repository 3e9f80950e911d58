//! # Universal Dispatcher
//!
//! Routes a `service/method` call to a local instance, one named remote, or
//! every remote in a role. Targeting is an explicit tagged variant; there
//! are no name-matching heuristics. Broadcast fans out in parallel with a
//! bounded in-flight window, returns per-leg results in arrival order, and
//! degrades laggards to `timeout` entries rather than failing as a whole.

use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::NodeConfig;
use crate::gossip::registry::{GossipRegistry, ServiceStatus};
use crate::services::runtime::ServiceRuntime;
use crate::transport::client::TransportClient;
use crate::types::{FabricError, FabricResult, NodeId, NodeRole, RpcErrorBody};

/// Dispatch target selected by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Require an in-process service.
    Local,
    /// One specific remote node.
    Node(NodeId),
    /// Every alive node of a role (optionally narrowed to a domain tag)
    /// that advertises the service as running.
    Broadcast {
        role: NodeRole,
        domain: Option<String>,
    },
}

/// One leg of a broadcast result, in arrival order.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BroadcastReply {
    pub node_id: NodeId,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

impl BroadcastReply {
    fn ok(node_id: NodeId, result: Value) -> Self {
        Self { node_id, success: true, result: Some(result), error: None }
    }

    fn err(node_id: NodeId, error: &FabricError) -> Self {
        Self { node_id, success: false, result: None, error: Some(error.into()) }
    }
}

/// Result of a dispatch: one value, or a per-node list for broadcasts.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Single(Value),
    Many(Vec<BroadcastReply>),
}

impl DispatchOutcome {
    pub fn into_single(self) -> FabricResult<Value> {
        match self {
            DispatchOutcome::Single(value) => Ok(value),
            DispatchOutcome::Many(_) => {
                Err(FabricError::internal("expected single result, got broadcast"))
            }
        }
    }

    pub fn into_many(self) -> FabricResult<Vec<BroadcastReply>> {
        match self {
            DispatchOutcome::Many(replies) => Ok(replies),
            DispatchOutcome::Single(_) => {
                Err(FabricError::internal("expected broadcast result, got single"))
            }
        }
    }
}

/// The per-node call router.
pub struct Dispatcher {
    runtime: Arc<ServiceRuntime>,
    registry: Arc<GossipRegistry>,
    client: Arc<TransportClient>,
    config: Arc<NodeConfig>,
    cache: DashMap<String, (Instant, Value)>,
    broadcast_permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        runtime: Arc<ServiceRuntime>,
        registry: Arc<GossipRegistry>,
        client: Arc<TransportClient>,
        config: Arc<NodeConfig>,
    ) -> Self {
        let permits = config.runtime.broadcast_max_in_flight.max(1);
        Self {
            runtime,
            registry,
            client,
            config,
            cache: DashMap::new(),
            broadcast_permits: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Route a call. Cancellation stops in-flight broadcast legs and marks
    /// the remainder `cancelled`.
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        params: Value,
        target: Target,
        cancel: &CancellationToken,
    ) -> FabricResult<DispatchOutcome> {
        match target {
            Target::Local => {
                let cache_ttl = self
                    .runtime
                    .method_spec(service, method)
                    .map(|s| s.cache_ttl_seconds)
                    .unwrap_or(0);
                let key = Self::cache_key(service, method, &params, self.registry.self_id());
                if cache_ttl > 0 {
                    if let Some(cached) = self.cache.get(&key) {
                        let (stored_at, value) = cached.value();
                        if stored_at.elapsed() < Duration::from_secs(cache_ttl) {
                            return Ok(DispatchOutcome::Single(value.clone()));
                        }
                    }
                }

                let result = tokio::select! {
                    r = self.runtime.call_local(service, method, params) => r?,
                    _ = cancel.cancelled() => {
                        return Err(FabricError::Cancelled("caller withdrew the call".into()));
                    }
                };
                if cache_ttl > 0 {
                    self.cache.insert(key, (Instant::now(), result.clone()));
                }
                Ok(DispatchOutcome::Single(result))
            }
            Target::Node(node_id) => {
                let result = tokio::select! {
                    r = self.call_node(service, method, params, &node_id) => r?,
                    _ = cancel.cancelled() => {
                        return Err(FabricError::Cancelled("caller withdrew the call".into()));
                    }
                };
                Ok(DispatchOutcome::Single(result))
            }
            Target::Broadcast { role, domain } => {
                let replies = self
                    .broadcast(service, method, params, role, domain, cancel)
                    .await;
                Ok(DispatchOutcome::Many(replies))
            }
        }
    }

    /// Default resolution order when the caller names no target:
    /// local service first, otherwise broadcast to workers.
    pub async fn call_auto(
        &self,
        service: &str,
        method: &str,
        params: Value,
        cancel: &CancellationToken,
    ) -> FabricResult<DispatchOutcome> {
        if self.runtime.has_running(service) {
            self.call(service, method, params, Target::Local, cancel).await
        } else {
            self.call(
                service,
                method,
                params,
                Target::Broadcast { role: NodeRole::Worker, domain: None },
                cancel,
            )
            .await
        }
    }

    fn cache_key(service: &str, method: &str, params: &Value, node: &NodeId) -> String {
        // serde_json maps serialize with sorted keys, so this is canonical.
        format!("{node}:{service}/{method}:{params}")
    }

    async fn call_node(
        &self,
        service: &str,
        method: &str,
        params: Value,
        node_id: &NodeId,
    ) -> FabricResult<Value> {
        let record = self
            .registry
            .get(node_id)
            .ok_or_else(|| FabricError::NodeUnreachable(format!("unknown node {node_id}")))?;

        let spec = self.runtime.method_spec(service, method);
        let cache_ttl = spec.as_ref().map(|s| s.cache_ttl_seconds).unwrap_or(0);
        let idempotent = spec.map(|s| s.idempotent).unwrap_or(false);

        let key = Self::cache_key(service, method, &params, node_id);
        if cache_ttl > 0 {
            if let Some(cached) = self.cache.get(&key) {
                let (stored_at, value) = cached.value();
                if stored_at.elapsed() < Duration::from_secs(cache_ttl) {
                    debug!("Cache hit for {}", key);
                    return Ok(value.clone());
                }
            }
        }

        let method_path = format!("{service}/{method}");
        let result = self
            .client
            .rpc(&record.endpoint, &method_path, params, idempotent)
            .await?;

        if cache_ttl > 0 {
            self.cache.insert(key, (Instant::now(), result.clone()));
        }
        Ok(result)
    }

    fn broadcast_targets(&self, service: &str, role: NodeRole, domain: &Option<String>) -> Vec<(NodeId, String)> {
        self.registry
            .alive_nodes(Some(role))
            .into_iter()
            .filter(|rec| rec.node_id != *self.registry.self_id())
            .filter(|rec| {
                rec.services
                    .get(service)
                    .map(|svc| svc.status == ServiceStatus::Running)
                    .unwrap_or(false)
            })
            .filter(|rec| match domain {
                Some(domain) => rec
                    .metadata
                    .get("domain")
                    .and_then(Value::as_str)
                    .map(|d| d == domain.as_str())
                    .unwrap_or(false),
                None => true,
            })
            .map(|rec| (rec.node_id, rec.endpoint))
            .collect()
    }

    /// Fan a call out to every matching node. Never fails as a whole: the
    /// returned list always has one entry per target, tagged `timeout` or
    /// `cancelled` for legs that did not complete.
    async fn broadcast(
        &self,
        service: &str,
        method: &str,
        params: Value,
        role: NodeRole,
        domain: Option<String>,
        cancel: &CancellationToken,
    ) -> Vec<BroadcastReply> {
        let targets = self.broadcast_targets(service, role, &domain);
        if targets.is_empty() {
            return Vec::new();
        }

        let method_path = format!("{service}/{method}");
        let idempotent = self
            .runtime
            .method_spec(service, method)
            .map(|s| s.idempotent)
            .unwrap_or(false);

        let mut pending: HashSet<NodeId> = targets.iter().map(|(id, _)| id.clone()).collect();
        let mut legs = FuturesUnordered::new();
        for (node_id, endpoint) in targets {
            let client = Arc::clone(&self.client);
            let permits = Arc::clone(&self.broadcast_permits);
            let method_path = method_path.clone();
            let params = params.clone();
            legs.push(async move {
                let _permit = permits.acquire_owned().await;
                let outcome = client.rpc(&endpoint, &method_path, params, idempotent).await;
                (node_id, outcome)
            });
        }

        let deadline = tokio::time::sleep(Duration::from_secs(
            self.config.transport.rpc_timeout_secs,
        ));
        tokio::pin!(deadline);

        let mut replies = Vec::with_capacity(pending.len());
        loop {
            tokio::select! {
                leg = legs.next() => {
                    match leg {
                        Some((node_id, outcome)) => {
                            pending.remove(&node_id);
                            let reply = match outcome {
                                Ok(value) => BroadcastReply::ok(node_id, value),
                                Err(err) => BroadcastReply::err(node_id, &err),
                            };
                            replies.push(reply);
                        }
                        None => break,
                    }
                }
                _ = &mut deadline => {
                    for node_id in pending.drain() {
                        replies.push(BroadcastReply::err(
                            node_id,
                            &FabricError::Timeout("broadcast deadline exceeded".into()),
                        ));
                    }
                    break;
                }
                _ = cancel.cancelled() => {
                    for node_id in pending.drain() {
                        replies.push(BroadcastReply::err(
                            node_id,
                            &FabricError::Cancelled("caller withdrew the broadcast".into()),
                        ));
                    }
                    break;
                }
            }
        }
        replies
    }

    /// Drop expired cache entries.
    pub fn prune_cache(&self) {
        self.cache
            .retain(|_, (stored_at, _)| stored_at.elapsed() < Duration::from_secs(3_600));
    }
}
