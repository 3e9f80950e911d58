//! # Service Runtime
//!
//! Supervises local service plugins: drives `initialize`/`cleanup` under
//! timeouts, registers public methods in the node's method table under
//! `service/method` keys, tracks per-method call metrics, and mirrors every
//! lifecycle transition into the gossip self-record.
//!
//! Services are registered at build time; each receives a handle to the
//! dispatcher through its [`ServiceContext`] so it can call peers without
//! holding a reference back to the runtime.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::NodeConfig;
use crate::gossip::registry::{GossipRegistry, ServiceDescriptor, ServiceStatus};
use crate::services::metrics::{MetricsSink, MetricType, MetricsState};
use crate::storage::SecureArchive;
use crate::types::{FabricError, FabricResult, NodeId, NodeRole};

/// Per-method metadata recognized by the runtime.
#[derive(Debug, Clone)]
pub struct MethodSpec {
    pub name: String,
    pub description: String,
    pub public: bool,
    pub requires_auth: bool,
    pub coordinator_only: bool,
    pub cache_ttl_seconds: u64,
    pub rate_limit_per_minute: Option<u32>,
    pub idempotent: bool,
    pub track_metrics: bool,
}

impl MethodSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            public: true,
            requires_auth: true,
            coordinator_only: false,
            cache_ttl_seconds: 0,
            rate_limit_per_minute: None,
            idempotent: false,
            track_metrics: true,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn no_auth(mut self) -> Self {
        self.requires_auth = false;
        self
    }

    pub fn coordinator_only(mut self) -> Self {
        self.coordinator_only = true;
        self
    }

    pub fn cached(mut self, ttl_seconds: u64) -> Self {
        self.cache_ttl_seconds = ttl_seconds;
        self
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn untracked(mut self) -> Self {
        self.track_metrics = false;
        self
    }

    pub fn private(mut self) -> Self {
        self.public = false;
        self
    }

    pub fn rate_limited(mut self, per_minute: u32) -> Self {
        self.rate_limit_per_minute = Some(per_minute);
        self
    }
}

/// Static manifest a service exposes to the runtime.
#[derive(Debug, Clone)]
pub struct ServiceManifest {
    pub version: String,
    pub description: String,
    pub methods: Vec<MethodSpec>,
}

impl ServiceManifest {
    pub fn method(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// Handles injected into a service at initialization.
#[derive(Clone)]
pub struct ServiceContext {
    pub node_id: NodeId,
    pub role: NodeRole,
    pub config: Arc<NodeConfig>,
    pub registry: Arc<GossipRegistry>,
    pub dispatcher: Arc<crate::dispatch::Dispatcher>,
    pub metrics: MetricsState,
    pub cancel: CancellationToken,
}

/// Contract every service plugin implements.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &'static str;

    fn manifest(&self) -> ServiceManifest;

    /// Called once under a timeout before the service is registered with
    /// the dispatcher.
    async fn initialize(&self, ctx: ServiceContext) -> anyhow::Result<()>;

    /// Called once under a timeout during graceful shutdown.
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// Execute one public method.
    async fn handle(&self, method: &str, params: Value) -> FabricResult<Value>;
}

struct ServiceEntry {
    service: Arc<dyn Service>,
    manifest: ServiceManifest,
    status: Mutex<ServiceStatus>,
    metrics: MetricsState,
}

/// Folds accepted metric pushes of one service into its gossip descriptor.
struct GossipMetricsSink {
    service: String,
    registry: Arc<GossipRegistry>,
    state: MetricsState,
}

impl MetricsSink for GossipMetricsSink {
    fn on_metric(&self, _service: &str, _name: &str, _value: f64, _type: MetricType) {
        let summary = self.state.summary();
        let service = self.service.clone();
        self.registry.update_self(move |rec| {
            if let Some(desc) = rec.services.get_mut(&service) {
                desc.metrics_summary = summary;
            }
        });
    }
}

/// The per-node service supervisor and method table.
pub struct ServiceRuntime {
    config: Arc<NodeConfig>,
    registry: Arc<GossipRegistry>,
    entries: RwLock<HashMap<String, Arc<ServiceEntry>>>,
    method_table: RwLock<HashMap<String, MethodSpec>>,
    method_windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl ServiceRuntime {
    pub fn new(config: Arc<NodeConfig>, registry: Arc<GossipRegistry>) -> Self {
        Self {
            config,
            registry,
            entries: RwLock::new(HashMap::new()),
            method_table: RwLock::new(HashMap::new()),
            method_windows: Mutex::new(HashMap::new()),
        }
    }

    /// Register a service plugin. Idempotent per name; the service stays
    /// `stopped` until [`start_all`] runs.
    pub fn register(&self, service: Arc<dyn Service>) {
        let name = service.name().to_string();
        let manifest = service.manifest();
        let metrics = MetricsState::new(name.clone());
        metrics.set_sink(Arc::new(GossipMetricsSink {
            service: name.clone(),
            registry: Arc::clone(&self.registry),
            state: metrics.clone(),
        }));

        let entry = Arc::new(ServiceEntry {
            service,
            manifest,
            status: Mutex::new(ServiceStatus::Stopped),
            metrics,
        });
        self.entries.write().insert(name.clone(), entry);
        info!("Registered service: {}", name);
    }

    fn descriptor_of(&self, entry: &ServiceEntry) -> ServiceDescriptor {
        ServiceDescriptor {
            version: entry.manifest.version.clone(),
            status: *entry.status.lock(),
            methods: entry
                .manifest
                .methods
                .iter()
                .filter(|m| m.public)
                .map(|m| m.name.clone())
                .collect(),
            description: entry.manifest.description.clone(),
            metrics_summary: entry.metrics.summary(),
        }
    }

    fn publish(&self, name: &str, entry: &ServiceEntry) {
        let descriptor = self.descriptor_of(entry);
        let name = name.to_string();
        self.registry.update_self(move |rec| {
            rec.services.insert(name, descriptor);
        });
    }

    fn set_status(&self, name: &str, entry: &ServiceEntry, status: ServiceStatus) {
        *entry.status.lock() = status;
        let gauge = match status {
            ServiceStatus::Stopped => 0.0,
            ServiceStatus::Starting => 1.0,
            ServiceStatus::Running => 2.0,
            ServiceStatus::Stopping => 3.0,
            ServiceStatus::Error => 4.0,
        };
        entry.metrics.gauge("service_status", gauge);
        self.publish(name, entry);
    }

    /// Initialize every registered service, registering methods for the
    /// ones that come up. A failed `initialize` parks the service in
    /// `error`; it is never added to the method table.
    pub async fn start_all(&self, make_ctx: &dyn Fn(&str, MetricsState) -> ServiceContext) {
        let services: Vec<(String, Arc<ServiceEntry>)> = {
            let entries = self.entries.read();
            entries.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect()
        };

        for (name, entry) in services {
            self.set_status(&name, &entry, ServiceStatus::Starting);
            let ctx = make_ctx(&name, entry.metrics.clone());
            let deadline = Duration::from_secs(self.config.runtime.init_timeout_secs);

            match tokio::time::timeout(deadline, entry.service.initialize(ctx)).await {
                Ok(Ok(())) => {
                    {
                        let mut table = self.method_table.write();
                        for spec in &entry.manifest.methods {
                            if spec.public {
                                table.insert(format!("{}/{}", name, spec.name), spec.clone());
                            }
                        }
                    }
                    self.set_status(&name, &entry, ServiceStatus::Running);
                    entry.metrics.gauge(
                        "service_uptime_start",
                        chrono::Utc::now().timestamp() as f64,
                    );
                    info!("Service {} started", name);
                }
                Ok(Err(err)) => {
                    error!("Service {} failed to initialize: {}", name, err);
                    self.set_status(&name, &entry, ServiceStatus::Error);
                }
                Err(_) => {
                    error!("Service {} initialize timed out", name);
                    self.set_status(&name, &entry, ServiceStatus::Error);
                }
            }
        }
    }

    /// Graceful shutdown: `stopping` -> `cleanup` under timeout ->
    /// `stopped`, method table entries removed, gossip record updated.
    pub async fn shutdown_all(&self, archive: &SecureArchive) {
        let services: Vec<(String, Arc<ServiceEntry>)> = {
            let entries = self.entries.read();
            entries.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect()
        };

        for (name, entry) in &services {
            if *entry.status.lock() != ServiceStatus::Running {
                continue;
            }
            self.set_status(name, entry, ServiceStatus::Stopping);

            let deadline = Duration::from_secs(self.config.runtime.cleanup_timeout_secs);
            match tokio::time::timeout(deadline, entry.service.cleanup()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("Service {} cleanup failed: {}", name, err),
                Err(_) => warn!("Service {} cleanup timed out", name),
            }

            {
                let mut table = self.method_table.write();
                table.retain(|key, _| !key.starts_with(&format!("{name}/")));
            }
            self.set_status(name, entry, ServiceStatus::Stopped);
            info!("Service {} stopped", name);
        }

        let statuses: serde_json::Map<String, Value> = services
            .iter()
            .map(|(name, entry)| (name.clone(), json!(entry.status.lock().to_string())))
            .collect();
        archive.put_state("services_state", json!({ "services": statuses }));
    }

    /// Look up a method spec by `service` + `method`.
    pub fn method_spec(&self, service: &str, method: &str) -> Option<MethodSpec> {
        self.method_table
            .read()
            .get(&format!("{service}/{method}"))
            .cloned()
    }

    /// Whether a local service exists and is `running`.
    pub fn has_running(&self, service: &str) -> bool {
        self.entries
            .read()
            .get(service)
            .map(|e| *e.status.lock() == ServiceStatus::Running)
            .unwrap_or(false)
    }

    fn check_method_rate(&self, key: &str, limit: u32) -> FabricResult<()> {
        let now = Instant::now();
        let mut windows = self.method_windows.lock();
        let window = windows.entry(key.to_string()).or_default();
        while let Some(front) = window.front() {
            if now.duration_since(*front) > Duration::from_secs(60) {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() >= limit as usize {
            return Err(FabricError::RateLimited(format!(
                "{key} exceeded {limit} calls/min"
            )));
        }
        window.push_back(now);
        Ok(())
    }

    /// Execute a method on a local service instance.
    pub async fn call_local(
        &self,
        service: &str,
        method: &str,
        params: Value,
    ) -> FabricResult<Value> {
        let entry = {
            let entries = self.entries.read();
            entries.get(service).cloned()
        }
        .ok_or_else(|| {
            FabricError::ServiceUnavailable(format!("no local service {service}"))
        })?;

        if *entry.status.lock() != ServiceStatus::Running {
            return Err(FabricError::ServiceUnavailable(format!(
                "service {service} is {}",
                entry.status.lock()
            )));
        }

        // Framework-provided methods every service answers.
        match method {
            "get_service_info" => {
                return Ok(json!({
                    "name": service,
                    "version": entry.manifest.version,
                    "description": entry.manifest.description,
                    "status": entry.status.lock().to_string(),
                    "exposed_methods": entry
                        .manifest
                        .methods
                        .iter()
                        .filter(|m| m.public)
                        .map(|m| m.name.clone())
                        .collect::<Vec<_>>(),
                    "metrics_summary": entry.metrics.summary(),
                }));
            }
            "health_check" => {
                return Ok(json!({
                    "service": service,
                    "status": "healthy",
                    "total_metrics": entry.metrics.summary()["total_metrics"],
                    "last_check": chrono::Utc::now().timestamp(),
                }));
            }
            "get_metrics" => {
                return Ok(json!({
                    "service_name": service,
                    "timestamp": chrono::Utc::now().timestamp(),
                    "metrics": entry.metrics.snapshot(),
                }));
            }
            _ => {}
        }

        let spec = entry
            .manifest
            .method(method)
            .filter(|m| m.public)
            .cloned()
            .ok_or_else(|| FabricError::MethodNotFound(format!("{service}/{method}")))?;

        if let Some(limit) = spec.rate_limit_per_minute {
            self.check_method_rate(&format!("{service}/{method}"), limit)?;
        }

        if !spec.track_metrics {
            return entry.service.handle(method, params).await;
        }

        entry.metrics.increment(&format!("method_{method}_calls"), 1.0);
        let started = Instant::now();
        let result = entry.service.handle(method, params).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
        entry
            .metrics
            .timer(&format!("method_{method}_duration_ms"), elapsed_ms);
        match &result {
            Ok(_) => entry.metrics.increment(&format!("method_{method}_success"), 1.0),
            Err(_) => entry.metrics.increment(&format!("method_{method}_errors"), 1.0),
        }
        result
    }

    /// Snapshot of every service's metrics, for `/metrics`.
    pub fn metrics_snapshot(&self) -> Value {
        let entries = self.entries.read();
        let services: serde_json::Map<String, Value> = entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.metrics.snapshot()))
            .collect();
        json!({
            "timestamp": chrono::Utc::now().timestamp(),
            "node_id": self.config.node_id,
            "services": services,
        })
    }

    /// Service listing for `/health` and `system/get_system_info`.
    pub fn service_listing(&self) -> Value {
        let entries = self.entries.read();
        let services: serde_json::Map<String, Value> = entries
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    json!({
                        "status": entry.status.lock().to_string(),
                        "version": entry.manifest.version,
                        "methods": entry
                            .manifest
                            .methods
                            .iter()
                            .filter(|m| m.public)
                            .map(|m| m.name.clone())
                            .collect::<Vec<_>>(),
                    }),
                )
            })
            .collect();
        Value::Object(services)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GossipConfig, NodeConfig};
    use crate::gossip::registry::NodeRecord;

    struct EchoService;

    #[async_trait]
    impl Service for EchoService {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn manifest(&self) -> ServiceManifest {
            ServiceManifest {
                version: "1.0.0".to_string(),
                description: "test echo".to_string(),
                methods: vec![
                    MethodSpec::new("echo").describe("echo params back").idempotent(),
                    MethodSpec::new("fail"),
                    MethodSpec::new("limited").rate_limited(2),
                    MethodSpec::new("hidden").private(),
                ],
            }
        }

        async fn initialize(&self, _ctx: ServiceContext) -> anyhow::Result<()> {
            Ok(())
        }

        async fn cleanup(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn handle(&self, method: &str, params: Value) -> FabricResult<Value> {
            match method {
                "echo" | "limited" => Ok(params),
                "fail" => Err(FabricError::bad_request("always fails")),
                other => Err(FabricError::MethodNotFound(other.to_string())),
            }
        }
    }

    fn test_runtime() -> (Arc<ServiceRuntime>, Arc<GossipRegistry>) {
        let config = Arc::new(NodeConfig::new("n1", NodeRole::Worker, 9000));
        let registry = Arc::new(GossipRegistry::new(
            NodeRecord::new(NodeId::from("n1"), NodeRole::Worker, config.endpoint()),
            GossipConfig::default(),
        ));
        let runtime = Arc::new(ServiceRuntime::new(config, Arc::clone(&registry)));
        runtime.register(Arc::new(EchoService));
        (runtime, registry)
    }

    async fn start(runtime: &Arc<ServiceRuntime>, registry: &Arc<GossipRegistry>) {
        let config = Arc::new(NodeConfig::new("n1", NodeRole::Worker, 9000));
        let client = Arc::new(
            crate::transport::client::TransportClient::new(Default::default()).unwrap(),
        );
        let dispatcher = Arc::new(crate::dispatch::Dispatcher::new(
            Arc::clone(runtime),
            Arc::clone(registry),
            client,
            Arc::clone(&config),
        ));
        let registry = Arc::clone(registry);
        runtime
            .start_all(&move |_name, metrics| ServiceContext {
                node_id: NodeId::from("n1"),
                role: NodeRole::Worker,
                config: Arc::clone(&config),
                registry: Arc::clone(&registry),
                dispatcher: Arc::clone(&dispatcher),
                metrics,
                cancel: CancellationToken::new(),
            })
            .await;
    }

    #[tokio::test]
    async fn test_lifecycle_reaches_running_and_gossip() {
        let (runtime, registry) = test_runtime();
        start(&runtime, &registry).await;

        assert!(runtime.has_running("echo"));
        let record = registry.self_record();
        let descriptor = record.services.get("echo").unwrap();
        assert_eq!(descriptor.status, ServiceStatus::Running);
        assert!(descriptor.methods.contains(&"echo".to_string()));
        assert!(!descriptor.methods.contains(&"hidden".to_string()));
    }

    #[tokio::test]
    async fn test_call_local_tracks_counter_identity() {
        let (runtime, registry) = test_runtime();
        start(&runtime, &registry).await;

        let ok = runtime
            .call_local("echo", "echo", json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(ok, json!({"x": 1}));
        let _ = runtime.call_local("echo", "fail", Value::Null).await;

        let entry = runtime.entries.read().get("echo").cloned().unwrap();
        let calls = entry.metrics.get("method_echo_calls").unwrap()
            + entry.metrics.get("method_fail_calls").unwrap();
        let success = entry.metrics.get("method_echo_success").unwrap();
        let errors = entry.metrics.get("method_fail_errors").unwrap();
        assert_eq!(calls, success + errors);
    }

    #[tokio::test]
    async fn test_missing_service_and_method_errors() {
        let (runtime, registry) = test_runtime();
        start(&runtime, &registry).await;

        assert!(matches!(
            runtime.call_local("nope", "x", Value::Null).await,
            Err(FabricError::ServiceUnavailable(_))
        ));
        assert!(matches!(
            runtime.call_local("echo", "nope", Value::Null).await,
            Err(FabricError::MethodNotFound(_))
        ));
        // Private methods are not reachable.
        assert!(matches!(
            runtime.call_local("echo", "hidden", Value::Null).await,
            Err(FabricError::MethodNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_builtin_service_methods() {
        let (runtime, registry) = test_runtime();
        start(&runtime, &registry).await;

        let info = runtime
            .call_local("echo", "get_service_info", Value::Null)
            .await
            .unwrap();
        assert_eq!(info["name"], "echo");
        assert_eq!(info["status"], "running");
        assert!(info["exposed_methods"]
            .as_array()
            .unwrap()
            .contains(&json!("echo")));

        let health = runtime
            .call_local("echo", "health_check", Value::Null)
            .await
            .unwrap();
        assert_eq!(health["status"], "healthy");

        let metrics = runtime
            .call_local("echo", "get_metrics", Value::Null)
            .await
            .unwrap();
        assert_eq!(metrics["service_name"], "echo");
    }

    #[tokio::test]
    async fn test_per_method_rate_limit() {
        let (runtime, registry) = test_runtime();
        start(&runtime, &registry).await;

        assert!(runtime.call_local("echo", "limited", Value::Null).await.is_ok());
        assert!(runtime.call_local("echo", "limited", Value::Null).await.is_ok());
        assert!(matches!(
            runtime.call_local("echo", "limited", Value::Null).await,
            Err(FabricError::RateLimited(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_clears_method_table() {
        let (runtime, registry) = test_runtime();
        start(&runtime, &registry).await;
        assert!(runtime.method_spec("echo", "echo").is_some());

        let dir = tempfile::tempdir().unwrap();
        let archive = SecureArchive::open(dir.path()).unwrap();
        runtime.shutdown_all(&archive).await;

        assert!(runtime.method_spec("echo", "echo").is_none());
        assert!(!runtime.has_running("echo"));
        let record = registry.self_record();
        assert_eq!(
            record.services.get("echo").unwrap().status,
            ServiceStatus::Stopped
        );
    }
}
