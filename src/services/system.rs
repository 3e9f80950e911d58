//! # System Service
//!
//! Small built-in service every node runs: the broadcast `ping` canary and
//! a node self-report.

use once_cell::sync::OnceCell;
use serde_json::{json, Value};
use std::time::Instant;

use crate::services::runtime::{MethodSpec, Service, ServiceContext, ServiceManifest};
use crate::types::{FabricError, FabricResult};

pub struct SystemService {
    ctx: OnceCell<ServiceContext>,
    started_at: Instant,
}

impl SystemService {
    pub fn new() -> Self {
        Self {
            ctx: OnceCell::new(),
            started_at: Instant::now(),
        }
    }
}

impl Default for SystemService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Service for SystemService {
    fn name(&self) -> &'static str {
        "system"
    }

    fn manifest(&self) -> ServiceManifest {
        ServiceManifest {
            version: "1.0.0".to_string(),
            description: "Node liveness and self-report".to_string(),
            methods: vec![
                MethodSpec::new("ping")
                    .describe("Liveness probe")
                    .no_auth()
                    .idempotent()
                    .untracked(),
                MethodSpec::new("get_system_info")
                    .describe("Node identity, role, uptime and services")
                    .idempotent(),
            ],
        }
    }

    async fn initialize(&self, ctx: ServiceContext) -> anyhow::Result<()> {
        let _ = self.ctx.set(ctx);
        Ok(())
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn handle(&self, method: &str, _params: Value) -> FabricResult<Value> {
        match method {
            "ping" => Ok(json!({ "ok": true })),
            "get_system_info" => {
                let ctx = self.ctx.get().ok_or_else(|| {
                    FabricError::ServiceUnavailable("system service not initialized".into())
                })?;
                let record = ctx.registry.self_record();
                Ok(json!({
                    "node_id": ctx.node_id,
                    "role": ctx.role,
                    "endpoint": record.endpoint,
                    "uptime_seconds": self.started_at.elapsed().as_secs(),
                    "heartbeat_version": record.heartbeat_version,
                    "known_nodes": ctx.registry.len(),
                    "services": record.services.keys().collect::<Vec<_>>(),
                }))
            }
            other => Err(FabricError::MethodNotFound(format!("system/{other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ping_replies_without_context() {
        let service = SystemService::new();
        let reply = service.handle("ping", Value::Null).await.unwrap();
        assert_eq!(reply, json!({ "ok": true }));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let service = SystemService::new();
        let err = service.handle("reboot", Value::Null).await.unwrap_err();
        assert!(matches!(err, FabricError::MethodNotFound(_)));
    }
}
