//! # Node Registry
//!
//! The gossip payload store: `node_id -> NodeRecord`. Records are merged by
//! `heartbeat_version` (higher wins; on a tie the locally later-received
//! record is preferred). The node's own record is locally authoritative and
//! is never overwritten by an echo from a peer.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::GossipConfig;
use crate::storage::SecureArchive;
use crate::types::{NodeId, NodeRole};

const SNAPSHOT_BLOB: &str = "gossip_state";

/// Lifecycle state of a service as advertised through gossip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Manifest of one service inside a node record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub version: String,
    pub status: ServiceStatus,
    pub methods: Vec<String>,
    pub description: String,
    #[serde(default)]
    pub metrics_summary: Value,
}

/// Complete, versioned serialization of one node as seen by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub role: NodeRole,
    pub endpoint: String,
    #[serde(default)]
    pub services: HashMap<String, ServiceDescriptor>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub heartbeat_version: u64,
    /// Local wall-clock timestamp of the last observed update. Rewritten on
    /// merge; carries no cross-node meaning.
    #[serde(default)]
    pub last_seen: i64,
}

impl NodeRecord {
    pub fn new(node_id: NodeId, role: NodeRole, endpoint: String) -> Self {
        Self {
            node_id,
            role,
            endpoint,
            services: HashMap::new(),
            metadata: HashMap::new(),
            heartbeat_version: 1,
            last_seen: chrono::Utc::now().timestamp(),
        }
    }
}

/// Liveness tier derived from `last_seen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Suspect,
    Dead,
}

/// Eventually-consistent node directory.
pub struct GossipRegistry {
    self_id: NodeId,
    config: GossipConfig,
    records: RwLock<HashMap<NodeId, NodeRecord>>,
}

impl GossipRegistry {
    pub fn new(self_record: NodeRecord, config: GossipConfig) -> Self {
        let self_id = self_record.node_id.clone();
        let mut records = HashMap::new();
        records.insert(self_id.clone(), self_record);
        Self {
            self_id,
            config,
            records: RwLock::new(records),
        }
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    /// Compact view `{node_id -> heartbeat_version}` used in pull requests.
    pub fn summary(&self) -> HashMap<NodeId, u64> {
        self.records
            .read()
            .iter()
            .map(|(id, rec)| (id.clone(), rec.heartbeat_version))
            .collect()
    }

    /// Records newer than the caller's summary.
    pub fn deltas_since(&self, since: &HashMap<NodeId, u64>) -> Vec<NodeRecord> {
        self.records
            .read()
            .values()
            .filter(|rec| {
                since
                    .get(&rec.node_id)
                    .map(|known| rec.heartbeat_version > *known)
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// Merge a record received from a peer. Returns true when adopted.
    pub fn merge(&self, mut incoming: NodeRecord) -> bool {
        if incoming.node_id == self.self_id {
            // The local self-record is authoritative.
            return false;
        }

        let mut records = self.records.write();
        let adopt = match records.get(&incoming.node_id) {
            Some(existing) => incoming.heartbeat_version >= existing.heartbeat_version,
            None => true,
        };
        if adopt {
            incoming.last_seen = chrono::Utc::now().timestamp();
            debug!(
                "Merged record for {} at version {}",
                incoming.node_id, incoming.heartbeat_version
            );
            records.insert(incoming.node_id.clone(), incoming);
        }
        adopt
    }

    /// Mutate the self-record, bumping its heartbeat version.
    pub fn update_self<F>(&self, f: F)
    where
        F: FnOnce(&mut NodeRecord),
    {
        let mut records = self.records.write();
        if let Some(record) = records.get_mut(&self.self_id) {
            f(record);
            record.heartbeat_version += 1;
            record.last_seen = chrono::Utc::now().timestamp();
        }
    }

    pub fn set_self_metadata(&self, key: &str, value: Value) {
        self.update_self(|rec| {
            rec.metadata.insert(key.to_string(), value);
        });
    }

    pub fn remove_self_metadata(&self, key: &str) {
        self.update_self(|rec| {
            rec.metadata.remove(key);
        });
    }

    pub fn get_metadata(&self, node_id: &NodeId, key: &str) -> Option<Value> {
        self.records
            .read()
            .get(node_id)
            .and_then(|rec| rec.metadata.get(key).cloned())
    }

    pub fn get(&self, node_id: &NodeId) -> Option<NodeRecord> {
        self.records.read().get(node_id).cloned()
    }

    pub fn self_record(&self) -> NodeRecord {
        self.records
            .read()
            .get(&self.self_id)
            .cloned()
            .expect("self record always present")
    }

    pub fn liveness(&self, record: &NodeRecord) -> Liveness {
        if record.node_id == self.self_id {
            return Liveness::Alive;
        }
        let age = chrono::Utc::now().timestamp() - record.last_seen;
        if age < self.config.alive_threshold_secs as i64 {
            Liveness::Alive
        } else if age < self.config.dead_threshold_secs as i64 {
            Liveness::Suspect
        } else {
            Liveness::Dead
        }
    }

    /// All alive nodes, optionally filtered by role.
    pub fn alive_nodes(&self, role: Option<NodeRole>) -> Vec<NodeRecord> {
        self.records
            .read()
            .values()
            .filter(|rec| self.liveness(rec) == Liveness::Alive)
            .filter(|rec| role.map(|r| rec.role == r).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Alive peers (excluding self), the gossip round candidates.
    pub fn alive_peers(&self) -> Vec<NodeRecord> {
        self.alive_nodes(None)
            .into_iter()
            .filter(|rec| rec.node_id != self.self_id)
            .collect()
    }

    /// Alive nodes whose advertised `name` service is running.
    pub fn neighbors_with_service(&self, name: &str) -> Vec<NodeId> {
        self.records
            .read()
            .values()
            .filter(|rec| self.liveness(rec) == Liveness::Alive)
            .filter(|rec| {
                rec.services
                    .get(name)
                    .map(|svc| svc.status == ServiceStatus::Running)
                    .unwrap_or(false)
            })
            .map(|rec| rec.node_id.clone())
            .collect()
    }

    /// Evict records dead for longer than the grace period.
    pub fn evict_dead(&self) {
        let now = chrono::Utc::now().timestamp();
        let cutoff = (self.config.dead_threshold_secs + self.config.eviction_grace_secs) as i64;
        let self_id = self.self_id.clone();
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|id, rec| *id == self_id || now - rec.last_seen < cutoff);
        let evicted = before - records.len();
        if evicted > 0 {
            info!("Evicted {} dead node records", evicted);
        }
    }

    /// Serialize the full registry into the archive.
    pub fn snapshot_to(&self, archive: &SecureArchive) {
        let records = self.records.read();
        let nodes: serde_json::Map<String, Value> = records
            .iter()
            .filter_map(|(id, rec)| {
                serde_json::to_value(rec).ok().map(|v| (id.to_string(), v))
            })
            .collect();
        archive.put_state(SNAPSHOT_BLOB, json!({ "nodes": nodes }));
    }

    /// Warm-start from an archive snapshot. Liveness is re-evaluated against
    /// the current wall clock, so stale entries land in suspect/dead tiers.
    pub fn load_snapshot(&self, archive: &SecureArchive) {
        let Some(blob) = archive.load_state(SNAPSHOT_BLOB) else {
            return;
        };
        let Some(nodes) = blob.get("nodes").and_then(Value::as_object) else {
            return;
        };

        let mut loaded = 0usize;
        for (id, value) in nodes {
            if id == self.self_id.as_str() {
                continue;
            }
            if let Ok(record) = serde_json::from_value::<NodeRecord>(value.clone()) {
                let mut records = self.records.write();
                records.entry(record.node_id.clone()).or_insert(record);
                loaded += 1;
            }
        }
        if loaded > 0 {
            info!("Warm-started gossip registry with {} records", loaded);
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

/// Shared handle type used across subsystems.
pub type SharedRegistry = Arc<GossipRegistry>;

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> GossipRegistry {
        let record = NodeRecord::new(
            NodeId::from("self"),
            NodeRole::Coordinator,
            "http://127.0.0.1:9000".to_string(),
        );
        GossipRegistry::new(record, GossipConfig::default())
    }

    fn worker_record(id: &str, version: u64) -> NodeRecord {
        let mut record = NodeRecord::new(
            NodeId::from(id),
            NodeRole::Worker,
            format!("http://10.0.0.1:9100"),
        );
        record.heartbeat_version = version;
        record
    }

    #[test]
    fn test_merge_prefers_higher_version() {
        let reg = registry();
        assert!(reg.merge(worker_record("w1", 5)));
        assert!(!reg.merge(worker_record("w1", 3)));
        assert_eq!(reg.get(&NodeId::from("w1")).unwrap().heartbeat_version, 5);
    }

    #[test]
    fn test_merge_tie_prefers_later_received() {
        let reg = registry();
        let mut first = worker_record("w1", 4);
        first.metadata.insert("gen".into(), Value::from(1));
        let mut second = worker_record("w1", 4);
        second.metadata.insert("gen".into(), Value::from(2));

        assert!(reg.merge(first));
        assert!(reg.merge(second));
        assert_eq!(reg.get_metadata(&NodeId::from("w1"), "gen"), Some(Value::from(2)));
    }

    #[test]
    fn test_merge_is_commutative_on_version() {
        let a = worker_record("w1", 7);
        let b = worker_record("w1", 2);

        let reg1 = registry();
        reg1.merge(a.clone());
        reg1.merge(b.clone());

        let reg2 = registry();
        reg2.merge(b);
        reg2.merge(a);

        assert_eq!(
            reg1.get(&NodeId::from("w1")).unwrap().heartbeat_version,
            reg2.get(&NodeId::from("w1")).unwrap().heartbeat_version,
        );
    }

    #[test]
    fn test_self_record_is_authoritative() {
        let reg = registry();
        let mut forged = reg.self_record();
        forged.heartbeat_version += 100;
        forged.metadata.insert("evil".into(), Value::from(true));
        assert!(!reg.merge(forged));
        assert!(reg.get_metadata(&NodeId::from("self"), "evil").is_none());
    }

    #[test]
    fn test_self_updates_bump_version() {
        let reg = registry();
        let v0 = reg.self_record().heartbeat_version;
        reg.set_self_metadata("k", Value::from("v"));
        let v1 = reg.self_record().heartbeat_version;
        assert_eq!(v1, v0 + 1);
        reg.remove_self_metadata("k");
        assert_eq!(reg.self_record().heartbeat_version, v1 + 1);
    }

    #[test]
    fn test_deltas_since_summary() {
        let reg = registry();
        reg.merge(worker_record("w1", 5));
        reg.merge(worker_record("w2", 2));

        let mut since = HashMap::new();
        since.insert(NodeId::from("w1"), 5u64);
        since.insert(NodeId::from("w2"), 1u64);
        since.insert(reg.self_id().clone(), reg.self_record().heartbeat_version);

        let deltas = reg.deltas_since(&since);
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].node_id, NodeId::from("w2"));
    }

    #[test]
    fn test_neighbors_with_service_filters_status() {
        let reg = registry();
        let mut w1 = worker_record("w1", 1);
        w1.services.insert(
            "hash_worker".to_string(),
            ServiceDescriptor {
                version: "1.0.0".into(),
                status: ServiceStatus::Running,
                methods: vec![],
                description: String::new(),
                metrics_summary: Value::Null,
            },
        );
        let mut w2 = worker_record("w2", 1);
        w2.services.insert(
            "hash_worker".to_string(),
            ServiceDescriptor {
                version: "1.0.0".into(),
                status: ServiceStatus::Error,
                methods: vec![],
                description: String::new(),
                metrics_summary: Value::Null,
            },
        );
        reg.merge(w1);
        reg.merge(w2);

        let neighbors = reg.neighbors_with_service("hash_worker");
        assert_eq!(neighbors, vec![NodeId::from("w1")]);
    }

    #[test]
    fn test_liveness_tiers() {
        let reg = registry();
        reg.merge(worker_record("w1", 1));

        {
            let mut records = reg.records.write();
            let rec = records.get_mut(&NodeId::from("w1")).unwrap();
            rec.last_seen = chrono::Utc::now().timestamp() - 45;
        }
        let rec = reg.get(&NodeId::from("w1")).unwrap();
        assert_eq!(reg.liveness(&rec), Liveness::Suspect);

        {
            let mut records = reg.records.write();
            let rec = records.get_mut(&NodeId::from("w1")).unwrap();
            rec.last_seen = chrono::Utc::now().timestamp() - 120;
        }
        let rec = reg.get(&NodeId::from("w1")).unwrap();
        assert_eq!(reg.liveness(&rec), Liveness::Dead);
        assert!(reg.alive_nodes(Some(NodeRole::Worker)).is_empty());
    }

    #[test]
    fn test_eviction_keeps_grace_period() {
        let reg = registry();
        reg.merge(worker_record("w1", 1));
        {
            let mut records = reg.records.write();
            records.get_mut(&NodeId::from("w1")).unwrap().last_seen =
                chrono::Utc::now().timestamp() - 120;
        }
        reg.evict_dead();
        // Dead but inside the grace window.
        assert!(reg.get(&NodeId::from("w1")).is_some());

        {
            let mut records = reg.records.write();
            records.get_mut(&NodeId::from("w1")).unwrap().last_seen =
                chrono::Utc::now().timestamp() - 100_000;
        }
        reg.evict_dead();
        assert!(reg.get(&NodeId::from("w1")).is_none());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = SecureArchive::open(dir.path()).unwrap();

        let reg = registry();
        reg.merge(worker_record("w1", 3));
        reg.snapshot_to(&archive);
        archive.flush().unwrap();

        let reg2 = registry();
        reg2.load_snapshot(&archive);
        let loaded = reg2.get(&NodeId::from("w1")).unwrap();
        assert_eq!(loaded.heartbeat_version, 3);
        assert_eq!(loaded.role, NodeRole::Worker);
    }
}
