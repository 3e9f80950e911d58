//! Control Plane Integration Tests
//!
//! Boots a real coordinator and two workers on localhost, with archives
//! provisioned the way an operator would: a shared fabric trust key, the
//! worker identity keys, and a trust bundle on the coordinator. Exercises
//! the handshake, gossip convergence, broadcast dispatch with partial
//! failure, token revocation over the wire, and a full distributed
//! hash-cracking job.

use ed25519_dalek::SigningKey;
use gridmesh_node::config::NodeConfig;
use gridmesh_node::dispatch::Target;
use gridmesh_node::hashcrack::compute::{compute_digest, HashAlgo, HashParams};
use gridmesh_node::node::Node;
use gridmesh_node::storage::SecureArchive;
use gridmesh_node::types::{NodeId, NodeRole};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const COORD_PORT: u16 = 19_300;
const WORKER1_PORT: u16 = 19_301;
const WORKER2_PORT: u16 = 19_302;
const SILENT_PORT: u16 = 19_309;

struct Fabric {
    coordinator: Arc<Node>,
    workers: Vec<Arc<Node>>,
    _dirs: Vec<tempfile::TempDir>,
}

fn fast_config(node_id: &str, role: NodeRole, port: u16) -> NodeConfig {
    let mut config = NodeConfig::new(node_id, role, port);
    config.bind_address = "127.0.0.1".to_string();
    config.rate_limit.enabled = false;
    config.gossip.tick_interval_ms = 200;
    config.transport.rpc_timeout_secs = 2;
    config.transport.max_retries = 0;
    config.hashcrack.monitor_interval_secs = 1;
    config.hashcrack.orphan_scan_interval_secs = 5;
    config.hashcrack.discovery_interval_ms = 200;
    config
}

/// Provision archives the way an operator would before first start.
fn provision(worker_ids: &[&str]) -> (Vec<tempfile::TempDir>, Vec<SigningKey>) {
    let mut dirs = Vec::new();
    let mut keys = Vec::new();

    let coord_dir = tempfile::tempdir().unwrap();
    let coord_archive = SecureArchive::open(coord_dir.path()).unwrap();

    let fabric_secret: Vec<u8> = (0..32).map(|i| i as u8 ^ 0x5a).collect();
    coord_archive.write_cert("fabric_secret", &fabric_secret).unwrap();

    let mut bundle: HashMap<String, String> = HashMap::new();
    for worker_id in worker_ids {
        let dir = tempfile::tempdir().unwrap();
        let archive = SecureArchive::open(dir.path()).unwrap();
        archive.write_cert("fabric_secret", &fabric_secret).unwrap();

        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        archive.write_cert("node_key", key.to_bytes().as_slice()).unwrap();
        bundle.insert(
            worker_id.to_string(),
            hex::encode(key.verifying_key().to_bytes()),
        );

        dirs.push(dir);
        keys.push(key);
    }

    coord_archive
        .write_cert(
            "trust_bundle.json",
            serde_json::to_vec(&bundle).unwrap().as_slice(),
        )
        .unwrap();

    let mut all_dirs = vec![coord_dir];
    all_dirs.extend(dirs);
    (all_dirs, keys)
}

async fn boot_fabric() -> Fabric {
    let (dirs, _keys) = provision(&["worker-1", "worker-2"]);

    let mut coord_config = fast_config("coord-1", NodeRole::Coordinator, COORD_PORT);
    coord_config.archive_dir = dirs[0].path().to_path_buf();
    let coordinator = Arc::new(Node::new(coord_config).unwrap());
    coordinator.start().await.unwrap();

    let mut workers = Vec::new();
    for (i, (worker_id, port)) in [("worker-1", WORKER1_PORT), ("worker-2", WORKER2_PORT)]
        .iter()
        .enumerate()
    {
        let mut config = fast_config(worker_id, NodeRole::Worker, *port);
        config.archive_dir = dirs[i + 1].path().to_path_buf();
        config.coordinator_endpoint = Some(format!("http://127.0.0.1:{COORD_PORT}"));
        let worker = Arc::new(Node::new(config).unwrap());
        worker.start().await.unwrap();
        workers.push(worker);
    }

    Fabric { coordinator, workers, _dirs: dirs }
}

/// Wait until the coordinator sees `count` workers advertising a running
/// hash_worker service.
async fn await_workers(fabric: &Fabric, count: usize) {
    for _ in 0..100 {
        let seen = fabric
            .coordinator
            .registry()
            .neighbors_with_service("hash_worker")
            .len();
        if seen >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    panic!("coordinator never saw {count} hash workers");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fabric_end_to_end() {
    let fabric = boot_fabric().await;
    await_workers(&fabric, 2).await;

    // --- Broadcast with partial failure (S4 shape) ---------------------
    // A silent socket that accepts connections and never answers.
    let silent = tokio::net::TcpListener::bind(("127.0.0.1", SILENT_PORT))
        .await
        .unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = silent.accept().await else { break };
            // Hold the connection open without responding.
            tokio::spawn(async move {
                let _socket = socket;
                tokio::time::sleep(Duration::from_secs(60)).await;
            });
        }
    });

    {
        // Forge a record for the silent node advertising the system service.
        let mut record = gridmesh_node::gossip::registry::NodeRecord::new(
            NodeId::from("w-silent"),
            NodeRole::Worker,
            format!("http://127.0.0.1:{SILENT_PORT}"),
        );
        record.services.insert(
            "system".to_string(),
            gridmesh_node::gossip::registry::ServiceDescriptor {
                version: "1.0.0".to_string(),
                status: gridmesh_node::gossip::registry::ServiceStatus::Running,
                methods: vec!["ping".to_string()],
                description: String::new(),
                metrics_summary: Value::Null,
            },
        );
        record.heartbeat_version = 1_000_000;
        fabric.coordinator.registry().merge(record);
    }

    let cancel = CancellationToken::new();
    let replies = fabric
        .coordinator
        .dispatcher()
        .call(
            "system",
            "ping",
            Value::Null,
            Target::Broadcast { role: NodeRole::Worker, domain: None },
            &cancel,
        )
        .await
        .unwrap()
        .into_many()
        .unwrap();

    assert_eq!(replies.len(), 3, "one reply per targeted worker: {replies:?}");
    let by_node: HashMap<String, &gridmesh_node::dispatch::BroadcastReply> = replies
        .iter()
        .map(|r| (r.node_id.to_string(), r))
        .collect();
    assert!(by_node["worker-1"].success);
    assert_eq!(by_node["worker-1"].result.as_ref().unwrap()["ok"], true);
    assert!(by_node["worker-2"].success);
    assert!(!by_node["w-silent"].success);
    assert_eq!(
        by_node["w-silent"].error.as_ref().unwrap().code,
        "timeout"
    );

    // The forged record advertises no hash_worker service, so chunk
    // assignment below ignores it.

    // --- Named-node dispatch -------------------------------------------
    let info = fabric
        .coordinator
        .dispatcher()
        .call(
            "system",
            "get_system_info",
            Value::Null,
            Target::Node(NodeId::from("worker-1")),
            &cancel,
        )
        .await
        .unwrap()
        .into_single()
        .unwrap();
    assert_eq!(info["node_id"], "worker-1");
    assert_eq!(info["role"], "worker");

    // --- Full distributed hash job (S1 shape) --------------------------
    let target = hex::encode(
        compute_digest("bab", HashAlgo::Sha256, &HashParams::default()).unwrap(),
    );
    let created = fabric
        .coordinator
        .dispatcher()
        .call(
            "hash_coordinator",
            "create_job",
            json!({
                "job_id": "e2e-job",
                "mode": "brute",
                "charset": "ab",
                "length": 3,
                "hash_algo": "sha256",
                "target_hashes": [target],
                "base_chunk_size": 100_000,
            }),
            Target::Local,
            &cancel,
        )
        .await
        .unwrap()
        .into_single()
        .unwrap();
    assert_eq!(created["success"], true);
    assert_eq!(created["total_combinations"], 8);

    // Workers discover the chunk through gossip, compute, and report back;
    // the coordinator's monitor loop closes the job.
    let mut completed_status = None;
    for _ in 0..150 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = fabric
            .coordinator
            .dispatcher()
            .call(
                "hash_coordinator",
                "get_job_status",
                json!({"job_id": "e2e-job"}),
                Target::Local,
                &cancel,
            )
            .await
            .unwrap()
            .into_single()
            .unwrap();
        if status["completed"] == true {
            completed_status = Some(status);
            break;
        }
    }
    let status = completed_status.expect("job never completed");
    assert_eq!(status["progress"]["processed"], 8);
    assert_eq!(status["solutions_found"], 1);

    let exported = fabric
        .coordinator
        .dispatcher()
        .call(
            "hash_coordinator",
            "export_results",
            json!({"job_id": "e2e-job"}),
            Target::Local,
            &cancel,
        )
        .await
        .unwrap()
        .into_single()
        .unwrap();
    assert_eq!(exported["data"]["solutions"][0]["combination"], "bab");
    assert_eq!(exported["data"]["solutions"][0]["index"], 5);

    // --- Token revocation over the wire (S5) ---------------------------
    let http = reqwest::Client::new();
    // The handshake path is already proven above; mint a token against the
    // same trust key to exercise revocation in isolation.
    let auth_token = {
        let archive = SecureArchive::open(fabric._dirs[0].path()).unwrap();
        let auth = gridmesh_node::auth::AuthManager::new(
            Arc::new(archive),
            fabric.coordinator.config().auth.clone(),
        )
        .unwrap();
        auth.issue_token(&NodeId::from("worker-1"), NodeRole::Worker)
            .unwrap()
    };

    // The token verifies against the running coordinator (same trust key).
    let ok_resp: Value = http
        .post(format!("http://127.0.0.1:{COORD_PORT}/rpc"))
        .bearer_auth(&auth_token)
        .json(&json!({
            "method": "system/get_system_info",
            "params": {},
            "id": "s5-pre",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(ok_resp["error"].is_null(), "unexpected error: {ok_resp}");

    // Revoke it through /auth logout, then replay the RPC.
    let logout: Value = http
        .post(format!("http://127.0.0.1:{COORD_PORT}/auth"))
        .bearer_auth(&auth_token)
        .json(&json!({"phase": "logout"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(logout["success"], true);

    let denied = http
        .post(format!("http://127.0.0.1:{COORD_PORT}/rpc"))
        .bearer_auth(&auth_token)
        .json(&json!({
            "method": "system/get_system_info",
            "params": {},
            "id": "s5-post",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), reqwest::StatusCode::OK);
    let body: Value = denied.json().await.unwrap();
    assert_eq!(body["error"]["code"], "auth_revoked");
    assert_eq!(body["id"], "s5-post");

    // The denial counter is visible on /metrics.
    let metrics: Value = http
        .get(format!("http://127.0.0.1:{COORD_PORT}/metrics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["auth"]["auth_revoked_denials"]["value"], 1.0);

    // --- Shutdown -------------------------------------------------------
    for worker in &fabric.workers {
        worker.shutdown().await;
    }
    fabric.coordinator.shutdown().await;
}
