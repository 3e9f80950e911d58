//! Hash Job Flow Tests
//!
//! Drives the hash coordinator service through its RPC surface with a
//! simulated worker record, without any network transport: job creation,
//! batch publication through gossip metadata, solved reports, and
//! completion.

use gridmesh_node::config::NodeConfig;
use gridmesh_node::dispatch::Dispatcher;
use gridmesh_node::gossip::registry::{
    GossipRegistry, NodeRecord, ServiceDescriptor, ServiceStatus,
};
use gridmesh_node::hashcrack::compute::{compute_digest, HashAlgo, HashParams};
use gridmesh_node::hashcrack::HashCoordinatorService;
use gridmesh_node::services::metrics::MetricsState;
use gridmesh_node::services::runtime::{Service, ServiceContext, ServiceRuntime};
use gridmesh_node::transport::client::TransportClient;
use gridmesh_node::types::{NodeId, NodeRole};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn worker_record(id: &str) -> NodeRecord {
    let mut record = NodeRecord::new(
        NodeId::from(id),
        NodeRole::Worker,
        format!("http://127.0.0.1:9{id}"),
    );
    record.services.insert(
        "hash_worker".to_string(),
        ServiceDescriptor {
            version: "1.0.0".to_string(),
            status: ServiceStatus::Running,
            methods: vec!["get_worker_status".to_string()],
            description: String::new(),
            metrics_summary: Value::Null,
        },
    );
    record
}

async fn coordinator_harness() -> (Arc<HashCoordinatorService>, ServiceContext) {
    let mut config = NodeConfig::new("coord-1", NodeRole::Coordinator, 9000);
    config.hashcrack.monitor_interval_secs = 1;
    config.hashcrack.orphan_scan_interval_secs = 1;
    let config = Arc::new(config);

    let registry = Arc::new(GossipRegistry::new(
        NodeRecord::new(NodeId::from("coord-1"), NodeRole::Coordinator, config.endpoint()),
        config.gossip.clone(),
    ));
    let runtime = Arc::new(ServiceRuntime::new(Arc::clone(&config), Arc::clone(&registry)));
    let client = Arc::new(TransportClient::new(config.transport.clone()).unwrap());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&runtime),
        Arc::clone(&registry),
        client,
        Arc::clone(&config),
    ));

    let ctx = ServiceContext {
        node_id: NodeId::from("coord-1"),
        role: NodeRole::Coordinator,
        config,
        registry,
        dispatcher,
        metrics: MetricsState::new("hash_coordinator"),
        cancel: CancellationToken::new(),
    };

    let service = Arc::new(HashCoordinatorService::new());
    service.initialize(ctx.clone()).await.unwrap();
    (service, ctx)
}

fn published_chunks(ctx: &ServiceContext, job_id: &str) -> Vec<(u64, u64, u64, String)> {
    let batches = ctx
        .registry
        .get_metadata(&NodeId::from("coord-1"), &format!("hash_batches_{job_id}"))
        .expect("batches published");
    let mut chunks = Vec::new();
    for batch in batches.as_object().unwrap().values() {
        for (chunk_id, chunk) in batch["chunks"].as_object().unwrap() {
            chunks.push((
                chunk_id.parse::<u64>().unwrap(),
                chunk["start_index"].as_u64().unwrap(),
                chunk["end_index"].as_u64().unwrap(),
                chunk["assigned_worker"].as_str().unwrap().to_string(),
            ));
        }
    }
    chunks.sort_unstable();
    chunks
}

#[tokio::test(flavor = "multi_thread")]
async fn test_minimal_brute_job_reaches_completion() {
    let (service, ctx) = coordinator_harness().await;
    ctx.registry.merge(worker_record("w1"));

    let target = hex::encode(
        compute_digest("bab", HashAlgo::Sha256, &HashParams::default()).unwrap(),
    );
    let created = service
        .handle(
            "create_job",
            json!({
                "job_id": "job-s1",
                "mode": "brute",
                "charset": "ab",
                "length": 3,
                "hash_algo": "sha256",
                "target_hashes": [target],
                "base_chunk_size": 100_000,
            }),
        )
        .await
        .unwrap();
    assert_eq!(created["success"], true);
    assert_eq!(created["total_combinations"], 8);

    // The whole space fits one chunk assigned to the only worker.
    let chunks = published_chunks(&ctx, "job-s1");
    assert_eq!(chunks.len(), 1);
    let (chunk_id, start, end, assigned) = chunks[0].clone();
    assert_eq!((start, end), (0, 8));
    assert_eq!(assigned, "w1");

    // Simulate the worker computing the chunk and reporting back.
    let charset: Vec<char> = "ab".chars().collect();
    let targets = gridmesh_node::hashcrack::compute::decode_targets(&[hex::encode(
        compute_digest("bab", HashAlgo::Sha256, &HashParams::default()).unwrap(),
    )])
    .unwrap();
    let (solutions, hash_count) = gridmesh_node::hashcrack::compute::compute_brute_subchunk(
        start,
        end,
        &charset,
        3,
        HashAlgo::Sha256,
        &HashParams::default(),
        &targets,
    )
    .unwrap();
    assert_eq!(hash_count, 8);
    assert_eq!(solutions[0].combination, "bab");
    assert_eq!(solutions[0].index, 5);

    let reported = service
        .handle(
            "report_chunk_progress",
            json!({
                "job_id": "job-s1",
                "worker_id": "w1",
                "chunk_id": chunk_id,
                "status": "solved",
                "time_taken": 0.5,
                "solutions": solutions,
            }),
        )
        .await
        .unwrap();
    assert_eq!(reported["success"], true);

    // The monitor loop promotes the job to completed.
    let mut completed = false;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let status = service
            .handle("get_job_status", json!({"job_id": "job-s1"}))
            .await
            .unwrap();
        if status["completed"] == true {
            assert_eq!(status["progress"]["processed"], 8);
            assert_eq!(status["progress"]["pending"], 0);
            completed = true;
            break;
        }
    }
    assert!(completed, "job never reached completion");

    // The completion record lands in gossip metadata.
    let result = ctx
        .registry
        .get_metadata(&NodeId::from("coord-1"), "hash_result_job-s1")
        .expect("completion record published");
    assert_eq!(result["preimage_found"], true);
    assert_eq!(result["solutions"][0]["combination"], "bab");

    // Export carries the solution.
    let exported = service
        .handle("export_results", json!({"job_id": "job-s1", "format": "csv"}))
        .await
        .unwrap();
    let csv = exported["data"].as_str().unwrap();
    assert!(csv.contains("bab"));

    service.cleanup().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_solved_report_is_noop() {
    let (service, ctx) = coordinator_harness().await;
    ctx.registry.merge(worker_record("w1"));

    let target = hex::encode(
        compute_digest("zzz", HashAlgo::Sha256, &HashParams::default()).unwrap(),
    );
    service
        .handle(
            "create_job",
            json!({
                "job_id": "job-dup",
                "charset": "ab",
                "length": 3,
                "hash_algo": "sha256",
                "target_hashes": [target],
            }),
        )
        .await
        .unwrap();

    let chunks = published_chunks(&ctx, "job-dup");
    let chunk_id = chunks[0].0;
    let report = json!({
        "job_id": "job-dup",
        "worker_id": "w1",
        "chunk_id": chunk_id,
        "status": "solved",
        "time_taken": 1.0,
    });
    service.handle("report_chunk_progress", report.clone()).await.unwrap();
    let first = service
        .handle("get_job_status", json!({"job_id": "job-dup"}))
        .await
        .unwrap();

    service.handle("report_chunk_progress", report).await.unwrap();
    let second = service
        .handle("get_job_status", json!({"job_id": "job-dup"}))
        .await
        .unwrap();

    assert_eq!(first["progress"]["processed"], second["progress"]["processed"]);
    assert_eq!(first["worker_speeds"], second["worker_speeds"]);

    service.cleanup().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_create_job_validation() {
    let (service, ctx) = coordinator_harness().await;
    ctx.registry.merge(worker_record("w1"));

    // Brute without charset.
    let err = service
        .handle(
            "create_job",
            json!({"job_id": "bad-1", "length": 3, "hash_algo": "sha256", "target_hashes": ["00"]}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind().as_str(), "bad_request");

    // Dictionary without wordlist.
    let err = service
        .handle(
            "create_job",
            json!({"job_id": "bad-2", "mode": "dictionary", "hash_algo": "md5", "target_hashes": ["00"]}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind().as_str(), "bad_request");

    // No targets at all.
    let err = service
        .handle(
            "create_job",
            json!({"job_id": "bad-3", "charset": "ab", "length": 2, "hash_algo": "sha256"}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind().as_str(), "bad_request");

    // Duplicate job id.
    let target = hex::encode(
        compute_digest("x", HashAlgo::Md5, &HashParams::default()).unwrap(),
    );
    let params = json!({
        "job_id": "job-x",
        "charset": "ab",
        "length": 2,
        "hash_algo": "md5",
        "target_hashes": [target],
    });
    service.handle("create_job", params.clone()).await.unwrap();
    let err = service.handle("create_job", params).await.unwrap_err();
    assert_eq!(err.kind().as_str(), "bad_request");

    service.cleanup().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dictionary_job_with_mutations_flow() {
    let (service, ctx) = coordinator_harness().await;
    ctx.registry.merge(worker_record("w1"));

    // S6: wordlist ["pass"], rules c then $1, md5 target of "Pass1".
    let target = hex::encode(
        compute_digest("Pass1", HashAlgo::Md5, &HashParams::default()).unwrap(),
    );
    let created = service
        .handle(
            "create_job",
            json!({
                "job_id": "job-s6",
                "mode": "dictionary",
                "wordlist": ["pass"],
                "mutations": ["c", "$1"],
                "hash_algo": "md5",
                "target_hashes": [target.clone()],
            }),
        )
        .await
        .unwrap();
    assert_eq!(created["total_combinations"], 1);

    let chunks = published_chunks(&ctx, "job-s6");
    assert_eq!(chunks.len(), 1);
    let (chunk_id, start, end, _) = chunks[0].clone();

    // Worker-side expansion of the assigned word range.
    let targets = gridmesh_node::hashcrack::compute::decode_targets(&[target]).unwrap();
    let words = vec!["pass".to_string()];
    let (solutions, _) = gridmesh_node::hashcrack::compute::compute_dict_subchunk(
        &words[start as usize..end as usize],
        &["c".to_string(), "$1".to_string()],
        HashAlgo::Md5,
        &HashParams::default(),
        &targets,
        start,
    )
    .unwrap();
    assert_eq!(solutions.len(), 1);
    assert_eq!(solutions[0].combination, "Pass1");
    assert_eq!(solutions[0].base_word.as_deref(), Some("pass"));

    service
        .handle(
            "report_chunk_progress",
            json!({
                "job_id": "job-s6",
                "worker_id": "w1",
                "chunk_id": chunk_id,
                "status": "solved",
                "time_taken": 0.1,
                "solutions": solutions,
            }),
        )
        .await
        .unwrap();

    let status = service
        .handle("get_job_status", json!({"job_id": "job-s6"}))
        .await
        .unwrap();
    assert_eq!(status["solutions_found"], 1);

    service.cleanup().await.unwrap();
}
