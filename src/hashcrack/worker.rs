//! # Hash Worker
//!
//! Worker side of the hash-cracking workload. Work is observed, not pushed:
//! each tick the worker reads coordinator gossip records, selects chunks
//! assigned to it, and computes them on a CPU-sized thread pool, reporting
//! progress and completion back through its own gossip record. If a chunk
//! it is computing gets reissued to another node, partial results are
//! discarded and the worker returns to discovery.

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatch::Target;
use crate::hashcrack::compute::{
    compute_brute_subchunk, compute_dict_subchunk, decode_targets, HashParams, Solution,
};
use crate::hashcrack::coordinator::{JobManifest, JobMode};
use crate::services::runtime::{MethodSpec, Service, ServiceContext, ServiceManifest};
use crate::types::{FabricError, FabricResult, NodeId, NodeRole};

const SUBCHUNK_MIN: u64 = 1_000;

/// One chunk assignment discovered through gossip.
#[derive(Debug, Clone)]
struct Assignment {
    coordinator: NodeId,
    job_id: String,
    chunk_id: u64,
    start_index: u64,
    end_index: u64,
    priority: u32,
    manifest: JobManifest,
}

/// The `hash_worker` service.
pub struct HashWorkerService {
    ctx: OnceCell<ServiceContext>,
    loop_cancel: OnceCell<CancellationToken>,
    pool: OnceCell<Arc<rayon::ThreadPool>>,
    reported: Arc<Mutex<HashSet<(String, u64)>>>,
}

impl HashWorkerService {
    pub fn new() -> Self {
        Self {
            ctx: OnceCell::new(),
            loop_cancel: OnceCell::new(),
            pool: OnceCell::new(),
            reported: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Scan coordinator records for chunks assigned to this node and pick
    /// the lowest chunk id among the highest priority.
    fn discover(
        ctx: &ServiceContext,
        reported: &Mutex<HashSet<(String, u64)>>,
    ) -> Option<Assignment> {
        let self_id = ctx.node_id.clone();
        let mut best: Option<Assignment> = None;

        for coordinator in ctx.registry.alive_nodes(Some(NodeRole::Coordinator)) {
            for (key, batches) in &coordinator.metadata {
                let Some(job_id) = key.strip_prefix("hash_batches_") else {
                    continue;
                };
                let manifest_key = format!("hash_job_{job_id}");
                let Some(manifest) = coordinator
                    .metadata
                    .get(&manifest_key)
                    .and_then(|v| serde_json::from_value::<JobManifest>(v.clone()).ok())
                else {
                    continue;
                };

                let Some(versions) = batches.as_object() else {
                    continue;
                };
                for batch in versions.values() {
                    let Some(chunks) = batch.get("chunks").and_then(Value::as_object) else {
                        continue;
                    };
                    for (chunk_id_str, chunk) in chunks {
                        let Ok(chunk_id) = chunk_id_str.parse::<u64>() else {
                            continue;
                        };
                        let assigned = chunk
                            .get("assigned_worker")
                            .and_then(Value::as_str)
                            .unwrap_or("");
                        if assigned != self_id.as_str() {
                            continue;
                        }
                        let status = chunk.get("status").and_then(Value::as_str).unwrap_or("");
                        if status == "solved" || status == "timeout" {
                            continue;
                        }
                        if reported.lock().contains(&(job_id.to_string(), chunk_id)) {
                            continue;
                        }

                        let (Some(start), Some(end)) = (
                            chunk.get("start_index").and_then(Value::as_u64),
                            chunk.get("end_index").and_then(Value::as_u64),
                        ) else {
                            continue;
                        };
                        let priority =
                            chunk.get("priority").and_then(Value::as_u64).unwrap_or(1) as u32;

                        let candidate = Assignment {
                            coordinator: coordinator.node_id.clone(),
                            job_id: job_id.to_string(),
                            chunk_id,
                            start_index: start,
                            end_index: end,
                            priority,
                            manifest: manifest.clone(),
                        };
                        let better = match &best {
                            None => true,
                            Some(current) => {
                                candidate.priority > current.priority
                                    || (candidate.priority == current.priority
                                        && candidate.chunk_id < current.chunk_id)
                            }
                        };
                        if better {
                            best = Some(candidate);
                        }
                    }
                }
            }
        }
        best
    }

    /// True when the coordinator still lists this chunk under our node id.
    fn still_ours(ctx: &ServiceContext, assignment: &Assignment) -> bool {
        let Some(batches) = ctx.registry.get_metadata(
            &assignment.coordinator,
            &format!("hash_batches_{}", assignment.job_id),
        ) else {
            // The whole job disappeared; stop working on it.
            return false;
        };
        let Some(versions) = batches.as_object() else {
            return false;
        };
        for batch in versions.values() {
            if let Some(chunk) = batch
                .get("chunks")
                .and_then(|c| c.get(assignment.chunk_id.to_string()))
            {
                let assigned = chunk
                    .get("assigned_worker")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                return assigned == ctx.node_id.as_str();
            }
        }
        false
    }

    fn publish_status(ctx: &ServiceContext, status: Value) {
        ctx.registry.set_self_metadata("hash_worker_status", status);
    }

    /// Compute one assigned chunk. Returns false when the chunk was
    /// reissued mid-flight and partial results were discarded.
    async fn execute(
        ctx: &ServiceContext,
        pool: &Arc<rayon::ThreadPool>,
        reported: &Arc<Mutex<HashSet<(String, u64)>>>,
        assignment: &Assignment,
        cancel: &CancellationToken,
    ) -> FabricResult<bool> {
        let started = Instant::now();
        info!(
            "Starting chunk {} of job {} ([{}, {}), priority {})",
            assignment.chunk_id,
            assignment.job_id,
            assignment.start_index,
            assignment.end_index,
            assignment.priority
        );

        Self::publish_status(
            ctx,
            json!({
                "job_id": assignment.job_id,
                "chunk_id": assignment.chunk_id,
                "status": "working",
                "progress": assignment.start_index,
            }),
        );

        let targets = Arc::new(decode_targets(&assignment.manifest.target_hashes)?);
        let params = Arc::new(assignment.manifest.params.clone());
        let threads = pool.current_num_threads().max(1) as u64;
        let chunk_len = assignment.end_index - assignment.start_index;
        let subchunk = (chunk_len / (threads * 4)).max(SUBCHUNK_MIN);

        let mut solutions: Vec<Solution> = Vec::new();
        let mut hash_count = 0u64;
        let mut cursor = assignment.start_index;
        let mut last_progress_push = Instant::now();
        let progress_throttle =
            Duration::from_millis(ctx.config.hashcrack.progress_update_interval_ms.max(1));

        while cursor < assignment.end_index {
            if cancel.is_cancelled() {
                return Err(FabricError::Cancelled("worker shutting down".into()));
            }
            if !Self::still_ours(ctx, assignment) {
                warn!(
                    "Chunk {} of job {} was reissued, discarding partial results",
                    assignment.chunk_id, assignment.job_id
                );
                return Ok(false);
            }

            // One wave of sub-chunks, one per pool thread.
            let wave_end = (cursor + subchunk * threads).min(assignment.end_index);
            let mut ranges = Vec::new();
            let mut s = cursor;
            while s < wave_end {
                let e = (s + subchunk).min(wave_end);
                ranges.push((s, e));
                s = e;
            }

            let wave_results = {
                let pool = Arc::clone(pool);
                let targets = Arc::clone(&targets);
                let params = Arc::clone(&params);
                let manifest = assignment.manifest.clone();
                tokio::task::spawn_blocking(move || {
                    pool.install(|| run_wave(&manifest, &ranges, &params, &targets))
                })
                .await
                .map_err(|e| FabricError::internal(format!("executor task failed: {e}")))??
            };

            for (mut wave_solutions, wave_count) in wave_results {
                solutions.append(&mut wave_solutions);
                hash_count += wave_count;
            }
            cursor = wave_end;

            if last_progress_push.elapsed() >= progress_throttle {
                last_progress_push = Instant::now();
                Self::publish_status(
                    ctx,
                    json!({
                        "job_id": assignment.job_id,
                        "chunk_id": assignment.chunk_id,
                        "status": "working",
                        "progress": cursor,
                    }),
                );
                ctx.metrics.gauge("current_chunk_progress", cursor as f64);
            }
        }

        let time_taken = started.elapsed().as_secs_f64();
        reported
            .lock()
            .insert((assignment.job_id.clone(), assignment.chunk_id));

        // This single write is the completion signal.
        Self::publish_status(
            ctx,
            json!({
                "job_id": assignment.job_id,
                "chunk_id": assignment.chunk_id,
                "status": "solved",
                "hash_count": hash_count,
                "time_taken": time_taken,
                "solutions": solutions,
            }),
        );

        ctx.metrics.increment("chunks_completed", 1.0);
        ctx.metrics.increment("hashes_computed", hash_count as f64);
        if time_taken > 0.0 {
            ctx.metrics.gauge("hashes_per_second", hash_count as f64 / time_taken);
        }
        info!(
            "Completed chunk {} of job {}: {} hashes in {:.2}s, {} solutions",
            assignment.chunk_id,
            assignment.job_id,
            hash_count,
            time_taken,
            solutions.len()
        );

        if !solutions.is_empty() {
            // Best-effort short path; gossip already carries the report.
            let outcome = ctx
                .dispatcher
                .call(
                    "hash_coordinator",
                    "report_solution",
                    json!({
                        "job_id": assignment.job_id,
                        "chunk_id": assignment.chunk_id,
                        "worker_id": ctx.node_id,
                        "solutions": solutions,
                    }),
                    Target::Node(assignment.coordinator.clone()),
                    cancel,
                )
                .await;
            if let Err(err) = outcome {
                debug!("Best-effort solution report failed: {}", err);
            }
        }

        Ok(true)
    }

    async fn work_loop(
        ctx: ServiceContext,
        cancel: CancellationToken,
        pool: Arc<rayon::ThreadPool>,
        reported: Arc<Mutex<HashSet<(String, u64)>>>,
    ) {
        let mut interval = tokio::time::interval(Duration::from_millis(
            ctx.config.hashcrack.discovery_interval_ms.max(10),
        ));

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = cancel.cancelled() => {
                    info!("Hash worker loop stopped");
                    break;
                }
            }

            let Some(assignment) = Self::discover(&ctx, &reported) else {
                continue;
            };
            match Self::execute(&ctx, &pool, &reported, &assignment, &cancel).await {
                Ok(true) => {}
                Ok(false) => {
                    // Reissued chunk; rediscover on the next tick.
                }
                Err(FabricError::Cancelled(_)) => break,
                Err(err) => {
                    error!(
                        "Chunk {} of job {} failed: {}",
                        assignment.chunk_id, assignment.job_id, err
                    );
                    reported
                        .lock()
                        .insert((assignment.job_id.clone(), assignment.chunk_id));
                    Self::publish_status(
                        &ctx,
                        json!({
                            "job_id": assignment.job_id,
                            "chunk_id": assignment.chunk_id,
                            "status": "failed",
                            "error": err.to_string(),
                        }),
                    );
                }
            }
        }
    }

    fn worker_status(&self) -> Value {
        let ctx = self.ctx.get();
        let status = ctx
            .and_then(|c| c.registry.get_metadata(c.registry.self_id(), "hash_worker_status"))
            .unwrap_or(Value::Null);
        json!({
            "success": true,
            "current": status,
            "completed_chunks": self.reported.lock().len(),
        })
    }
}

/// Run one wave of sub-chunk ranges on the rayon pool.
fn run_wave(
    manifest: &JobManifest,
    ranges: &[(u64, u64)],
    params: &HashParams,
    targets: &HashSet<Vec<u8>>,
) -> FabricResult<Vec<(Vec<Solution>, u64)>> {
    match manifest.mode {
        JobMode::Brute => {
            let charset: Vec<char> = manifest
                .charset
                .as_deref()
                .ok_or_else(|| FabricError::bad_request("brute job without charset"))?
                .chars()
                .collect();
            let length = manifest
                .length
                .ok_or_else(|| FabricError::bad_request("brute job without length"))?;
            if charset.len() < 2 || length == 0 {
                return Err(FabricError::bad_request("malformed brute job manifest"));
            }
            ranges
                .par_iter()
                .map(|(start, end)| {
                    compute_brute_subchunk(
                        *start,
                        *end,
                        &charset,
                        length,
                        manifest.hash_algo,
                        params,
                        targets,
                    )
                })
                .collect()
        }
        JobMode::Dictionary => {
            let wordlist = manifest
                .wordlist
                .as_ref()
                .ok_or_else(|| FabricError::bad_request("dictionary job without wordlist"))?;
            let mutations = manifest.mutations.clone().unwrap_or_default();
            ranges
                .par_iter()
                .map(|(start, end)| {
                    let start_idx = (*start as usize).min(wordlist.len());
                    let end_idx = (*end as usize).min(wordlist.len());
                    compute_dict_subchunk(
                        &wordlist[start_idx..end_idx],
                        &mutations,
                        manifest.hash_algo,
                        params,
                        targets,
                        *start,
                    )
                })
                .collect()
        }
    }
}

impl Default for HashWorkerService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Service for HashWorkerService {
    fn name(&self) -> &'static str {
        "hash_worker"
    }

    fn manifest(&self) -> ServiceManifest {
        ServiceManifest {
            version: "1.0.0".to_string(),
            description: "Distributed hash-cracking worker".to_string(),
            methods: vec![MethodSpec::new("get_worker_status")
                .describe("Current chunk and completion counters")
                .idempotent()],
        }
    }

    async fn initialize(&self, ctx: ServiceContext) -> anyhow::Result<()> {
        if ctx.role != NodeRole::Worker {
            info!("Hash worker disabled on coordinator node");
            let _ = self.ctx.set(ctx);
            return Ok(());
        }

        // One thread is left for the supervising tasks.
        let threads = num_cpus::get().saturating_sub(1).max(1);
        let pool = Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("hash-worker-{i}"))
                .build()?,
        );
        let _ = self.pool.set(Arc::clone(&pool));

        let cancel = ctx.cancel.child_token();
        let _ = self.loop_cancel.set(cancel.clone());
        let _ = self.ctx.set(ctx.clone());

        tokio::spawn(Self::work_loop(ctx, cancel, pool, Arc::clone(&self.reported)));

        info!("Hash worker initialized with {} compute threads", threads);
        Ok(())
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        if let Some(cancel) = self.loop_cancel.get() {
            cancel.cancel();
        }
        Ok(())
    }

    async fn handle(&self, method: &str, _params: Value) -> FabricResult<Value> {
        match method {
            "get_worker_status" => Ok(self.worker_status()),
            other => Err(FabricError::MethodNotFound(format!("hash_worker/{other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GossipConfig, NodeConfig};
    use crate::gossip::registry::{GossipRegistry, NodeRecord};
    use crate::hashcrack::compute::HashAlgo;

    fn manifest_value() -> Value {
        serde_json::to_value(JobManifest {
            job_id: "job1".to_string(),
            mode: JobMode::Brute,
            hash_algo: HashAlgo::Sha256,
            target_hashes: vec!["00".to_string()],
            charset: Some("ab".to_string()),
            length: Some(3),
            wordlist: None,
            mutations: None,
            params: HashParams::default(),
            base_chunk_size: 1_000_000,
            created_at: 0,
        })
        .unwrap()
    }

    fn batches_value(chunks: &[(u64, &str, u64, u64, &str, u64)]) -> Value {
        // (chunk_id, worker, start, end, status, priority)
        let mut chunk_map = serde_json::Map::new();
        for (id, worker, start, end, status, priority) in chunks {
            chunk_map.insert(
                id.to_string(),
                json!({
                    "assigned_worker": worker,
                    "start_index": start,
                    "end_index": end,
                    "chunk_size": end - start,
                    "status": status,
                    "priority": priority,
                }),
            );
        }
        json!({
            "1": {
                "chunks": chunk_map,
                "created_at": 0,
                "is_recovery": false,
            }
        })
    }

    fn test_ctx() -> ServiceContext {
        let config = Arc::new(NodeConfig::new("w1", NodeRole::Worker, 9100));
        let registry = Arc::new(GossipRegistry::new(
            NodeRecord::new(NodeId::from("w1"), NodeRole::Worker, config.endpoint()),
            GossipConfig::default(),
        ));
        let runtime = Arc::new(crate::services::runtime::ServiceRuntime::new(
            Arc::clone(&config),
            Arc::clone(&registry),
        ));
        let client = Arc::new(
            crate::transport::client::TransportClient::new(Default::default()).unwrap(),
        );
        let dispatcher = Arc::new(crate::dispatch::Dispatcher::new(
            runtime,
            Arc::clone(&registry),
            client,
            Arc::clone(&config),
        ));
        ServiceContext {
            node_id: NodeId::from("w1"),
            role: NodeRole::Worker,
            config,
            registry,
            dispatcher,
            metrics: crate::services::metrics::MetricsState::new("hash_worker"),
            cancel: CancellationToken::new(),
        }
    }

    fn seed_coordinator(ctx: &ServiceContext, chunks: &[(u64, &str, u64, u64, &str, u64)]) {
        let mut record = NodeRecord::new(
            NodeId::from("coord"),
            NodeRole::Coordinator,
            "http://127.0.0.1:9000".to_string(),
        );
        record
            .metadata
            .insert("hash_job_job1".to_string(), manifest_value());
        record
            .metadata
            .insert("hash_batches_job1".to_string(), batches_value(chunks));
        record.heartbeat_version = 10;
        ctx.registry.merge(record);
    }

    #[test]
    fn test_discovery_picks_highest_priority_then_lowest_id() {
        let ctx = test_ctx();
        seed_coordinator(
            &ctx,
            &[
                (10_001, "w1", 0, 100, "assigned", 1),
                (10_000, "w1", 100, 200, "assigned", 1),
                (20_000, "w1", 200, 300, "recovery", 5),
                (10_002, "other", 300, 400, "assigned", 9),
            ],
        );

        let reported = Mutex::new(HashSet::new());
        let assignment = HashWorkerService::discover(&ctx, &reported).unwrap();
        assert_eq!(assignment.chunk_id, 20_000);
        assert_eq!(assignment.priority, 5);
    }

    #[test]
    fn test_discovery_skips_solved_and_reported() {
        let ctx = test_ctx();
        seed_coordinator(
            &ctx,
            &[
                (10_000, "w1", 0, 100, "solved", 1),
                (10_001, "w1", 100, 200, "assigned", 1),
            ],
        );

        let reported = Mutex::new(HashSet::new());
        reported.lock().insert(("job1".to_string(), 10_001));
        assert!(HashWorkerService::discover(&ctx, &reported).is_none());
    }

    #[test]
    fn test_still_ours_detects_reissue() {
        let ctx = test_ctx();
        seed_coordinator(&ctx, &[(10_000, "w1", 0, 100, "working", 1)]);

        let reported = Mutex::new(HashSet::new());
        let assignment = HashWorkerService::discover(&ctx, &reported).unwrap();
        assert!(HashWorkerService::still_ours(&ctx, &assignment));

        // Coordinator reissues the chunk to another worker.
        seed_coordinator(&ctx, &[(10_000, "w2", 0, 100, "recovery", 5)]);
        assert!(!HashWorkerService::still_ours(&ctx, &assignment));
    }

    #[tokio::test]
    async fn test_execute_solves_minimal_chunk() {
        let ctx = test_ctx();
        let target = hex::encode(
            crate::hashcrack::compute::compute_digest(
                "bab",
                HashAlgo::Sha256,
                &HashParams::default(),
            )
            .unwrap(),
        );

        let mut record = NodeRecord::new(
            NodeId::from("coord"),
            NodeRole::Coordinator,
            "http://127.0.0.1:9000".to_string(),
        );
        let mut manifest: JobManifest = serde_json::from_value(manifest_value()).unwrap();
        manifest.target_hashes = vec![target];
        record.metadata.insert(
            "hash_job_job1".to_string(),
            serde_json::to_value(&manifest).unwrap(),
        );
        record.metadata.insert(
            "hash_batches_job1".to_string(),
            batches_value(&[(10_000, "w1", 0, 8, "assigned", 1)]),
        );
        ctx.registry.merge(record);

        let pool = Arc::new(rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap());
        let reported = Arc::new(Mutex::new(HashSet::new()));
        let assignment = HashWorkerService::discover(&ctx, &reported).unwrap();

        let cancel = CancellationToken::new();
        let completed = HashWorkerService::execute(&ctx, &pool, &reported, &assignment, &cancel)
            .await
            .unwrap();
        assert!(completed);

        let status = ctx
            .registry
            .get_metadata(&NodeId::from("w1"), "hash_worker_status")
            .unwrap();
        assert_eq!(status["status"], "solved");
        assert_eq!(status["hash_count"], 8);
        let solutions: Vec<Solution> =
            serde_json::from_value(status["solutions"].clone()).unwrap();
        assert_eq!(solutions.len(), 1);
        assert_eq!(solutions[0].combination, "bab");
        assert_eq!(solutions[0].index, 5);
    }
}
