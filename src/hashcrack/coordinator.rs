//! # Hash Coordinator
//!
//! Coordinator side of the distributed hash-cracking workload: generates
//! chunk batches, adapts chunk sizes to observed worker throughput, assigns
//! work through its own gossip record, ingests worker progress, recovers
//! orphaned chunks, and aggregates discovered solutions.

use parking_lot::Mutex;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::hashcrack::compute::{HashAlgo, HashParams, Solution};
use crate::hashcrack::keyspace::total_combinations;
use crate::services::runtime::{MethodSpec, Service, ServiceContext, ServiceManifest};
use crate::types::{FabricError, FabricResult, NodeId, NodeRole};

const SPEED_HISTORY: usize = 10;
const CHUNK_GRANULE: u64 = 100_000;
const CHUNK_ID_STRIDE: u64 = 10_000;
const RECOVERY_PRIORITY: u32 = 5;

/// Job execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMode {
    Brute,
    Dictionary,
}

/// Lifecycle of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Assigned,
    Working,
    Solved,
    Recovery,
    Timeout,
}

/// A contiguous half-open index interval assigned to one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub chunk_id: u64,
    pub start_index: u64,
    pub end_index: u64,
    pub chunk_size: u64,
    pub assigned_worker: NodeId,
    pub status: ChunkStatus,
    pub priority: u32,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_progress: Option<u64>,
}

/// A versioned set of chunks emitted together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchInfo {
    pub version: u64,
    pub chunks: Vec<ChunkInfo>,
    pub created_at: i64,
    pub is_recovery: bool,
}

/// Job manifest published into gossip under `hash_job_<job_id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobManifest {
    pub job_id: String,
    pub mode: JobMode,
    pub hash_algo: HashAlgo,
    pub target_hashes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wordlist: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutations: Option<Vec<String>>,
    #[serde(flatten)]
    pub params: HashParams,
    pub base_chunk_size: u64,
    pub created_at: i64,
}

/// One speed observation `(chunk_size / time_taken)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeedSample {
    pub chunk_size: u64,
    pub time_taken: f64,
    pub hash_rate: f64,
    pub timestamp: i64,
}

/// Cluster-wide speed statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStats {
    pub avg_speed: f64,
    pub median_speed: f64,
    pub total_speed: f64,
    pub min_speed: f64,
    pub max_speed: f64,
    pub std_dev: f64,
}

/// Tracks per-worker throughput and derives adaptive chunk sizes.
#[derive(Debug)]
pub struct PerformanceAnalyzer {
    base_chunk_size: u64,
    worker_speeds: HashMap<NodeId, f64>,
    worker_history: HashMap<NodeId, VecDeque<SpeedSample>>,
}

impl PerformanceAnalyzer {
    pub fn new(base_chunk_size: u64) -> Self {
        Self {
            base_chunk_size,
            worker_speeds: HashMap::new(),
            worker_history: HashMap::new(),
        }
    }

    /// Fold in one `(chunk_size, time_taken)` sample.
    pub fn update_worker_performance(&mut self, worker: &NodeId, chunk_size: u64, time_taken: f64) {
        if time_taken <= 0.0 {
            return;
        }
        let hash_rate = chunk_size as f64 / time_taken;
        self.worker_speeds.insert(worker.clone(), hash_rate);

        let history = self.worker_history.entry(worker.clone()).or_default();
        history.push_back(SpeedSample {
            chunk_size,
            time_taken,
            hash_rate,
            timestamp: chrono::Utc::now().timestamp(),
        });
        while history.len() > SPEED_HISTORY {
            history.pop_front();
        }
    }

    pub fn worker_speeds(&self) -> &HashMap<NodeId, f64> {
        &self.worker_speeds
    }

    pub fn cluster_stats(&self) -> ClusterStats {
        if self.worker_speeds.is_empty() {
            return ClusterStats {
                avg_speed: 0.0,
                median_speed: 0.0,
                total_speed: 0.0,
                min_speed: 0.0,
                max_speed: 0.0,
                std_dev: 0.0,
            };
        }

        let mut speeds: Vec<f64> = self.worker_speeds.values().copied().collect();
        speeds.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let total: f64 = speeds.iter().sum();
        let avg = total / speeds.len() as f64;
        let median = if speeds.len() % 2 == 1 {
            speeds[speeds.len() / 2]
        } else {
            (speeds[speeds.len() / 2 - 1] + speeds[speeds.len() / 2]) / 2.0
        };
        let variance = if speeds.len() > 1 {
            speeds.iter().map(|s| (s - avg).powi(2)).sum::<f64>() / (speeds.len() - 1) as f64
        } else {
            0.0
        };

        ClusterStats {
            avg_speed: avg,
            median_speed: median,
            total_speed: total,
            min_speed: speeds[0],
            max_speed: speeds[speeds.len() - 1],
            std_dev: variance.sqrt(),
        }
    }

    /// Adaptive chunk size: the worker's speed ratio against the cluster
    /// average, clamped to [0.5, 2.0], scaled onto the base size and
    /// rounded down to the 100k granule with a 100k floor.
    pub fn adaptive_chunk_size(&self, worker: &NodeId) -> u64 {
        let worker_speed = self.worker_speeds.get(worker).copied().unwrap_or(0.0);
        if worker_speed == 0.0 {
            return self.base_chunk_size;
        }

        let avg_speed = self.cluster_stats().avg_speed;
        if avg_speed == 0.0 {
            return self.base_chunk_size;
        }

        let speed_ratio = (worker_speed / avg_speed).clamp(0.5, 2.0);
        let raw = (self.base_chunk_size as f64 * speed_ratio) as u64;
        let rounded = (raw / CHUNK_GRANULE) * CHUNK_GRANULE;
        rounded.max(CHUNK_GRANULE)
    }
}

/// A chunk the orphan scan flagged for recovery.
#[derive(Debug, Clone)]
pub struct OrphanChunk {
    pub chunk_id: u64,
    pub start_index: u64,
    pub end_index: u64,
    pub progress: Option<u64>,
    pub stuck_worker: NodeId,
    pub age_secs: i64,
}

/// Per-job progress snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProgress {
    pub total_combinations: u64,
    pub processed: u64,
    pub in_progress: u64,
    pub pending: u64,
    pub progress_percentage: f64,
    pub eta_seconds: f64,
    pub current_version: u64,
    pub completed_batches: usize,
    pub active_batches: usize,
}

/// Single-writer generator state for one job: the next unassigned index,
/// the active batch pipeline, and the performance map.
pub struct ChunkGenerator {
    total_combinations: u64,
    base_chunk_size: u64,
    lookahead_batches: usize,
    batch_retention: usize,

    current_version: u64,
    current_global_index: u64,
    generated_batches: BTreeMap<u64, BatchInfo>,
    completed_batches: BTreeSet<u64>,

    pub performance: PerformanceAnalyzer,
}

impl ChunkGenerator {
    pub fn new(
        total_combinations: u64,
        base_chunk_size: u64,
        lookahead_batches: usize,
        batch_retention: usize,
    ) -> Self {
        Self {
            total_combinations,
            base_chunk_size: base_chunk_size.max(1),
            lookahead_batches,
            batch_retention,
            current_version: 0,
            current_global_index: 0,
            generated_batches: BTreeMap::new(),
            completed_batches: BTreeSet::new(),
            performance: PerformanceAnalyzer::new(base_chunk_size.max(1)),
        }
    }

    pub fn total_combinations(&self) -> u64 {
        self.total_combinations
    }

    pub fn current_global_index(&self) -> u64 {
        self.current_global_index
    }

    pub fn current_version(&self) -> u64 {
        self.current_version
    }

    pub fn batches(&self) -> &BTreeMap<u64, BatchInfo> {
        &self.generated_batches
    }

    fn active_depth(&self) -> usize {
        self.generated_batches.len() - self.completed_batches.len()
    }

    /// Keep the active pipeline `lookahead_batches` deep. Returns true when
    /// any batch was generated.
    pub fn ensure_lookahead(&mut self, active_workers: &[NodeId]) -> bool {
        let mut generated = false;
        while self.active_depth() < self.lookahead_batches
            && self.current_global_index < self.total_combinations
        {
            if self.generate_next_batch(active_workers).is_none() {
                break;
            }
            generated = true;
        }
        generated
    }

    fn generate_next_batch(&mut self, active_workers: &[NodeId]) -> Option<u64> {
        if active_workers.is_empty() {
            return None;
        }

        self.current_version += 1;
        let version = self.current_version;
        let now = chrono::Utc::now().timestamp();
        let mut chunks = Vec::new();

        for worker in active_workers {
            if self.current_global_index >= self.total_combinations {
                break;
            }
            let mut chunk_size = self.performance.adaptive_chunk_size(worker);
            let remaining = self.total_combinations - self.current_global_index;
            chunk_size = chunk_size.min(remaining);

            chunks.push(ChunkInfo {
                chunk_id: version * CHUNK_ID_STRIDE + chunks.len() as u64,
                start_index: self.current_global_index,
                end_index: self.current_global_index + chunk_size,
                chunk_size,
                assigned_worker: worker.clone(),
                status: ChunkStatus::Assigned,
                priority: 1,
                created_at: now,
                reported_progress: None,
            });
            self.current_global_index += chunk_size;
        }

        if chunks.is_empty() {
            self.current_version -= 1;
            return None;
        }

        self.generated_batches.insert(
            version,
            BatchInfo { version, chunks, created_at: now, is_recovery: false },
        );
        Some(version)
    }

    /// Re-issue orphaned intervals as a recovery batch, round-robin over the
    /// current alive workers at elevated priority. The original chunks are
    /// parked in `timeout`.
    pub fn recover_orphans(
        &mut self,
        orphans: &[OrphanChunk],
        active_workers: &[NodeId],
    ) -> Option<u64> {
        if orphans.is_empty() || active_workers.is_empty() {
            return None;
        }

        self.current_version += 1;
        let version = self.current_version;
        let now = chrono::Utc::now().timestamp();
        let mut chunks = Vec::new();

        for orphan in orphans {
            let start = match orphan.progress {
                Some(progress) => (progress + 1).max(orphan.start_index),
                None => orphan.start_index,
            };
            if start >= orphan.end_index {
                // The worker had actually finished the range.
                self.set_chunk_status(orphan.chunk_id, ChunkStatus::Solved);
                continue;
            }

            let worker = &active_workers[chunks.len() % active_workers.len()];
            chunks.push(ChunkInfo {
                chunk_id: version * CHUNK_ID_STRIDE + chunks.len() as u64,
                start_index: start,
                end_index: orphan.end_index,
                chunk_size: orphan.end_index - start,
                assigned_worker: worker.clone(),
                status: ChunkStatus::Recovery,
                priority: RECOVERY_PRIORITY,
                created_at: now,
                reported_progress: None,
            });
            self.set_chunk_status(orphan.chunk_id, ChunkStatus::Timeout);
        }

        if chunks.is_empty() {
            self.current_version -= 1;
            return None;
        }

        self.generated_batches.insert(
            version,
            BatchInfo { version, chunks, created_at: now, is_recovery: true },
        );
        Some(version)
    }

    fn set_chunk_status(&mut self, chunk_id: u64, status: ChunkStatus) {
        for batch in self.generated_batches.values_mut() {
            if let Some(chunk) = batch.chunks.iter_mut().find(|c| c.chunk_id == chunk_id) {
                chunk.status = status;
                return;
            }
        }
    }

    #[cfg(test)]
    fn find_chunk(&self, chunk_id: u64) -> Option<&ChunkInfo> {
        self.generated_batches
            .values()
            .flat_map(|b| b.chunks.iter())
            .find(|c| c.chunk_id == chunk_id)
    }

    /// Mark a chunk solved. Returns its size the first time; repeated
    /// reports for the same chunk are a no-op.
    pub fn mark_chunk_solved(&mut self, chunk_id: u64) -> Option<u64> {
        for batch in self.generated_batches.values_mut() {
            if let Some(chunk) = batch.chunks.iter_mut().find(|c| c.chunk_id == chunk_id) {
                if chunk.status == ChunkStatus::Solved {
                    return None;
                }
                let old = chunk.status;
                chunk.status = ChunkStatus::Solved;
                debug!("Chunk {} status: {:?} -> solved", chunk_id, old);
                return Some(chunk.chunk_size);
            }
        }
        warn!("Chunk {} not found in any batch", chunk_id);
        None
    }

    /// Record a worker's in-flight progress and move the chunk to `working`.
    pub fn chunk_progress(&mut self, chunk_id: u64, progress: Option<u64>) {
        for batch in self.generated_batches.values_mut() {
            if let Some(chunk) = batch.chunks.iter_mut().find(|c| c.chunk_id == chunk_id) {
                if matches!(chunk.status, ChunkStatus::Assigned | ChunkStatus::Recovery) {
                    chunk.status = ChunkStatus::Working;
                }
                if let Some(progress) = progress {
                    chunk.reported_progress = Some(progress);
                }
                return;
            }
        }
    }

    /// Park a chunk in `timeout` so the orphan loop re-issues its range.
    pub fn chunk_failed(&mut self, chunk_id: u64) {
        self.set_chunk_status(chunk_id, ChunkStatus::Timeout);
    }

    /// A working chunk past the age threshold is orphaned only when its
    /// worker has since solved a chunk with a higher id, which means the
    /// older one was skipped or lost.
    pub fn detect_orphans(&self, timeout_secs: u64) -> Vec<OrphanChunk> {
        let now = chrono::Utc::now().timestamp();
        let mut orphans = Vec::new();

        for batch in self.generated_batches.values() {
            for chunk in &batch.chunks {
                if chunk.status != ChunkStatus::Working {
                    continue;
                }
                let age = now - chunk.created_at;
                if age <= timeout_secs as i64 {
                    continue;
                }

                let has_newer_solved = self
                    .generated_batches
                    .values()
                    .flat_map(|b| b.chunks.iter())
                    .any(|c| {
                        c.assigned_worker == chunk.assigned_worker
                            && c.chunk_id > chunk.chunk_id
                            && c.status == ChunkStatus::Solved
                    });
                if has_newer_solved {
                    orphans.push(OrphanChunk {
                        chunk_id: chunk.chunk_id,
                        start_index: chunk.start_index,
                        end_index: chunk.end_index,
                        progress: chunk.reported_progress,
                        stuck_worker: chunk.assigned_worker.clone(),
                        age_secs: age,
                    });
                }
            }
        }
        orphans
    }

    /// Promote finished batches to completed and trim the retention
    /// window. A timed-out chunk counts as finished once solved chunks
    /// cover its unprocessed interval.
    pub fn mark_completed_batches(&mut self) {
        let solved: Vec<(u64, u64)> = self
            .generated_batches
            .values()
            .flat_map(|b| b.chunks.iter())
            .filter(|c| c.status == ChunkStatus::Solved)
            .map(|c| (c.start_index, c.end_index))
            .collect();

        let newly_completed: Vec<u64> = self
            .generated_batches
            .iter()
            .filter(|(version, batch)| {
                !self.completed_batches.contains(version)
                    && batch.chunks.iter().all(|c| match c.status {
                        ChunkStatus::Solved => true,
                        ChunkStatus::Timeout => {
                            let start =
                                c.reported_progress.map(|p| p + 1).unwrap_or(c.start_index);
                            covered(start.max(c.start_index), c.end_index, &solved)
                        }
                        _ => false,
                    })
            })
            .map(|(version, _)| *version)
            .collect();
        for version in newly_completed {
            self.completed_batches.insert(version);
        }

        if self.completed_batches.len() > self.batch_retention {
            let excess = self.completed_batches.len() - self.batch_retention;
            let stale: Vec<u64> = self.completed_batches.iter().take(excess).copied().collect();
            for version in stale {
                self.generated_batches.remove(&version);
                self.completed_batches.remove(&version);
            }
        }
    }

    pub fn progress(&self) -> JobProgress {
        let mut processed = 0u64;
        let mut in_progress = 0u64;

        for batch in self.generated_batches.values() {
            for chunk in &batch.chunks {
                match chunk.status {
                    ChunkStatus::Solved => processed += chunk.chunk_size,
                    ChunkStatus::Working | ChunkStatus::Assigned | ChunkStatus::Recovery => {
                        in_progress += chunk.chunk_size
                    }
                    ChunkStatus::Timeout => {}
                }
            }
        }

        let progress_pct = if self.total_combinations > 0 {
            processed as f64 / self.total_combinations as f64 * 100.0
        } else {
            0.0
        };
        let total_rate = self.performance.cluster_stats().total_speed;
        let remaining = self.total_combinations.saturating_sub(processed);
        let eta = if total_rate > 0.0 { remaining as f64 / total_rate } else { 0.0 };

        JobProgress {
            total_combinations: self.total_combinations,
            processed,
            in_progress,
            pending: remaining,
            progress_percentage: progress_pct,
            eta_seconds: eta,
            current_version: self.current_version,
            completed_batches: self.completed_batches.len(),
            active_batches: self.active_depth(),
        }
    }

    /// Complete when the index is exhausted, nothing is live, and every
    /// timed-out interval is covered by solved recovery chunks.
    pub fn is_complete(&self) -> bool {
        if self.current_global_index < self.total_combinations {
            return false;
        }

        let chunks: Vec<&ChunkInfo> = self
            .generated_batches
            .values()
            .flat_map(|b| b.chunks.iter())
            .collect();

        if chunks.iter().any(|c| {
            matches!(
                c.status,
                ChunkStatus::Assigned | ChunkStatus::Working | ChunkStatus::Recovery
            )
        }) {
            return false;
        }

        let solved: Vec<(u64, u64)> = chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Solved)
            .map(|c| (c.start_index, c.end_index))
            .collect();

        chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Timeout)
            .all(|c| {
                let uncovered_start = c.reported_progress.map(|p| p + 1).unwrap_or(c.start_index);
                covered(uncovered_start.max(c.start_index), c.end_index, &solved)
            })
    }

    /// The gossip publication payload: every non-completed batch as
    /// `{version -> {chunks: {chunk_id -> chunk}, created_at, is_recovery}}`.
    pub fn active_batches_value(&self) -> Value {
        let mut batches = serde_json::Map::new();
        for (version, batch) in &self.generated_batches {
            if self.completed_batches.contains(version) {
                continue;
            }
            let chunks: serde_json::Map<String, Value> = batch
                .chunks
                .iter()
                .map(|chunk| {
                    (
                        chunk.chunk_id.to_string(),
                        json!({
                            "assigned_worker": chunk.assigned_worker,
                            "start_index": chunk.start_index,
                            "end_index": chunk.end_index,
                            "chunk_size": chunk.chunk_size,
                            "status": chunk.status,
                            "priority": chunk.priority,
                        }),
                    )
                })
                .collect();
            batches.insert(
                version.to_string(),
                json!({
                    "chunks": chunks,
                    "created_at": batch.created_at,
                    "is_recovery": batch.is_recovery,
                }),
            );
        }
        Value::Object(batches)
    }
}

/// Interval coverage check against a set of solved intervals.
fn covered(start: u64, end: u64, solved: &[(u64, u64)]) -> bool {
    if start >= end {
        return true;
    }
    let mut cursor = start;
    let mut intervals: Vec<(u64, u64)> = solved.to_vec();
    intervals.sort_unstable();
    for (s, e) in intervals {
        if s <= cursor && e > cursor {
            cursor = e;
            if cursor >= end {
                return true;
            }
        }
    }
    cursor >= end
}

struct JobState {
    manifest: JobManifest,
    generator: ChunkGenerator,
    solutions: Vec<Solution>,
    completed: bool,
}

#[derive(Debug, Deserialize)]
struct CreateJobParams {
    job_id: String,
    #[serde(default = "default_mode")]
    mode: JobMode,
    #[serde(default)]
    charset: Option<String>,
    #[serde(default)]
    length: Option<usize>,
    #[serde(default)]
    wordlist: Option<Vec<String>>,
    #[serde(default)]
    mutations: Option<Vec<String>>,
    hash_algo: HashAlgo,
    #[serde(default)]
    target_hash: Option<String>,
    #[serde(default)]
    target_hashes: Option<Vec<String>>,
    #[serde(default)]
    ssid: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    output_length: Option<usize>,
    #[serde(default)]
    base_chunk_size: Option<u64>,
}

fn default_mode() -> JobMode {
    JobMode::Brute
}

#[derive(Debug, Deserialize)]
struct JobIdParams {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct ReportSolutionParams {
    job_id: String,
    chunk_id: u64,
    worker_id: NodeId,
    solutions: Vec<Solution>,
}

#[derive(Debug, Deserialize)]
struct ReportProgressParams {
    job_id: String,
    worker_id: NodeId,
    chunk_id: u64,
    status: String,
    #[serde(default)]
    progress: Option<u64>,
    #[serde(default)]
    time_taken: Option<f64>,
    #[serde(default)]
    solutions: Option<Vec<Solution>>,
}

#[derive(Debug, Deserialize)]
struct ExportParams {
    job_id: String,
    #[serde(default = "default_export_format")]
    format: String,
    #[serde(default)]
    output_file: Option<String>,
}

fn default_export_format() -> String {
    "json".to_string()
}

/// The `hash_coordinator` service.
pub struct HashCoordinatorService {
    jobs: Arc<Mutex<HashMap<String, JobState>>>,
    ctx: OnceCell<ServiceContext>,
    loop_cancel: OnceCell<CancellationToken>,
}

impl HashCoordinatorService {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            ctx: OnceCell::new(),
            loop_cancel: OnceCell::new(),
        }
    }

    fn ctx(&self) -> FabricResult<&ServiceContext> {
        self.ctx
            .get()
            .ok_or_else(|| FabricError::ServiceUnavailable("hash_coordinator not initialized".into()))
    }

    /// Alive workers advertising a running `hash_worker`, in stable order.
    fn active_workers(ctx: &ServiceContext) -> Vec<NodeId> {
        let mut workers: Vec<NodeId> = ctx
            .registry
            .neighbors_with_service("hash_worker")
            .into_iter()
            .filter(|id| {
                ctx.registry
                    .get(id)
                    .map(|rec| rec.role == NodeRole::Worker)
                    .unwrap_or(false)
            })
            .collect();
        workers.sort();
        workers
    }

    fn publish_job(ctx: &ServiceContext, manifest: &JobManifest) {
        let key = format!("hash_job_{}", manifest.job_id);
        if let Ok(value) = serde_json::to_value(manifest) {
            ctx.registry.set_self_metadata(&key, value);
        }
    }

    fn publish_batches(ctx: &ServiceContext, job_id: &str, generator: &ChunkGenerator) {
        let key = format!("hash_batches_{job_id}");
        ctx.registry.set_self_metadata(&key, generator.active_batches_value());
    }

    fn create_job(&self, params: CreateJobParams) -> FabricResult<Value> {
        let ctx = self.ctx()?;

        let mut target_hashes = params.target_hashes.unwrap_or_default();
        if let Some(single) = params.target_hash {
            target_hashes.push(single);
        }
        if target_hashes.is_empty() {
            return Err(FabricError::bad_request("at least one target hash is required"));
        }
        crate::hashcrack::compute::decode_targets(&target_hashes)?;

        let base_chunk_size = params
            .base_chunk_size
            .unwrap_or(ctx.config.hashcrack.base_chunk_size);
        let lookahead = ctx.config.hashcrack.lookahead_batches;
        let retention = ctx.config.hashcrack.batch_retention;

        let total = match params.mode {
            JobMode::Brute => {
                let charset = params
                    .charset
                    .as_deref()
                    .ok_or_else(|| FabricError::bad_request("charset required for brute mode"))?;
                let length = params
                    .length
                    .ok_or_else(|| FabricError::bad_request("length required for brute mode"))?;
                total_combinations(charset.chars().count(), length)?
            }
            JobMode::Dictionary => {
                let wordlist = params
                    .wordlist
                    .as_ref()
                    .filter(|w| !w.is_empty())
                    .ok_or_else(|| FabricError::bad_request("wordlist required for dictionary mode"))?;
                wordlist.len() as u64
            }
        };

        if params.hash_algo == HashAlgo::Wpa && params.ssid.is_none() {
            return Err(FabricError::bad_request("ssid required for wpa jobs"));
        }

        let manifest = JobManifest {
            job_id: params.job_id.clone(),
            mode: params.mode,
            hash_algo: params.hash_algo,
            target_hashes,
            charset: params.charset,
            length: params.length,
            wordlist: params.wordlist,
            mutations: params.mutations,
            params: HashParams {
                ssid: params.ssid,
                username: params.username,
                domain: params.domain,
                output_length: params.output_length,
            },
            base_chunk_size,
            created_at: chrono::Utc::now().timestamp(),
        };

        let workers = Self::active_workers(ctx);
        let response = {
            let mut jobs = self.jobs.lock();
            if jobs.contains_key(&params.job_id) {
                return Err(FabricError::bad_request(format!(
                    "job {} already exists",
                    params.job_id
                )));
            }

            let mut generator = ChunkGenerator::new(total, base_chunk_size, lookahead, retention);
            generator.ensure_lookahead(&workers);

            Self::publish_job(ctx, &manifest);
            Self::publish_batches(ctx, &params.job_id, &generator);

            let response = json!({
                "success": true,
                "job_id": params.job_id,
                "mode": manifest.mode,
                "total_combinations": total,
                "initial_batches": generator.current_version(),
            });
            jobs.insert(
                params.job_id.clone(),
                JobState { manifest, generator, solutions: Vec::new(), completed: false },
            );
            response
        };

        ctx.metrics.increment("jobs_created", 1.0);
        info!("Created hash job {} ({} combinations)", params.job_id, total);
        Ok(response)
    }

    fn get_job_status(&self, params: JobIdParams) -> FabricResult<Value> {
        let jobs = self.jobs.lock();
        let job = jobs
            .get(&params.job_id)
            .ok_or_else(|| FabricError::bad_request(format!("job {} not found", params.job_id)))?;

        Ok(json!({
            "success": true,
            "job_id": params.job_id,
            "completed": job.completed,
            "progress": job.generator.progress(),
            "cluster_stats": job.generator.performance.cluster_stats(),
            "worker_speeds": job.generator.performance.worker_speeds(),
            "solutions_found": job.solutions.len(),
        }))
    }

    fn get_all_jobs(&self) -> Value {
        let jobs = self.jobs.lock();
        let listing: Vec<Value> = jobs
            .iter()
            .map(|(job_id, job)| {
                let progress = job.generator.progress();
                json!({
                    "job_id": job_id,
                    "completed": job.completed,
                    "progress_percentage": progress.progress_percentage,
                    "processed": progress.processed,
                    "total": progress.total_combinations,
                    "eta_seconds": progress.eta_seconds,
                })
            })
            .collect();
        json!({ "success": true, "jobs": listing })
    }

    fn report_solution(&self, params: ReportSolutionParams) -> FabricResult<Value> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(&params.job_id)
            .ok_or_else(|| FabricError::bad_request(format!("job {} not found", params.job_id)))?;

        warn!(
            "Worker {} found {} solutions in job {}, chunk {}!",
            params.worker_id,
            params.solutions.len(),
            params.job_id,
            params.chunk_id
        );
        for solution in &params.solutions {
            warn!("  Solution: {} -> {}", solution.combination, solution.hash);
        }
        merge_solutions(&mut job.solutions, params.solutions);

        Ok(json!({
            "success": true,
            "job_id": params.job_id,
            "solutions_count": job.solutions.len(),
            "acknowledged": true,
        }))
    }

    fn report_chunk_progress(&self, params: ReportProgressParams) -> FabricResult<Value> {
        let ctx = self.ctx()?;
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(&params.job_id)
            .ok_or_else(|| FabricError::bad_request(format!("job {} not found", params.job_id)))?;

        match params.status.as_str() {
            "solved" => {
                if let Some(chunk_size) = job.generator.mark_chunk_solved(params.chunk_id) {
                    if let Some(time_taken) = params.time_taken {
                        job.generator.performance.update_worker_performance(
                            &params.worker_id,
                            chunk_size,
                            time_taken,
                        );
                    }
                    if let Some(solutions) = params.solutions {
                        merge_solutions(&mut job.solutions, solutions);
                    }
                    let workers = Self::active_workers(ctx);
                    job.generator.ensure_lookahead(&workers);
                    Self::publish_batches(ctx, &params.job_id, &job.generator);
                }
            }
            "working" => job.generator.chunk_progress(params.chunk_id, params.progress),
            _ => job.generator.chunk_failed(params.chunk_id),
        }

        Ok(json!({ "success": true }))
    }

    fn cancel_job(&self, params: JobIdParams) -> FabricResult<Value> {
        let ctx = self.ctx()?;
        let removed = self.jobs.lock().remove(&params.job_id);
        match removed {
            Some(_) => {
                ctx.registry.remove_self_metadata(&format!("hash_job_{}", params.job_id));
                ctx.registry
                    .remove_self_metadata(&format!("hash_batches_{}", params.job_id));
                info!("Cancelled hash job {}", params.job_id);
                Ok(json!({ "success": true, "job_id": params.job_id }))
            }
            None => Err(FabricError::bad_request(format!("job {} not found", params.job_id))),
        }
    }

    fn export_results(&self, params: ExportParams) -> FabricResult<Value> {
        let jobs = self.jobs.lock();
        let job = jobs
            .get(&params.job_id)
            .ok_or_else(|| FabricError::bad_request(format!("job {} not found", params.job_id)))?;

        let results = json!({
            "job_id": params.job_id,
            "progress": job.generator.progress(),
            "solutions": job.solutions,
            "exported_at": chrono::Utc::now().to_rfc3339(),
        });

        let rendered = match params.format.as_str() {
            "json" => serde_json::to_string_pretty(&results)?,
            "csv" => {
                let mut out = String::from("combination,hash,index\n");
                for solution in &job.solutions {
                    out.push_str(&format!(
                        "{},{},{}\n",
                        solution.combination, solution.hash, solution.index
                    ));
                }
                out
            }
            other => {
                return Err(FabricError::bad_request(format!("unknown export format: {other}")))
            }
        };

        match params.output_file {
            Some(path) => {
                std::fs::write(&path, rendered)
                    .map_err(|e| FabricError::internal(format!("writing {path}: {e}")))?;
                Ok(json!({
                    "success": true,
                    "format": params.format,
                    "output_file": path,
                    "solutions_count": job.solutions.len(),
                }))
            }
            None => Ok(json!({
                "success": true,
                "format": params.format,
                "data": if params.format == "json" { results } else { Value::String(rendered) },
            })),
        }
    }

    /// One pass of the progress-ingestion loop: read every node's
    /// `hash_worker_status` record and fold it into the generators.
    fn ingest_worker_reports(jobs: &Arc<Mutex<HashMap<String, JobState>>>, ctx: &ServiceContext) {
        let records = ctx.registry.alive_nodes(Some(NodeRole::Worker));
        for record in records {
            let Some(status) = record.metadata.get("hash_worker_status") else {
                continue;
            };
            Self::process_worker_status(jobs, ctx, &record.node_id, status);
        }
    }

    fn process_worker_status(
        jobs: &Arc<Mutex<HashMap<String, JobState>>>,
        ctx: &ServiceContext,
        worker_id: &NodeId,
        status: &Value,
    ) {
        let Some(job_id) = status.get("job_id").and_then(Value::as_str) else {
            return;
        };
        // Gossip transports chunk ids as numbers or strings.
        let Some(chunk_id) = status
            .get("chunk_id")
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        else {
            return;
        };
        let chunk_status = status.get("status").and_then(Value::as_str).unwrap_or("");

        let mut jobs_guard = jobs.lock();
        let Some(job) = jobs_guard.get_mut(job_id) else {
            return;
        };

        match chunk_status {
            "solved" => {
                let Some(chunk_size) = job.generator.mark_chunk_solved(chunk_id) else {
                    // Duplicate delivery of the same report.
                    return;
                };

                let time_taken = status.get("time_taken").and_then(Value::as_f64).unwrap_or(0.0);
                if time_taken > 0.0 {
                    job.generator
                        .performance
                        .update_worker_performance(worker_id, chunk_size, time_taken);
                }

                if let Some(solutions) = status
                    .get("solutions")
                    .and_then(|v| serde_json::from_value::<Vec<Solution>>(v.clone()).ok())
                {
                    if !solutions.is_empty() {
                        warn!(
                            "Worker {} found {} solutions in chunk {}!",
                            worker_id,
                            solutions.len(),
                            chunk_id
                        );
                        for solution in &solutions {
                            warn!("  Solution: {} -> {}", solution.combination, solution.hash);
                        }
                        ctx.metrics.increment("solutions_found", solutions.len() as f64);
                        merge_solutions(&mut job.solutions, solutions);
                    }
                }

                let workers = Self::active_workers(ctx);
                job.generator.ensure_lookahead(&workers);
                Self::publish_batches(ctx, job_id, &job.generator);
            }
            "working" => {
                let progress = status.get("progress").and_then(Value::as_u64);
                job.generator.chunk_progress(chunk_id, progress);
            }
            "" => {}
            _ => job.generator.chunk_failed(chunk_id),
        }
    }

    fn monitor_pass(jobs: &Arc<Mutex<HashMap<String, JobState>>>, ctx: &ServiceContext) {
        Self::ingest_worker_reports(jobs, ctx);

        let workers = Self::active_workers(ctx);
        let mut jobs_guard = jobs.lock();
        for (job_id, job) in jobs_guard.iter_mut() {
            if job.completed {
                continue;
            }

            job.generator.ensure_lookahead(&workers);
            job.generator.mark_completed_batches();
            Self::publish_batches(ctx, job_id, &job.generator);

            if job.generator.is_complete() {
                job.completed = true;
                warn!(
                    "Job {} completed: {} solutions discovered",
                    job_id,
                    job.solutions.len()
                );
                ctx.metrics.increment("jobs_completed", 1.0);
                let key = format!("hash_result_{job_id}");
                ctx.registry.set_self_metadata(
                    &key,
                    json!({
                        "job_id": job_id,
                        "completed_at": chrono::Utc::now().timestamp(),
                        "solutions": job.solutions,
                        "preimage_found": !job.solutions.is_empty(),
                    }),
                );
            }
        }
    }

    fn orphan_pass(jobs: &Arc<Mutex<HashMap<String, JobState>>>, ctx: &ServiceContext) {
        let timeout = ctx.config.hashcrack.orphan_timeout_secs;
        let workers = Self::active_workers(ctx);

        let mut jobs_guard = jobs.lock();
        for (job_id, job) in jobs_guard.iter_mut() {
            if job.completed {
                continue;
            }
            let orphans = job.generator.detect_orphans(timeout);
            if orphans.is_empty() {
                continue;
            }
            warn!("Detected {} orphaned chunks in job {}", orphans.len(), job_id);
            if job.generator.recover_orphans(&orphans, &workers).is_some() {
                ctx.metrics.increment("orphans_recovered", orphans.len() as f64);
                Self::publish_batches(ctx, job_id, &job.generator);
            }
        }
    }
}

fn merge_solutions(existing: &mut Vec<Solution>, incoming: Vec<Solution>) {
    for solution in incoming {
        let duplicate = existing
            .iter()
            .any(|s| s.combination == solution.combination && s.hash == solution.hash);
        if !duplicate {
            existing.push(solution);
        }
    }
}

impl Default for HashCoordinatorService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Service for HashCoordinatorService {
    fn name(&self) -> &'static str {
        "hash_coordinator"
    }

    fn manifest(&self) -> ServiceManifest {
        ServiceManifest {
            version: "1.0.0".to_string(),
            description: "Distributed hash-cracking coordinator".to_string(),
            methods: vec![
                MethodSpec::new("create_job")
                    .describe("Create a new hash-cracking job")
                    .coordinator_only(),
                MethodSpec::new("get_job_status")
                    .describe("Progress and cluster stats for one job")
                    .idempotent(),
                MethodSpec::new("get_all_jobs")
                    .describe("List every active job")
                    .idempotent(),
                MethodSpec::new("report_solution")
                    .describe("Best-effort solution report from a worker"),
                MethodSpec::new("report_chunk_progress")
                    .describe("Explicit chunk progress report from a worker"),
                MethodSpec::new("export_results")
                    .describe("Export job results as JSON or CSV")
                    .idempotent(),
                MethodSpec::new("cancel_job")
                    .describe("Drop a job and clear its gossip keys")
                    .coordinator_only(),
            ],
        }
    }

    async fn initialize(&self, ctx: ServiceContext) -> anyhow::Result<()> {
        if ctx.role != NodeRole::Coordinator {
            info!("Hash coordinator disabled on worker node");
            let _ = self.ctx.set(ctx);
            return Ok(());
        }

        let cancel = ctx.cancel.child_token();
        let _ = self.loop_cancel.set(cancel.clone());

        let monitor_jobs = Arc::clone(&self.jobs);
        let monitor_ctx = ctx.clone();
        let monitor_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                monitor_ctx.config.hashcrack.monitor_interval_secs.max(1),
            ));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        // A bad record must never kill the loop.
                        let pass = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            Self::monitor_pass(&monitor_jobs, &monitor_ctx)
                        }));
                        if pass.is_err() {
                            error!("Monitor pass panicked, continuing");
                        }
                    }
                    _ = monitor_cancel.cancelled() => break,
                }
            }
        });

        let orphan_jobs = Arc::clone(&self.jobs);
        let orphan_ctx = ctx.clone();
        let orphan_cancel = cancel;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                orphan_ctx.config.hashcrack.orphan_scan_interval_secs.max(1),
            ));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let pass = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            Self::orphan_pass(&orphan_jobs, &orphan_ctx)
                        }));
                        if pass.is_err() {
                            error!("Orphan pass panicked, continuing");
                        }
                    }
                    _ = orphan_cancel.cancelled() => break,
                }
            }
        });

        let _ = self.ctx.set(ctx);
        info!("Hash coordinator initialized");
        Ok(())
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        if let Some(cancel) = self.loop_cancel.get() {
            cancel.cancel();
        }
        Ok(())
    }

    async fn handle(&self, method: &str, params: Value) -> FabricResult<Value> {
        match method {
            "create_job" => self.create_job(serde_json::from_value(params)?),
            "get_job_status" => self.get_job_status(serde_json::from_value(params)?),
            "get_all_jobs" => Ok(self.get_all_jobs()),
            "report_solution" => self.report_solution(serde_json::from_value(params)?),
            "report_chunk_progress" => self.report_chunk_progress(serde_json::from_value(params)?),
            "export_results" => self.export_results(serde_json::from_value(params)?),
            "cancel_job" => self.cancel_job(serde_json::from_value(params)?),
            other => Err(FabricError::MethodNotFound(format!("hash_coordinator/{other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(id: &str) -> NodeId {
        NodeId::from(id)
    }

    #[test]
    fn test_adaptive_sizing_matches_expected_values() {
        // Worker A: 1M hashes in 1s, worker B: 1M in 2s, base 1M.
        let mut perf = PerformanceAnalyzer::new(1_000_000);
        perf.update_worker_performance(&worker("a"), 1_000_000, 1.0);
        perf.update_worker_performance(&worker("b"), 1_000_000, 2.0);

        let stats = perf.cluster_stats();
        assert!((stats.avg_speed - 750_000.0).abs() < 1.0);

        assert_eq!(perf.adaptive_chunk_size(&worker("a")), 1_300_000);
        assert_eq!(perf.adaptive_chunk_size(&worker("b")), 600_000);
    }

    #[test]
    fn test_adaptive_sizing_bounds() {
        let mut perf = PerformanceAnalyzer::new(1_000_000);
        perf.update_worker_performance(&worker("fast"), 100_000_000, 1.0);
        perf.update_worker_performance(&worker("slow"), 1_000, 1.0);

        let fast = perf.adaptive_chunk_size(&worker("fast"));
        let slow = perf.adaptive_chunk_size(&worker("slow"));
        for size in [fast, slow] {
            assert!(size >= 100_000);
            assert!(size <= 2_000_000);
            assert_eq!(size % 100_000, 0);
        }
        // No history falls back to the base size.
        assert_eq!(perf.adaptive_chunk_size(&worker("new")), 1_000_000);
    }

    #[test]
    fn test_speed_history_is_bounded() {
        let mut perf = PerformanceAnalyzer::new(1_000_000);
        for i in 0..30 {
            perf.update_worker_performance(&worker("a"), 1_000_000, 1.0 + i as f64);
        }
        assert_eq!(perf.worker_history[&worker("a")].len(), SPEED_HISTORY);
    }

    #[test]
    fn test_batches_never_overlap_and_cover_prefix() {
        let workers = vec![worker("a"), worker("b"), worker("c")];
        let mut generator = ChunkGenerator::new(10_000_000, 1_000_000, 3, 20);
        generator.ensure_lookahead(&workers);

        let mut intervals: Vec<(u64, u64)> = generator
            .batches()
            .values()
            .flat_map(|b| b.chunks.iter())
            .map(|c| (c.start_index, c.end_index))
            .collect();
        intervals.sort_unstable();

        let mut cursor = 0u64;
        for (start, end) in &intervals {
            assert_eq!(*start, cursor, "gap or overlap at {start}");
            assert!(end > start);
            cursor = *end;
        }
        assert_eq!(cursor, generator.current_global_index());
        // Pipeline is exactly lookahead deep.
        assert_eq!(generator.progress().active_batches, 3);
    }

    #[test]
    fn test_global_index_equals_sum_of_chunk_sizes() {
        let workers = vec![worker("a"), worker("b")];
        let mut generator = ChunkGenerator::new(100_000_000, 1_000_000, 3, 20);
        generator.ensure_lookahead(&workers);

        let sum: u64 = generator
            .batches()
            .values()
            .filter(|b| !b.is_recovery)
            .flat_map(|b| b.chunks.iter())
            .map(|c| c.chunk_size)
            .sum();
        assert_eq!(sum, generator.current_global_index());
    }

    #[test]
    fn test_small_space_single_chunk() {
        // S1 shape: 8 combinations with a 100k base chunk.
        let workers = vec![worker("a")];
        let mut generator = ChunkGenerator::new(8, 100_000, 3, 20);
        generator.ensure_lookahead(&workers);

        assert_eq!(generator.current_global_index(), 8);
        let chunks: Vec<&ChunkInfo> = generator
            .batches()
            .values()
            .flat_map(|b| b.chunks.iter())
            .collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_index, 0);
        assert_eq!(chunks[0].end_index, 8);

        let chunk_id = chunks[0].chunk_id;
        assert_eq!(generator.mark_chunk_solved(chunk_id), Some(8));
        generator.mark_completed_batches();
        assert!(generator.is_complete());
    }

    #[test]
    fn test_solved_report_is_idempotent() {
        let workers = vec![worker("a")];
        let mut generator = ChunkGenerator::new(8, 100_000, 3, 20);
        generator.ensure_lookahead(&workers);
        let chunk_id = generator.batches().values().next().unwrap().chunks[0].chunk_id;

        assert_eq!(generator.mark_chunk_solved(chunk_id), Some(8));
        assert_eq!(generator.mark_chunk_solved(chunk_id), None);
        assert_eq!(generator.progress().processed, 8);
    }

    #[test]
    fn test_chunk_ids_follow_version_stride() {
        let workers = vec![worker("a"), worker("b")];
        let mut generator = ChunkGenerator::new(100_000_000, 1_000_000, 2, 20);
        generator.ensure_lookahead(&workers);

        for (version, batch) in generator.batches() {
            for (i, chunk) in batch.chunks.iter().enumerate() {
                assert_eq!(chunk.chunk_id, version * CHUNK_ID_STRIDE + i as u64);
            }
        }
    }

    #[test]
    fn test_orphan_detection_requires_newer_solved_evidence() {
        let workers = vec![worker("x")];
        let mut generator = ChunkGenerator::new(10_000_000, 1_000_000, 2, 20);
        generator.ensure_lookahead(&workers);

        let chunk_ids: Vec<u64> = generator
            .batches()
            .values()
            .flat_map(|b| b.chunks.iter().map(|c| c.chunk_id))
            .collect();
        let (old_chunk, newer_chunk) = (chunk_ids[0], chunk_ids[1]);

        // Worker starts the old chunk, reports progress, then goes silent.
        generator.chunk_progress(old_chunk, Some(400_000));
        // Backdate so the age threshold trips.
        for batch in generator.generated_batches.values_mut() {
            for chunk in batch.chunks.iter_mut() {
                chunk.created_at -= 400;
            }
        }

        // No newer solved chunk yet: not an orphan.
        assert!(generator.detect_orphans(300).is_empty());

        // The same worker solves a later chunk: the older one is orphaned.
        generator.mark_chunk_solved(newer_chunk);
        let orphans = generator.detect_orphans(300);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].chunk_id, old_chunk);
        assert_eq!(orphans[0].progress, Some(400_000));
    }

    #[test]
    fn test_recovery_batch_resumes_from_progress() {
        // Chunk [0, 1_000_000) stuck at progress 400_000 while its worker
        // went on to solve the next chunk.
        let workers = vec![worker("x")];
        let mut generator = ChunkGenerator::new(2_000_000, 1_000_000, 2, 20);
        generator.ensure_lookahead(&workers);

        let chunk_ids: Vec<u64> = generator
            .batches()
            .values()
            .flat_map(|b| b.chunks.iter().map(|c| c.chunk_id))
            .collect();
        generator.chunk_progress(chunk_ids[0], Some(400_000));
        for batch in generator.generated_batches.values_mut() {
            for chunk in batch.chunks.iter_mut() {
                chunk.created_at -= 400;
            }
        }
        generator.mark_chunk_solved(chunk_ids[1]);

        let orphans = generator.detect_orphans(300);
        let version = generator.recover_orphans(&orphans, &[worker("y")]).unwrap();

        let recovery = &generator.batches()[&version];
        assert!(recovery.is_recovery);
        assert_eq!(recovery.chunks.len(), 1);
        let chunk = &recovery.chunks[0];
        assert_eq!(chunk.start_index, 400_001);
        assert_eq!(chunk.end_index, 1_000_000);
        assert_eq!(chunk.priority, RECOVERY_PRIORITY);
        assert_eq!(chunk.status, ChunkStatus::Recovery);
        assert_eq!(chunk.assigned_worker, worker("y"));

        // The original chunk is parked in timeout.
        let original = generator.find_chunk(chunk_ids[0]).unwrap();
        assert_eq!(original.status, ChunkStatus::Timeout);
    }

    #[test]
    fn test_completion_covers_recovered_ranges() {
        let workers = vec![worker("x")];
        let mut generator = ChunkGenerator::new(1_000_000, 1_000_000, 1, 20);
        generator.ensure_lookahead(&workers);
        let chunk_id = generator.batches().values().next().unwrap().chunks[0].chunk_id;

        generator.chunk_progress(chunk_id, Some(399_999));
        for batch in generator.generated_batches.values_mut() {
            for chunk in batch.chunks.iter_mut() {
                chunk.created_at -= 400;
            }
        }
        // Fake the evidence chunk by failing it directly.
        generator.chunk_failed(chunk_id);
        let orphan = OrphanChunk {
            chunk_id,
            start_index: 0,
            end_index: 1_000_000,
            progress: Some(399_999),
            stuck_worker: worker("x"),
            age_secs: 400,
        };
        let version = generator.recover_orphans(&[orphan], &[worker("y")]).unwrap();

        // Not complete until the recovery chunk is solved.
        assert!(!generator.is_complete());
        let recovery_id = generator.batches()[&version].chunks[0].chunk_id;
        generator.mark_chunk_solved(recovery_id);
        assert!(generator.is_complete());
    }

    #[test]
    fn test_batch_retention_window() {
        let workers = vec![worker("a")];
        let mut generator = ChunkGenerator::new(100_000_000, 100_000, 1, 5);

        for _ in 0..30 {
            generator.ensure_lookahead(&workers);
            let pending: Vec<u64> = generator
                .batches()
                .values()
                .flat_map(|b| b.chunks.iter())
                .filter(|c| c.status != ChunkStatus::Solved)
                .map(|c| c.chunk_id)
                .collect();
            for chunk_id in pending {
                generator.mark_chunk_solved(chunk_id);
            }
            generator.mark_completed_batches();
        }

        assert!(generator.batches().len() <= 5);
    }

    #[test]
    fn test_coverage_helper() {
        assert!(covered(0, 10, &[(0, 10)]));
        assert!(covered(2, 8, &[(0, 5), (5, 10)]));
        assert!(!covered(0, 10, &[(0, 4), (6, 10)]));
        assert!(covered(5, 5, &[]));
    }

    #[test]
    fn test_merge_solutions_deduplicates() {
        let mut existing = Vec::new();
        let sol = Solution {
            combination: "bab".into(),
            hash: "ff".into(),
            index: 5,
            mode: "brute".into(),
            base_word: None,
        };
        merge_solutions(&mut existing, vec![sol.clone()]);
        merge_solutions(&mut existing, vec![sol]);
        assert_eq!(existing.len(), 1);
    }
}
