//! # Push Metrics
//!
//! Reactive metrics state for services. Services push values; the state
//! throttles to at most one push per metric per second (unless forced),
//! keeps a bounded per-metric history, and forwards accepted changes to a
//! sink so the runtime can fold them into the gossip self-record.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

/// Metric classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    /// Current value.
    Gauge,
    /// Strictly additive accumulator.
    Counter,
    /// Duration sample in milliseconds.
    Timer,
    /// Value distribution sample.
    Histogram,
}

/// Receives accepted metric pushes.
pub trait MetricsSink: Send + Sync {
    fn on_metric(&self, service: &str, name: &str, value: f64, metric_type: MetricType);
}

const HISTORY_SIZE: usize = 100;

#[derive(Debug, Clone)]
struct MetricData {
    value: f64,
    metric_type: MetricType,
    updated_at: i64,
    update_count: u64,
    history: VecDeque<(i64, f64)>,
    last_push: Option<Instant>,
}

struct MetricsInner {
    data: HashMap<String, MetricData>,
    last_update: i64,
    total_updates: u64,
}

/// Per-service metrics state.
#[derive(Clone)]
pub struct MetricsState {
    service_name: String,
    inner: Arc<Mutex<MetricsInner>>,
    sink: Arc<Mutex<Option<Arc<dyn MetricsSink>>>>,
    throttle: std::time::Duration,
}

impl MetricsState {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            inner: Arc::new(Mutex::new(MetricsInner {
                data: HashMap::new(),
                last_update: chrono::Utc::now().timestamp(),
                total_updates: 0,
            })),
            sink: Arc::new(Mutex::new(None)),
            throttle: std::time::Duration::from_secs(1),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Attach the sink changes are forwarded to.
    pub fn set_sink(&self, sink: Arc<dyn MetricsSink>) {
        *self.sink.lock() = Some(sink);
    }

    /// Record a metric value. Counters accumulate, everything else is set.
    pub fn set(&self, name: &str, value: f64, metric_type: MetricType, force_push: bool) {
        let now = chrono::Utc::now().timestamp();
        let (pushed_value, should_forward) = {
            let mut inner = self.inner.lock();
            let entry = inner.data.entry(name.to_string()).or_insert_with(|| MetricData {
                value: 0.0,
                metric_type,
                updated_at: now,
                update_count: 0,
                history: VecDeque::with_capacity(HISTORY_SIZE),
                last_push: None,
            });

            let old_value = entry.value;
            let new_value = match metric_type {
                MetricType::Counter => old_value + value,
                _ => value,
            };

            let changed = (new_value - old_value).abs() > f64::EPSILON || entry.update_count == 0;
            let throttle_passed = entry
                .last_push
                .map(|t| t.elapsed() >= self.throttle)
                .unwrap_or(true);

            entry.value = new_value;
            entry.updated_at = now;
            entry.update_count += 1;
            if entry.history.len() == HISTORY_SIZE {
                entry.history.pop_front();
            }
            entry.history.push_back((now, new_value));

            inner.last_update = now;
            inner.total_updates += 1;

            let forward = (force_push || changed) && (force_push || throttle_passed);
            if forward {
                inner.data.get_mut(name).unwrap().last_push = Some(Instant::now());
            }
            (new_value, forward)
        };

        if should_forward {
            let sink = self.sink.lock().clone();
            if let Some(sink) = sink {
                sink.on_metric(&self.service_name, name, pushed_value, metric_type);
            }
        }
    }

    pub fn gauge(&self, name: &str, value: f64) {
        self.set(name, value, MetricType::Gauge, false);
    }

    /// Add to a counter. Strictly additive.
    pub fn increment(&self, name: &str, value: f64) {
        self.set(name, value, MetricType::Counter, false);
    }

    pub fn timer(&self, name: &str, duration_ms: f64) {
        self.set(name, duration_ms, MetricType::Timer, false);
    }

    pub fn histogram(&self, name: &str, value: f64) {
        self.set(name, value, MetricType::Histogram, false);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.inner.lock().data.get(name).map(|d| d.value)
    }

    /// Full snapshot of every metric.
    pub fn snapshot(&self) -> Value {
        let inner = self.inner.lock();
        let metrics: serde_json::Map<String, Value> = inner
            .data
            .iter()
            .map(|(name, data)| {
                (
                    name.clone(),
                    json!({
                        "value": data.value,
                        "type": data.metric_type,
                        "timestamp": data.updated_at,
                        "update_count": data.update_count,
                    }),
                )
            })
            .collect();
        Value::Object(metrics)
    }

    /// Compact summary folded into the gossip service descriptor.
    pub fn summary(&self) -> Value {
        let inner = self.inner.lock();
        json!({
            "total_metrics": inner.data.len(),
            "last_update": inner.last_update,
            "update_count": inner.total_updates,
        })
    }
}
