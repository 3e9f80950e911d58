//! # Service Layer
//!
//! The pluggable service runtime: lifecycle supervision, the per-node
//! method table, push metrics, and the built-in `system` service.

pub mod metrics;
pub mod runtime;
pub mod system;

pub use metrics::{MetricType, MetricsSink, MetricsState};
pub use runtime::{MethodSpec, Service, ServiceContext, ServiceManifest, ServiceRuntime};
