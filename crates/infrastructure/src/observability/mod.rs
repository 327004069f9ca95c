//! Observability module
//!
//! - Metrics collection through the `metrics` facade, exported for Prometheus
//! - Structured engine events through `tracing`

pub mod metrics_collector;
pub mod structured_logger;

pub use metrics_collector::{install_prometheus_recorder, MetricsCollector};
pub use structured_logger::StructuredLogger;
