//! Metrics collector for the schedule execution engine

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use scheduler_core::Channel;

/// 安装全局 Prometheus 记录器，返回用于渲染 `/metrics` 的句柄
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("安装Prometheus指标记录器失败: {e}"))
}

/// Metrics collector
///
/// 未安装记录器时所有调用都是空操作。
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a claim cycle
    pub fn record_claim(&self, trigger: &'static str, claimed: usize, duration_seconds: f64) {
        counter!("schedule_engine_claims_total", "trigger" => trigger).increment(1);
        counter!("schedule_engine_claimed_tasks_total", "trigger" => trigger)
            .increment(claimed as u64);
        histogram!("schedule_engine_claim_duration_seconds", "trigger" => trigger)
            .record(duration_seconds);
    }

    /// Record a finished transport invocation
    pub fn record_execution(&self, channel: Channel, success: bool, duration_seconds: f64) {
        let status = if success { "success" } else { "failure" };
        counter!(
            "schedule_engine_executions_total",
            "channel" => channel.as_str(),
            "status" => status
        )
        .increment(1);
        histogram!(
            "schedule_engine_execution_duration_seconds",
            "channel" => channel.as_str()
        )
        .record(duration_seconds);
    }

    pub fn record_retry_scheduled(&self, channel: Channel) {
        counter!("schedule_engine_retries_scheduled_total", "channel" => channel.as_str())
            .increment(1);
    }

    pub fn record_commit_failure(&self) {
        counter!("schedule_engine_commit_failures_total").increment(1);
    }

    pub fn record_stale_reclaimed(&self, count: usize) {
        counter!("schedule_engine_stale_reclaimed_total").increment(count as u64);
    }

    pub fn set_in_flight(&self, in_flight: usize) {
        gauge!("schedule_engine_in_flight_executions").set(in_flight as f64);
    }
}
