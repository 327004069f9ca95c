use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use scheduler_core::TriggerService;

use crate::handlers::{
    execute::{trigger_due, trigger_task},
    health::health_check,
    metrics::prometheus_metrics,
};

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub trigger: Arc<dyn TriggerService>,
    pub metrics: Option<PrometheusHandle>,
}

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/execute/trigger-due", post(trigger_due))
        .route("/api/execute/tasks/{id}", post(trigger_task))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}
