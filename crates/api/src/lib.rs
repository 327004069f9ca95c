//! # Scheduler API
//!
//! 调度执行引擎的触发接口：
//!
//! - `GET /health` - 健康检查
//! - `POST /api/execute/trigger-due?channel=&limit=` - 触发全部到期任务
//! - `POST /api/execute/tasks/{id}` - 手动触发单个任务
//! - `GET /metrics` - Prometheus 指标（启用指标时）

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower::ServiceBuilder;

use middleware::{cors_layer, request_logging, trace_layer};
use routes::{create_routes, AppState};
use scheduler_core::{config::ApiConfig, TriggerService};

/// 创建完整的API应用
pub fn create_app(
    trigger: Arc<dyn TriggerService>,
    metrics: Option<PrometheusHandle>,
    api_config: &ApiConfig,
) -> Router {
    let router = create_routes(AppState { trigger, metrics }).layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(axum::middleware::from_fn(request_logging)),
    );

    if api_config.cors_enabled {
        router.layer(cors_layer())
    } else {
        router
    }
}
