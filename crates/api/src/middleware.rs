use axum::{extract::Request, http::Method, middleware::Next, response::Response};
use std::time::Instant;
use tower_http::{
    classify::{ServerErrorsAsFailures, SharedClassifier},
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info};

/// 探活和指标抓取路径只记录 debug 日志
const QUIET_PATHS: [&str; 2] = ["/health", "/metrics"];

pub async fn request_logging(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;
    let status = response.status().as_u16();
    let duration_ms = start.elapsed().as_millis() as u64;

    if QUIET_PATHS.contains(&path.as_str()) {
        debug!(method = %method, path = %path, status, duration_ms, "请求处理完成");
    } else {
        info!(method = %method, path = %path, status, duration_ms, "请求处理完成");
    }
    response
}

/// 触发接口只开放 GET/POST
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
}

pub fn trace_layer() -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>> {
    TraceLayer::new_for_http()
}
