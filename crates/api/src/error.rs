use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use scheduler_core::SchedulerError;
use serde_json::json;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("调度器错误: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("未找到资源")]
    NotFound,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::Scheduler(SchedulerError::TaskNotFound { id }) => (
                StatusCode::NOT_FOUND,
                "TASK_NOT_FOUND",
                format!("任务 ID {id} 不存在"),
            ),
            ApiError::Scheduler(e @ SchedulerError::ValidationError(_))
            | ApiError::Scheduler(e @ SchedulerError::InvalidExpression { .. }) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string())
            }
            ApiError::Scheduler(e) if e.is_store_error() => (
                StatusCode::SERVICE_UNAVAILABLE,
                "STORE_UNAVAILABLE",
                "任务存储暂不可用，请稍后重试".to_string(),
            ),
            ApiError::Scheduler(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                e.to_string(),
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::NotFound => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                "请求的资源不存在".to_string(),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        if status.is_server_error() {
            error!(error = %self, code = code, "请求处理失败");
        }

        let body = Json(json!({
            "success": false,
            "error": {
                "code": code,
                "message": message,
            },
            "timestamp": chrono::Utc::now(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                ApiError::Scheduler(SchedulerError::TaskNotFound { id: 3 }),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::Scheduler(SchedulerError::DatabaseOperation("down".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ApiError::Scheduler(SchedulerError::Internal("boom".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (ApiError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
        ];
        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }
}
