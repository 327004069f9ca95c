use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 统一的成功响应信封，失败响应见 [`crate::error::ApiError`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn new(data: T, message: Option<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            message,
            timestamp: Utc::now(),
        }
    }
}

/// 触发已受理，执行在请求之外进行
pub struct Accepted<T>(pub ApiResponse<T>);

impl<T: Serialize> IntoResponse for Accepted<T> {
    fn into_response(self) -> Response {
        (StatusCode::ACCEPTED, Json(self.0)).into_response()
    }
}

pub fn accepted<T: Serialize>(data: T, message: String) -> Accepted<T> {
    Accepted(ApiResponse::new(data, Some(message)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepted_envelope() {
        let response = accepted(vec![1, 2], "ok".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let body = ApiResponse::new(3, None);
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["data"], 3);
        assert!(value["message"].is_null());
    }
}
