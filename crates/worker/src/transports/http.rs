use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Method};
use std::time::Duration;
use tracing::{info, warn};

use scheduler_core::{
    config::HttpConfig, Channel, ExecutionMetadata, ExecutionResult, HttpPayload, ScheduleTask,
    TaskPayload, Transport,
};

/// HTTP传输
///
/// 请求超时、连接错误和5xx响应视为瞬时错误，在一次执行内按固定间隔重试
/// `retry_count` 次。最终状态码与 `expected_status` 不一致即为失败。
pub struct HttpTransport {
    client: reqwest::Client,
    config: HttpConfig,
}

enum Attempt {
    Done(ExecutionResult),
    Transient(ExecutionResult),
}

impl HttpTransport {
    pub fn new(config: HttpConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client, config })
    }

    pub async fn send(&self, payload: &HttpPayload) -> ExecutionResult {
        let method = match Method::from_bytes(payload.method.trim().to_ascii_uppercase().as_bytes())
        {
            Ok(method) => method,
            Err(_) => {
                return ExecutionResult::failure(
                    "InvalidMethod",
                    format!("不支持的HTTP方法: {}", payload.method),
                )
            }
        };
        let timeout = Duration::from_secs(
            payload
                .timeout_seconds
                .unwrap_or(self.config.default_timeout_seconds),
        );
        let attempts = payload.retry_count + 1;

        let mut attempt = 1;
        loop {
            info!(
                method = %method,
                url = %payload.url,
                attempt = attempt,
                attempts = attempts,
                "发送HTTP请求"
            );

            match self.attempt(payload, method.clone(), timeout).await {
                Attempt::Done(result) => return result,
                Attempt::Transient(result) if attempt >= attempts => {
                    warn!(url = %payload.url, attempts = attempts, "HTTP请求重试次数已用尽");
                    return result;
                }
                Attempt::Transient(result) => {
                    warn!(
                        url = %payload.url,
                        attempt = attempt,
                        error = result.error_message.as_deref().unwrap_or_default(),
                        retry_in_seconds = payload.retry_interval_seconds,
                        "HTTP请求失败，准备重试"
                    );
                }
            }

            if payload.retry_interval_seconds > 0 {
                tokio::time::sleep(Duration::from_secs(payload.retry_interval_seconds)).await;
            }
            attempt += 1;
        }
    }

    async fn attempt(&self, payload: &HttpPayload, method: Method, timeout: Duration) -> Attempt {
        let mut request = self.client.request(method, &payload.url).timeout(timeout);

        let has_content_type = payload
            .headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case(CONTENT_TYPE.as_str()));
        for (key, value) in &payload.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(body) = &payload.body {
            if !has_content_type {
                request = request.header(CONTENT_TYPE, payload.content_type.as_str());
            }
            request = request.body(body.clone());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Attempt::Transient(ExecutionResult::failure(
                    "Timeout",
                    format!("HTTP请求超时: {e}"),
                ))
            }
            Err(e) if e.is_connect() => {
                return Attempt::Transient(ExecutionResult::failure(
                    "ConnectionError",
                    format!("HTTP连接失败: {e}"),
                ))
            }
            Err(e) => {
                return Attempt::Done(ExecutionResult::failure(
                    "RequestError",
                    format!("HTTP请求失败: {e}"),
                ))
            }
        };

        let status = response.status();
        // 响应头已到达但正文中断，与超时同样视为瞬时错误
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                let exception_type = if e.is_timeout() {
                    "Timeout"
                } else {
                    "ResponseReadError"
                };
                return Attempt::Transient(
                    ExecutionResult::failure(exception_type, format!("读取HTTP响应失败: {e}"))
                        .with_metadata(ExecutionMetadata {
                            http_status: Some(status.as_u16()),
                            ..Default::default()
                        }),
                );
            }
        };
        let metadata = ExecutionMetadata {
            http_status: Some(status.as_u16()),
            response_size: Some(body.len() as i64),
            details: Some(serde_json::json!({
                "response_body": truncate_body(&body, self.config.max_response_body_bytes),
            })),
            ..Default::default()
        };

        if status.as_u16() == payload.expected_status {
            return Attempt::Done(ExecutionResult::success(metadata));
        }

        let result = ExecutionResult::failure(
            "UnexpectedStatus",
            format!(
                "HTTP状态码 {}，期望 {}",
                status.as_u16(),
                payload.expected_status
            ),
        )
        .with_metadata(metadata);

        if status.is_server_error() {
            Attempt::Transient(result)
        } else {
            Attempt::Done(result)
        }
    }
}

fn truncate_body(body: &[u8], limit: usize) -> String {
    let slice = &body[..body.len().min(limit)];
    String::from_utf8_lossy(slice).into_owned()
}

#[async_trait]
impl Transport for HttpTransport {
    fn channel(&self) -> Channel {
        Channel::Http
    }

    async fn execute(&self, task: &ScheduleTask) -> ExecutionResult {
        match &task.payload {
            TaskPayload::Http(payload) => self.send(payload).await,
            other => ExecutionResult::failure(
                "PayloadMismatch",
                format!("HTTP传输收到{}通道的任务", other.channel()),
            ),
        }
    }
}
