use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::any, Router};
use scheduler_core::{config::HttpConfig, HttpPayload, Transport};
use scheduler_testing_utils::TaskBuilder;
use scheduler_worker::HttpTransport;
use tokio::net::TcpListener;

/// 前 `failures` 次返回500，之后返回200
async fn spawn_server(failures: usize) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route(
            "/hook",
            any(move |State(hits): State<Arc<AtomicUsize>>| async move {
                let n = hits.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    (StatusCode::INTERNAL_SERVER_ERROR, "boom")
                } else {
                    (StatusCode::OK, "done")
                }
            }),
        )
        .route("/created", any(|| async { (StatusCode::CREATED, "created") }))
        .route("/missing", any(|| async { (StatusCode::NOT_FOUND, "nope") }))
        .with_state(hits.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), hits)
}

fn payload(url: String, retry_count: u32) -> HttpPayload {
    let mut payload = HttpPayload::new(url);
    payload.retry_count = retry_count;
    payload.retry_interval_seconds = 0;
    payload.timeout_seconds = Some(5);
    payload
}

#[tokio::test]
async fn test_server_errors_exhaust_transport_retries() {
    let (base, hits) = spawn_server(usize::MAX).await;
    let transport = HttpTransport::new(HttpConfig::default()).unwrap();

    let result = transport.send(&payload(format!("{base}/hook"), 2)).await;

    assert!(!result.success);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert_eq!(result.exception_type.as_deref(), Some("UnexpectedStatus"));
    assert_eq!(result.metadata.http_status, Some(500));
    assert!(result.error_message.unwrap().contains("500"));
}

#[tokio::test]
async fn test_recovers_within_retry_budget() {
    let (base, hits) = spawn_server(1).await;
    let transport = HttpTransport::new(HttpConfig::default()).unwrap();
    let mut request = payload(format!("{base}/hook"), 2);
    request.method = "post".to_string();
    request.body = Some(r#"{"ping":true}"#.to_string());

    let task = TaskBuilder::new()
        .with_payload(scheduler_core::TaskPayload::Http(request))
        .build();
    let result = transport.execute(&task).await;

    assert!(result.success);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(result.metadata.http_status, Some(200));
    assert_eq!(result.metadata.response_size, Some(4));
}

#[tokio::test]
async fn test_expected_status_and_client_errors() {
    let (base, _) = spawn_server(0).await;
    let transport = HttpTransport::new(HttpConfig::default()).unwrap();

    let mut created = payload(format!("{base}/created"), 0);
    created.expected_status = 201;
    assert!(transport.send(&created).await.success);

    // 默认期望200，201同样视为失败
    let result = transport.send(&payload(format!("{base}/created"), 0)).await;
    assert!(!result.success);

    // 4xx 不是瞬时错误，不会重试
    let result = transport.send(&payload(format!("{base}/missing"), 3)).await;
    assert!(!result.success);
    assert_eq!(result.metadata.http_status, Some(404));
}

#[tokio::test]
async fn test_connection_refused_is_retried_then_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let transport = HttpTransport::new(HttpConfig::default()).unwrap();
    let result = transport
        .send(&payload(format!("http://{addr}/gone"), 1))
        .await;

    assert!(!result.success);
    assert_eq!(result.exception_type.as_deref(), Some("ConnectionError"));
    assert_eq!(result.metadata.http_status, None);
}

/// 声明的正文长度大于实际发送的字节数，随后关闭连接
async fn spawn_truncating_server() -> (String, Arc<AtomicUsize>) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let hits = Arc::new(AtomicUsize::new(0));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let counter = hits.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\npartial")
                .await;
            let _ = socket.shutdown().await;
        }
    });
    (format!("http://{addr}/hook"), hits)
}

#[tokio::test]
async fn test_interrupted_response_body_is_retried_then_reported() {
    let (url, hits) = spawn_truncating_server().await;
    let transport = HttpTransport::new(HttpConfig::default()).unwrap();

    let result = transport.send(&payload(url, 1)).await;

    assert!(!result.success);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(result.exception_type.as_deref(), Some("ResponseReadError"));
    assert_eq!(result.metadata.http_status, Some(200));
}
