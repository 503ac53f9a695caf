//! HTTP 接口测试（不监听端口，直接驱动 Router）

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use serde_json::Value;
use tower::ServiceExt;

use llm_limiter::admission::AdmissionController;
use llm_limiter::config::AdmissionConfig;
use llm_limiter::http::{build_router, HttpServerState};
use llm_limiter::infra::{MemoryCapacityStore, OverflowQueue};
use llm_limiter::model::{Category, RequestStatus};
use llm_limiter::repository::{MemoryRequestRepository, RequestRecordStore};
use llm_limiter::service::{MockGenerationProcessor, SubmissionService};

const BOUNDARY: &str = "llm-limiter-test-boundary";

struct TestApp {
    router: Router,
    controller: Arc<AdmissionController>,
    records: Arc<MemoryRequestRepository>,
    queue: Arc<OverflowQueue>,
}

async fn test_app(submit_timeout: Duration) -> TestApp {
    let admission = AdmissionConfig {
        limits: Category::ALL.iter().map(|c| (*c, 1)).collect(),
        ..AdmissionConfig::default()
    };
    let controller = Arc::new(AdmissionController::new(
        Arc::new(MemoryCapacityStore::new()),
        &admission,
    ));
    controller.reset_all().await.unwrap();

    let records = Arc::new(MemoryRequestRepository::new());
    let queue = Arc::new(OverflowQueue::in_memory());
    let submission = Arc::new(SubmissionService::new(
        controller.clone(),
        records.clone(),
        queue.clone(),
        Arc::new(MockGenerationProcessor::new(Duration::ZERO)),
        submit_timeout,
    ));

    let router = build_router(HttpServerState {
        submission,
        controller: controller.clone(),
        records: records.clone(),
        queue: queue.clone(),
        redis: None,
    });

    TestApp {
        router,
        controller,
        records,
        queue,
    }
}

/// 构造 multipart/form-data 请求体；files: (文件名, Content-Type, 数据)
fn multipart_body(text: Option<&str>, files: &[(&str, &str, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    if let Some(text) = text {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"text\"\r\n\r\n{text}\r\n"
            )
            .as_bytes(),
        );
    }
    for (filename, content_type, data) in files {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn submit_request(body: Vec<u8>) -> Request<Body> {
    multipart_request("/llm/submit", body)
}

fn multipart_request(uri: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_submit_text_completes_immediately() {
    let app = test_app(Duration::from_secs(3)).await;

    let response = app
        .router
        .clone()
        .oneshot(submit_request(multipart_body(Some("What is Rust?"), &[])))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    let request_id = body["request_id"].as_str().unwrap().to_string();
    assert_eq!(body["response"], "[text_only] What is Rust?");

    let record = app.records.get(&request_id).await.unwrap();
    assert_eq!(record.status, RequestStatus::Completed);
    assert_eq!(record.category, Category::TextOnly);
}

#[tokio::test]
async fn test_submit_with_file_is_multi_modal() {
    let app = test_app(Duration::from_secs(3)).await;

    let response = app
        .router
        .clone()
        .oneshot(submit_request(multipart_body(
            Some("describe this"),
            &[("cat.png", "image/png", b"\x89PNG fake")],
        )))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    let request_id = body["request_id"].as_str().unwrap();
    let record = app.records.get(request_id).await.unwrap();
    assert_eq!(record.category, Category::MultiModal);
}

#[tokio::test]
async fn test_submit_without_text_or_file_is_rejected() {
    let app = test_app(Duration::from_secs(3)).await;

    let response = app
        .router
        .clone()
        .oneshot(submit_request(multipart_body(None, &[])))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(app.records.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_submit_when_saturated_returns_accepted() {
    let app = test_app(Duration::from_secs(1)).await;
    let _held = app
        .controller
        .acquire(Category::ImageGeneration, Duration::from_secs(1))
        .await
        .unwrap();

    let response = app
        .router
        .clone()
        .oneshot(submit_request(multipart_body(
            Some("Please draw a lighthouse at dusk"),
            &[],
        )))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let body = json_body(response).await;
    assert_eq!(body["status"], "queued");
    let request_id = body["request_id"].as_str().unwrap().to_string();
    assert_eq!(app.queue.len(Category::ImageGeneration).await.unwrap(), 1);

    // 状态查询返回 queued
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/llm/status/{}", request_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "queued");
    assert_eq!(body["category"], "image_generation");
    assert!(body.get("input_data").is_none());
}

#[tokio::test]
async fn test_stream_returns_chunks_and_releases_capacity() {
    let app = test_app(Duration::from_secs(3)).await;

    let response = app
        .router
        .clone()
        .oneshot(multipart_request(
            "/llm/stream",
            multipart_body(Some("tell me more"), &[]),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/plain; charset=utf-8"
    );

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"[text_only] tell me more");
    assert!(app.records.is_empty());

    // 流读完后容量已归还
    let permit = app
        .controller
        .acquire(Category::TextOnly, Duration::from_millis(10))
        .await
        .unwrap();
    permit.release().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stream_when_saturated_is_unavailable() {
    let app = test_app(Duration::from_secs(1)).await;
    let _held = app
        .controller
        .acquire(Category::TextOnly, Duration::from_secs(1))
        .await
        .unwrap();

    let response = app
        .router
        .clone()
        .oneshot(multipart_request(
            "/llm/stream",
            multipart_body(Some("tell me more"), &[]),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(app.queue.len(Category::TextOnly).await.unwrap(), 0);
    assert!(app.records.is_empty());
}

#[tokio::test]
async fn test_status_unknown_request_is_not_found() {
    let app = test_app(Duration::from_secs(3)).await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/llm/status/does-not-exist")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health_reports_capacity_and_queue_depth() {
    let app = test_app(Duration::from_secs(3)).await;

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/llm/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["capacity"]["text_only"]["available"], 1);
    assert_eq!(body["capacity"]["text_only"]["limit"], 1);
    assert_eq!(body["queue_depth"]["multi_modal"], 0);
}
