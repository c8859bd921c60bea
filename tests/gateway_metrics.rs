use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use futures_util::StreamExt;
use futures_util::stream;
use gpt_broker::gateway::metrics::{FAILED_REQUESTS, REQUESTS_TOTAL, VALID_REQUESTS};
use gpt_broker::gateway::{
    AuthGate, GatewayHttpState, Identity, LimitsConfig, MemoryQuotaStore, MetricsRegistry,
    MetricsSnapshot, RateLimiter, RequestPipeline, StaticTokenVerifier, router,
};
use gpt_broker::{CompletionModel, CompletionRequest, FragmentStream};
use tower::util::ServiceExt;

struct EchoModel;

#[async_trait]
impl CompletionModel for EchoModel {
    fn provider(&self) -> &str {
        "echo"
    }

    async fn complete(&self, request: CompletionRequest) -> gpt_broker::Result<String> {
        Ok(request
            .messages
            .last()
            .map(|message| message.content.clone())
            .unwrap_or_default())
    }

    async fn stream(&self, _request: CompletionRequest) -> gpt_broker::Result<FragmentStream> {
        Ok(stream::empty().boxed())
    }
}

fn app(metrics: MetricsRegistry) -> Router {
    let verifier = StaticTokenVerifier::default()
        .with_token("good-token", Identity::new("user-1", "user@example.com"));
    let limiter = RateLimiter::new(Arc::new(MemoryQuotaStore::new()), LimitsConfig::default());
    let pipeline = RequestPipeline::standard(AuthGate::new(Arc::new(verifier)), limiter);
    router(GatewayHttpState::new(pipeline, Arc::new(EchoModel)).with_metrics(metrics))
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn responses_are_counted_by_method_and_status() {
    let metrics = MetricsRegistry::new();
    let app = app(metrics.clone());

    for request in [
        get("/health", None),
        get("/simple-complete?prompt=hi", Some("good-token")),
        get("/simple-complete?prompt=hi", None),
        get("/missing", None),
    ] {
        let _ = app.clone().oneshot(request).await.unwrap();
    }

    assert_eq!(metrics.count(REQUESTS_TOTAL, "GET", 200), 2);
    assert_eq!(metrics.count(VALID_REQUESTS, "GET", 200), 2);
    assert_eq!(metrics.count(FAILED_REQUESTS, "GET", 401), 1);
    assert_eq!(metrics.count(FAILED_REQUESTS, "GET", 404), 1);
    assert_eq!(
        metrics.snapshot(),
        MetricsSnapshot {
            requests_total: 4,
            valid_requests: 2,
            failed_requests: 2,
        }
    );
}

#[tokio::test]
async fn scraping_metrics_is_not_counted() {
    let metrics = MetricsRegistry::new();
    let app = app(metrics.clone());

    let _ = app.clone().oneshot(get("/health", None)).await.unwrap();
    let before = metrics.snapshot();

    for _ in 0..3 {
        let response = app.clone().oneshot(get("/metrics", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(metrics.snapshot(), before);
}

#[tokio::test]
async fn metrics_endpoint_renders_prometheus_text() {
    let metrics = MetricsRegistry::new();
    let app = app(metrics);

    let _ = app
        .clone()
        .oneshot(get("/simple-complete?prompt=hi", Some("good-token")))
        .await
        .unwrap();
    let _ = app
        .clone()
        .oneshot(get("/simple-complete?prompt=hi", Some("bad-token")))
        .await
        .unwrap();

    let response = app.oneshot(get("/metrics", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/plain"));

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("# TYPE gpt_broker_requests_total counter"));
    assert!(text.contains("gpt_broker_requests_total{method=\"GET\",status_code=\"200\"} 1"));
    assert!(text.contains("gpt_broker_valid_requests{method=\"GET\",status_code=\"200\"} 1"));
    assert!(text.contains("gpt_broker_failed_requests{method=\"GET\",status_code=\"401\"} 1"));
}
