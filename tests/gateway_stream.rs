use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use futures_util::StreamExt;
use futures_util::stream;
use gpt_broker::gateway::{
    AuthGate, GatewayHttpState, Identity, LimitsConfig, MemoryQuotaStore, RateLimiter,
    RequestPipeline, StaticTokenVerifier, StreamRelay, router,
};
use gpt_broker::{BrokerError, ChatModel, CompletionModel, CompletionRequest, FragmentStream};
use serde_json::{Value, json};
use tower::util::ServiceExt;

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

enum Script {
    Fragments(Vec<&'static str>),
    FailAfter(Vec<&'static str>),
    Hang(Arc<AtomicBool>),
    RefuseToOpen,
}

struct ScriptedModel {
    script: Mutex<Option<Script>>,
    stream_calls: AtomicUsize,
    models: Mutex<Vec<ChatModel>>,
}

impl ScriptedModel {
    fn new(script: Script) -> Self {
        Self {
            script: Mutex::new(Some(script)),
            stream_calls: AtomicUsize::new(0),
            models: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl CompletionModel for ScriptedModel {
    fn provider(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _request: CompletionRequest) -> gpt_broker::Result<String> {
        Err(BrokerError::InvalidResponse("not used".to_string()))
    }

    async fn stream(&self, request: CompletionRequest) -> gpt_broker::Result<FragmentStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.models.lock().unwrap().push(request.model);
        let script = self.script.lock().unwrap().take();
        if matches!(script, Some(Script::RefuseToOpen)) {
            return Err(BrokerError::Api {
                status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                body: "overloaded, key sk-secret".to_string(),
            });
        }
        let stream = match script {
            Some(Script::Fragments(parts)) => {
                stream::iter(parts.into_iter().map(|part| Ok(part.to_string()))).boxed()
            }
            Some(Script::FailAfter(parts)) => {
                stream::iter(parts.into_iter().map(|part| Ok(part.to_string())))
                    .chain(stream::iter(vec![Err(BrokerError::InvalidResponse(
                        "connection reset".to_string(),
                    ))]))
                    .boxed()
            }
            Some(Script::Hang(dropped)) => {
                let flag = DropFlag(dropped);
                stream::iter(vec![Ok("first".to_string())])
                    .chain(stream::pending())
                    .map(move |item: gpt_broker::Result<String>| {
                        let _keep = &flag;
                        item
                    })
                    .boxed()
            }
            Some(Script::RefuseToOpen) | None => stream::empty().boxed(),
        };
        Ok(stream)
    }
}

fn state_with(model: Arc<ScriptedModel>) -> GatewayHttpState {
    let verifier = StaticTokenVerifier::default()
        .with_token("good-token", Identity::new("user-1", "user@example.com"));
    let limiter = RateLimiter::new(Arc::new(MemoryQuotaStore::new()), LimitsConfig::default());
    let pipeline = RequestPipeline::standard(AuthGate::new(Arc::new(verifier)), limiter);
    GatewayHttpState::new(pipeline, model)
}

fn app_with(model: Arc<ScriptedModel>) -> Router {
    router(state_with(model))
}

fn stream_request(auth: Option<&str>, payload: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/stream")
        .header("content-type", "application/json");
    if let Some(auth) = auth {
        builder = builder.header("authorization", auth);
    }
    builder.body(Body::from(payload.to_string())).unwrap()
}

fn valid_payload() -> Value {
    json!({
        "messages": [{"role": "user", "content": "tell me a story"}],
        "temperature": 0.5,
        "model": "gpt-4o"
    })
}

fn frames(body: &[u8]) -> Vec<Value> {
    std::str::from_utf8(body)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test]
async fn stream_relays_one_frame_per_fragment() {
    let model = Arc::new(ScriptedModel::new(Script::Fragments(vec![
        "Once", " upon", " a time",
    ])));
    let relay = StreamRelay::new().with_channel_capacity(4);
    let app = router(state_with(model.clone()).with_relay(relay));

    let response = app
        .oneshot(stream_request(Some("Bearer good-token"), valid_payload()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok()),
        Some("application/x-ndjson")
    );

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(
        frames(&body),
        vec![
            json!({"data": "Once"}),
            json!({"data": " upon"}),
            json!({"data": " a time"}),
        ]
    );
    assert_eq!(*model.models.lock().unwrap(), vec![ChatModel::Gpt4o]);
}

#[tokio::test]
async fn mid_stream_failure_ends_with_one_error_frame() {
    let model = Arc::new(ScriptedModel::new(Script::FailAfter(vec![
        "partial", " answer",
    ])));
    let app = app_with(model);

    let response = app
        .oneshot(stream_request(Some("Bearer good-token"), valid_payload()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let frames = frames(&body);
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0], json!({"data": "partial"}));
    assert_eq!(frames[1], json!({"data": " answer"}));
    assert!(frames[2].get("error").and_then(Value::as_str).is_some());
    assert!(frames[2].get("data").is_none());
}

#[tokio::test]
async fn upstream_that_fails_to_open_yields_one_error_frame() {
    let model = Arc::new(ScriptedModel::new(Script::RefuseToOpen));
    let app = app_with(model.clone());

    let response = app
        .oneshot(stream_request(Some("Bearer good-token"), valid_payload()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok()),
        Some("application/x-ndjson")
    );

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(
        frames(&body),
        vec![json!({"error": "upstream returned 503 Service Unavailable"})]
    );
    assert!(!String::from_utf8_lossy(&body).contains("sk-secret"));
    assert_eq!(model.stream_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn invalid_bearer_is_rejected_before_any_frame() {
    let model = Arc::new(ScriptedModel::new(Script::Fragments(vec!["never"])));
    let app = app_with(model.clone());

    let response = app
        .oneshot(stream_request(Some("Bearer wrong"), valid_payload()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"], "Invalid or expired token");
    assert_eq!(model.stream_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stream_validates_model_before_calling_upstream() {
    let model = Arc::new(ScriptedModel::new(Script::Fragments(vec!["never"])));
    let app = app_with(model.clone());

    let response = app
        .clone()
        .oneshot(stream_request(
            Some("Bearer good-token"),
            json!({"messages": [{"role": "user", "content": "hi"}], "model": "gpt-3.5-turbo"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"], "'model' must be one of gpt-4o,gpt-4o-mini");

    let response = app
        .oneshot(stream_request(
            Some("Bearer good-token"),
            json!({
                "messages": [{"role": "user", "content": "hi"}],
                "model": "gpt-4o",
                "temperature": 2
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(model.stream_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn client_disconnect_drops_upstream_stream() {
    let dropped = Arc::new(AtomicBool::new(false));
    let model = Arc::new(ScriptedModel::new(Script::Hang(dropped.clone())));
    let app = app_with(model);

    let response = app
        .oneshot(stream_request(Some("Bearer good-token"), valid_payload()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body().into_data_stream();
    let first = body.next().await.unwrap().unwrap();
    assert_eq!(&first[..], b"{\"data\":\"first\"}\n");
    assert!(!dropped.load(Ordering::SeqCst));

    drop(body);
    let mut released = false;
    for _ in 0..100 {
        if dropped.load(Ordering::SeqCst) {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(released, "upstream stream was not dropped after disconnect");
}
