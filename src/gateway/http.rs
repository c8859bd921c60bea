use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::{StreamExt, stream};
use serde::Serialize;
use serde_json::json;

use super::GatewayError;
use super::metrics::{
    METRICS_PATH, MetricsRecorderLayer, MetricsRegistry, PROMETHEUS_CONTENT_TYPE,
};
use super::pipeline::{PipelineContext, RequestPipeline};
use super::relay::{NDJSON_CONTENT_TYPE, StreamRelay};
use super::validation::{
    MISSING_PROMPT, completion_request, message_list_request, parse_json_body, prompt_request,
    stream_request,
};
use crate::model::CompletionModel;
use crate::types::{ChatModel, CompletionRequest};

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct GatewayHttpState {
    pipeline: Arc<RequestPipeline>,
    upstream: Arc<dyn CompletionModel>,
    metrics: MetricsRegistry,
    relay: StreamRelay,
}

impl std::fmt::Debug for GatewayHttpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayHttpState")
            .field("pipeline", &self.pipeline)
            .field("upstream", &self.upstream.provider())
            .field("relay", &self.relay)
            .finish_non_exhaustive()
    }
}

impl GatewayHttpState {
    pub fn new(pipeline: RequestPipeline, upstream: Arc<dyn CompletionModel>) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            upstream,
            metrics: MetricsRegistry::new(),
            relay: StreamRelay::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_relay(mut self, relay: StreamRelay) -> Self {
        self.relay = relay;
        self
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }
}

#[derive(Debug, Serialize)]
struct CompletionResponse {
    message: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::NotFound => json!({ "error": self.client_message() }),
            _ => json!({ "error": self.client_message(), "message": null }),
        };
        let mut response = (status, Json(body)).into_response();
        if let Self::RateLimited {
            retry_after_secs, ..
        } = &self
        {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

pub fn router(state: GatewayHttpState) -> Router {
    let metrics = MetricsRecorderLayer::new(state.metrics.clone());

    Router::new()
        .route("/health", get(health))
        .route(METRICS_PATH, get(metrics_text))
        .route("/simple-complete", get(handle_simple_complete))
        .route("/simple-gpt-4o-mini-complete", get(handle_simple_complete))
        .route("/advanced-complete", post(handle_advanced_complete))
        .route(
            "/advanced-gpt-4o-mini-complete",
            post(handle_advanced_complete),
        )
        .route("/v2/complete", post(handle_v2_complete))
        .route(
            "/v2/advanced-gpt-4o-mini-complete",
            post(handle_v2_complete),
        )
        .route("/complete-alt-model", post(handle_alt_model_complete))
        .route("/gpt-4o", post(handle_alt_model_complete))
        .route("/stream", post(handle_stream))
        .fallback(not_found)
        .with_state(state)
        .layer(metrics)
}

async fn health() -> &'static str {
    "OK"
}

async fn metrics_text(State(state): State<GatewayHttpState>) -> Response {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.metrics.render(),
    )
        .into_response()
}

async fn not_found(uri: Uri) -> Response {
    tracing::debug!(path = %uri.path(), "unknown endpoint");
    GatewayError::NotFound.into_response()
}

async fn handle_simple_complete(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let (state, uri) = (&state, &uri);
    gated(state, &headers, uri, move |ctx| async move {
        let Query(query) = Query::<Vec<(String, String)>>::try_from_uri(uri)
            .map_err(|_| GatewayError::validation(MISSING_PROMPT))?;
        let request = prompt_request(&query, ChatModel::Gpt4oMini)?;
        let text = complete(state, &ctx, request).await?;
        Ok(text.into_response())
    })
    .await
}

async fn handle_advanced_complete(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    let state = &state;
    gated(state, &headers, &uri, move |ctx| async move {
        let body = parse_json_body(&body)?;
        let request = message_list_request(&body, ChatModel::Gpt4oMini)?;
        let text = complete(state, &ctx, request).await?;
        Ok(text.into_response())
    })
    .await
}

async fn handle_v2_complete(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    complete_json(&state, &headers, &uri, body, ChatModel::Gpt4oMini).await
}

async fn handle_alt_model_complete(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    complete_json(&state, &headers, &uri, body, ChatModel::Gpt4o).await
}

async fn complete_json(
    state: &GatewayHttpState,
    headers: &HeaderMap,
    uri: &Uri,
    body: Bytes,
    model: ChatModel,
) -> Response {
    gated(state, headers, uri, move |ctx| async move {
        let body = parse_json_body(&body)?;
        let request = completion_request(&body, model)?;
        let message = complete(state, &ctx, request).await?;
        Ok(Json(CompletionResponse { message }).into_response())
    })
    .await
}

async fn handle_stream(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    let state = &state;
    gated(state, &headers, &uri, move |ctx| async move {
        let body = parse_json_body(&body)?;
        let request = stream_request(&body)?;
        let model = request.model;

        // An upstream that fails to open ends the stream with the same terminal error frame
        // as a mid-stream failure.
        let fragments = match state.upstream.stream(request).await {
            Ok(fragments) => {
                tracing::info!(
                    request_id = %ctx.request_id,
                    model = %model,
                    "streaming completion"
                );
                fragments
            }
            Err(err) => {
                tracing::error!(
                    request_id = %ctx.request_id,
                    provider = state.upstream.provider(),
                    model = %model,
                    error = %err,
                    "upstream stream failed to start"
                );
                stream::once(async move { Err::<String, _>(err) }).boxed()
            }
        };

        let body = Body::from_stream(state.relay.relay(fragments));
        Ok((
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, NDJSON_CONTENT_TYPE),
                (header::CACHE_CONTROL, "no-cache"),
                (HeaderName::from_static("x-accel-buffering"), "no"),
            ],
            body,
        )
            .into_response())
    })
    .await
}

/// Runs the pipeline stages, then `handler`, and stamps the request id on whatever comes out.
async fn gated<F, Fut>(
    state: &GatewayHttpState,
    headers: &HeaderMap,
    uri: &Uri,
    handler: F,
) -> Response
where
    F: FnOnce(PipelineContext) -> Fut,
    Fut: Future<Output = Result<Response, GatewayError>>,
{
    let request_id = extract_header(headers, REQUEST_ID_HEADER).unwrap_or_else(generate_request_id);
    let ctx = PipelineContext::new(request_id.clone(), uri.path());

    let mut response = match state.pipeline.run(ctx, headers, handler).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    };
    insert_request_id(response.headers_mut(), &request_id);
    response
}

async fn complete(
    state: &GatewayHttpState,
    ctx: &PipelineContext,
    request: CompletionRequest,
) -> Result<String, GatewayError> {
    let model = request.model;
    tracing::info!(request_id = %ctx.request_id, model = %model, "querying upstream");
    state.upstream.complete(request).await.map_err(|err| {
        tracing::error!(
            request_id = %ctx.request_id,
            provider = state.upstream.provider(),
            model = %model,
            error = %err,
            "upstream completion failed"
        );
        GatewayError::from(err)
    })
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn generate_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    format!("gpt-broker-{ts_ms}-{seq}")
}

fn insert_request_id(headers: &mut HeaderMap, request_id: &str) {
    let Ok(value) = HeaderValue::from_str(request_id) else {
        return;
    };
    headers.insert(REQUEST_ID_HEADER, value);
}
