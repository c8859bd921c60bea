use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use axum::http::{Request, Response};
use serde::Serialize;
use tower::{Layer, Service};

pub const REQUESTS_TOTAL: &str = "gpt_broker_requests_total";
pub const VALID_REQUESTS: &str = "gpt_broker_valid_requests";
pub const FAILED_REQUESTS: &str = "gpt_broker_failed_requests";
pub const METRICS_PATH: &str = "/metrics";
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

const DEFAULT_MAX_SERIES: usize = 256;
const OVERFLOW_LABEL: &str = "__overflow__";

type SeriesKey = (String, String);

#[derive(Debug, Default)]
struct Counters {
    requests_total: HashMap<SeriesKey, u64>,
    valid_requests: HashMap<SeriesKey, u64>,
    failed_requests: HashMap<SeriesKey, u64>,
}

/// Per-(method, status) counters of handled requests.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    counters: Arc<Mutex<Counters>>,
    max_series: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub valid_requests: u64,
    pub failed_requests: u64,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_max_series(DEFAULT_MAX_SERIES)
    }

    pub fn with_max_series(max_series: usize) -> Self {
        Self {
            counters: Arc::new(Mutex::new(Counters::default())),
            max_series: max_series.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, method: &str, status: u16) {
        let key = (method.to_string(), status.to_string());
        let mut counters = self.lock();
        bump_limited(&mut counters.requests_total, key.clone(), self.max_series);
        if (200..=299).contains(&status) {
            bump_limited(&mut counters.valid_requests, key, self.max_series);
        } else {
            bump_limited(&mut counters.failed_requests, key, self.max_series);
        }
    }

    pub fn count(&self, metric: &str, method: &str, status: u16) -> u64 {
        let counters = self.lock();
        let map = match metric {
            REQUESTS_TOTAL => &counters.requests_total,
            VALID_REQUESTS => &counters.valid_requests,
            FAILED_REQUESTS => &counters.failed_requests,
            _ => return 0,
        };
        map.get(&(method.to_string(), status.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self.lock();
        MetricsSnapshot {
            requests_total: counters.requests_total.values().sum(),
            valid_requests: counters.valid_requests.values().sum(),
            failed_requests: counters.failed_requests.values().sum(),
        }
    }

    /// Prometheus text exposition format.
    pub fn render(&self) -> String {
        let counters = self.lock();
        let mut out = String::new();
        write_counter_map(
            &mut out,
            REQUESTS_TOTAL,
            "Number of requests made to gpt-broker",
            &counters.requests_total,
        );
        write_counter_map(
            &mut out,
            VALID_REQUESTS,
            "The number of requests that passed security and queried GPT",
            &counters.valid_requests,
        );
        write_counter_map(
            &mut out,
            FAILED_REQUESTS,
            "The number of requests that failed security checks",
            &counters.failed_requests,
        );
        out
    }
}

fn bump_limited(map: &mut HashMap<SeriesKey, u64>, key: SeriesKey, max_series: usize) {
    let key = if map.contains_key(&key) || map.len() < max_series {
        key
    } else {
        (OVERFLOW_LABEL.to_string(), OVERFLOW_LABEL.to_string())
    };
    let count = map.entry(key).or_default();
    *count = count.saturating_add(1);
}

fn write_counter_map(out: &mut String, metric: &str, help: &str, map: &HashMap<SeriesKey, u64>) {
    out.push_str(&format!("# HELP {metric} {help}\n"));
    out.push_str(&format!("# TYPE {metric} counter\n"));

    let mut entries: Vec<(&SeriesKey, &u64)> = map.iter().collect();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));
    for ((method, status), count) in entries {
        out.push_str(&format!(
            "{metric}{{method=\"{}\",status_code=\"{}\"}} {count}\n",
            escape_label_value(method),
            escape_label_value(status)
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    let mut out = String::new();
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '"' => out.push_str("\\\""),
            _ => out.push(c),
        }
    }
    out
}

/// Counts every response of the wrapped service, except those for excluded paths.
#[derive(Clone, Debug)]
pub struct MetricsRecorderLayer {
    registry: MetricsRegistry,
    excluded: Arc<[String]>,
}

impl MetricsRecorderLayer {
    pub fn new(registry: MetricsRegistry) -> Self {
        Self {
            registry,
            excluded: Arc::from(vec![METRICS_PATH.to_string()]),
        }
    }

    pub fn exclude_path(mut self, path: impl Into<String>) -> Self {
        let mut excluded = self.excluded.to_vec();
        excluded.push(path.into());
        self.excluded = Arc::from(excluded);
        self
    }
}

impl<S> Layer<S> for MetricsRecorderLayer {
    type Service = MetricsRecorder<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsRecorder {
            inner,
            registry: self.registry.clone(),
            excluded: self.excluded.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MetricsRecorder<S> {
    inner: S,
    registry: MetricsRegistry,
    excluded: Arc<[String]>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for MetricsRecorder<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // Call the instance that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let skip = self
            .excluded
            .iter()
            .any(|path| path == req.uri().path());
        let method = req.method().as_str().to_string();
        let registry = self.registry.clone();

        Box::pin(async move {
            let response = inner.call(req).await?;
            if !skip {
                registry.record(&method, response.status().as_u16());
            }
            Ok(response)
        })
    }
}
