//! Request-gating pipeline, quota enforcement, metrics and the HTTP surface.

pub mod auth;
pub mod config;
pub mod http;
pub mod limits;
pub mod memory_store;
pub mod metrics;
pub mod observability;
pub mod pipeline;
#[cfg(feature = "gateway-store-redis")]
pub mod redis_store;
pub mod relay;
pub mod validation;

use axum::http::StatusCode;
use thiserror::Error;

use crate::BrokerError;

pub use auth::{AuthGate, Identity, IdentityVerifier, StaticTokenVerifier, SupabaseVerifier};
pub use config::{GatewayConfig, IdentityConfig, QuotaStoreConfig};
pub use http::{GatewayHttpState, router};
pub use limits::{
    LimitsConfig, QuotaKey, QuotaRecord, QuotaStore, QuotaStoreError, RateDecision, RateLimiter,
    StoreFailurePolicy,
};
pub use memory_store::MemoryQuotaStore;
pub use metrics::{MetricsRecorderLayer, MetricsRegistry, MetricsSnapshot};
pub use pipeline::{
    PipelineContext, PipelinePhase, PipelineStage, RequestPipeline, StageOutcome,
};
#[cfg(feature = "gateway-store-redis")]
pub use redis_store::RedisQuotaStore;
pub use relay::{RelayStream, StreamFrame, StreamRelay};

pub const MISSING_CREDENTIAL: &str = "Authorization header is required";
pub const INVALID_CREDENTIAL: &str = "Invalid or expired token";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unauthorized: {reason}")]
    Unauthorized { reason: &'static str },
    #[error("invalid request: {reason}")]
    Validation { reason: String },
    #[error("rate limit exceeded: limit={limit}")]
    RateLimited { limit: u64, retry_after_secs: u64 },
    #[error("quota store unavailable: {message}")]
    QuotaUnavailable { message: String },
    #[error("upstream error: {source}")]
    Upstream {
        #[source]
        source: BrokerError,
    },
    #[error("endpoint not found")]
    NotFound,
}

impl GatewayError {
    pub fn missing_credential() -> Self {
        Self::Unauthorized {
            reason: MISSING_CREDENTIAL,
        }
    }

    pub fn invalid_credential() -> Self {
        Self::Unauthorized {
            reason: INVALID_CREDENTIAL,
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::QuotaUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound => StatusCode::NOT_FOUND,
        }
    }

    /// Text placed in the `error` field of the response body.
    pub fn client_message(&self) -> String {
        match self {
            Self::Unauthorized { reason } => (*reason).to_string(),
            Self::Validation { reason } => reason.clone(),
            Self::RateLimited { .. } => "Rate limit exceeded".to_string(),
            Self::QuotaUnavailable { .. } => "Rate limiter unavailable".to_string(),
            Self::Upstream { source } => format!("GPT Threw an error - {}", source.summary()),
            Self::NotFound => "Endpoint not found".to_string(),
        }
    }
}

impl From<BrokerError> for GatewayError {
    fn from(source: BrokerError) -> Self {
        Self::Upstream { source }
    }
}

pub trait Clock: Send + Sync {
    fn now_epoch_millis(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_millis(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0));
        u64::try_from(now.as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_expected_status_and_text() {
        let cases = [
            (
                GatewayError::missing_credential(),
                StatusCode::UNAUTHORIZED,
                "Authorization header is required",
            ),
            (
                GatewayError::invalid_credential(),
                StatusCode::UNAUTHORIZED,
                "Invalid or expired token",
            ),
            (
                GatewayError::validation("bad"),
                StatusCode::BAD_REQUEST,
                "bad",
            ),
            (
                GatewayError::RateLimited {
                    limit: 3,
                    retry_after_secs: 10,
                },
                StatusCode::TOO_MANY_REQUESTS,
                "Rate limit exceeded",
            ),
            (
                GatewayError::QuotaUnavailable {
                    message: "connection refused".to_string(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
                "Rate limiter unavailable",
            ),
            (
                GatewayError::NotFound,
                StatusCode::NOT_FOUND,
                "Endpoint not found",
            ),
        ];

        for (err, status, text) in cases {
            assert_eq!(err.status(), status);
            assert_eq!(err.client_message(), text);
        }
    }

    #[test]
    fn upstream_errors_keep_cause_but_show_summary() {
        let err = GatewayError::from(BrokerError::InvalidResponse("missing choices".to_string()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            err.client_message(),
            "GPT Threw an error - unexpected upstream response"
        );
        assert!(err.to_string().contains("missing choices"));
    }
}
