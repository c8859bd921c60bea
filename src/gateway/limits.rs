use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::auth::Identity;
use super::{Clock, GatewayError, SystemClock};

const DEFAULT_LIMIT: u64 = 100;
const DEFAULT_WINDOW_SECONDS: u64 = 60 * 60;

/// What to do with a request when the quota store cannot be reached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    #[default]
    Closed,
    Open,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_limit")]
    pub limit: u64,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    /// Identity ids or emails that bypass the quota.
    #[serde(default)]
    pub exempt: Vec<String>,
    #[serde(default)]
    pub on_store_error: StoreFailurePolicy,
}

fn default_limit() -> u64 {
    DEFAULT_LIMIT
}

fn default_window_seconds() -> u64 {
    DEFAULT_WINDOW_SECONDS
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            window_seconds: DEFAULT_WINDOW_SECONDS,
            exempt: Vec::new(),
            on_store_error: StoreFailurePolicy::Closed,
        }
    }
}

impl LimitsConfig {
    pub fn window_millis(&self) -> u64 {
        self.window_seconds.max(1).saturating_mul(1000)
    }

    pub fn is_exempt(&self, identity: &Identity) -> bool {
        self.exempt.iter().any(|entry| {
            entry == &identity.id || (!identity.email.is_empty() && entry == &identity.email)
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QuotaKey(String);

impl QuotaKey {
    pub fn for_identity(identity: &Identity) -> Self {
        Self(format!("rate_limit:{}", identity.id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuotaRecord {
    pub key: QuotaKey,
    pub count: u64,
    pub reset_at_ms: u64,
    pub limit: u64,
}

impl QuotaRecord {
    pub fn exceeded(&self) -> bool {
        self.count > self.limit
    }

    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        self.reset_at_ms.saturating_sub(now_ms).div_ceil(1000)
    }
}

#[derive(Debug, Error)]
pub enum QuotaStoreError {
    #[error("quota backend unavailable: {0}")]
    Unavailable(String),
    #[error("unexpected quota backend response: {0}")]
    Protocol(String),
}

/// Counter backend. `increment` must be atomic per key, with the window reset folded into the
/// same step.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn increment(
        &self,
        key: &QuotaKey,
        limit: u64,
        window_ms: u64,
    ) -> Result<QuotaRecord, QuotaStoreError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RateDecision {
    Exempt,
    Allowed(QuotaRecord),
    FailedOpen,
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn QuotaStore>,
    config: LimitsConfig,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(store: Arc<dyn QuotaStore>, config: LimitsConfig) -> Self {
        Self {
            store,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &LimitsConfig {
        &self.config
    }

    pub async fn check(&self, identity: &Identity) -> Result<RateDecision, GatewayError> {
        if self.config.is_exempt(identity) {
            return Ok(RateDecision::Exempt);
        }

        let key = QuotaKey::for_identity(identity);
        let record = match self
            .store
            .increment(&key, self.config.limit, self.config.window_millis())
            .await
        {
            Ok(record) => record,
            Err(err) => {
                return match self.config.on_store_error {
                    StoreFailurePolicy::Open => {
                        tracing::warn!(
                            key = %key,
                            error = %err,
                            "quota store failed, admitting request"
                        );
                        Ok(RateDecision::FailedOpen)
                    }
                    StoreFailurePolicy::Closed => {
                        tracing::error!(
                            key = %key,
                            error = %err,
                            "quota store failed, rejecting request"
                        );
                        Err(GatewayError::QuotaUnavailable {
                            message: err.to_string(),
                        })
                    }
                };
            }
        };

        if record.exceeded() {
            let retry_after_secs = record.retry_after_secs(self.clock.now_epoch_millis());
            tracing::info!(
                key = %key,
                count = record.count,
                limit = record.limit,
                retry_after_secs,
                "rate limit exceeded"
            );
            return Err(GatewayError::RateLimited {
                limit: record.limit,
                retry_after_secs,
            });
        }

        Ok(RateDecision::Allowed(record))
    }
}
