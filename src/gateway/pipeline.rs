use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;

use super::GatewayError;
use super::auth::{AuthGate, Identity};
use super::limits::{QuotaRecord, RateDecision, RateLimiter};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelinePhase {
    Start,
    Auth,
    RateLimit,
    Handler,
    Done,
    Failed,
}

impl PipelinePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::Handler => "handler",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// Per-request state threaded through the stages and handed to the handler.
#[derive(Clone, Debug)]
pub struct PipelineContext {
    pub request_id: String,
    pub path: String,
    pub identity: Option<Identity>,
    pub quota: Option<QuotaRecord>,
    pub limit: Option<u64>,
    pub window_seconds: Option<u64>,
    pub phase: PipelinePhase,
}

impl PipelineContext {
    pub fn new(request_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            path: path.into(),
            identity: None,
            quota: None,
            limit: None,
            window_seconds: None,
            phase: PipelinePhase::Start,
        }
    }
}

#[derive(Debug)]
pub enum StageOutcome {
    Continue(PipelineContext),
    Terminal(GatewayError),
}

#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn name(&self) -> &'static str;

    fn phase(&self) -> PipelinePhase;

    async fn run(&self, ctx: PipelineContext, headers: &HeaderMap) -> StageOutcome;
}

#[derive(Clone, Debug)]
pub struct AuthStage {
    gate: AuthGate,
}

impl AuthStage {
    pub fn new(gate: AuthGate) -> Self {
        Self { gate }
    }
}

#[async_trait]
impl PipelineStage for AuthStage {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn phase(&self) -> PipelinePhase {
        PipelinePhase::Auth
    }

    async fn run(&self, mut ctx: PipelineContext, headers: &HeaderMap) -> StageOutcome {
        match self.gate.authenticate(headers).await {
            Ok(identity) => {
                ctx.identity = Some(identity);
                StageOutcome::Continue(ctx)
            }
            Err(err) => StageOutcome::Terminal(err),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RateLimitStage {
    limiter: RateLimiter,
}

impl RateLimitStage {
    pub fn new(limiter: RateLimiter) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl PipelineStage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn phase(&self) -> PipelinePhase {
        PipelinePhase::RateLimit
    }

    async fn run(&self, mut ctx: PipelineContext, _headers: &HeaderMap) -> StageOutcome {
        // Never limit an anonymous request: it means the stage list is misordered.
        let Some(identity) = ctx.identity.as_ref() else {
            return StageOutcome::Terminal(GatewayError::missing_credential());
        };

        let config = self.limiter.config();
        ctx.limit = Some(config.limit);
        ctx.window_seconds = Some(config.window_seconds);

        match self.limiter.check(identity).await {
            Ok(RateDecision::Allowed(record)) => {
                ctx.quota = Some(record);
                StageOutcome::Continue(ctx)
            }
            Ok(RateDecision::Exempt | RateDecision::FailedOpen) => StageOutcome::Continue(ctx),
            Err(err) => StageOutcome::Terminal(err),
        }
    }
}

/// Ordered gate stages run before a handler; the first terminal outcome wins.
#[derive(Clone, Default)]
pub struct RequestPipeline {
    stages: Vec<Arc<dyn PipelineStage>>,
}

impl std::fmt::Debug for RequestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPipeline")
            .field("stages", &self.stage_names())
            .finish()
    }
}

impl RequestPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Auth, then rate limiting.
    pub fn standard(gate: AuthGate, limiter: RateLimiter) -> Self {
        Self::new()
            .with_stage(Arc::new(AuthStage::new(gate)))
            .with_stage(Arc::new(RateLimitStage::new(limiter)))
    }

    pub fn with_stage(mut self, stage: Arc<dyn PipelineStage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub async fn admit(
        &self,
        mut ctx: PipelineContext,
        headers: &HeaderMap,
    ) -> Result<PipelineContext, GatewayError> {
        for stage in &self.stages {
            ctx.phase = stage.phase();
            let request_id = ctx.request_id.clone();
            ctx = match stage.run(ctx, headers).await {
                StageOutcome::Continue(ctx) => ctx,
                StageOutcome::Terminal(err) => {
                    tracing::info!(
                        request_id = %request_id,
                        stage = stage.name(),
                        phase = PipelinePhase::Failed.as_str(),
                        status = err.status().as_u16(),
                        "request rejected"
                    );
                    return Err(err);
                }
            };
        }

        ctx.phase = PipelinePhase::Handler;
        let user = ctx.identity.as_ref().map_or("-", |who| who.id.as_str());
        tracing::debug!(
            request_id = %ctx.request_id,
            path = %ctx.path,
            user,
            "request admitted"
        );
        Ok(ctx)
    }

    pub async fn run<T, F, Fut>(
        &self,
        ctx: PipelineContext,
        headers: &HeaderMap,
        handler: F,
    ) -> Result<T, GatewayError>
    where
        F: FnOnce(PipelineContext) -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let ctx = self.admit(ctx, headers).await?;
        let request_id = ctx.request_id.clone();
        let result = handler(ctx).await;
        let phase = if result.is_ok() {
            PipelinePhase::Done
        } else {
            PipelinePhase::Failed
        };
        tracing::debug!(request_id = %request_id, phase = phase.as_str(), "request finished");
        result
    }
}
