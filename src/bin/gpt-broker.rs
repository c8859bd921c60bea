use std::path::PathBuf;

use clap::Parser;
use gpt_broker::Env;
use gpt_broker::gateway::{
    AuthGate, GatewayConfig, GatewayHttpState, QuotaStoreConfig, RateLimiter, RequestPipeline,
    observability, router,
};

/// Authenticated, rate-limited gateway in front of an LLM chat-completion API.
#[derive(Parser, Debug)]
#[command(name = "gpt-broker", version)]
struct Cli {
    /// Config file (`.json`, otherwise TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file
    #[arg(long, visible_alias = "addr")]
    listen: Option<String>,

    /// Dotenv file whose values take precedence over the process environment.
    /// Defaults to `./.env` when that file exists
    #[arg(long)]
    dotenv: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Use a Redis quota store at this URL
    #[arg(long)]
    redis: Option<String>,

    /// Key prefix for the Redis quota store
    #[arg(long, requires = "redis")]
    redis_prefix: Option<String>,

    /// Export spans over OTLP/HTTP
    #[arg(long)]
    otel: bool,

    /// OTLP endpoint, implies --otel
    #[arg(long)]
    otel_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    let env = Env::discover(cli.dotenv.as_deref(), ".").await?;

    let mut config = match &cli.config {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };
    config.apply_env(&env);
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(url) = cli.redis {
        config.quota_store = QuotaStoreConfig::Redis {
            url,
            prefix: cli.redis_prefix,
        };
    }
    config.json_logs |= cli.json_logs;

    let otel_enabled = cli.otel || cli.otel_endpoint.is_some();
    let _otel_guard = attach_tracing(otel_enabled, cli.otel_endpoint.as_deref(), config.json_logs)?;

    let verifier = config.build_verifier()?;
    let store = config.build_quota_store()?;
    let upstream = config.build_upstream(&env)?;

    let limiter = RateLimiter::new(store, config.limits.clone());
    let pipeline = RequestPipeline::standard(AuthGate::new(verifier), limiter);
    let state = GatewayHttpState::new(pipeline, upstream);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!(
        listen = %config.listen,
        limit = config.limits.limit,
        window_seconds = config.limits.window_seconds,
        "gpt-broker listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("gpt-broker stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[cfg(feature = "gateway-otel")]
fn attach_tracing(
    otel: bool,
    endpoint: Option<&str>,
    json_logs: bool,
) -> Result<Option<observability::OtelGuard>, Box<dyn std::error::Error + Send + Sync>> {
    if !otel {
        observability::init_tracing(json_logs)?;
        return Ok(None);
    }
    Ok(Some(observability::init_tracing_with_otel(
        endpoint, json_logs,
    )?))
}

#[cfg(not(feature = "gateway-otel"))]
fn attach_tracing(
    otel: bool,
    _endpoint: Option<&str>,
    json_logs: bool,
) -> Result<Option<()>, Box<dyn std::error::Error + Send + Sync>> {
    if otel {
        return Err("otel requires `--features gateway-otel`".into());
    }
    observability::init_tracing(json_logs)?;
    Ok(None)
}
