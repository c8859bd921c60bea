use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::auth::{Identity, IdentityVerifier, StaticTokenVerifier, SupabaseVerifier};
use super::limits::{LimitsConfig, QuotaStore};
use super::memory_store::MemoryQuotaStore;
use crate::BrokerError;
use crate::env::Env;
use crate::model::CompletionModel;
use crate::providers::{OpenAiChat, OpenAiConfig};

pub const DEFAULT_LISTEN: &str = "127.0.0.1:5002";

#[derive(Debug, Error)]
pub enum GatewayConfigError {
    #[error("read config failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("parse config failed: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("parse config failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("upstream config: {0}")]
    Upstream(#[from] BrokerError),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentityConfig>,
    #[serde(default)]
    pub upstream: OpenAiConfig,
    #[serde(default)]
    pub quota_store: QuotaStoreConfig,
    #[serde(default)]
    pub json_logs: bool,
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            limits: LimitsConfig::default(),
            identity: None,
            upstream: OpenAiConfig::default(),
            quota_store: QuotaStoreConfig::default(),
            json_logs: false,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdentityConfig {
    Supabase {
        url: String,
        anon_key: String,
    },
    Static {
        #[serde(default)]
        tokens: BTreeMap<String, Identity>,
    },
}

impl std::fmt::Debug for IdentityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Supabase { url, .. } => f
                .debug_struct("Supabase")
                .field("url", url)
                .field("anon_key", &"<redacted>")
                .finish(),
            Self::Static { tokens } => f
                .debug_struct("Static")
                .field("tokens", &tokens.len())
                .finish(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuotaStoreConfig {
    #[default]
    Memory,
    Redis {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
    },
}

impl GatewayConfig {
    /// Reads a `.json` file as JSON and anything else as TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GatewayConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Ok(serde_json::from_str(&raw)?)
        } else {
            Ok(toml::from_str(&raw)?)
        }
    }

    /// Overlays `SUPABASE_URL`/`SUPABASE_KEY` and `REDIS_URL`. The upstream key is read from
    /// `OPENAI_API_KEY` when the upstream client is built.
    pub fn apply_env(&mut self, env: &Env) {
        let supabase_url = env.get("SUPABASE_URL");
        let supabase_key = env.get("SUPABASE_KEY");
        if let Some(IdentityConfig::Supabase { url, anon_key }) = &mut self.identity {
            if let Some(env_url) = supabase_url {
                *url = env_url;
            }
            if let Some(env_key) = supabase_key {
                *anon_key = env_key;
            }
        } else if let (Some(url), Some(anon_key)) = (supabase_url, supabase_key) {
            self.identity = Some(IdentityConfig::Supabase { url, anon_key });
        }

        if let Some(url) = env.get("REDIS_URL") {
            let prefix = match &self.quota_store {
                QuotaStoreConfig::Redis { prefix, .. } => prefix.clone(),
                QuotaStoreConfig::Memory => None,
            };
            self.quota_store = QuotaStoreConfig::Redis { url, prefix };
        }
    }

    pub fn build_verifier(&self) -> Result<Arc<dyn IdentityVerifier>, GatewayConfigError> {
        match &self.identity {
            Some(IdentityConfig::Supabase { url, anon_key }) => {
                if url.trim().is_empty() || anon_key.trim().is_empty() {
                    return Err(GatewayConfigError::Invalid(
                        "supabase identity requires url and anon_key".to_string(),
                    ));
                }
                Ok(Arc::new(SupabaseVerifier::new(url.trim(), anon_key.trim())))
            }
            Some(IdentityConfig::Static { tokens }) => Ok(Arc::new(StaticTokenVerifier::new(
                tokens
                    .iter()
                    .map(|(token, identity)| (token.clone(), identity.clone()))
                    .collect(),
            ))),
            None => Err(GatewayConfigError::Invalid(
                "identity provider is not configured (set SUPABASE_URL and SUPABASE_KEY)"
                    .to_string(),
            )),
        }
    }

    pub fn build_quota_store(&self) -> Result<Arc<dyn QuotaStore>, GatewayConfigError> {
        match &self.quota_store {
            QuotaStoreConfig::Memory => Ok(Arc::new(MemoryQuotaStore::new())),
            #[cfg(feature = "gateway-store-redis")]
            QuotaStoreConfig::Redis { url, prefix } => {
                let mut store = super::redis_store::RedisQuotaStore::new(url)
                    .map_err(|err| GatewayConfigError::Invalid(format!("redis url: {err}")))?;
                if let Some(prefix) = prefix {
                    store = store.with_prefix(prefix.clone());
                }
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "gateway-store-redis"))]
            QuotaStoreConfig::Redis { .. } => Err(GatewayConfigError::Invalid(
                "redis quota store requires the `gateway-store-redis` feature".to_string(),
            )),
        }
    }

    pub fn build_upstream(
        &self,
        env: &Env,
    ) -> Result<Arc<dyn CompletionModel>, GatewayConfigError> {
        Ok(Arc::new(OpenAiChat::from_config(&self.upstream, env)?))
    }
}
