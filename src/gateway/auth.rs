use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

use super::GatewayError;
use crate::utils::http::response_text_truncated;
use crate::{BrokerError, Result};

/// The caller a bearer credential resolved to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    #[serde(default)]
    pub email: String,
}

impl Identity {
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
        }
    }
}

/// Resolves a bearer token to an identity. `Ok(None)` means the provider rejected the token.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Option<Identity>>;
}

const USER_PATH: &str = "/auth/v1/user";
const VERIFY_TIMEOUT_SECS: u64 = 10;
const MAX_ERROR_BODY_BYTES: usize = 4 * 1024;

/// Verifies tokens against a Supabase-style `/auth/v1/user` endpoint.
#[derive(Clone)]
pub struct SupabaseVerifier {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
}

impl std::fmt::Debug for SupabaseVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupabaseVerifier")
            .field("base_url", &self.base_url)
            .field("anon_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct SupabaseUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

impl SupabaseVerifier {
    pub fn new(base_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(VERIFY_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: base_url.into(),
            anon_key: anon_key.into(),
        }
    }

    fn user_url(&self) -> String {
        format!("{}{USER_PATH}", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl IdentityVerifier for SupabaseVerifier {
    async fn verify(&self, token: &str) -> Result<Option<Identity>> {
        let response = self
            .http
            .get(self.user_url())
            .header("apikey", &self.anon_key)
            .bearer_auth(token)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response_text_truncated(response, MAX_ERROR_BODY_BYTES).await;
            return Err(BrokerError::Api { status, body });
        }

        let user: SupabaseUser = response.json().await?;
        if user.id.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(Identity {
            id: user.id,
            email: user.email.unwrap_or_default(),
        }))
    }
}

/// Fixed token table, for local development and tests.
#[derive(Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Identity>,
}

impl std::fmt::Debug for StaticTokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenVerifier")
            .field("tokens", &self.tokens.len())
            .finish()
    }
}

impl StaticTokenVerifier {
    pub fn new(tokens: HashMap<String, Identity>) -> Self {
        Self { tokens }
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }
}

#[async_trait]
impl IdentityVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Option<Identity>> {
        Ok(self.tokens.get(token).cloned())
    }
}

pub fn extract_bearer(headers: &HeaderMap) -> Option<Option<String>> {
    let value = headers.get("authorization")?;
    let token = value.to_str().ok().and_then(|raw| {
        let raw = raw.trim();
        let (scheme, rest) = raw.split_once(char::is_whitespace)?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        let token = rest.trim();
        (!token.is_empty()).then(|| token.to_string())
    });
    Some(token)
}

#[derive(Clone)]
pub struct AuthGate {
    verifier: Arc<dyn IdentityVerifier>,
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate").finish_non_exhaustive()
    }
}

impl AuthGate {
    pub fn new(verifier: Arc<dyn IdentityVerifier>) -> Self {
        Self { verifier }
    }

    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
    ) -> std::result::Result<Identity, GatewayError> {
        let Some(token) = extract_bearer(headers) else {
            return Err(GatewayError::missing_credential());
        };
        let Some(token) = token else {
            return Err(GatewayError::invalid_credential());
        };

        match self.verifier.verify(&token).await {
            Ok(Some(identity)) => Ok(identity),
            Ok(None) => Err(GatewayError::invalid_credential()),
            Err(err) => {
                tracing::warn!(error = %err, "identity verification failed");
                Err(GatewayError::invalid_credential())
            }
        }
    }
}
