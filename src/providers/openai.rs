use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use serde::{Deserialize, Serialize};

use crate::env::Env;
use crate::model::{CompletionModel, FragmentStream};
use crate::types::{ChatMessage, CompletionRequest};
use crate::utils::http::{send_checked, send_checked_json};
use crate::utils::sse::sse_data_stream_from_response;
use crate::{BrokerError, Result};

pub(crate) const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_TIMEOUT_SECONDS: u64 = 300;
const API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
        }
    }
}

impl std::fmt::Debug for OpenAiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

/// Chat-completions client for the OpenAI API (or anything speaking its wire format).
#[derive(Clone)]
pub struct OpenAiChat {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiChat {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_timeout(api_key, Duration::from_secs(DEFAULT_TIMEOUT_SECONDS))
    }

    fn with_timeout(api_key: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn from_config(config: &OpenAiConfig, env: &Env) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| env.get(API_KEY_ENV))
            .ok_or_else(|| {
                BrokerError::Config(format!("upstream api key is not set (set {API_KEY_ENV})"))
            })?;

        let timeout = Duration::from_secs(config.timeout_seconds.max(1));
        let mut out = Self::with_timeout(api_key, timeout);
        if !config.base_url.trim().is_empty() {
            out = out.with_base_url(config.base_url.trim());
        }
        Ok(out)
    }

    fn chat_completions_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{base}/chat/completions")
        }
    }

    fn request_builder(&self, body: &ChatCompletionBody<'_>) -> reqwest::RequestBuilder {
        let mut req = self.http.post(self.chat_completions_url()).json(body);
        if !self.api_key.trim().is_empty() {
            req = req.bearer_auth(&self.api_key);
        }
        req
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

impl<'a> ChatCompletionBody<'a> {
    fn new(request: &'a CompletionRequest, stream: bool) -> Self {
        Self {
            model: request.model.as_str(),
            messages: &request.messages,
            temperature: request.temperature,
            stream,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: Option<ChatCompletionMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChatCompletionChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunkChoice {
    #[serde(default)]
    delta: Option<ChatCompletionDelta>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionDelta {
    #[serde(default)]
    content: Option<String>,
}

fn parse_stream_data(data: &str) -> Result<Option<String>> {
    let chunk: ChatCompletionChunk = serde_json::from_str(data)?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta)
        .and_then(|delta| delta.content)
        .filter(|content| !content.is_empty()))
}

#[async_trait]
impl CompletionModel for OpenAiChat {
    fn provider(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let body = ChatCompletionBody::new(&request, false);
        let parsed: ChatCompletionResponse = send_checked_json(self.request_builder(&body)).await?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .ok_or_else(|| {
                BrokerError::InvalidResponse("chat completion has no message content".to_string())
            })?;
        Ok(content.trim().to_string())
    }

    async fn stream(&self, request: CompletionRequest) -> Result<FragmentStream> {
        let body = ChatCompletionBody::new(&request, true);
        let response =
            send_checked(self.request_builder(&body).header("Accept", "text/event-stream")).await?;

        let data_stream = sse_data_stream_from_response(response);
        let stream = stream::unfold(
            (data_stream, false),
            |(mut data_stream, done)| async move {
                if done {
                    return None;
                }
                loop {
                    match data_stream.next().await {
                        Some(Ok(data)) => match parse_stream_data(&data) {
                            Ok(Some(fragment)) => return Some((Ok(fragment), (data_stream, false))),
                            Ok(None) => continue,
                            Err(err) => return Some((Err(err), (data_stream, true))),
                        },
                        Some(Err(err)) => return Some((Err(err), (data_stream, true))),
                        None => return None,
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }
}
