use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("api error ({status}): {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
}

impl BrokerError {
    /// Short description that is safe to hand to API clients: upstream bodies and
    /// transport details stay in the logs.
    pub fn summary(&self) -> String {
        match self {
            Self::Api { status, .. } => format!("upstream returned {status}"),
            Self::Http(err) if err.is_timeout() => "upstream request timed out".to_string(),
            Self::Http(_) | Self::Io(_) => "upstream request failed".to_string(),
            Self::InvalidResponse(_) | Self::Json(_) => "unexpected upstream response".to_string(),
            Self::Config(_) => "upstream is not configured".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
