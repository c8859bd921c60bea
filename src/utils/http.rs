use futures_util::StreamExt;
use serde::de::DeserializeOwned;

use crate::{BrokerError, Result};

const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

const TRUNCATED_SUFFIX: &str = "...(truncated)";

/// Reads at most `max_bytes` of an error body. Read failures end the body early instead of
/// masking the status that caused us to look at it.
pub(crate) async fn response_text_truncated(
    response: reqwest::Response,
    max_bytes: usize,
) -> String {
    let limit = max_bytes.max(1);
    let mut body = Vec::with_capacity(limit.min(4096));
    let mut chunks = response.bytes_stream();

    while let Some(Ok(chunk)) = chunks.next().await {
        let room = limit - body.len();
        if chunk.len() > room {
            body.extend_from_slice(&chunk[..room]);
            let mut text = String::from_utf8_lossy(&body).into_owned();
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(TRUNCATED_SUFFIX);
            return text;
        }
        body.extend_from_slice(&chunk);
    }
    String::from_utf8_lossy(&body).into_owned()
}

/// Sends `req`, turning a non-2xx status into `BrokerError::Api`.
pub(crate) async fn send_checked(req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
    let response = req.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response_text_truncated(response, MAX_ERROR_BODY_BYTES).await;
    tracing::debug!(%status, "upstream returned an error status");
    Err(BrokerError::Api { status, body })
}

pub(crate) async fn send_checked_json<T: DeserializeOwned>(
    req: reqwest::RequestBuilder,
) -> Result<T> {
    Ok(send_checked(req).await?.json::<T>().await?)
}
