use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::Result;
use crate::types::CompletionRequest;

/// Lazy sequence of text fragments produced by a streaming completion.
pub type FragmentStream = BoxStream<'static, Result<String>>;

#[async_trait]
pub trait CompletionModel: Send + Sync {
    fn provider(&self) -> &str;

    async fn complete(&self, request: CompletionRequest) -> Result<String>;

    async fn stream(&self, request: CompletionRequest) -> Result<FragmentStream>;
}
