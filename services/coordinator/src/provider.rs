use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::stream::{ChatRequest, DeltaSink, StreamingEngine};

/// Completion backend the compare runner drives.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn stream(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
        on_delta: &mut DeltaSink<'_>,
    ) -> Result<()>;

    async fn complete_once(&self, request: &ChatRequest) -> Result<String>;
}

#[async_trait]
impl ChatProvider for StreamingEngine {
    async fn stream(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
        on_delta: &mut DeltaSink<'_>,
    ) -> Result<()> {
        StreamingEngine::stream(self, request, cancel, on_delta).await
    }

    async fn complete_once(&self, request: &ChatRequest) -> Result<String> {
        StreamingEngine::complete_once(self, request).await
    }
}
