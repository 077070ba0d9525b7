use crate::types::CompletionRequest;
use crate::Result;
use async_trait::async_trait;

/// A chat-completion backend.
///
/// Implementations return the raw assistant text; callers own any JSON recovery.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;

    /// Identifier recorded in tier records; a change invalidates cached tiers.
    fn model_id(&self) -> &str;
}
