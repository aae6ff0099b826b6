//! Core trait definitions

use crate::error::DelveResult;
use crate::types::*;
use async_trait::async_trait;

/// Fetches documents for a query
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Which backend this is
    fn kind(&self) -> SearchProviderKind;

    /// Return up to `limit` documents for the query
    async fn search(&self, query: &str, limit: usize) -> DelveResult<Vec<SourceDocument>>;
}

/// Turns a prompt into text or a structured object
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Model identity, used in logs
    fn model(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> DelveResult<CompletionOutput>;
}
