//! Tavily search client

use async_trait::async_trait;
use delve_core::{DelveError, DelveResult, ErrorContext, SearchProvider, SearchProviderKind, SourceDocument};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{create_http_client, handle_response_error, transport_error, SearchClientConfig};

/// Tavily `/search` client
pub struct TavilyProvider {
    client: reqwest::Client,
    config: SearchClientConfig,
}

#[derive(Debug, Serialize)]
struct TavilySearchRequest<'a> {
    query: &'a str,
    max_results: usize,
    topic: &'static str,
    search_depth: &'static str,
    include_answer: bool,
    include_raw_content: bool,
    include_images: bool,
}

impl<'a> TavilySearchRequest<'a> {
    fn new(query: &'a str, max_results: usize) -> Self {
        Self {
            query,
            max_results,
            topic: "general",
            search_depth: "basic",
            include_answer: false,
            include_raw_content: false,
            include_images: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TavilySearchResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

impl TavilyResult {
    fn into_document(self) -> Option<SourceDocument> {
        if self.url.trim().is_empty() {
            return None;
        }
        let title = self.title.unwrap_or_else(|| self.url.clone());
        Some(SourceDocument::new(
            self.url,
            title,
            self.content.unwrap_or_default(),
            SearchProviderKind::Tavily,
        ))
    }
}

impl TavilyProvider {
    /// Create a new Tavily client
    pub fn new(config: SearchClientConfig) -> DelveResult<Self> {
        let client = create_http_client(&config)?;

        debug!("Created Tavily client for {}", config.base_url);

        Ok(Self { client, config })
    }
}

#[async_trait]
impl SearchProvider for TavilyProvider {
    fn kind(&self) -> SearchProviderKind {
        SearchProviderKind::Tavily
    }

    async fn search(&self, query: &str, limit: usize) -> DelveResult<Vec<SourceDocument>> {
        let url = self.config.endpoint("search");

        debug!(query = query, limit = limit, "Tavily search");

        let response = self
            .client
            .post(&url)
            .json(&TavilySearchRequest::new(query, limit))
            .send()
            .await
            .map_err(|e| {
                transport_error(
                    e,
                    SearchProviderKind::Tavily,
                    "search",
                    self.config.timeout_seconds,
                )
            })?;

        if !response.status().is_success() {
            return Err(handle_response_error(response, SearchProviderKind::Tavily, "search").await);
        }

        let body: TavilySearchResponse = response.json().await.map_err(|e| DelveError::Provider {
            message: format!("Failed to decode Tavily response: {}", e),
            provider: SearchProviderKind::Tavily.to_string(),
            retryable: false,
            source: Some(Box::new(e)),
            context: ErrorContext::new("tavily").with_operation("decode_response"),
        })?;

        let mut documents: Vec<SourceDocument> = body
            .results
            .into_iter()
            .filter_map(TavilyResult::into_document)
            .collect();
        documents.truncate(limit);
        Ok(documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body() {
        let body = serde_json::to_value(TavilySearchRequest::new("rust async", 4)).unwrap();
        assert_eq!(body["query"], "rust async");
        assert_eq!(body["max_results"], 4);
        assert_eq!(body["topic"], "general");
        assert_eq!(body["search_depth"], "basic");
        assert_eq!(body["include_answer"], false);
        assert_eq!(body["include_raw_content"], false);
        assert_eq!(body["include_images"], false);
    }

    #[test]
    fn test_results_map_to_documents() {
        let body: TavilySearchResponse = serde_json::from_value(serde_json::json!({
            "query": "rust async",
            "results": [
                { "title": "Tokio", "url": "https://tokio.rs", "content": "Async runtime", "score": 0.9 },
                { "url": "https://smol.rs", "content": "Small runtime" }
            ]
        }))
        .unwrap();

        let documents: Vec<SourceDocument> = body
            .results
            .into_iter()
            .filter_map(TavilyResult::into_document)
            .collect();
        assert_eq!(documents.len(), 2);
        assert_eq!(documents[0].title, "Tokio");
        assert_eq!(documents[0].content, "Async runtime");
        assert_eq!(documents[1].title, "https://smol.rs");
        assert_eq!(documents[1].provider, SearchProviderKind::Tavily);
    }
}
