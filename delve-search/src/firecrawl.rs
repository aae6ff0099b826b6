//! Firecrawl search client

use async_trait::async_trait;
use delve_core::{DelveError, DelveResult, ErrorContext, SearchProvider, SearchProviderKind, SourceDocument};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{create_http_client, handle_response_error, transport_error, SearchClientConfig};

/// Firecrawl `/v1/search` client
pub struct FirecrawlProvider {
    client: reqwest::Client,
    config: SearchClientConfig,
}

#[derive(Debug, Serialize)]
struct FirecrawlSearchRequest<'a> {
    query: &'a str,
    limit: usize,
}

#[derive(Debug, Deserialize)]
struct FirecrawlSearchResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    data: Vec<FirecrawlResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FirecrawlResult {
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    markdown: Option<String>,
}

impl FirecrawlResult {
    fn into_document(self) -> Option<SourceDocument> {
        if self.url.trim().is_empty() {
            return None;
        }
        let content = self
            .markdown
            .filter(|m| !m.trim().is_empty())
            .or(self.description)
            .unwrap_or_default();
        let title = self.title.unwrap_or_else(|| self.url.clone());
        Some(SourceDocument::new(
            self.url,
            title,
            content,
            SearchProviderKind::Firecrawl,
        ))
    }
}

impl FirecrawlProvider {
    /// Create a new Firecrawl client
    pub fn new(config: SearchClientConfig) -> DelveResult<Self> {
        let client = create_http_client(&config)?;

        debug!("Created Firecrawl client for {}", config.base_url);

        Ok(Self { client, config })
    }

    fn parse_response(body: FirecrawlSearchResponse) -> DelveResult<Vec<SourceDocument>> {
        if body.success == Some(false) {
            return Err(DelveError::Provider {
                message: body
                    .error
                    .unwrap_or_else(|| "Firecrawl reported an unsuccessful search".to_string()),
                provider: SearchProviderKind::Firecrawl.to_string(),
                retryable: false,
                source: None,
                context: ErrorContext::new("firecrawl").with_operation("search"),
            });
        }

        Ok(body
            .data
            .into_iter()
            .filter_map(FirecrawlResult::into_document)
            .collect())
    }
}

#[async_trait]
impl SearchProvider for FirecrawlProvider {
    fn kind(&self) -> SearchProviderKind {
        SearchProviderKind::Firecrawl
    }

    async fn search(&self, query: &str, limit: usize) -> DelveResult<Vec<SourceDocument>> {
        let url = self.config.endpoint("v1/search");

        debug!(query = query, limit = limit, "Firecrawl search");

        let response = self
            .client
            .post(&url)
            .json(&FirecrawlSearchRequest { query, limit })
            .send()
            .await
            .map_err(|e| {
                transport_error(
                    e,
                    SearchProviderKind::Firecrawl,
                    "search",
                    self.config.timeout_seconds,
                )
            })?;

        if !response.status().is_success() {
            return Err(handle_response_error(response, SearchProviderKind::Firecrawl, "search").await);
        }

        let body: FirecrawlSearchResponse = response.json().await.map_err(|e| DelveError::Provider {
            message: format!("Failed to decode Firecrawl response: {}", e),
            provider: SearchProviderKind::Firecrawl.to_string(),
            retryable: false,
            source: Some(Box::new(e)),
            context: ErrorContext::new("firecrawl").with_operation("decode_response"),
        })?;

        let mut documents = Self::parse_response(body)?;
        documents.truncate(limit);
        Ok(documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_search_response() {
        let body: FirecrawlSearchResponse = serde_json::from_value(serde_json::json!({
            "success": true,
            "data": [
                {
                    "url": "https://tokio.rs",
                    "title": "Tokio",
                    "description": "An asynchronous runtime",
                    "markdown": "# Tokio\nAsync runtime for Rust"
                },
                { "url": "https://docs.rs/axum", "description": "Web framework" },
                { "url": "" }
            ]
        }))
        .unwrap();

        let documents = FirecrawlProvider::parse_response(body).unwrap();
        assert_eq!(documents.len(), 2);
        assert_eq!(documents[0].content, "# Tokio\nAsync runtime for Rust");
        assert_eq!(documents[1].title, "https://docs.rs/axum");
        assert_eq!(documents[1].content, "Web framework");
        assert!(documents
            .iter()
            .all(|d| d.provider == SearchProviderKind::Firecrawl));
    }

    #[test]
    fn test_unsuccessful_response_is_an_error() {
        let body: FirecrawlSearchResponse = serde_json::from_value(serde_json::json!({
            "success": false,
            "error": "Insufficient credits"
        }))
        .unwrap();

        match FirecrawlProvider::parse_response(body) {
            Err(DelveError::Provider { message, retryable, .. }) => {
                assert_eq!(message, "Insufficient credits");
                assert!(!retryable);
            }
            other => panic!("Expected Provider error, got {:?}", other),
        }
    }
}
