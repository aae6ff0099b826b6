//! Search provider adapters
//!
//! This crate provides the search backends the research engine can query:
//! Firecrawl and Tavily over HTTP, and a local JSON document index.

use delve_core::{
    DelveError, DelveResult, ErrorContext, SearchProvider, SearchProviderKind, SearchSettings,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

pub mod firecrawl;
pub mod local;
pub mod tavily;


pub use firecrawl::FirecrawlProvider;
pub use local::LocalIndexProvider;
pub use tavily::TavilyProvider;

/// Configuration for HTTP search clients
#[derive(Debug, Clone)]
pub struct SearchClientConfig {
    /// Base URL for the API
    pub base_url: String,
    /// API key sent as a bearer token
    pub api_key: Option<String>,
    /// Request timeout in seconds
    pub timeout_seconds: u64,
    /// User agent string
    pub user_agent: String,
    /// Additional headers
    pub headers: HashMap<String, String>,
}

impl Default for SearchClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            timeout_seconds: 30,
            user_agent: format!("delve/{}", env!("CARGO_PKG_VERSION")),
            headers: HashMap::new(),
        }
    }
}

impl SearchClientConfig {
    /// Configuration for the Firecrawl API
    pub fn firecrawl(api_key: Option<String>) -> Self {
        Self {
            base_url: "https://api.firecrawl.dev".to_string(),
            api_key,
            ..Default::default()
        }
    }

    /// Configuration for the Tavily API
    pub fn tavily(api_key: Option<String>) -> Self {
        Self {
            base_url: "https://api.tavily.com".to_string(),
            api_key,
            ..Default::default()
        }
    }

    /// Override the base URL
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set additional header
    pub fn with_header(mut self, key: String, value: String) -> Self {
        self.headers.insert(key, value);
        self
    }

    /// Set timeout
    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// Factory for creating search providers
pub struct SearchProviderFactory;

impl SearchProviderFactory {
    /// Create an HTTP provider of the given kind
    pub fn create(
        kind: SearchProviderKind,
        config: SearchClientConfig,
    ) -> DelveResult<Arc<dyn SearchProvider>> {
        match kind {
            SearchProviderKind::Firecrawl => Ok(Arc::new(FirecrawlProvider::new(config)?)),
            SearchProviderKind::Tavily => Ok(Arc::new(TavilyProvider::new(config)?)),
            SearchProviderKind::Local => Err(DelveError::Config {
                message: "The local provider is built from an index file, not an HTTP config"
                    .to_string(),
                source: None,
                context: ErrorContext::new("search_provider_factory")
                    .with_operation("create")
                    .with_suggestion("Use SearchProviderFactory::from_settings"),
            }),
        }
    }

    /// Create a provider from its configured name.
    ///
    /// Unknown names fail with `UnsupportedProvider` before any client is built.
    pub fn create_by_name(
        name: &str,
        config: SearchClientConfig,
    ) -> DelveResult<Arc<dyn SearchProvider>> {
        let kind: SearchProviderKind = name.parse()?;
        Self::create(kind, config)
    }

    /// Create the provider selected by the search settings
    pub fn from_settings(settings: &SearchSettings) -> DelveResult<Arc<dyn SearchProvider>> {
        let kind: SearchProviderKind = settings.provider.parse()?;

        info!(provider = %kind, "Selecting search provider");

        let config = match kind {
            SearchProviderKind::Firecrawl => {
                SearchClientConfig::firecrawl(settings.firecrawl_api_key.clone())
            }
            SearchProviderKind::Tavily => SearchClientConfig::tavily(settings.tavily_api_key.clone()),
            SearchProviderKind::Local => {
                let path = settings.local_index_path.as_ref().ok_or_else(|| {
                    DelveError::Config {
                        message: "search.local_index_path is required for the local provider"
                            .to_string(),
                        source: None,
                        context: ErrorContext::new("search_provider_factory")
                            .with_operation("from_settings"),
                    }
                })?;
                return Ok(Arc::new(LocalIndexProvider::from_file(path)?));
            }
        };

        let config = match &settings.base_url {
            Some(base_url) => config.with_base_url(base_url.clone()),
            None => config,
        }
        .with_timeout(settings.timeout_seconds);

        Self::create(kind, config)
    }
}

/// Helper function to create HTTP client with common configuration
pub(crate) fn create_http_client(config: &SearchClientConfig) -> DelveResult<reqwest::Client> {
    let mut headers = reqwest::header::HeaderMap::new();

    headers.insert(
        reqwest::header::USER_AGENT,
        reqwest::header::HeaderValue::from_str(&config.user_agent).map_err(|e| {
            DelveError::Config {
                message: format!("Invalid user agent: {}", e),
                source: Some(Box::new(e)),
                context: ErrorContext::new("http_client").with_operation("create_client"),
            }
        })?,
    );

    if let Some(api_key) = &config.api_key {
        let mut value = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|e| DelveError::Config {
                message: format!("Invalid API key header: {}", e),
                source: Some(Box::new(e)),
                context: ErrorContext::new("http_client").with_operation("create_client"),
            })?;
        value.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, value);
    }

    for (key, value) in &config.headers {
        let header_name = reqwest::header::HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
            DelveError::Config {
                message: format!("Invalid header name '{}': {}", key, e),
                source: Some(Box::new(e)),
                context: ErrorContext::new("http_client").with_operation("create_client"),
            }
        })?;

        let header_value =
            reqwest::header::HeaderValue::from_str(value).map_err(|e| DelveError::Config {
                message: format!("Invalid header value for '{}': {}", key, e),
                source: Some(Box::new(e)),
                context: ErrorContext::new("http_client").with_operation("create_client"),
            })?;

        headers.insert(header_name, header_value);
    }

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(config.timeout_seconds))
        .default_headers(headers)
        .build()
        .map_err(|e| DelveError::Config {
            message: format!("Failed to create HTTP client: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("http_client").with_operation("create_client"),
        })?;

    Ok(client)
}

/// Classify a transport error from reqwest
pub(crate) fn transport_error(
    error: reqwest::Error,
    provider: SearchProviderKind,
    operation: &str,
    timeout_seconds: u64,
) -> DelveError {
    if error.is_timeout() {
        return DelveError::Timeout {
            operation: format!("{} {}", provider, operation),
            duration_ms: timeout_seconds * 1000,
            context: ErrorContext::new(provider.as_str())
                .with_operation(operation)
                .with_suggestion("Increase search.timeout_seconds"),
        };
    }

    let retryable = error.is_connect() || error.is_request();
    DelveError::Provider {
        message: format!("Request to {} failed: {}", provider, error),
        provider: provider.to_string(),
        retryable,
        source: Some(Box::new(error)),
        context: ErrorContext::new(provider.as_str())
            .with_operation(operation)
            .with_suggestion("Check network connectivity and API status"),
    }
}

/// Map an HTTP status to the error taxonomy
pub(crate) fn status_error(
    status: u16,
    body: &str,
    retry_after_secs: Option<u64>,
    provider: SearchProviderKind,
    operation: &str,
) -> DelveError {
    let detail = if body.trim().is_empty() {
        "no response body".to_string()
    } else {
        body.chars().take(300).collect()
    };

    let context = ErrorContext::new(provider.as_str())
        .with_operation(operation)
        .with_metadata("status", &status.to_string());

    match status {
        429 => DelveError::RateLimit {
            message: format!("{} returned HTTP 429: {}", provider, detail),
            retry_after_ms: retry_after_secs.map(|s| s * 1000),
            context: context.with_suggestion("Lower research.concurrency or wait before retrying"),
        },
        408 | 500..=599 => DelveError::Provider {
            message: format!("{} returned HTTP {}: {}", provider, status, detail),
            provider: provider.to_string(),
            retryable: true,
            source: None,
            context: context.with_suggestion("The provider may be temporarily unavailable"),
        },
        _ => DelveError::Provider {
            message: format!("{} returned HTTP {}: {}", provider, status, detail),
            provider: provider.to_string(),
            retryable: false,
            source: None,
            context: context.with_suggestion(match status {
                401 => "Check your API key",
                402 | 403 => "Check your plan, credits or API key permissions",
                _ => "Check the request parameters",
            }),
        },
    }
}

/// Helper function to handle HTTP response errors
pub(crate) async fn handle_response_error(
    response: reqwest::Response,
    provider: SearchProviderKind,
    operation: &str,
) -> DelveError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    let body = response.text().await.unwrap_or_default();

    status_error(status, &body, retry_after, provider, operation)
}
