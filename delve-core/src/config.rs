//! Configuration management

use crate::async_utils::RetryPolicy;
use crate::error::{DelveError, DelveResult, ErrorContext};
use crate::types::{OutputMode, SearchProviderKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// LLM providers the completion adapter can build
pub const SUPPORTED_LLM_PROVIDERS: [&str; 4] = ["openai", "anthropic", "ollama", "groq"];

/// Top level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelveConfig {
    pub research: ResearchSettings,
    pub search: SearchSettings,
    pub llm: LlmSettings,
}

/// Shape and limits of a research run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResearchSettings {
    /// Number of queries at the first level
    pub breadth: usize,
    /// Levels of follow-up below the first level
    pub depth: usize,
    /// Maximum number of nodes in flight
    pub concurrency: usize,
    pub output_mode: OutputMode,
    /// Overall wall clock budget for the research phase
    pub timeout_secs: Option<u64>,
    /// Documents per search; the node's breadth when unset
    pub search_limit: Option<usize>,
    /// Token Jaccard similarity at which two queries count as duplicates
    pub query_similarity_threshold: f64,
    /// Enables near-duplicate suppression of single-source claims on the same URL
    pub fact_similarity_threshold: Option<f64>,
    /// Capacity of the progress channel
    pub progress_buffer: usize,
}

impl Default for ResearchSettings {
    fn default() -> Self {
        Self {
            breadth: 4,
            depth: 2,
            concurrency: 4,
            output_mode: OutputMode::Report,
            timeout_secs: None,
            search_limit: None,
            query_similarity_threshold: 0.8,
            fact_similarity_threshold: None,
            progress_buffer: 64,
        }
    }
}

/// Search provider selection and credentials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    /// firecrawl, tavily or local
    pub provider: String,
    pub firecrawl_api_key: Option<String>,
    pub tavily_api_key: Option<String>,
    /// Override the provider's API base URL
    pub base_url: Option<String>,
    /// JSON document index used by the local provider
    pub local_index_path: Option<PathBuf>,
    pub timeout_seconds: u64,
    pub retry: RetryPolicy,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            provider: "firecrawl".to_string(),
            firecrawl_api_key: None,
            tavily_api_key: None,
            base_url: None,
            local_index_path: None,
            timeout_seconds: 30,
            retry: RetryPolicy::search(),
        }
    }
}

/// Completion service settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub provider: String,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    /// Left to the provider default when unset
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub timeout_seconds: u64,
    pub retry: RetryPolicy,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "o4-mini".to_string(),
            api_key: None,
            base_url: None,
            temperature: None,
            max_tokens: None,
            timeout_seconds: 180,
            retry: RetryPolicy::completion(),
        }
    }
}

impl LlmSettings {
    /// Environment variable holding the provider's API key
    pub fn api_key_var(&self) -> Option<&'static str> {
        match self.provider.as_str() {
            "openai" => Some("OPENAI_API_KEY"),
            "anthropic" => Some("ANTHROPIC_API_KEY"),
            "groq" => Some("GROQ_API_KEY"),
            _ => None,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn config_failure(message: String, suggestion: &str) -> DelveError {
    DelveError::Config {
        message,
        source: None,
        context: ErrorContext::new("config")
            .with_operation("validate")
            .with_suggestion(suggestion),
    }
}

impl DelveConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> DelveResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| DelveError::Config {
            message: format!("Failed to read config file: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config")
                .with_operation("read_file")
                .with_suggestion("Check if the config file exists and is readable"),
        })?;

        let config: DelveConfig = toml::from_str(&content).map_err(|e| DelveError::Config {
            message: format!("Failed to parse config: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config")
                .with_operation("parse_toml")
                .with_suggestion("Check TOML syntax in config file"),
        })?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> DelveResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| DelveError::Config {
            message: format!("Failed to serialize config: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config").with_operation("serialize_toml"),
        })?;

        std::fs::write(path, content).map_err(|e| DelveError::Config {
            message: format!("Failed to write config file: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config")
                .with_operation("write_file")
                .with_suggestion("Check if the directory exists and is writable"),
        })?;

        Ok(())
    }

    /// Overlay settings from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Overlay settings from an arbitrary variable lookup
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| non_empty(lookup(key));

        if let Some(provider) = var("SEARCH_PROVIDER") {
            self.search.provider = provider.trim().to_lowercase();
        }
        if let Some(key) = var("FIRECRAWL_KEY") {
            self.search.firecrawl_api_key = Some(key);
        }
        if let Some(key) = var("TAVILY_API_KEY") {
            self.search.tavily_api_key = Some(key);
        }
        if let Some(provider) = var("LLM_PROVIDER") {
            self.llm.provider = provider.trim().to_lowercase();
        }
        if let Some(model) = var("LLM_MODEL") {
            self.llm.model = model;
        }

        if non_empty(self.llm.api_key.clone()).is_none() {
            if let Some(key) = self.llm.api_key_var().and_then(var) {
                self.llm.api_key = Some(key);
            }
        }

        if self.llm.provider == "ollama" && self.llm.base_url.is_none() {
            if let Some(host) = var("OLLAMA_HOST") {
                self.llm.base_url = Some(host);
            }
        }
    }

    /// Selected search backend
    pub fn provider_kind(&self) -> DelveResult<SearchProviderKind> {
        self.search.provider.parse()
    }

    /// Validate ranges and provider names
    pub fn validate(&self) -> DelveResult<()> {
        let research = &self.research;

        if research.breadth == 0 {
            return Err(config_failure(
                "research.breadth must be at least 1".to_string(),
                "Set research.breadth to a positive value",
            ));
        }

        if research.concurrency == 0 {
            return Err(config_failure(
                "research.concurrency must be at least 1".to_string(),
                "Set research.concurrency to a positive value",
            ));
        }

        if research.timeout_secs == Some(0) {
            return Err(config_failure(
                "research.timeout_secs must be greater than 0".to_string(),
                "Remove research.timeout_secs to disable the overall timeout",
            ));
        }

        if research.search_limit == Some(0) {
            return Err(config_failure(
                "research.search_limit must be greater than 0".to_string(),
                "Remove research.search_limit to use the node breadth",
            ));
        }

        if !(research.query_similarity_threshold > 0.0
            && research.query_similarity_threshold <= 1.0)
        {
            return Err(config_failure(
                format!(
                    "research.query_similarity_threshold must be in (0, 1], got {}",
                    research.query_similarity_threshold
                ),
                "Use a value such as 0.8",
            ));
        }

        if let Some(threshold) = research.fact_similarity_threshold {
            if !(threshold > 0.0 && threshold <= 1.0) {
                return Err(config_failure(
                    format!(
                        "research.fact_similarity_threshold must be in (0, 1], got {}",
                        threshold
                    ),
                    "Use a value such as 0.9 or remove the setting",
                ));
            }
        }

        self.provider_kind()?;

        if !SUPPORTED_LLM_PROVIDERS.contains(&self.llm.provider.as_str()) {
            return Err(config_failure(
                format!("Unsupported LLM provider: {}", self.llm.provider),
                "Supported LLM providers: openai, anthropic, ollama, groq",
            ));
        }

        if self.llm.model.trim().is_empty() {
            return Err(config_failure(
                "llm.model must not be empty".to_string(),
                "Set llm.model or the LLM_MODEL environment variable",
            ));
        }

        if self.search.retry.max_attempts == 0 || self.llm.retry.max_attempts == 0 {
            return Err(config_failure(
                "retry.max_attempts must be at least 1".to_string(),
                "Use max_attempts = 1 to disable retries",
            ));
        }

        Ok(())
    }

    /// Check that every credential the selected providers need is present.
    ///
    /// Runs before the first network call so a missing key fails the session
    /// immediately instead of failing every branch.
    pub fn validate_credentials(&self) -> DelveResult<()> {
        self.validate_credentials_from(|key| std::env::var(key).ok())
    }

    /// Credential check where the LLM key may also come from `lookup`, the same
    /// fallback the completion client applies when `llm.api_key` is unset
    pub fn validate_credentials_from<F>(&self, lookup: F) -> DelveResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        match self.provider_kind()? {
            SearchProviderKind::Firecrawl => {
                if non_empty(self.search.firecrawl_api_key.clone()).is_none() {
                    return Err(config_failure(
                        "Firecrawl API key not found".to_string(),
                        "Set FIRECRAWL_KEY or search.firecrawl_api_key",
                    ));
                }
            }
            SearchProviderKind::Tavily => {
                if non_empty(self.search.tavily_api_key.clone()).is_none() {
                    return Err(config_failure(
                        "Tavily API key not found".to_string(),
                        "Set TAVILY_API_KEY or search.tavily_api_key",
                    ));
                }
            }
            SearchProviderKind::Local => match &self.search.local_index_path {
                Some(path) if path.exists() => {}
                Some(path) => {
                    return Err(config_failure(
                        format!("Local search index not found: {}", path.display()),
                        "Point search.local_index_path at an existing JSON index",
                    ));
                }
                None => {
                    return Err(config_failure(
                        "search.local_index_path is required for the local provider".to_string(),
                        "Point search.local_index_path at a JSON index",
                    ));
                }
            },
        }

        let llm_key = non_empty(self.llm.api_key.clone())
            .or_else(|| self.llm.api_key_var().and_then(|var| non_empty(lookup(var))));
        if self.llm.provider != "ollama" && llm_key.is_none() {
            return Err(config_failure(
                format!("API key for LLM provider '{}' not found", self.llm.provider),
                "Set the provider's API key environment variable or llm.api_key",
            ));
        }

        Ok(())
    }
}
