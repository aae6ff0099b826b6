//! LLM client integration using siumai
//!
//! Wraps a siumai chat client as a `CompletionService`. Structured requests are sent as
//! plain chat with the JSON schema appended to the prompt; the reply is parsed here when
//! possible and otherwise handed back as text for the caller to reject or repair.

use async_trait::async_trait;
use delve_core::{
    with_timeout, CompletionOutput, CompletionRequest, CompletionService, DelveError, DelveResult,
    ErrorContext, LlmSettings,
};
use siumai::prelude::*;
use std::time::Instant;
use tracing::{debug, info};

use crate::structured::extract_json;

/// Completion service backed by any siumai provider
pub struct DelveLlmClient {
    client: Box<dyn LlmClient>,
    settings: LlmSettings,
}

impl DelveLlmClient {
    /// Create a new LLM client
    pub async fn new(settings: LlmSettings) -> DelveResult<Self> {
        let client = Self::build_client(&settings).await?;

        info!(
            "Created LLM client for provider: {} with model: {}",
            settings.provider, settings.model
        );

        Ok(Self { client, settings })
    }

    fn api_key(settings: &LlmSettings, env_var: &str) -> DelveResult<String> {
        settings
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var(env_var).ok().filter(|k| !k.trim().is_empty()))
            .ok_or_else(|| DelveError::Config {
                message: format!("{} API key not found", settings.provider),
                source: None,
                context: ErrorContext::new("llm_client")
                    .with_operation("build_client")
                    .with_suggestion(&format!("Set {} or llm.api_key", env_var)),
            })
    }

    fn build_error(provider: &str, error: impl std::fmt::Display) -> DelveError {
        DelveError::Config {
            message: format!("Failed to build {} client: {}", provider, error),
            source: None,
            context: ErrorContext::new("llm_client").with_operation("build_client"),
        }
    }

    /// Build the appropriate siumai client based on configuration
    async fn build_client(settings: &LlmSettings) -> DelveResult<Box<dyn LlmClient>> {
        match settings.provider.as_str() {
            "openai" => {
                let api_key = Self::api_key(settings, "OPENAI_API_KEY")?;

                let mut builder = LlmBuilder::new()
                    .openai()
                    .api_key(&api_key)
                    .model(&settings.model);

                if let Some(temperature) = settings.temperature {
                    builder = builder.temperature(temperature);
                }

                if let Some(max_tokens) = settings.max_tokens {
                    builder = builder.max_tokens(max_tokens);
                }

                if let Some(base_url) = &settings.base_url {
                    builder = builder.base_url(base_url);
                }

                let client = builder
                    .build()
                    .await
                    .map_err(|e| Self::build_error("OpenAI", e))?;

                Ok(Box::new(client))
            }
            "anthropic" => {
                let api_key = Self::api_key(settings, "ANTHROPIC_API_KEY")?;

                let mut builder = LlmBuilder::new()
                    .anthropic()
                    .api_key(&api_key)
                    .model(&settings.model);

                if let Some(temperature) = settings.temperature {
                    builder = builder.temperature(temperature);
                }

                if let Some(max_tokens) = settings.max_tokens {
                    builder = builder.max_tokens(max_tokens);
                }

                let client = builder
                    .build()
                    .await
                    .map_err(|e| Self::build_error("Anthropic", e))?;

                Ok(Box::new(client))
            }
            "ollama" => {
                let base_url = settings
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "http://localhost:11434".to_string());

                let mut builder = LlmBuilder::new()
                    .ollama()
                    .model(&settings.model)
                    .base_url(&base_url);

                if let Some(temperature) = settings.temperature {
                    builder = builder.temperature(temperature);
                }

                if let Some(max_tokens) = settings.max_tokens {
                    builder = builder.max_tokens(max_tokens);
                }

                let client = builder
                    .build()
                    .await
                    .map_err(|e| Self::build_error("Ollama", e))?;

                Ok(Box::new(client))
            }
            "groq" => {
                let api_key = Self::api_key(settings, "GROQ_API_KEY")?;

                let mut builder = LlmBuilder::new()
                    .groq()
                    .api_key(&api_key)
                    .model(&settings.model);

                if let Some(temperature) = settings.temperature {
                    builder = builder.temperature(temperature);
                }

                if let Some(max_tokens) = settings.max_tokens {
                    builder = builder.max_tokens(max_tokens);
                }

                let client = builder
                    .build()
                    .await
                    .map_err(|e| Self::build_error("Groq", e))?;

                Ok(Box::new(client))
            }
            provider => Err(DelveError::Config {
                message: format!("Unsupported LLM provider: {}", provider),
                source: None,
                context: ErrorContext::new("llm_client")
                    .with_operation("build_client")
                    .with_suggestion("Supported LLM providers: openai, anthropic, ollama, groq"),
            }),
        }
    }
}

/// Prompt actually sent to the model for a request
pub fn render_prompt(request: &CompletionRequest) -> String {
    match &request.schema {
        Some(schema) => {
            let schema_text = serde_json::to_string_pretty(&schema.schema)
                .unwrap_or_else(|_| schema.schema.to_string());
            format!(
                "{}\n\nRespond with a single JSON object named {} that conforms to this JSON schema. \
                 Do not add any text before or after the JSON.\n```json\n{}\n```",
                request.prompt, schema.name, schema_text
            )
        }
        None => request.prompt.clone(),
    }
}

/// Whether a provider error message describes a transient failure
pub fn is_transient_failure(message: &str) -> bool {
    let lowered = message.to_lowercase();
    [
        "429",
        "rate limit",
        "too many requests",
        "timeout",
        "timed out",
        "500",
        "502",
        "503",
        "504",
        "overloaded",
        "connection",
        "temporarily",
    ]
    .iter()
    .any(|needle| lowered.contains(needle))
}

fn call_site(request: &CompletionRequest) -> String {
    request.schema_name().unwrap_or("text").to_string()
}

#[async_trait]
impl CompletionService for DelveLlmClient {
    fn model(&self) -> &str {
        &self.settings.model
    }

    async fn complete(&self, request: &CompletionRequest) -> DelveResult<CompletionOutput> {
        let start_time = Instant::now();
        let site = call_site(request);
        let prompt = render_prompt(request);

        debug!(call_site = %site, prompt_chars = prompt.len(), "Sending completion request");

        let messages = vec![system!(request.system.as_str()), user!(prompt.as_str())];

        let response = with_timeout(
            self.client.chat(messages),
            self.settings.timeout_seconds * 1000,
            &format!("completion:{}", site),
        )
        .await?
        .map_err(|e| {
            let message = format!("LLM generation failed: {}", e);
            DelveError::Completion {
                retryable: is_transient_failure(&message),
                message,
                call_site: site.clone(),
                context: ErrorContext::new("llm_client")
                    .with_operation("complete")
                    .with_metadata("model", &self.settings.model),
            }
        })?;

        let text = response
            .content_text()
            .map(|t| t.to_string())
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| DelveError::Completion {
                message: "No text content in LLM response".to_string(),
                call_site: site.clone(),
                retryable: false,
                context: ErrorContext::new("llm_client").with_operation("complete"),
            })?;

        info!(
            call_site = %site,
            duration_ms = start_time.elapsed().as_millis() as u64,
            chars = text.len(),
            "Completion received"
        );

        if request.schema.is_some() {
            if let Some(value) = extract_json(&text) {
                return Ok(CompletionOutput::Structured(value));
            }
        }

        Ok(CompletionOutput::Text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use delve_core::OutputSchema;

    #[test]
    fn test_render_prompt_appends_schema() {
        let request = CompletionRequest::structured(
            "system",
            "List queries",
            OutputSchema::new(
                "queries",
                serde_json::json!({ "type": "object", "required": ["queries"] }),
            ),
        );
        let prompt = render_prompt(&request);
        assert!(prompt.starts_with("List queries"));
        assert!(prompt.contains("\"required\""));
        assert!(prompt.contains("queries"));

        let plain = CompletionRequest::text("system", "Hello");
        assert_eq!(render_prompt(&plain), "Hello");
    }

    #[test]
    fn test_transient_failure_detection() {
        assert!(is_transient_failure("HTTP 429 Too Many Requests"));
        assert!(is_transient_failure("request timed out"));
        assert!(is_transient_failure("503 Service Unavailable"));
        assert!(!is_transient_failure("401 invalid api key"));
        assert!(!is_transient_failure("model not found"));
    }

    #[tokio::test]
    async fn test_missing_api_key_is_config_error() {
        let settings = LlmSettings {
            provider: "groq".to_string(),
            api_key: Some("  ".to_string()),
            ..LlmSettings::default()
        };
        // GROQ_API_KEY is not expected in the test environment
        if std::env::var("GROQ_API_KEY").is_err() {
            assert!(matches!(
                DelveLlmClient::new(settings).await,
                Err(DelveError::Config { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_unsupported_provider() {
        let settings = LlmSettings {
            provider: "mystery".to_string(),
            ..LlmSettings::default()
        };
        assert!(matches!(
            DelveLlmClient::new(settings).await,
            Err(DelveError::Config { .. })
        ));
    }
}
