//! Unified error handling system
//!
//! Provides structured error types with context, recovery suggestions, and proper error chaining

use crate::types::{BranchFailure, ResearchSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

pub type DelveResult<T> = Result<T, DelveError>;

/// Error context providing additional information for debugging and recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Unique error ID for tracking
    pub error_id: String,
    /// Timestamp when error occurred
    pub timestamp: DateTime<Utc>,
    /// Component where error originated
    pub component: String,
    /// Operation being performed when error occurred
    pub operation: Option<String>,
    /// Additional metadata
    pub metadata: std::collections::HashMap<String, String>,
    /// Recovery suggestions
    pub recovery_suggestions: Vec<String>,
}

impl ErrorContext {
    pub fn new(component: &str) -> Self {
        Self {
            error_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            component: component.to_string(),
            operation: None,
            metadata: std::collections::HashMap::new(),
            recovery_suggestions: Vec::new(),
        }
    }

    pub fn with_operation(mut self, operation: &str) -> Self {
        self.operation = Some(operation.to_string());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_suggestion(mut self, suggestion: &str) -> Self {
        self.recovery_suggestions.push(suggestion.to_string());
        self
    }
}

/// Main error type for the delve system
#[derive(Error, Debug)]
pub enum DelveError {
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        context: ErrorContext,
    },

    #[error("Unsupported search provider: {provider}")]
    UnsupportedProvider {
        provider: String,
        context: ErrorContext,
    },

    #[error("Search provider error ({provider}): {message}")]
    Provider {
        message: String,
        provider: String,
        /// Whether the failure is transient (unreachable, 5xx)
        retryable: bool,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        context: ErrorContext,
    },

    #[error("Rate limit exceeded: {message}")]
    RateLimit {
        message: String,
        retry_after_ms: Option<u64>,
        context: ErrorContext,
    },

    #[error("Operation timeout: {operation}")]
    Timeout {
        operation: String,
        duration_ms: u64,
        context: ErrorContext,
    },

    #[error("Completion error at {call_site}: {message}")]
    Completion {
        message: String,
        call_site: String,
        retryable: bool,
        context: ErrorContext,
    },

    #[error("Generation error: {message}")]
    Generation {
        message: String,
        context: ErrorContext,
    },

    #[error("Research failed: {message}")]
    ResearchFailed {
        message: String,
        failures: Vec<BranchFailure>,
        /// Whatever was aggregated before every root branch failed
        snapshot: Box<ResearchSnapshot>,
        context: ErrorContext,
    },

    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
        context: ErrorContext,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        context: ErrorContext,
    },
}

impl DelveError {
    /// Get the error context
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            DelveError::Config { context, .. } => Some(context),
            DelveError::UnsupportedProvider { context, .. } => Some(context),
            DelveError::Provider { context, .. } => Some(context),
            DelveError::RateLimit { context, .. } => Some(context),
            DelveError::Timeout { context, .. } => Some(context),
            DelveError::Completion { context, .. } => Some(context),
            DelveError::Generation { context, .. } => Some(context),
            DelveError::ResearchFailed { context, .. } => Some(context),
            DelveError::Validation { context, .. } => Some(context),
            DelveError::Internal { context, .. } => Some(context),
            DelveError::Io(_) | DelveError::Serialization(_) => None,
        }
    }

    /// Check if error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            DelveError::Provider { retryable, .. } => *retryable,
            DelveError::Completion { retryable, .. } => *retryable,
            DelveError::Timeout { .. } => true,
            DelveError::RateLimit { .. } => true,
            DelveError::Config { .. } => false,
            DelveError::UnsupportedProvider { .. } => false,
            DelveError::Validation { .. } => false,
            _ => false,
        }
    }

    /// Server supplied retry hint in milliseconds, if any
    pub fn retry_delay_ms(&self) -> Option<u64> {
        match self {
            DelveError::RateLimit { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }

    /// True for malformed or failed completion output
    pub fn is_completion(&self) -> bool {
        matches!(self, DelveError::Completion { .. })
    }

    /// Log the error with appropriate level
    pub fn log(&self) {
        match self {
            DelveError::Internal { .. } => {
                error!(
                    error_id = ?self.context().map(|c| &c.error_id),
                    error = %self,
                    "Internal error occurred"
                );
            }
            DelveError::Config { .. }
            | DelveError::UnsupportedProvider { .. }
            | DelveError::Validation { .. } => {
                error!(
                    error_id = ?self.context().map(|c| &c.error_id),
                    error = %self,
                    "Configuration or validation error"
                );
            }
            DelveError::Provider { .. } | DelveError::RateLimit { .. } | DelveError::Timeout { .. } => {
                warn!(
                    error_id = ?self.context().map(|c| &c.error_id),
                    error = %self,
                    recoverable = self.is_recoverable(),
                    "Search provider error"
                );
            }
            DelveError::Completion { .. } | DelveError::Generation { .. } => {
                warn!(
                    error_id = ?self.context().map(|c| &c.error_id),
                    error = %self,
                    "Completion service error"
                );
            }
            _ => {
                error!(
                    error_id = ?self.context().map(|c| &c.error_id),
                    error = %self,
                    "Error occurred"
                );
            }
        }
    }
}

/// Convenience macros for creating errors with context
#[macro_export]
macro_rules! config_error {
    ($msg:expr, $component:expr) => {
        $crate::DelveError::Config {
            message: $msg.to_string(),
            source: None,
            context: $crate::ErrorContext::new($component)
                .with_suggestion("Check your configuration file and environment variables")
                .with_suggestion("Run 'delve config --init' to create default config"),
        }
    };
    ($msg:expr, $component:expr, $source:expr) => {
        $crate::DelveError::Config {
            message: $msg.to_string(),
            source: Some(Box::new($source)),
            context: $crate::ErrorContext::new($component)
                .with_suggestion("Check your configuration file and environment variables"),
        }
    };
}

#[macro_export]
macro_rules! provider_error {
    ($msg:expr, $provider:expr, $retryable:expr) => {
        $crate::DelveError::Provider {
            message: $msg.to_string(),
            provider: $provider.to_string(),
            retryable: $retryable,
            source: None,
            context: $crate::ErrorContext::new("search_provider"),
        }
    };
    ($msg:expr, $provider:expr, $retryable:expr, $source:expr) => {
        $crate::DelveError::Provider {
            message: $msg.to_string(),
            provider: $provider.to_string(),
            retryable: $retryable,
            source: Some(Box::new($source)),
            context: $crate::ErrorContext::new("search_provider"),
        }
    };
}

#[macro_export]
macro_rules! completion_error {
    ($msg:expr, $call_site:expr) => {
        $crate::DelveError::Completion {
            message: $msg.to_string(),
            call_site: $call_site.to_string(),
            retryable: false,
            context: $crate::ErrorContext::new("completion").with_operation($call_site),
        }
    };
    ($msg:expr, $call_site:expr, retryable) => {
        $crate::DelveError::Completion {
            message: $msg.to_string(),
            call_site: $call_site.to_string(),
            retryable: true,
            context: $crate::ErrorContext::new("completion").with_operation($call_site),
        }
    };
}

#[macro_export]
macro_rules! generation_error {
    ($msg:expr, $component:expr) => {
        $crate::DelveError::Generation {
            message: $msg.to_string(),
            context: $crate::ErrorContext::new($component)
                .with_suggestion("Rephrase the topic or try a different model"),
        }
    };
}

#[macro_export]
macro_rules! validation_error {
    ($msg:expr, $field:expr, $component:expr) => {
        $crate::DelveError::Validation {
            message: $msg.to_string(),
            field: Some($field.to_string()),
            context: $crate::ErrorContext::new($component)
                .with_suggestion("Check the field value and format"),
        }
    };
}
