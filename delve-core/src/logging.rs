//! Unified logging system
//!
//! Structured logging with span timing and configurable output. Console output goes to
//! stderr so that a report printed on stdout can be piped cleanly.

use serde::{Deserialize, Serialize};
use std::io;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty, compact)
    pub format: LogFormat,
    /// Whether to include file and line information
    pub include_location: bool,
    /// Whether to include thread information
    pub include_thread: bool,
    /// Log file path; stderr when unset
    pub log_file_path: Option<String>,
    /// Whether to log span close events with timing
    pub enable_performance_monitoring: bool,
    /// Custom filter directives
    pub filter_directives: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::Compact,
            include_location: false,
            include_thread: false,
            log_file_path: None,
            enable_performance_monitoring: false,
            filter_directives: Vec::new(),
        }
    }
}

impl LoggingConfig {
    /// Verbose preset used by `--verbose`
    pub fn verbose() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_location: true,
            enable_performance_monitoring: true,
            filter_directives: vec![
                "delve=debug".to_string(),
                "delve_core=debug".to_string(),
                "delve_search=debug".to_string(),
                "delve_llm=debug".to_string(),
                "delve_research=debug".to_string(),
            ],
            ..Self::default()
        }
    }

    fn span_events(&self) -> FmtSpan {
        if self.enable_performance_monitoring {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// Initialize the logging system
pub fn init_logging(
    config: &LoggingConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    for directive in &config.filter_directives {
        filter = filter.add_directive(directive.parse()?);
    }

    let registry = tracing_subscriber::registry().with(filter);

    let file = match &config.log_file_path {
        Some(path) => Some(
            std::sync::Mutex::new(
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?,
            ),
        ),
        None => None,
    };

    let base = fmt::layer()
        .with_span_events(config.span_events())
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_thread_ids(config.include_thread)
        .with_thread_names(config.include_thread);

    match (config.format, file) {
        (LogFormat::Json, Some(file)) => registry.with(base.json().with_writer(file)).try_init()?,
        (LogFormat::Json, None) => registry.with(base.json().with_writer(io::stderr)).try_init()?,
        (LogFormat::Pretty, Some(file)) => {
            registry.with(base.pretty().with_writer(file)).try_init()?
        }
        (LogFormat::Pretty, None) => registry
            .with(base.pretty().with_writer(io::stderr))
            .try_init()?,
        (LogFormat::Compact, Some(file)) => {
            registry.with(base.compact().with_writer(file)).try_init()?
        }
        (LogFormat::Compact, None) => registry
            .with(base.compact().with_writer(io::stderr))
            .try_init()?,
    }

    Ok(())
}

/// Performance monitoring utilities
pub mod performance {
    use std::time::Instant;
    use tracing::{info_span, Instrument};

    /// Measure and log execution time of an async operation
    pub async fn measure_async<F, T>(operation_name: &str, future: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let span = info_span!("performance", operation = operation_name);
        let start = Instant::now();

        let result = future.instrument(span).await;

        tracing::info!(
            target: "performance",
            operation = operation_name,
            duration_ms = start.elapsed().as_millis() as u64,
            "Operation completed"
        );

        result
    }
}

/// Logging macros for common patterns
#[macro_export]
macro_rules! log_operation_start {
    ($operation:expr) => {
        tracing::info!(
            operation = $operation,
            "Starting operation"
        );
    };
    ($operation:expr, $($field:tt)*) => {
        tracing::info!(
            operation = $operation,
            $($field)*,
            "Starting operation"
        );
    };
}

#[macro_export]
macro_rules! log_operation_success {
    ($operation:expr) => {
        tracing::info!(
            operation = $operation,
            "Operation completed successfully"
        );
    };
    ($operation:expr, $($field:tt)*) => {
        tracing::info!(
            operation = $operation,
            $($field)*,
            "Operation completed successfully"
        );
    };
}

#[macro_export]
macro_rules! log_operation_error {
    ($operation:expr, $error:expr) => {
        tracing::error!(
            operation = $operation,
            error = %$error,
            "Operation failed"
        );
    };
    ($operation:expr, $error:expr, $($field:tt)*) => {
        tracing::error!(
            operation = $operation,
            error = %$error,
            $($field)*,
            "Operation failed"
        );
    };
}
