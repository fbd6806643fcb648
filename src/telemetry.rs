//! Logging setup
//!
//! `LogConfig` is resolved once from `Config` and installed once; nothing
//! reads the environment for logging after startup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;

const DEFAULT_FILTER: &str = "simple_bank=info,tower_http=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines for local development
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub format: LogFormat,
    pub filter: String,
}

impl LogConfig {
    pub fn from_config(config: &Config) -> Self {
        let format = match config.log_format.as_deref() {
            Some("json") => LogFormat::Json,
            Some("text") | Some("pretty") => LogFormat::Text,
            _ if config.is_development() => LogFormat::Text,
            _ => LogFormat::Json,
        };
        Self {
            format,
            filter: config
                .log_filter
                .clone()
                .unwrap_or_else(|| DEFAULT_FILTER.to_string()),
        }
    }

    /// Install the global subscriber
    pub fn init(&self) -> Result<(), TelemetryError> {
        let filter = EnvFilter::try_new(&self.filter)
            .map_err(|e| TelemetryError::Filter(e.to_string()))?;
        let registry = tracing_subscriber::registry().with(filter);

        match self.format {
            LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init(),
            LogFormat::Json => registry
                .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
                .try_init(),
        }
        .map_err(|e| TelemetryError::Install(e.to_string()))
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            filter: DEFAULT_FILTER.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Invalid log filter: {0}")]
    Filter(String),

    #[error("Failed to install tracing subscriber: {0}")]
    Install(String),
}
