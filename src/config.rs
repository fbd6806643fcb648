//! Configuration module
//!
//! Loads configuration from environment variables once at startup.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::worker::{TaskOptions, WorkerConfig, QUEUE_CRITICAL, QUEUE_DEFAULT};

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Maximum database connections in pool
    pub database_max_connections: u32,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Environment (dev, staging, production)
    pub environment: String,

    /// Explicit log format; derived from the environment when unset
    pub log_format: Option<String>,

    /// Log filter directives (RUST_LOG syntax)
    pub log_filter: Option<String>,

    pub email: EmailConfig,

    /// Link target embedded in verification mails
    pub verify_email_url: String,

    pub worker_critical_concurrency: usize,
    pub worker_default_concurrency: usize,

    /// Retry budget of the send-verify-email task
    pub verify_email_max_retry: u32,

    /// Delay before the first send-verify-email attempt
    pub verify_email_delay: Duration,
}

/// Outbound SMTP settings
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub sender_name: String,
    pub sender_address: String,
    /// Empty when no SMTP relay is configured
    pub sender_password: String,
    pub smtp_host: String,
    pub smtp_port: u16,
}

impl EmailConfig {
    pub fn is_configured(&self) -> bool {
        !self.sender_password.is_empty()
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key/value source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::MissingEnv("DATABASE_URL"))?;
        let port = parse(&lookup, "PORT", "8080")?;

        let email = EmailConfig {
            sender_name: var("EMAIL_SENDER_NAME", "Simple Bank"),
            sender_address: var("EMAIL_SENDER_ADDRESS", "simplebank@example.com"),
            sender_password: var("EMAIL_SENDER_PASSWORD", ""),
            smtp_host: var("SMTP_HOST", "smtp.gmail.com"),
            smtp_port: parse(&lookup, "SMTP_PORT", "587")?,
        };

        let verify_email_delay_secs: u64 = parse(&lookup, "VERIFY_EMAIL_DELAY_SECS", "10")?;

        Ok(Self {
            database_url,
            database_max_connections: parse(&lookup, "DATABASE_MAX_CONNECTIONS", "10")?,
            host: var("HOST", "0.0.0.0"),
            port,
            environment: var("ENVIRONMENT", "dev"),
            log_format: lookup("LOG_FORMAT"),
            log_filter: lookup("RUST_LOG"),
            email,
            verify_email_url: var(
                "VERIFY_EMAIL_BASE_URL",
                &format!("http://localhost:{}/v1/verify_email", port),
            ),
            worker_critical_concurrency: parse(&lookup, "WORKER_CRITICAL_CONCURRENCY", "10")?,
            worker_default_concurrency: parse(&lookup, "WORKER_DEFAULT_CONCURRENCY", "5")?,
            verify_email_max_retry: parse(&lookup, "VERIFY_EMAIL_MAX_RETRY", "10")?,
            verify_email_delay: Duration::from_secs(verify_email_delay_secs),
        })
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn is_development(&self) -> bool {
        self.environment == "dev" || self.environment == "development"
    }

    /// Lane layout for the task processor
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            queues: vec![
                (QUEUE_CRITICAL.to_string(), self.worker_critical_concurrency),
                (QUEUE_DEFAULT.to_string(), self.worker_default_concurrency),
            ],
            ..WorkerConfig::default()
        }
    }

    /// Delivery options for the send-verify-email follow-up
    pub fn verify_email_task_options(&self) -> TaskOptions {
        TaskOptions::new()
            .queue(QUEUE_CRITICAL)
            .max_retry(self.verify_email_max_retry)
            .process_in(self.verify_email_delay)
    }
}

fn parse<T, F>(lookup: &F, key: &'static str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .unwrap_or_else(|| default.to_string())
        .parse()
        .map_err(|_| ConfigError::InvalidValue(key))
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}
