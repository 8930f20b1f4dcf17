//! Typed configuration from environment variables and an optional TOML file.
//!
//! Loads once at startup, fails fast if required values are missing.
//! Environment variables override the file. The database URL carries
//! credentials, so it is wrapped in `SecretString` to keep it out of logs.

use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::dispatch::DispatcherConfig;
use crate::error::{Error, Result};
use crate::worker::WorkerConfig;

#[derive(Debug)]
pub struct Config {
    /// Postgres URL for both the pgmq broker and the result store.
    pub database_url: SecretString,
    /// Default queue tasks are submitted to and consumed from.
    pub queue: String,
    pub visibility_timeout: Duration,
    pub max_retries: u32,
    /// How long a task record survives after its last update.
    pub result_ttl: Duration,
    pub submit_timeout: Duration,
    pub execution_timeout: Duration,
    /// Workers push a running task's visibility forward while it executes.
    pub extend_visibility: bool,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

/// On-disk shape. Every field optional; unset fields fall back to env or defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    database_url: Option<String>,
    queue: Option<String>,
    visibility_timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    result_ttl_secs: Option<u64>,
    submit_timeout_ms: Option<u64>,
    execution_timeout_secs: Option<u64>,
    extend_visibility: Option<bool>,
    concurrency: Option<usize>,
    poll_interval_ms: Option<u64>,
    otel_endpoint: Option<String>,
    log_level: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::resolve(FileConfig::default())
    }

    /// Load a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Parse TOML content, then apply environment overrides.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: FileConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("bad config file: {e}")))?;
        Self::resolve(file)
    }

    fn resolve(file: FileConfig) -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .or(file.database_url)
            .ok_or_else(|| {
                Error::Config("required environment variable DATABASE_URL is not set".to_string())
            })?;

        let config = Self {
            database_url: SecretString::from(database_url),
            queue: string_var("TASKQ_QUEUE")
                .or(file.queue)
                .unwrap_or_else(|| "tasks".to_string()),
            visibility_timeout: Duration::from_secs(
                parsed_var("TASKQ_VISIBILITY_TIMEOUT_SECS")?
                    .or(file.visibility_timeout_secs)
                    .unwrap_or(30),
            ),
            max_retries: parsed_var("TASKQ_MAX_RETRIES")?
                .or(file.max_retries)
                .unwrap_or(3),
            result_ttl: Duration::from_secs(
                parsed_var("TASKQ_RESULT_TTL_SECS")?
                    .or(file.result_ttl_secs)
                    .unwrap_or(86_400),
            ),
            submit_timeout: Duration::from_millis(
                parsed_var("TASKQ_SUBMIT_TIMEOUT_MS")?
                    .or(file.submit_timeout_ms)
                    .unwrap_or(5_000),
            ),
            execution_timeout: Duration::from_secs(
                parsed_var("TASKQ_EXECUTION_TIMEOUT_SECS")?
                    .or(file.execution_timeout_secs)
                    .unwrap_or(300),
            ),
            extend_visibility: parsed_var("TASKQ_EXTEND_VISIBILITY")?
                .or(file.extend_visibility)
                .unwrap_or(true),
            concurrency: parsed_var("TASKQ_CONCURRENCY")?
                .or(file.concurrency)
                .unwrap_or(4),
            poll_interval: Duration::from_millis(
                parsed_var("TASKQ_POLL_INTERVAL_MS")?
                    .or(file.poll_interval_ms)
                    .unwrap_or(500),
            ),
            otel_endpoint: string_var("OTEL_ENDPOINT").or(file.otel_endpoint),
            log_level: string_var("LOG_LEVEL")
                .or(file.log_level)
                .unwrap_or_else(|| "info".to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.queue.is_empty() {
            return Err(Error::Config("queue name must not be empty".to_string()));
        }
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".to_string()));
        }
        if self.visibility_timeout.is_zero() {
            return Err(Error::Config("visibility timeout must be positive".to_string()));
        }
        if self.submit_timeout.is_zero() {
            return Err(Error::Config("submit timeout must be positive".to_string()));
        }
        if self.execution_timeout.is_zero() {
            return Err(Error::Config("execution timeout must be positive".to_string()));
        }
        // Without extension a slow handler outlives its delivery and runs twice.
        if !self.extend_visibility && self.execution_timeout >= self.visibility_timeout {
            return Err(Error::Config(format!(
                "execution timeout {:?} must be below visibility timeout {:?} when visibility extension is off",
                self.execution_timeout, self.visibility_timeout
            )));
        }
        Ok(())
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            queue: self.queue.clone(),
            submit_timeout: self.submit_timeout,
            ..DispatcherConfig::default()
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            queue: self.queue.clone(),
            concurrency: self.concurrency,
            max_retries: self.max_retries,
            execution_timeout: self.execution_timeout,
            visibility_extension: self.extend_visibility.then_some(self.visibility_timeout),
            poll_interval: self.poll_interval,
            ..WorkerConfig::default()
        }
    }
}

fn string_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match string_var(name) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}"))),
        None => Ok(None),
    }
}
