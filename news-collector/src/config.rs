//! Configuration file, environment and command line.

use crate::storage::Backend;
use crate::types::{AggregatorError, FetchConfig, Result, UndatedPolicy};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Environment variable holding the storage connection string.
pub const CONN_STRING_ENV: &str = "NEWS_DB_CONN_STRING";

#[derive(Debug, Parser)]
#[command(name = "news-collector", version, about = "Polls RSS and Atom feeds into storage")]
pub struct CliArgs {
    /// Path to the JSON configuration file
    pub config: PathBuf,

    /// Log at debug level
    #[arg(long)]
    pub debug: bool,

    /// Storage backend, overrides the configuration file
    #[arg(long, value_enum)]
    pub backend: Option<Backend>,

    /// Storage connection string
    #[arg(long = "db", env = CONN_STRING_ENV, hide_env_values = true)]
    pub connection_string: Option<String>,
}

fn default_error_threshold() -> u64 {
    100
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_user_agent() -> String {
    FetchConfig::default().user_agent
}

fn default_max_feed_size_mb() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Feed URLs, one poll worker each.
    pub rss: Vec<String>,
    /// Seconds between two polls of the same feed.
    pub request_period: u64,
    #[serde(default)]
    pub storage: Backend,
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u64,
    /// Defaults to the number of feeds.
    #[serde(default)]
    pub write_failure_threshold: Option<u64>,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_max_feed_size_mb")]
    pub max_feed_size_mb: usize,
    #[serde(default)]
    pub undated_entries: UndatedPolicy,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AggregatorError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(raw)
            .map_err(|e| AggregatorError::Config(format!("malformed configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rss.is_empty() {
            return Err(AggregatorError::Config("no feeds configured in \"rss\"".to_string()));
        }
        for link in &self.rss {
            let url = Url::parse(link)
                .map_err(|e| AggregatorError::Config(format!("invalid feed URL {link:?}: {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(AggregatorError::Config(format!(
                    "feed URL {link:?} must use http or https"
                )));
            }
        }
        if self.request_period == 0 {
            return Err(AggregatorError::Config("\"request_period\" must be positive".to_string()));
        }
        if self.request_timeout_secs == 0 || self.write_timeout_secs == 0 {
            return Err(AggregatorError::Config("timeouts must be positive".to_string()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.request_period)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    /// Failed writes tolerated before the writer aborts.
    pub fn write_failure_threshold(&self) -> u64 {
        self.write_failure_threshold
            .unwrap_or(self.rss.len() as u64)
            .max(1)
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            user_agent: self.user_agent.clone(),
            timeout: Duration::from_secs(self.request_timeout_secs),
            max_feed_size_mb: self.max_feed_size_mb,
            undated: self.undated_entries,
        }
    }
}

/// The connection string the chosen backend needs, or an error naming the
/// missing variable.
pub fn connection_string(backend: Backend, provided: Option<&str>) -> Result<Option<String>> {
    if !backend.needs_connection_string() {
        return Ok(None);
    }
    match provided {
        Some(conn) if !conn.trim().is_empty() => Ok(Some(conn.to_string())),
        _ => Err(AggregatorError::MissingEnv(CONN_STRING_ENV.to_string())),
    }
}

/// Hides the password of a connection URL for logging.
pub fn redact(connection_string: &str) -> String {
    match Url::parse(connection_string) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => "<redacted>".to_string(),
    }
}
