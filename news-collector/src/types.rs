use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Publication time given to entries whose date matches none of the known
/// layouts: 0001-01-01T00:00:00Z as Unix seconds.
pub const ZERO_TIME: i64 = -62_135_596_800;

/// A normalized feed entry. `link` is the natural key; `id` is assigned by
/// storage and stays `0` until the item is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Item {
    pub id: i64,
    pub title: String,
    #[serde(rename = "pubDate")]
    pub pub_date: i64,
    pub description: String,
    pub link: String,
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Id: {}, Title: {}, Description: {}, Link: {}",
            self.id, self.title, self.description, self.link
        )
    }
}

/// Items produced by one successful poll of one feed.
pub type Batch = Vec<Item>;

/// What to do with an entry whose publication date cannot be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UndatedPolicy {
    /// Keep the entry with `pub_date = ZERO_TIME`.
    #[default]
    ZeroTime,
    /// Drop the entry.
    Skip,
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    pub timeout: Duration,
    pub max_feed_size_mb: usize,
    pub undated: UndatedPolicy,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            // some feeds answer 403 to library user agents
            user_agent: "Mozilla/5.0".to_string(),
            timeout: Duration::from_secs(5),
            max_feed_size_mb: 10,
            undated: UndatedPolicy::ZeroTime,
        }
    }
}

/// Running totals of the stream writer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteStats {
    pub batches: u64,
    pub items: u64,
    pub failures: u64,
}

/// How the error supervisor treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The feed address itself is unusable (bad URL, unresolvable host).
    Address,
    /// The network operation failed; `temporary` when a retry may succeed.
    Operation { temporary: bool },
    /// Echo of the shared shutdown signal.
    Shutdown,
    Other,
}

#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("[{url}] response code is {status}")]
    Status { url: String, status: u16 },

    #[error("[{url}] content is not XML (Content-Type: {content_type})")]
    NotXml { url: String, content_type: String },

    #[error("Feed size exceeds limit: {size_mb}MB")]
    FeedTooLarge { size_mb: usize },

    #[error("Feed parse error: {0}")]
    Parse(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("collector poll: no links provided")]
    NoFeeds,

    #[error("operation cancelled")]
    Cancelled,

    #[error("Item not found: {link}")]
    NotFound { link: String },

    #[error("storage call exceeded {0:?}")]
    StorageTimeout(Duration),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("write failures reached threshold {threshold}: {source}")]
    WriteThreshold {
        threshold: u64,
        #[source]
        source: Box<AggregatorError>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("${0} environment variable must be set")]
    MissingEnv(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AggregatorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AggregatorError::Cancelled => ErrorClass::Shutdown,
            AggregatorError::InvalidUrl(_) => ErrorClass::Address,
            AggregatorError::Http(e) if e.is_builder() => ErrorClass::Address,
            AggregatorError::Http(e) if e.is_connect() || e.is_timeout() => {
                ErrorClass::Operation { temporary: true }
            }
            AggregatorError::Http(e) if e.is_request() || e.is_body() => {
                ErrorClass::Operation { temporary: false }
            }
            AggregatorError::Status { status, .. } if *status == 429 || *status >= 500 => {
                ErrorClass::Operation { temporary: true }
            }
            _ => ErrorClass::Other,
        }
    }

    pub fn is_benign(&self) -> bool {
        self.class() == ErrorClass::Shutdown
    }
}

pub type Result<T> = std::result::Result<T, AggregatorError>;
