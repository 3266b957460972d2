use crate::normalizer;
use crate::traits::PullFeed;
use crate::types::{AggregatorError, Batch, FetchConfig, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::time::Instant;
use tracing::debug;
use url::Url;

/// Performs single bounded fetches of feed URLs.
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    config: FetchConfig,
}

impl Fetcher {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .build()?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Fetches one feed and normalizes it. No retries: a failed fetch is
    /// retried by the next scheduled poll.
    pub async fn fetch_feed(&self, url: &str) -> Result<Batch> {
        let start_time = Instant::now();
        let parsed = Url::parse(url)?;

        let mut response = self.client.get(parsed).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AggregatorError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let limit = self.config.max_feed_size_mb * 1024 * 1024;
        if let Some(content_length) = response.content_length() {
            if content_length > limit as u64 {
                return Err(AggregatorError::FeedTooLarge {
                    size_mb: content_length as usize / (1024 * 1024),
                });
            }
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        // chunked responses carry no length, so the limit is enforced while reading
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > limit {
                return Err(AggregatorError::FeedTooLarge {
                    size_mb: (body.len() + chunk.len()) / (1024 * 1024),
                });
            }
            body.extend_from_slice(&chunk);
        }

        if !is_xml_media_type(&content_type) && !looks_like_feed(&body) {
            return Err(AggregatorError::NotXml {
                url: url.to_string(),
                content_type,
            });
        }

        let items = normalizer::parse_feed(&body, self.config.undated)?;
        debug!(
            url,
            bytes = body.len(),
            items = items.len(),
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            "Fetched feed"
        );
        Ok(items)
    }
}

#[async_trait]
impl PullFeed for Fetcher {
    async fn pull(&self, url: &str) -> Result<Batch> {
        self.fetch_feed(url).await
    }
}

/// `text/xml`, `application/rss+xml`, `application/atom+xml` and friends.
fn is_xml_media_type(content_type: &str) -> bool {
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    media_type == "xml" || media_type.ends_with("/xml") || media_type.ends_with("+xml")
}

/// Structural sniffing for servers that send feeds as `text/plain` or
/// `application/octet-stream`.
fn looks_like_feed(body: &[u8]) -> bool {
    let head = &body[..body.len().min(1024)];
    let head = String::from_utf8_lossy(head).to_lowercase();
    let head = head.trim_start_matches('\u{feff}').trim_start();

    head.starts_with("<?xml")
        || head.starts_with("<rss")
        || head.starts_with("<feed")
        || head.starts_with("<rdf:rdf")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_xml_media_types() {
        assert!(is_xml_media_type("text/xml"));
        assert!(is_xml_media_type("application/rss+xml; charset=utf-8"));
        assert!(is_xml_media_type("Application/Atom+XML"));
        assert!(!is_xml_media_type("text/html; charset=utf-8"));
        assert!(!is_xml_media_type(""));
    }

    #[test]
    fn sniffs_feed_bodies() {
        assert!(looks_like_feed(b"\n  <?xml version=\"1.0\"?><rss/>"));
        assert!(looks_like_feed(b"<rss version=\"2.0\"><channel/></rss>"));
        assert!(looks_like_feed("\u{feff}<feed xmlns=\"http://www.w3.org/2005/Atom\"/>".as_bytes()));
        assert!(!looks_like_feed(b"<!DOCTYPE html><html></html>"));
        assert!(!looks_like_feed(b"{\"json\": true}"));
    }
}
