use async_trait::async_trait;
use news_collector::types::*;
use news_collector::{Fetcher, MemDb, Pipeline, PipelineSettings, Shutdown, ShutdownReason, Storage};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SINGLE_ITEM_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Test feed</title>
    <item>
      <title>T</title>
      <link>https://x/1</link>
      <description>&lt;b&gt;D&lt;/b&gt;</description>
      <pubDate>Thu, 16 Jun 2022 10:14:28 +0300</pubDate>
    </item>
  </channel>
</rss>"#;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn feed(name: &str, count: usize) -> String {
    let items: String = (0..count)
        .map(|i| {
            format!(
                "<item><title>{name} {i}</title><link>https://{name}.test/{i}</link>\
                 <pubDate>Mon, 02 Jan 2006 15:04:{i:02} GMT</pubDate></item>"
            )
        })
        .collect();
    format!(r#"<?xml version="1.0"?><rss version="2.0"><channel>{items}</channel></rss>"#)
}

async fn serve(server: &MockServer, route: &str, body: String) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/rss+xml"))
        .mount(server)
        .await;
}

fn settings(interval: Duration) -> PipelineSettings {
    PipelineSettings {
        interval,
        error_threshold: 100,
        write_failure_threshold: 2,
        write_timeout: Duration::from_secs(1),
    }
}

#[tokio::test]
async fn single_poll_normalizes_and_stores_one_item() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    serve(&server, "/rss", SINGLE_ITEM_FEED.to_string()).await;

    let fetcher = Fetcher::new(FetchConfig::default())?;
    let batch = fetcher.fetch_feed(&format!("{}/rss", server.uri())).await?;
    assert_eq!(batch.len(), 1);

    let db = MemDb::new();
    db.add_items(&batch).await?;

    let stored = db.items(1).await?;
    info!("Stored {}", stored[0]);
    assert_eq!(stored[0].title, "T");
    assert_eq!(stored[0].link, "https://x/1");
    assert_eq!(stored[0].description, "D");
    assert_eq!(stored[0].pub_date, 1655363668);
    assert!(stored[0].id > 0);
    Ok(())
}

#[tokio::test]
async fn fetcher_sends_the_configured_user_agent() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rss"))
        .and(wiremock::matchers::header("user-agent", "Mozilla/5.0"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(SINGLE_ITEM_FEED, "text/xml"))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = Fetcher::new(FetchConfig::default())?;
    fetcher.fetch_feed(&format!("{}/rss", server.uri())).await?;
    Ok(())
}

#[tokio::test]
async fn rejects_error_statuses() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let fetcher = Fetcher::new(FetchConfig::default()).unwrap();
    let result = fetcher.fetch_feed(&format!("{}/missing", server.uri())).await;
    assert!(matches!(result, Err(AggregatorError::Status { status: 404, .. })));
}

#[tokio::test]
async fn rejects_html_pages() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("<!DOCTYPE html><html><body>moved</body></html>", "text/html"),
        )
        .mount(&server)
        .await;

    let fetcher = Fetcher::new(FetchConfig::default()).unwrap();
    let result = fetcher.fetch_feed(&server.uri()).await;
    assert!(matches!(result, Err(AggregatorError::NotXml { .. })));
}

#[tokio::test]
async fn accepts_feeds_served_as_plain_text() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(feed("plain", 3), "text/plain"))
        .mount(&server)
        .await;

    let fetcher = Fetcher::new(FetchConfig::default())?;
    assert_eq!(fetcher.fetch_feed(&server.uri()).await?.len(), 3);
    Ok(())
}

fn one_mb_limit() -> FetchConfig {
    FetchConfig {
        max_feed_size_mb: 1,
        ..FetchConfig::default()
    }
}

#[tokio::test]
async fn rejects_feeds_over_the_size_limit() {
    init_tracing();
    let server = MockServer::start().await;
    let mut body = feed("big", 1).into_bytes();
    body.resize(2 * 1024 * 1024, b' ');
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/rss+xml"))
        .mount(&server)
        .await;

    let fetcher = Fetcher::new(one_mb_limit()).unwrap();
    let result = fetcher.fetch_feed(&server.uri()).await;
    assert!(matches!(result, Err(AggregatorError::FeedTooLarge { size_mb: 2 })));
}

#[tokio::test]
async fn rejects_oversized_chunked_feeds_without_a_length() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    init_tracing();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 4096];
        let _ = socket.read(&mut request).await;

        let head = "HTTP/1.1 200 OK\r\nContent-Type: application/rss+xml\r\nTransfer-Encoding: chunked\r\n\r\n";
        if socket.write_all(head.as_bytes()).await.is_err() {
            return;
        }
        let chunk = vec![b' '; 64 * 1024];
        // 3MB in total, never terminated, so only the limit can end the read
        for _ in 0..48 {
            let mut frame = format!("{:x}\r\n", chunk.len()).into_bytes();
            frame.extend_from_slice(&chunk);
            frame.extend_from_slice(b"\r\n");
            if socket.write_all(&frame).await.is_err() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let fetcher = Fetcher::new(one_mb_limit()).unwrap();
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        fetcher.fetch_feed(&format!("http://{addr}/rss")),
    )
    .await
    .expect("the size limit should end the read");
    assert!(matches!(result, Err(AggregatorError::FeedTooLarge { .. })));
}

#[tokio::test]
async fn slow_feeds_time_out_as_temporary_operation_errors() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(SINGLE_ITEM_FEED, "text/xml")
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let fetcher = Fetcher::new(FetchConfig {
        timeout: Duration::from_millis(100),
        ..FetchConfig::default()
    })
    .unwrap();
    let err = fetcher.fetch_feed(&server.uri()).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Operation { temporary: true });
    assert!(!err.is_benign());
}

#[tokio::test]
async fn pipeline_collects_every_feed_until_shutdown() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    serve(&server, "/a", feed("a", 3)).await;
    serve(&server, "/b", feed("b", 2)).await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let links = vec![
        format!("{}/a", server.uri()),
        format!("{}/b", server.uri()),
        format!("{}/broken", server.uri()),
    ];
    let storage = Arc::new(MemDb::new());
    let shutdown = Shutdown::new();
    let pipeline = Pipeline::new(
        Arc::new(Fetcher::new(FetchConfig::default())?),
        storage.clone(),
        settings(Duration::from_millis(20)),
        shutdown.clone(),
    );

    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.trigger(ShutdownReason::Requested);
    });
    let report = pipeline.run(&links).await?;
    stopper.await.unwrap();

    info!(?report, "Pipeline report");
    assert!(report.is_clean());
    assert_eq!(report.reason, Some(ShutdownReason::Requested));
    assert_eq!(report.workers.len(), 3);
    assert!(report.errors.failures >= 1, "the 503 feed reports errors");
    assert_eq!(report.errors.benign, 3);
    assert_eq!(storage.len().await, 5);

    let newest = storage.items(1).await?;
    assert_eq!(newest[0].title, "a 2");
    Ok(())
}

/// Storage that rejects every write.
struct ReadOnlyStorage;

#[async_trait]
impl Storage for ReadOnlyStorage {
    async fn item(&self, link: &str) -> Result<Item> {
        Err(AggregatorError::NotFound { link: link.to_string() })
    }
    async fn items(&self, _n: usize) -> Result<Vec<Item>> {
        Ok(Vec::new())
    }
    async fn add_item(&self, _item: &Item) -> Result<()> {
        Err(AggregatorError::Config("read-only".to_string()))
    }
    async fn add_items(&self, _items: &[Item]) -> Result<()> {
        Err(AggregatorError::Config("read-only".to_string()))
    }
    async fn update_item(&self, _item: &Item) -> Result<()> {
        Ok(())
    }
    async fn delete_item(&self, _item: &Item) -> Result<()> {
        Ok(())
    }
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn storage_failures_abort_the_pipeline() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    serve(&server, "/a", feed("a", 1)).await;

    let shutdown = Shutdown::new();
    let pipeline = Pipeline::new(
        Arc::new(Fetcher::new(FetchConfig::default())?),
        Arc::new(ReadOnlyStorage),
        settings(Duration::from_millis(10)),
        shutdown.clone(),
    );

    let links = vec![format!("{}/a", server.uri())];
    let report = tokio::time::timeout(Duration::from_secs(5), pipeline.run(&links))
        .await
        .expect("writer abort should stop the pipeline")?;

    assert!(!report.is_clean());
    assert_eq!(report.reason, Some(ShutdownReason::WriteFailure));
    assert!(matches!(
        report.write_error,
        Some(AggregatorError::WriteThreshold { threshold: 2, .. })
    ));
    assert_eq!(report.stats.failures, 2);
    Ok(())
}
