use anyhow::Context;
use clap::Parser;
use news_collector::config::{self, CliArgs, Config};
use news_collector::{storage, Fetcher, Pipeline, PipelineSettings, Shutdown};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, Level};

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.debug { Level::DEBUG } else { Level::INFO })
        .init();

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns `Ok(false)` when the pipeline stopped because storage kept failing.
async fn run(args: CliArgs) -> anyhow::Result<bool> {
    let config = Config::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let backend = args.backend.unwrap_or(config.storage);
    let conn = config::connection_string(backend, args.connection_string.as_deref())?;

    info!(
        feeds = config.rss.len(),
        period_secs = config.request_period,
        ?backend,
        "Starting news collector"
    );
    if let Some(conn) = &conn {
        info!("Connecting to storage: {}", config::redact(conn));
    }

    let storage = storage::open(backend, conn.as_deref())
        .await
        .context("connecting to storage")?;
    let fetcher = Fetcher::new(config.fetch_config()).context("building HTTP client")?;

    let shutdown = Shutdown::new();
    let signals = shutdown.listen_for_signals();

    let pipeline = Pipeline::new(
        Arc::new(fetcher),
        storage.clone(),
        PipelineSettings::from(&config),
        shutdown,
    );
    let report = pipeline.run(&config.rss).await;

    signals.abort();
    if let Err(e) = storage.close().await {
        error!(error = %e, "Failed to close storage");
    }

    let report = report?;
    if let Some(e) = &report.write_error {
        error!(error = %e, "Stopped after storage failures");
    }
    info!("News collector finished");
    Ok(report.is_clean())
}
