use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;
use sensor_ingestor::api::CloudClient;
use sensor_ingestor::auth::CredentialManager;
use sensor_ingestor::config::Config;
use sensor_ingestor::db::PgPointStore;
use sensor_ingestor::history::{parse_time_arg, BackfillWindow, HistoryFetcher};
use sensor_ingestor::transform::ReadingTransformer;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Upload a device's historical readings to the time-series store
#[derive(Debug, Parser)]
#[command(name = "backfill", version)]
struct Args {
    /// Begin time: RFC 3339, or YYYY-MM-DD[ HH:MM:SS] in local time
    #[arg(long, value_parser = parse_time_arg)]
    begin: DateTime<Utc>,

    /// End time, same formats as --begin (default: now)
    #[arg(long, value_parser = parse_time_arg)]
    end: Option<DateTime<Utc>>,

    /// Items per history query and per upload
    #[arg(long, default_value_t = 200)]
    batch_size: u64,

    /// MAC address of the device
    mac: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::from_env().context("loading configuration")?;
    let window = BackfillWindow::new(&args.mac, args.begin, args.end.unwrap_or_else(Utc::now))?;

    info!("Database: {}", config.database_host());
    let client = Arc::new(CloudClient::from_config(&config)?);
    let store = Arc::new(
        PgPointStore::connect(&config.database_url)
            .await
            .context("connecting to database")?,
    );

    let fetcher = HistoryFetcher::new(
        client.clone(),
        Arc::new(CredentialManager::new(client)),
        store,
        ReadingTransformer::new(config.measurement.clone()),
    );

    match fetcher.backfill(&window, args.batch_size).await {
        Ok(summary) => {
            info!(
                "Uploaded {} of {} items for {} ({} skipped)",
                summary.written, summary.total, window.mac, summary.skipped
            );
            Ok(())
        }
        Err(e) => {
            error!("Error occurred: {}", e);
            Err(e.into())
        }
    }
}
