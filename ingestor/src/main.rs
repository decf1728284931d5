use axum::{routing::get, Router};
use sensor_ingestor::api::CloudClient;
use sensor_ingestor::auth::CredentialManager;
use sensor_ingestor::config::Config;
use sensor_ingestor::db::PgPointStore;
use sensor_ingestor::metrics;
use sensor_ingestor::poller::LivePoller;
use sensor_ingestor::scheduler::SchedulerLoop;
use sensor_ingestor::transform::ReadingTransformer;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    info!("Starting sensor ingestor (live mode)");
    info!("Device API: {}", config.api_base_url);
    info!("Database: {}", config.database_host());
    info!("Measurement: {}", config.measurement);
    info!("Poll interval: {:?}", config.poll_interval);

    if let Err(e) = metrics::init_metrics() {
        error!("Failed to register metrics: {}", e);
        std::process::exit(1);
    }

    let client = match CloudClient::from_config(&config) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let store = match PgPointStore::connect(&config.database_url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    let credentials = Arc::new(CredentialManager::new(client.clone()));
    let poller = Arc::new(LivePoller::new(
        client,
        credentials,
        store,
        ReadingTransformer::new(config.measurement.clone()),
    ));

    let cancel = CancellationToken::new();
    let scheduler = SchedulerLoop::new(config.poll_interval);
    let scheduler_cancel = cancel.clone();
    let mut scheduler_handle =
        tokio::spawn(async move { scheduler.run(poller, scheduler_cancel).await });

    let app = Router::new().route("/metrics", get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("Metrics server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = &mut scheduler_handle => {
            error!("Scheduler terminated");
            return;
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    // Let the scheduler stop at its cancellation point before the runtime goes away.
    cancel.cancel();
    match scheduler_handle.await {
        Ok(cycles) => info!("Scheduler ran {} cycles", cycles),
        Err(e) => error!("Scheduler task failed: {}", e),
    }

    info!("Shutting down");
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
