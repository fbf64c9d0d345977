//! Slotwise booking service.
//!
//! Runs session generation on a schedule and exposes Prometheus metrics.

use booking::config::Config;
use booking::metrics::register_business_metrics;
use booking::SlotwiseApp;
use slotwise_runtime::metrics::MetricsServer;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "booking=info,slotwise_runtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Slotwise booking service");

    // Load configuration
    let config = Config::from_env();
    config.validate()?;
    info!(
        store = %config.store,
        utc_offset_minutes = config.booking.utc_offset_minutes,
        schedule_path = ?config.scheduler.schedule_path,
        "Configuration loaded"
    );

    // Metrics exporter
    let mut metrics_server = MetricsServer::new(config.metrics_addr()?);
    metrics_server.start()?;
    register_business_metrics();

    // Build application
    let app = SlotwiseApp::new(&config).await?;

    // Run scheduler until shutdown
    let scheduler = {
        let scheduler = std::sync::Arc::clone(&app.scheduler);
        tokio::spawn(async move { scheduler.run().await })
    };

    shutdown_signal().await;
    app.shutdown().await;

    let timeout = Duration::from_secs(config.server.shutdown_timeout);
    match tokio::time::timeout(timeout, scheduler).await {
        Ok(Ok(())) => info!("Scheduler stopped"),
        Ok(Err(e)) => error!(error = %e, "Scheduler task failed"),
        Err(_) => warn!(timeout_secs = timeout.as_secs(), "Scheduler did not stop in time"),
    }

    info!("Slotwise stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal, shutting down gracefully...");
        },
        () = terminate => {
            info!("Received SIGTERM signal, shutting down gracefully...");
        },
    }
}
