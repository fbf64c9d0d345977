//! Application coordinator - main application lifecycle manager.

use crate::aggregates::BookingEnvironment;
use crate::config::{Config, ConfigError, StoreBackend};
use crate::generation::{
    FileRecurrenceSource, RecurrenceSource, SessionGenerator, StaticRecurrenceSource,
};
use crate::metrics::{MetricsHook, PrometheusMetricsHook};
use crate::scheduler::{GroundSlotJob, Scheduler, SessionGenerationJob};
use crate::service::BookingService;
use crate::store::{BookingRepository, InMemorySessionStore, PostgresSessionStore, SessionStore, StoreError};
use slotwise_core::environment::{Clock, SystemClock};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Application errors
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration is unusable
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Store connection or migration failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Main booking application.
///
/// Coordinates all components:
/// - Booking service over the configured store
/// - Session generator reading the schedule snapshot
/// - Scheduler running the generation jobs
pub struct SlotwiseApp {
    /// Booking commands and queries
    pub service: Arc<BookingService>,
    /// Session generator (also run by the scheduler)
    pub generator: SessionGenerator,
    /// Periodic job runner
    pub scheduler: Arc<Scheduler>,
    shutdown: watch::Sender<bool>,
}

impl SlotwiseApp {
    /// Initialize the application from configuration.
    ///
    /// Connects to and migrates `PostgreSQL` when that backend is selected.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the store is unreachable.
    pub async fn new(config: &Config) -> Result<Self, AppError> {
        config.validate()?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let hook: Arc<dyn MetricsHook> = Arc::new(PrometheusMetricsHook);
        let source: Arc<dyn RecurrenceSource> = match &config.scheduler.schedule_path {
            Some(path) => {
                tracing::info!(path = %path, "Reading schedule snapshot from file on every run");
                Arc::new(FileRecurrenceSource::new(path))
            },
            None => {
                tracing::warn!("SLOTWISE_SCHEDULE_PATH not set; generation has no entities");
                Arc::new(StaticRecurrenceSource::default())
            },
        };

        match config.store_backend()? {
            StoreBackend::Memory => {
                tracing::info!("Using in-memory session store");
                Self::with_store(Arc::new(InMemorySessionStore::new()), config, clock, hook, source)
            },
            StoreBackend::Postgres => {
                tracing::info!("Connecting to PostgreSQL...");
                let store = PostgresSessionStore::connect(
                    &config.postgres.url,
                    config.postgres.max_connections,
                    config.postgres.min_connections,
                    Duration::from_secs(config.postgres.connect_timeout),
                )
                .await?;

                tracing::info!("Running database migrations...");
                store.migrate().await?;
                tracing::info!("✓ Session store initialized");

                Self::with_store(Arc::new(store), config, clock, hook, source)
            },
        }
    }

    /// Build the application over an existing store.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid.
    pub fn with_store<R>(
        store: Arc<R>,
        config: &Config,
        clock: Arc<dyn Clock>,
        hook: Arc<dyn MetricsHook>,
        source: Arc<dyn RecurrenceSource>,
    ) -> Result<Self, AppError>
    where
        R: BookingRepository + 'static,
    {
        let calendar = config.calendar()?;

        let generator = SessionGenerator::new(
            Arc::clone(&store) as Arc<dyn SessionStore>,
            source,
            Arc::clone(&hook),
            Arc::clone(&clock),
            calendar,
        )
        .with_concurrency(config.scheduler.generation_concurrency);

        let service = BookingService::new(store, BookingEnvironment::new(clock, hook), calendar)
            .with_default_page_size(config.booking.default_page_size);

        let (scheduler, shutdown) = Scheduler::new();
        let scheduler = scheduler
            .with_job(
                Arc::new(SessionGenerationJob::new(generator.clone())),
                config.session_job_interval(),
            )
            .with_job(
                Arc::new(GroundSlotJob::new(generator.clone())),
                config.ground_job_interval(),
            );
        tracing::info!(jobs = ?scheduler.job_names(), "✓ Scheduler configured");

        Ok(Self {
            service: Arc::new(service),
            generator,
            scheduler: Arc::new(scheduler),
            shutdown,
        })
    }

    /// Run the scheduler until [`SlotwiseApp::shutdown`] is called
    pub async fn run_scheduler(&self) {
        self.scheduler.run().await;
    }

    /// Stop the scheduler and wait for in-flight booking effects
    pub async fn shutdown(&self) {
        if self.shutdown.send(true).is_err() {
            tracing::debug!("Scheduler already stopped");
        }
        self.service.settle().await;
    }
}
