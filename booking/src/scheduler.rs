//! Periodic job runner.
//!
//! Each registered job ticks on its own interval until shutdown is signalled.
//! Jobs can also be fired by hand with [`Scheduler::trigger`], concurrently
//! with their schedule; the generation jobs are idempotent so overlapping runs
//! never duplicate sessions.

use crate::generation::{GenerationError, SessionGenerator};
use crate::types::ServiceType;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

/// Errors from scheduled jobs
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Session generation could not run
    #[error("Generation failed: {0}")]
    Generation(#[from] GenerationError),

    /// Any other job failure
    #[error("Job failed: {0}")]
    Failed(String),

    /// No job registered under that name
    #[error("Unknown job: {0}")]
    UnknownJob(String),
}

/// Boxed future returned by [`PeriodicJob::run`]
pub type JobFuture<'a> = Pin<Box<dyn Future<Output = Result<(), JobError>> + Send + 'a>>;

/// Work the scheduler runs on an interval.
///
/// Fee generation and other external periodic work plug in here too.
pub trait PeriodicJob: Send + Sync {
    /// Stable name, used for manual triggers and metrics labels
    fn name(&self) -> &'static str;

    /// Run once
    fn run(&self) -> JobFuture<'_>;
}

/// Generates batch, program and coach sessions for the months due today
#[derive(Clone)]
pub struct SessionGenerationJob {
    generator: SessionGenerator,
}

impl SessionGenerationJob {
    /// Job name
    pub const NAME: &'static str = "session_generation";

    const SERVICES: [ServiceType; 3] = [
        ServiceType::AcademyBatch,
        ServiceType::AcademyProgram,
        ServiceType::Coach,
    ];

    /// Creates a new `SessionGenerationJob`
    #[must_use]
    pub const fn new(generator: SessionGenerator) -> Self {
        Self { generator }
    }
}

impl PeriodicJob for SessionGenerationJob {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self) -> JobFuture<'_> {
        Box::pin(async move {
            self.generator.generate_due(&Self::SERVICES).await?;
            Ok(())
        })
    }
}

/// Generates daily ground slots
#[derive(Clone)]
pub struct GroundSlotJob {
    generator: SessionGenerator,
}

impl GroundSlotJob {
    /// Job name
    pub const NAME: &'static str = "ground_slot_generation";

    /// Creates a new `GroundSlotJob`
    #[must_use]
    pub const fn new(generator: SessionGenerator) -> Self {
        Self { generator }
    }
}

impl PeriodicJob for GroundSlotJob {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self) -> JobFuture<'_> {
        Box::pin(async move {
            self.generator.generate_due(&[ServiceType::Turf]).await?;
            Ok(())
        })
    }
}

struct ScheduledJob {
    job: Arc<dyn PeriodicJob>,
    every: Duration,
}

/// Runs registered jobs on their intervals until shutdown.
///
/// # Example
///
/// ```ignore
/// let (scheduler, shutdown) = Scheduler::new();
/// let scheduler = Arc::new(
///     scheduler.with_job(Arc::new(SessionGenerationJob::new(generator)), Duration::from_secs(86_400)),
/// );
///
/// tokio::spawn({
///     let scheduler = Arc::clone(&scheduler);
///     async move { scheduler.run().await }
/// });
///
/// scheduler.trigger(SessionGenerationJob::NAME).await?;
/// shutdown.send(true).ok();
/// ```
pub struct Scheduler {
    jobs: Vec<ScheduledJob>,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    /// Creates an empty scheduler and its shutdown sender.
    ///
    /// Send `true` to stop every job loop.
    #[must_use]
    pub fn new() -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        (
            Self {
                jobs: Vec::new(),
                shutdown: shutdown_rx,
            },
            shutdown_tx,
        )
    }

    /// Register `job` to run every `every` (first run immediately)
    #[must_use]
    pub fn with_job(mut self, job: Arc<dyn PeriodicJob>, every: Duration) -> Self {
        self.jobs.push(ScheduledJob {
            job,
            every: every.max(Duration::from_millis(1)),
        });
        self
    }

    /// Names of registered jobs
    #[must_use]
    pub fn job_names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|scheduled| scheduled.job.name()).collect()
    }

    /// Run one job now, regardless of its schedule
    ///
    /// # Errors
    ///
    /// [`JobError::UnknownJob`] for an unregistered name, otherwise the
    /// job's own error.
    pub async fn trigger(&self, name: &str) -> Result<(), JobError> {
        let scheduled = self
            .jobs
            .iter()
            .find(|scheduled| scheduled.job.name() == name)
            .ok_or_else(|| JobError::UnknownJob(name.to_string()))?;
        tracing::info!(job = name, "Job triggered manually");
        run_job(scheduled.job.as_ref()).await
    }

    /// Run every job loop until shutdown is signalled.
    pub async fn run(&self) {
        let mut loops = JoinSet::new();
        for scheduled in &self.jobs {
            loops.spawn(job_loop(
                Arc::clone(&scheduled.job),
                scheduled.every,
                self.shutdown.clone(),
            ));
        }
        tracing::info!(jobs = self.jobs.len(), "Scheduler started");

        while let Some(joined) = loops.join_next().await {
            if let Err(error) = joined {
                tracing::error!(%error, "Job loop aborted");
            }
        }
        tracing::info!("Scheduler stopped");
    }
}

async fn job_loop(job: Arc<dyn PeriodicJob>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while !*shutdown.borrow() {
        tokio::select! {
            _ = ticker.tick() => {
                // Errors are logged and counted in run_job; the loop keeps going
                let _ = run_job(job.as_ref()).await;
            }

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!(job = job.name(), "Shutdown signal received");
                    break;
                }
            }
        }
    }
}

async fn run_job(job: &dyn PeriodicJob) -> Result<(), JobError> {
    let started = Instant::now();
    let result = job.run().await;
    let outcome = if result.is_ok() { "ok" } else { "error" };

    metrics::counter!("slotwise_job_runs_total", "job" => job.name(), "outcome" => outcome)
        .increment(1);
    match &result {
        Ok(()) => tracing::info!(
            job = job.name(),
            elapsed_secs = started.elapsed().as_secs_f64(),
            "Job finished"
        ),
        Err(error) => tracing::error!(job = job.name(), %error, "Job failed"),
    }
    result
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingJob {
        runs: Arc<AtomicUsize>,
        fail: bool,
    }

    impl PeriodicJob for CountingJob {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn run(&self) -> JobFuture<'_> {
            Box::pin(async move {
                self.runs.fetch_add(1, Ordering::SeqCst);
                if self.fail {
                    Err(JobError::Failed("boom".to_string()))
                } else {
                    Ok(())
                }
            })
        }
    }

    fn counting(fail: bool) -> (Arc<dyn PeriodicJob>, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let job = Arc::new(CountingJob {
            runs: Arc::clone(&runs),
            fail,
        });
        (job, runs)
    }

    #[tokio::test]
    async fn test_trigger_runs_job_once() {
        let (job, runs) = counting(false);
        let (scheduler, _shutdown) = Scheduler::new();
        let scheduler = scheduler.with_job(job, Duration::from_secs(3600));

        scheduler.trigger("counting").await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.job_names(), vec!["counting"]);
    }

    #[tokio::test]
    async fn test_trigger_unknown_job() {
        let (scheduler, _shutdown) = Scheduler::new();
        assert_eq!(
            scheduler.trigger("fees").await,
            Err(JobError::UnknownJob("fees".to_string()))
        );
    }

    #[tokio::test]
    async fn test_loop_ticks_until_shutdown() {
        let (job, runs) = counting(true);
        let (scheduler, shutdown) = Scheduler::new();
        let scheduler = Arc::new(scheduler.with_job(job, Duration::from_millis(10)));

        let running = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.run().await }
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap();

        // Failing runs do not stop the loop
        let after_shutdown = runs.load(Ordering::SeqCst);
        assert!(after_shutdown >= 2, "expected repeated runs, got {after_shutdown}");

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_shutdown);
    }
}
