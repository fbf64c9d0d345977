//! Session generation.
//!
//! Each run fetches a fresh [`ScheduleSnapshot`], expands it for the target
//! month, and creates whatever sessions do not exist yet. Runs are idempotent:
//! the store's slot uniqueness is what prevents duplicates, the `find_by_slot`
//! lookup beforehand only saves a write.

use crate::calendar::Calendar;
use crate::metrics::{MetricKey, MetricsHook, SessionCounter, increment_best_effort, record_generation_run};
use crate::recurrence::{EntitySchedule, RecurrenceDefaults, ScheduleSnapshot, plan_entity};
use crate::store::{CreateOutcome, SessionStore, SessionStoreExt, StoreError};
use crate::types::{EntityId, NewSession, ServiceType, YearMonth};
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use slotwise_core::async_effect;
use slotwise_core::effect::Effect;
use slotwise_core::environment::Clock;
use slotwise_runtime::EffectRunner;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Entities processed at once when not configured
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Errors that abort a whole generation run.
///
/// Per-entity and per-day failures never abort a run; they are counted in
/// the [`GenerationReport`]. A malformed entity entry is one of those; only
/// a snapshot that is not a snapshot at all is an `InvalidSnapshot`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    /// Schedule snapshot could not be read
    #[error("Failed to load schedule snapshot: {0}")]
    Source(String),

    /// Schedule snapshot could not be parsed
    #[error("Invalid schedule snapshot: {0}")]
    InvalidSnapshot(String),
}

// ============================================================================
// Recurrence sources
// ============================================================================

/// Boxed future returned by [`RecurrenceSource::snapshot`]
pub type SnapshotFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ScheduleSnapshot, GenerationError>> + Send + 'a>>;

/// Supplies recurrence configuration. Called once at the start of every run.
pub trait RecurrenceSource: Send + Sync {
    /// Current configuration
    fn snapshot(&self) -> SnapshotFuture<'_>;
}

/// Source serving one fixed snapshot
#[derive(Clone, Debug, Default)]
pub struct StaticRecurrenceSource {
    snapshot: ScheduleSnapshot,
}

impl StaticRecurrenceSource {
    /// Serve `snapshot`
    #[must_use]
    pub const fn new(snapshot: ScheduleSnapshot) -> Self {
        Self { snapshot }
    }

    /// Parse a snapshot from JSON
    ///
    /// # Errors
    ///
    /// [`GenerationError::InvalidSnapshot`] when `json` is not a valid snapshot.
    pub fn from_json(json: &str) -> Result<Self, GenerationError> {
        parse_snapshot(json).map(Self::new)
    }
}

impl RecurrenceSource for StaticRecurrenceSource {
    fn snapshot(&self) -> SnapshotFuture<'_> {
        Box::pin(async move { Ok(self.snapshot.clone()) })
    }
}

/// Source that re-reads a JSON file on every run, so edits apply to the next run
#[derive(Clone, Debug)]
pub struct FileRecurrenceSource {
    path: PathBuf,
}

impl FileRecurrenceSource {
    /// Read from `path`
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RecurrenceSource for FileRecurrenceSource {
    fn snapshot(&self) -> SnapshotFuture<'_> {
        Box::pin(async move {
            let json = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
                GenerationError::Source(format!("{}: {e}", self.path.display()))
            })?;
            parse_snapshot(&json)
        })
    }
}

fn parse_snapshot(json: &str) -> Result<ScheduleSnapshot, GenerationError> {
    serde_json::from_str(json).map_err(|e| GenerationError::InvalidSnapshot(e.to_string()))
}

// ============================================================================
// Generator
// ============================================================================

/// Outcome of one generation run for one month
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationReport {
    /// Month generated
    pub month: YearMonth,
    /// Sessions created by this run
    pub created: usize,
    /// Occurrences that already existed
    pub skipped: usize,
    /// Occurrences that failed to persist
    pub failed: usize,
    /// Entities with at least one failed occurrence, or whose schedule
    /// entry could not be read
    pub failed_entities: Vec<EntityId>,
}

impl GenerationReport {
    fn empty(month: YearMonth) -> Self {
        Self {
            month,
            created: 0,
            skipped: 0,
            failed: 0,
            failed_entities: Vec::new(),
        }
    }
}

#[derive(Default)]
struct EntityOutcome {
    created: usize,
    skipped: usize,
    failed: usize,
    increments: Vec<MetricKey>,
}

/// Expands schedules into stored sessions.
#[derive(Clone)]
pub struct SessionGenerator {
    store: Arc<dyn SessionStore>,
    source: Arc<dyn RecurrenceSource>,
    metrics: Arc<dyn MetricsHook>,
    clock: Arc<dyn Clock>,
    calendar: Calendar,
    concurrency: usize,
    runner: EffectRunner<()>,
}

impl SessionGenerator {
    /// Creates a new `SessionGenerator`
    #[must_use]
    pub fn new(
        store: Arc<dyn SessionStore>,
        source: Arc<dyn RecurrenceSource>,
        metrics: Arc<dyn MetricsHook>,
        clock: Arc<dyn Clock>,
        calendar: Calendar,
    ) -> Self {
        Self {
            store,
            source,
            metrics,
            clock,
            calendar,
            concurrency: DEFAULT_CONCURRENCY,
            runner: EffectRunner::new(),
        }
    }

    /// Process up to `concurrency` entities at once
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Generate the months due today: the current month, plus next month
    /// during the current month's final week.
    ///
    /// # Errors
    ///
    /// Fails only if the schedule snapshot cannot be loaded.
    pub async fn generate_due(
        &self,
        services: &[ServiceType],
    ) -> Result<Vec<GenerationReport>, GenerationError> {
        let today = self.calendar.today(self.clock.as_ref());
        let mut reports = Vec::new();
        for month in Calendar::target_months(today) {
            reports.push(self.generate_month(month, services).await?);
        }
        Ok(reports)
    }

    /// Generate `month` for the entities of `services`.
    ///
    /// # Errors
    ///
    /// Fails only if the schedule snapshot cannot be loaded.
    #[tracing::instrument(skip(self, services), fields(month = %month))]
    pub async fn generate_month(
        &self,
        month: YearMonth,
        services: &[ServiceType],
    ) -> Result<GenerationReport, GenerationError> {
        let started = Instant::now();
        let snapshot = self.source.snapshot().await?;
        let today = self.calendar.today(self.clock.as_ref());

        let mut report = GenerationReport::empty(month);
        for rejected in snapshot.rejected_for(services) {
            tracing::warn!(
                entity = %rejected.label(),
                reason = %rejected.reason,
                "Skipping unreadable schedule entry; continuing"
            );
            report.failed_entities.push(rejected.label());
        }

        let entities: Vec<EntitySchedule> = snapshot.entities_for(services).cloned().collect();
        let defaults = Arc::new(snapshot.defaults);
        let outcomes: Vec<(EntityId, EntityOutcome)> = stream::iter(entities)
            .map(|entity| {
                let defaults = Arc::clone(&defaults);
                async move {
                    let outcome = self.generate_entity(&entity, &defaults, month, today).await;
                    (entity.entity_id, outcome)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut effects: Vec<Effect<()>> = Vec::new();
        for (entity_id, outcome) in outcomes {
            report.created += outcome.created;
            report.skipped += outcome.skipped;
            report.failed += outcome.failed;
            if outcome.failed > 0 {
                report.failed_entities.push(entity_id);
            }
            effects.extend(outcome.increments.into_iter().map(|key| {
                let hook = Arc::clone(&self.metrics);
                async_effect! {
                    increment_best_effort(hook, key, SessionCounter::TotalSessions).await;
                    None
                }
            }));
        }
        report.failed_entities.sort();

        // Best-effort: hook failures are logged inside each effect.
        let mut handle = self.runner.run(effects);
        handle.wait().await;

        record_generation_run(report.created, report.skipped, started.elapsed().as_secs_f64());
        tracing::info!(
            created = report.created,
            skipped = report.skipped,
            failed = report.failed,
            "Session generation finished"
        );
        Ok(report)
    }

    /// Create every missing occurrence of one entity. Failures are per day.
    async fn generate_entity(
        &self,
        entity: &EntitySchedule,
        defaults: &RecurrenceDefaults,
        month: YearMonth,
        today: NaiveDate,
    ) -> EntityOutcome {
        let planned = plan_entity(entity, defaults, month, today);
        if planned.is_empty() {
            tracing::debug!(entity_id = %entity.entity_id, "No recurrence configured; nothing to generate");
        }

        let mut outcome = EntityOutcome::default();
        for new in planned {
            let date = new.date;
            match self.create_if_missing(new).await {
                Ok(Some(key)) => {
                    outcome.created += 1;
                    outcome.increments.push(key);
                },
                Ok(None) => outcome.skipped += 1,
                Err(error) => {
                    outcome.failed += 1;
                    tracing::warn!(
                        entity_id = %entity.entity_id,
                        %date,
                        %error,
                        "Failed to generate session; continuing"
                    );
                },
            }
        }
        outcome
    }

    /// `Some(key)` when a session was created
    async fn create_if_missing(&self, new: NewSession) -> Result<Option<MetricKey>, StoreError> {
        let existing = self
            .store
            .find_by_slot(new.service_type, &new.entity_id, new.date, new.slot.start())
            .await?;
        if existing.is_some() {
            return Ok(None);
        }

        match self.store.create_new_session(new, self.clock.now()).await? {
            CreateOutcome::Created(session) => Ok(Some(MetricKey::for_session(
                session.owner_id,
                session.date,
            ))),
            CreateOutcome::Duplicate => Ok(None),
        }
    }
}
