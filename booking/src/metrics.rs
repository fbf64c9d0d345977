//! Business metrics for the booking core.
//!
//! Two concerns live here:
//! - The [`MetricsHook`] contract: per-owner session counters keyed by
//!   `(owner, month, day)`, incremented on create/complete/cancel. Calls are
//!   fire-and-forget; failures are logged and never reach the booking caller.
//! - Process metrics recorded straight through the `metrics` crate.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `slotwise_sessions_total{owner, month, counter}` - Per-owner session counters (hook)
//! - `slotwise_requests_total{service_type, outcome}` - Requests created, approved, rejected
//! - `slotwise_generated_sessions_total{service_type, outcome}` - Generation results
//! - `slotwise_job_runs_total{job, outcome}` - Scheduler job runs
//! - `slotwise_metrics_hook_failures_total` - Hook calls that failed
//!
//! ## Histograms
//! - `slotwise_command_duration_seconds{command, outcome}` - Duration of one booking command
//! - `slotwise_generation_run_duration_seconds` - Duration of one generation run

use crate::types::{OwnerId, ServiceType, YearMonth};
use chrono::{Datelike, NaiveDate};
use metrics::{describe_counter, describe_histogram};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors from a metrics hook
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetricsError {
    /// The analytics backend refused or failed the increment
    #[error("Metrics backend error: {0}")]
    Backend(String),
}

/// Which per-owner counter to increment
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionCounter {
    /// Sessions generated
    TotalSessions,
    /// Sessions completed
    CompletedSessions,
    /// Sessions cancelled
    CancelledSessions,
}

impl SessionCounter {
    /// Counter name as exposed to analytics
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TotalSessions => "totalSessions",
            Self::CompletedSessions => "completedSessions",
            Self::CancelledSessions => "cancelledSessions",
        }
    }
}

/// Counter key: owner, month and optionally the day of month
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricKey {
    /// Academy, coach or turf operator
    pub owner_id: OwnerId,
    /// Month of the session
    pub month: YearMonth,
    /// Day of month, when the counter is tracked daily
    pub day: Option<u32>,
}

impl MetricKey {
    /// Daily key for a session date
    #[must_use]
    pub fn for_session(owner_id: OwnerId, date: NaiveDate) -> Self {
        Self {
            owner_id,
            month: YearMonth::of(date),
            day: Some(date.day()),
        }
    }
}

/// Boxed future returned by hook calls
pub type HookFuture<'a> = Pin<Box<dyn Future<Output = Result<(), MetricsError>> + Send + 'a>>;

/// External counter-increment contract.
///
/// Implementations must tolerate concurrent calls.
pub trait MetricsHook: Send + Sync {
    /// Increment `counter` for `key` by one
    fn increment(&self, key: MetricKey, counter: SessionCounter) -> HookFuture<'_>;
}

/// Calls `hook` and logs (never returns) a failure.
pub async fn increment_best_effort(hook: Arc<dyn MetricsHook>, key: MetricKey, counter: SessionCounter) {
    if let Err(error) = hook.increment(key.clone(), counter).await {
        metrics::counter!("slotwise_metrics_hook_failures_total").increment(1);
        tracing::warn!(
            owner_id = %key.owner_id,
            month = %key.month,
            counter = counter.as_str(),
            %error,
            "Metrics hook increment failed"
        );
    }
}

/// Hook that records through the process-wide `metrics` recorder.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusMetricsHook;

impl MetricsHook for PrometheusMetricsHook {
    fn increment(&self, key: MetricKey, counter: SessionCounter) -> HookFuture<'_> {
        Box::pin(async move {
            metrics::counter!(
                "slotwise_sessions_total",
                "owner" => key.owner_id.to_string(),
                "month" => key.month.to_string(),
                "counter" => counter.as_str()
            )
            .increment(1);
            tracing::debug!(owner_id = %key.owner_id, counter = counter.as_str(), "Recorded session counter");
            Ok(())
        })
    }
}

/// Hook that drops every increment
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetricsHook;

impl MetricsHook for NoopMetricsHook {
    fn increment(&self, _key: MetricKey, _counter: SessionCounter) -> HookFuture<'_> {
        Box::pin(async { Ok(()) })
    }
}

/// Hook that keeps counts in memory, for tests and local runs
#[derive(Debug, Clone, Default)]
pub struct InMemoryMetricsHook {
    counts: Arc<Mutex<HashMap<(MetricKey, SessionCounter), u64>>>,
}

impl InMemoryMetricsHook {
    /// Create an empty hook
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of one counter
    #[must_use]
    pub fn count(&self, key: &MetricKey, counter: SessionCounter) -> u64 {
        self.counts
            .lock()
            .map(|counts| counts.get(&(key.clone(), counter)).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Sum of one counter across every key
    #[must_use]
    pub fn total(&self, counter: SessionCounter) -> u64 {
        self.counts
            .lock()
            .map(|counts| {
                counts
                    .iter()
                    .filter(|((_, c), _)| *c == counter)
                    .map(|(_, n)| *n)
                    .sum()
            })
            .unwrap_or(0)
    }
}

impl MetricsHook for InMemoryMetricsHook {
    fn increment(&self, key: MetricKey, counter: SessionCounter) -> HookFuture<'_> {
        Box::pin(async move {
            let mut counts = self
                .counts
                .lock()
                .map_err(|e| MetricsError::Backend(format!("counter lock poisoned: {e}")))?;
            *counts.entry((key, counter)).or_insert(0) += 1;
            Ok(())
        })
    }
}

/// Initialize and register all business metrics descriptions.
///
/// This should be called once at application startup, before any metrics are recorded.
pub fn register_business_metrics() {
    describe_counter!(
        "slotwise_sessions_total",
        "Per-owner session counters (totalSessions, completedSessions, cancelledSessions)"
    );
    describe_counter!(
        "slotwise_requests_total",
        "Session requests by service type and outcome (created, approved, rejected)"
    );
    describe_counter!(
        "slotwise_generated_sessions_total",
        "Sessions considered by generation runs, by outcome (created, skipped)"
    );
    describe_counter!(
        "slotwise_job_runs_total",
        "Scheduled and manual job runs, by job and outcome"
    );
    describe_counter!(
        "slotwise_metrics_hook_failures_total",
        "Metrics hook increments that failed and were dropped"
    );
    describe_histogram!(
        "slotwise_command_duration_seconds",
        "Time taken to load, decide and persist one booking command, by outcome"
    );
    describe_histogram!(
        "slotwise_generation_run_duration_seconds",
        "Time taken by one session generation run"
    );

    tracing::info!("Business metrics registered");
}

// ============================================================================
// Metric Recording Functions
// ============================================================================

/// Record a request outcome (`created`, `approved`, `rejected`).
pub fn record_request(service_type: ServiceType, outcome: &'static str) {
    metrics::counter!(
        "slotwise_requests_total",
        "service_type" => service_type.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record how long a booking command took and how it ended.
pub fn record_command(command: &'static str, outcome: &'static str, duration_secs: f64) {
    metrics::histogram!(
        "slotwise_command_duration_seconds",
        "command" => command,
        "outcome" => outcome
    )
    .record(duration_secs);
}

/// Record the result of one generation run.
#[allow(clippy::cast_possible_truncation)]
pub fn record_generation_run(created: usize, skipped: usize, duration_secs: f64) {
    metrics::counter!("slotwise_generated_sessions_total", "outcome" => "created")
        .increment(created as u64);
    metrics::counter!("slotwise_generated_sessions_total", "outcome" => "skipped")
        .increment(skipped as u64);
    metrics::histogram!("slotwise_generation_run_duration_seconds").record(duration_secs);
    tracing::debug!(created, skipped, duration_secs, "Recorded generation run metrics");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct FailingHook;

    impl MetricsHook for FailingHook {
        fn increment(&self, _key: MetricKey, _counter: SessionCounter) -> HookFuture<'_> {
            Box::pin(async { Err(MetricsError::Backend("analytics down".to_string())) })
        }
    }

    fn key() -> MetricKey {
        MetricKey::for_session(
            OwnerId::new("academy-1"),
            NaiveDate::from_ymd_opt(2025, 3, 12).unwrap(),
        )
    }

    #[test]
    fn test_key_for_session() {
        let key = key();
        assert_eq!(key.month.to_string(), "2025-03");
        assert_eq!(key.day, Some(12));
    }

    #[tokio::test]
    async fn test_in_memory_hook_counts() {
        let hook = InMemoryMetricsHook::new();
        hook.increment(key(), SessionCounter::TotalSessions).await.unwrap();
        hook.increment(key(), SessionCounter::TotalSessions).await.unwrap();
        hook.increment(key(), SessionCounter::CompletedSessions).await.unwrap();

        assert_eq!(hook.count(&key(), SessionCounter::TotalSessions), 2);
        assert_eq!(hook.total(SessionCounter::CompletedSessions), 1);
        assert_eq!(hook.total(SessionCounter::CancelledSessions), 0);
    }

    #[tokio::test]
    async fn test_best_effort_swallows_failures() {
        increment_best_effort(Arc::new(FailingHook), key(), SessionCounter::CancelledSessions).await;
    }

    #[tokio::test]
    async fn test_noop_and_prometheus_hooks_succeed_without_recorder() {
        assert!(NoopMetricsHook.increment(key(), SessionCounter::TotalSessions).await.is_ok());
        assert!(
            PrometheusMetricsHook
                .increment(key(), SessionCounter::TotalSessions)
                .await
                .is_ok()
        );
    }

    #[test]
    fn test_counter_names() {
        assert_eq!(SessionCounter::TotalSessions.as_str(), "totalSessions");
        assert_eq!(SessionCounter::CancelledSessions.as_str(), "cancelledSessions");
    }
}
