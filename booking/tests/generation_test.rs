//! Session generation integration tests.
//!
//! Runs the generator against the in-memory store with fixed clocks and
//! checks idempotence, ground slot volume and the never-in-the-past rule.
//!
//! Run with: `cargo test --test generation_test`

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use booking::calendar::Calendar;
use booking::generation::{SessionGenerator, StaticRecurrenceSource};
use booking::metrics::{InMemoryMetricsHook, MetricKey, SessionCounter};
use booking::recurrence::{EntitySchedule, RecurrenceRule, ScheduleSnapshot};
use booking::store::{
    CreateOutcome, InMemorySessionStore, SessionQuery, SessionStore, StoreError, StoreFuture,
};
use booking::types::{
    EntityId, ListingProfile, OwnerId, ServiceType, Session, SessionId, SessionStatus, TimeSlot,
    YearMonth,
};
use chrono::{NaiveDate, NaiveTime, Weekday};
use slotwise_testing::FixedClock;
use std::sync::Arc;

/// In-memory store whose writes fail for one entity
struct FlakyStore {
    inner: InMemorySessionStore,
    broken: EntityId,
}

impl SessionStore for FlakyStore {
    fn find_session(
        &self,
        service_type: ServiceType,
        session_id: SessionId,
    ) -> StoreFuture<'_, Option<Session>> {
        self.inner.find_session(service_type, session_id)
    }

    fn find_by_slot<'a>(
        &'a self,
        service_type: ServiceType,
        entity_id: &'a EntityId,
        date: NaiveDate,
        start: NaiveTime,
    ) -> StoreFuture<'a, Option<Session>> {
        self.inner.find_by_slot(service_type, entity_id, date, start)
    }

    fn create_session(&self, session: Session) -> StoreFuture<'_, CreateOutcome> {
        if session.entity_id == self.broken {
            return Box::pin(async { Err(StoreError::Database("connection reset".to_string())) });
        }
        self.inner.create_session(session)
    }

    fn save_session<'a>(
        &'a self,
        session: &'a Session,
        expected: &'a SessionStatus,
    ) -> StoreFuture<'a, ()> {
        self.inner.save_session(session, expected)
    }

    fn query_sessions<'a>(
        &'a self,
        service_type: ServiceType,
        query: &'a SessionQuery,
    ) -> StoreFuture<'a, Vec<Session>> {
        self.inner.query_sessions(service_type, query)
    }
}

fn batch(entity: &str, days: &[Weekday], slot: &str) -> EntitySchedule {
    EntitySchedule {
        service_type: ServiceType::AcademyBatch,
        entity_id: EntityId::new(entity),
        owner_id: OwnerId::new("academy-1"),
        rule: Some(RecurrenceRule::Weekly {
            days: days.iter().copied().collect(),
            slot: slot.parse().unwrap(),
        }),
        profile: ListingProfile {
            location: Some("North Field".to_string()),
            sport: Some("football".to_string()),
            price_cents: Some(1200),
        },
    }
}

fn ground(entity: &str, slots: &[&str]) -> EntitySchedule {
    EntitySchedule {
        service_type: ServiceType::Turf,
        entity_id: EntityId::new(entity),
        owner_id: OwnerId::new("turf-1"),
        rule: Some(RecurrenceRule::DailySlots {
            slots: slots.iter().map(|s| s.parse::<TimeSlot>().unwrap()).collect(),
        }),
        profile: ListingProfile::default(),
    }
}

fn generator(
    store: &Arc<InMemorySessionStore>,
    snapshot: ScheduleSnapshot,
    hook: &InMemoryMetricsHook,
    today: (i32, u32, u32),
) -> SessionGenerator {
    let clock = FixedClock::on_date(today.0, today.1, today.2).expect("valid date");
    SessionGenerator::new(
        Arc::clone(store) as Arc<dyn SessionStore>,
        Arc::new(StaticRecurrenceSource::new(snapshot)),
        Arc::new(hook.clone()),
        Arc::new(clock),
        Calendar::utc(),
    )
}

#[tokio::test]
async fn test_weekly_generation_is_idempotent() {
    let store = Arc::new(InMemorySessionStore::new());
    let hook = InMemoryMetricsHook::new();
    let snapshot = ScheduleSnapshot {
        entities: vec![batch("batch-u12", &[Weekday::Mon, Weekday::Wed], "17:00-18:00")],
        ..ScheduleSnapshot::default()
    };
    let generator = generator(&store, snapshot, &hook, (2025, 10, 1));
    let october = YearMonth::new(2025, 10).unwrap();

    let first = generator
        .generate_month(october, &[ServiceType::AcademyBatch])
        .await
        .unwrap();
    assert_eq!(first.created, 9, "4 Mondays + 5 Wednesdays in October 2025");
    assert_eq!(first.skipped, 0);

    let second = generator
        .generate_month(october, &[ServiceType::AcademyBatch])
        .await
        .unwrap();
    assert_eq!(second.created, 0);
    assert_eq!(second.skipped, 9);
    assert_eq!(store.session_count(ServiceType::AcademyBatch).await, 9);

    // Counters only move for sessions that were actually created
    assert_eq!(hook.total(SessionCounter::TotalSessions), 9);
    let oct_6 = MetricKey::for_session(
        OwnerId::new("academy-1"),
        NaiveDate::from_ymd_opt(2025, 10, 6).unwrap(),
    );
    assert_eq!(hook.count(&oct_6, SessionCounter::TotalSessions), 1);
}

#[tokio::test]
async fn test_overlapping_runs_never_duplicate() {
    let store = Arc::new(InMemorySessionStore::new());
    let hook = InMemoryMetricsHook::new();
    let snapshot = ScheduleSnapshot {
        entities: vec![
            batch("batch-a", &[Weekday::Tue, Weekday::Thu], "06:00-07:00"),
            batch("batch-b", &[Weekday::Sat], "09:00-10:30"),
        ],
        ..ScheduleSnapshot::default()
    };
    let generator = generator(&store, snapshot, &hook, (2025, 10, 1));
    let october = YearMonth::new(2025, 10).unwrap();

    let (a, b) = tokio::join!(
        generator.generate_month(october, &[ServiceType::AcademyBatch]),
        generator.generate_month(october, &[ServiceType::AcademyBatch]),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    // Tue/Thu: 7+14+21+28 and 2+9+16+23+30 = 9, Sat: 4+11+18+25 = 4
    assert_eq!(a.created + b.created, 13);
    assert_eq!(store.session_count(ServiceType::AcademyBatch).await, 13);
    assert_eq!(hook.total(SessionCounter::TotalSessions), 13);
}

#[tokio::test]
async fn test_ground_slots_cover_every_day() {
    let store = Arc::new(InMemorySessionStore::new());
    let hook = InMemoryMetricsHook::new();
    let snapshot = ScheduleSnapshot {
        entities: vec![ground("ground-1", &["06:00-07:00", "07:00-08:00"])],
        ..ScheduleSnapshot::default()
    };
    let generator = generator(&store, snapshot, &hook, (2025, 11, 1));

    let report = generator
        .generate_month(YearMonth::new(2025, 11).unwrap(), &[ServiceType::Turf])
        .await
        .unwrap();

    assert_eq!(report.created, 60, "30 days × 2 slots");
    assert!(report.failed_entities.is_empty());
}

#[tokio::test]
async fn test_generated_dates_stay_in_month_and_not_in_past() {
    let store = Arc::new(InMemorySessionStore::new());
    let hook = InMemoryMetricsHook::new();
    let snapshot = ScheduleSnapshot {
        entities: vec![
            batch("batch-u14", &[Weekday::Mon, Weekday::Fri], "16:00-17:00"),
            ground("ground-2", &["20:00-21:00"]),
        ],
        ..ScheduleSnapshot::default()
    };
    let generator = generator(&store, snapshot, &hook, (2025, 10, 15));
    let october = YearMonth::new(2025, 10).unwrap();
    let today = NaiveDate::from_ymd_opt(2025, 10, 15).unwrap();

    generator
        .generate_month(october, &[ServiceType::AcademyBatch, ServiceType::Turf])
        .await
        .unwrap();

    for service_type in [ServiceType::AcademyBatch, ServiceType::Turf] {
        let sessions = store
            .query_sessions(service_type, &SessionQuery::new())
            .await
            .unwrap();
        assert!(!sessions.is_empty());
        for session in &sessions {
            assert!(october.contains(session.date), "{} outside month", session.date);
            assert!(session.date >= today, "{} is in the past", session.date);
            assert!(session.status.is_open());
        }
    }

    // Ground: Oct 15..=31 is 17 days
    assert_eq!(store.session_count(ServiceType::Turf).await, 17);
}

#[tokio::test]
async fn test_generate_due_rolls_into_next_month_in_final_week() {
    let store = Arc::new(InMemorySessionStore::new());
    let hook = InMemoryMetricsHook::new();
    let snapshot = ScheduleSnapshot {
        entities: vec![ground("ground-3", &["18:00-19:00"])],
        ..ScheduleSnapshot::default()
    };

    // Oct 24: 7 days left, only the current month
    let early = generator(&store, snapshot.clone(), &hook, (2025, 10, 24));
    let reports = early.generate_due(&[ServiceType::Turf]).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].created, 8);

    // Oct 25: final week, November is generated too
    let late = generator(&store, snapshot, &hook, (2025, 10, 25));
    let reports = late.generate_due(&[ServiceType::Turf]).await.unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].created, 0);
    assert_eq!(reports[0].skipped, 7);
    assert_eq!(reports[1].month, YearMonth::new(2025, 11).unwrap());
    assert_eq!(reports[1].created, 30);
}

#[tokio::test]
async fn test_service_defaults_apply_without_override() {
    let store = Arc::new(InMemorySessionStore::new());
    let hook = InMemoryMetricsHook::new();
    let snapshot: ScheduleSnapshot = serde_json::from_str(
        r#"{
            "defaults": {
                "turf": { "kind": "daily_slots", "slots": ["06:00-07:00", "07:00-08:00", "08:00-09:00"] }
            },
            "entities": [
                { "service_type": "turf", "entity_id": "ground-9", "owner_id": "turf-9" },
                { "service_type": "coach", "entity_id": "coach-9", "owner_id": "coach-9" }
            ]
        }"#,
    )
    .unwrap();
    let generator = generator(&store, snapshot, &hook, (2025, 2, 27));

    let report = generator
        .generate_month(
            YearMonth::new(2025, 2).unwrap(),
            &[ServiceType::Turf, ServiceType::Coach],
        )
        .await
        .unwrap();

    // Feb 27 + 28, three slots each; the coach has no rule and no default
    assert_eq!(report.created, 6);
    assert_eq!(store.session_count(ServiceType::Coach).await, 0);
}

#[tokio::test]
async fn test_unreadable_entity_does_not_stop_the_run() {
    let store = Arc::new(InMemorySessionStore::new());
    let hook = InMemoryMetricsHook::new();
    let snapshot: ScheduleSnapshot = serde_json::from_str(
        r#"{
            "entities": [
                { "service_type": "academy_batch", "entity_id": "batch-ok", "owner_id": "academy-1",
                  "rule": { "kind": "weekly", "days": ["Mon", "Wed"], "slot": "17:00-18:00" } },
                { "service_type": "turf", "entity_id": "ground-late", "owner_id": "turf-1",
                  "rule": { "kind": "daily_slots", "slots": ["23:00-00:00"] } }
            ]
        }"#,
    )
    .unwrap();
    assert_eq!(snapshot.entities.len(), 1);
    assert_eq!(snapshot.rejected.len(), 1);

    let generator = generator(&store, snapshot, &hook, (2025, 10, 1));
    let report = generator
        .generate_month(
            YearMonth::new(2025, 10).unwrap(),
            &[ServiceType::AcademyBatch, ServiceType::Turf],
        )
        .await
        .unwrap();

    assert_eq!(report.created, 9);
    assert_eq!(report.failed_entities, vec![EntityId::new("ground-late")]);
    assert_eq!(store.session_count(ServiceType::Turf).await, 0);
}

#[tokio::test]
async fn test_failing_entity_is_reported_and_others_still_generate() {
    let store = Arc::new(FlakyStore {
        inner: InMemorySessionStore::new(),
        broken: EntityId::new("batch-broken"),
    });
    let hook = InMemoryMetricsHook::new();
    let snapshot = ScheduleSnapshot {
        entities: vec![
            batch("batch-broken", &[Weekday::Mon], "16:00-17:00"),
            batch("batch-fine", &[Weekday::Mon, Weekday::Wed], "17:00-18:00"),
        ],
        ..ScheduleSnapshot::default()
    };
    let generator = SessionGenerator::new(
        Arc::clone(&store) as Arc<dyn SessionStore>,
        Arc::new(StaticRecurrenceSource::new(snapshot)),
        Arc::new(hook.clone()),
        Arc::new(FixedClock::on_date(2025, 10, 1).expect("valid date")),
        Calendar::utc(),
    );

    let report = generator
        .generate_month(YearMonth::new(2025, 10).unwrap(), &[ServiceType::AcademyBatch])
        .await
        .unwrap();

    // Mondays in October 2025: 6, 13, 20, 27
    assert_eq!(report.created, 9);
    assert_eq!(report.failed, 4);
    assert_eq!(report.failed_entities, vec![EntityId::new("batch-broken")]);
    assert_eq!(store.inner.session_count(ServiceType::AcademyBatch).await, 9);
    assert_eq!(hook.total(SessionCounter::TotalSessions), 9);
}
