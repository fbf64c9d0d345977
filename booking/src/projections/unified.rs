//! Unified cross-type booking view.
//!
//! A user's sessions live in four per-type tables with slightly different
//! shapes. This projection queries all four concurrently, normalizes every row
//! to a [`UnifiedBooking`], and merges them into one sorted list.

use crate::calendar::Calendar;
use crate::error::BookingError;
use crate::store::{SessionQuery, SessionStore, SortOrder, StateFilter};
use crate::types::{
    EntityId, OwnerId, RequestId, ServiceType, Session, SessionId, SupplierType, UserId,
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use slotwise_core::environment::Clock;
use std::cmp::Ordering;
use std::sync::Arc;

/// Where a booking's date falls relative to today
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemporalStatus {
    /// Before today
    Past,
    /// Today
    Today,
    /// After today
    Upcoming,
}

impl TemporalStatus {
    /// Classify `date` against `today` at day granularity
    #[must_use]
    pub fn classify(date: NaiveDate, today: NaiveDate) -> Self {
        match date.cmp(&today) {
            Ordering::Less => Self::Past,
            Ordering::Equal => Self::Today,
            Ordering::Greater => Self::Upcoming,
        }
    }
}

/// One session from any service type, in the common shape.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedBooking {
    /// Session ID
    pub id: SessionId,
    /// Which per-type table the row came from
    pub session_type: ServiceType,
    /// Academy, coach or turf
    pub supplier_type: SupplierType,
    /// Owning batch/program/coach/ground
    pub supplier_id: EntityId,
    /// Academy, coach or turf operator
    pub owner_id: OwnerId,
    /// Session date
    pub date: NaiveDate,
    /// Start time
    pub time: NaiveTime,
    /// End time
    pub end_time: NaiveTime,
    /// Length in minutes
    pub duration_minutes: i64,
    /// Past, today or upcoming
    pub status: TemporalStatus,
    /// Price in minor units
    pub price_cents: Option<i64>,
    /// Approved request that booked the session
    pub booking_id: Option<RequestId>,
    /// Venue or area
    pub location: Option<String>,
    /// Sport played
    pub sport: Option<String>,
    /// When the session was generated
    pub created_at: DateTime<Utc>,
    /// The row as stored
    pub original: Session,
}

impl UnifiedBooking {
    /// Normalize `session`, labelling it against `today`
    #[must_use]
    pub fn from_session(session: Session, today: NaiveDate) -> Self {
        Self {
            id: session.session_id,
            session_type: session.service_type,
            supplier_type: session.service_type.supplier_type(),
            supplier_id: session.entity_id.clone(),
            owner_id: session.owner_id.clone(),
            date: session.date,
            time: session.slot.start(),
            end_time: session.slot.end(),
            duration_minutes: session.slot.duration_minutes(),
            status: TemporalStatus::classify(session.date, today),
            price_cents: session.price_cents,
            booking_id: session.booking_id,
            location: session.location.clone(),
            sport: session.sport.clone(),
            created_at: session.created_at,
            original: session,
        }
    }
}

/// Filters for [`BookingAggregator::get_all_user_bookings`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingFilters {
    /// Restrict to these service types (all four when `None`)
    pub service_types: Option<Vec<ServiceType>>,
    /// Restrict to one owner
    pub scope_id: Option<OwnerId>,
    /// Lifecycle filter
    pub state: Option<StateFilter>,
    /// First date, inclusive
    pub from: Option<NaiveDate>,
    /// Last date, inclusive
    pub to: Option<NaiveDate>,
    /// Sort direction of the merged list
    #[serde(default)]
    pub order: SortOrder,
    /// Maximum rows returned
    pub limit: Option<usize>,
}

/// Fans queries out to every per-type store and merges the results.
#[derive(Clone)]
pub struct BookingAggregator {
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    calendar: Calendar,
}

impl BookingAggregator {
    /// Creates a new `BookingAggregator`
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, clock: Arc<dyn Clock>, calendar: Calendar) -> Self {
        Self {
            store,
            clock,
            calendar,
        }
    }

    /// Every booking of `user_id` across the selected service types
    ///
    /// # Errors
    ///
    /// Fails if any per-type query fails.
    #[tracing::instrument(skip(self, filters), fields(user_id = %user_id))]
    pub async fn get_all_user_bookings(
        &self,
        user_id: &UserId,
        filters: &BookingFilters,
    ) -> Result<Vec<UnifiedBooking>, BookingError> {
        let query = SessionQuery::new()
            .for_user(user_id.clone())
            .for_owner(filters.scope_id.clone())
            .between(filters.from, filters.to)
            .ordered(filters.order)
            .page(filters.limit, 0);
        let query = match filters.state {
            Some(state) => query.in_state(state),
            None => query,
        };
        let types = filters
            .service_types
            .as_deref()
            .unwrap_or(&ServiceType::ALL);

        self.merged(types, &query).await
    }

    /// Booked sessions of `user_id` from today on, soonest first
    ///
    /// # Errors
    ///
    /// Fails if any per-type query fails.
    #[tracing::instrument(skip(self, scope_id), fields(user_id = %user_id))]
    pub async fn get_upcoming_sessions(
        &self,
        user_id: &UserId,
        scope_id: Option<&OwnerId>,
        limit: usize,
    ) -> Result<Vec<UnifiedBooking>, BookingError> {
        let today = self.calendar.today(self.clock.as_ref());
        let query = SessionQuery::new()
            .for_user(user_id.clone())
            .for_owner(scope_id.cloned())
            .between(Some(today), None)
            .in_state(StateFilter::Booked)
            .ordered(SortOrder::Chronological)
            .page(Some(limit), 0);

        self.merged(&ServiceType::ALL, &query).await
    }

    /// Most recently completed sessions of `user_id`, latest first
    ///
    /// # Errors
    ///
    /// Fails if any per-type query fails.
    #[tracing::instrument(skip(self, scope_id), fields(user_id = %user_id))]
    pub async fn get_latest_completed_sessions(
        &self,
        user_id: &UserId,
        scope_id: Option<&OwnerId>,
        limit: usize,
    ) -> Result<Vec<UnifiedBooking>, BookingError> {
        let query = SessionQuery::new()
            .for_user(user_id.clone())
            .for_owner(scope_id.cloned())
            .in_state(StateFilter::Completed)
            .ordered(SortOrder::ReverseChronological)
            .page(Some(limit), 0);

        self.merged(&ServiceType::ALL, &query).await
    }

    /// Run `query` against each type, wait for all, then merge once.
    ///
    /// The per-type limit equals the final limit, so truncating each list
    /// first never drops a row the merged list would keep.
    async fn merged(
        &self,
        types: &[ServiceType],
        query: &SessionQuery,
    ) -> Result<Vec<UnifiedBooking>, BookingError> {
        let results = join_all(
            types
                .iter()
                .map(|service_type| self.store.query_sessions(*service_type, query)),
        )
        .await;

        let mut sessions = Vec::new();
        for (service_type, result) in types.iter().zip(results) {
            match result {
                Ok(rows) => sessions.extend(rows),
                Err(error) => {
                    tracing::warn!(%service_type, %error, "Per-type booking query failed");
                    return Err(error.into());
                },
            }
        }

        sessions.sort_by(|a, b| query.order.compare(a, b));
        if let Some(limit) = query.limit {
            sessions.truncate(limit);
        }

        let today = self.calendar.today(self.clock.as_ref());
        tracing::debug!(rows = sessions.len(), "Merged bookings across service types");
        Ok(sessions
            .into_iter()
            .map(|session| UnifiedBooking::from_session(session, today))
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::{InMemorySessionStore, SessionStoreExt};
    use crate::types::{NewSession, SessionStatus};
    use slotwise_testing::test_clock;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
    }

    #[test]
    fn test_classify() {
        assert_eq!(TemporalStatus::classify(date(9), date(10)), TemporalStatus::Past);
        assert_eq!(TemporalStatus::classify(date(10), date(10)), TemporalStatus::Today);
        assert_eq!(TemporalStatus::classify(date(11), date(10)), TemporalStatus::Upcoming);
    }

    #[test]
    fn test_unified_shape() {
        let session = NewSession {
            service_type: ServiceType::Turf,
            entity_id: EntityId::new("ground-1"),
            owner_id: OwnerId::new("turf-1"),
            date: date(12),
            slot: "06:00-07:30".parse().unwrap(),
            profile: crate::types::ListingProfile {
                location: Some("Pitch A".to_string()),
                sport: Some("cricket".to_string()),
                price_cents: Some(4000),
            },
        }
        .into_session(SessionId::new(), test_clock().now());

        let unified = UnifiedBooking::from_session(session, date(10));
        assert_eq!(unified.supplier_type, SupplierType::Turf);
        assert_eq!(unified.duration_minutes, 90);
        assert_eq!(unified.status, TemporalStatus::Upcoming);

        let json = serde_json::to_value(&unified).unwrap();
        assert_eq!(json["supplierType"], "turf");
        assert_eq!(json["status"], "upcoming");
        assert_eq!(json["priceCents"], 4000);
    }

    #[tokio::test]
    async fn test_scope_narrows_to_one_owner() {
        let store = Arc::new(InMemorySessionStore::new());
        let user = UserId::new("u-1");
        for (service_type, owner, day) in [
            (ServiceType::Coach, "coach-1", 12),
            (ServiceType::Coach, "coach-2", 13),
            (ServiceType::AcademyBatch, "coach-1", 14),
        ] {
            let new = NewSession {
                service_type,
                entity_id: EntityId::new(format!("{owner}-e")),
                owner_id: OwnerId::new(owner),
                date: date(day),
                slot: "09:00-10:00".parse().unwrap(),
                profile: crate::types::ListingProfile::default(),
            };
            let mut session = new.into_session(SessionId::new(), test_clock().now());
            let expected = session.status.clone();
            store.create_session(session.clone()).await.unwrap();
            session.status = SessionStatus::Booked {
                user_id: user.clone(),
            };
            store.save_session(&session, &expected).await.unwrap();
        }

        let aggregator = BookingAggregator::new(store, Arc::new(test_clock()), Calendar::utc());
        let scope = OwnerId::new("coach-1");
        let upcoming = aggregator
            .get_upcoming_sessions(&user, Some(&scope), 10)
            .await
            .unwrap();

        assert_eq!(upcoming.len(), 2);
        assert!(upcoming.iter().all(|b| b.owner_id == scope));
        assert_eq!(upcoming[0].date, date(12));
        assert_eq!(upcoming[1].session_type, ServiceType::AcademyBatch);
    }

    #[tokio::test]
    async fn test_empty_store_yields_empty_list() {
        let store = Arc::new(InMemorySessionStore::new());
        store
            .create_new_session(
                NewSession {
                    service_type: ServiceType::Turf,
                    entity_id: EntityId::new("ground-1"),
                    owner_id: OwnerId::new("turf-1"),
                    date: date(12),
                    slot: "06:00-07:00".parse().unwrap(),
                    profile: crate::types::ListingProfile::default(),
                },
                test_clock().now(),
            )
            .await
            .unwrap();

        let aggregator = BookingAggregator::new(store, Arc::new(test_clock()), Calendar::utc());
        let all = aggregator
            .get_all_user_bookings(&UserId::new("nobody"), &BookingFilters::default())
            .await
            .unwrap();
        assert!(all.is_empty());
    }
}
