//! `PostgreSQL` session store.
//!
//! Four session tables and four request tables (`<type>_sessions`,
//! `<type>_requests`). Slot uniqueness and the one-pending-request rule are
//! database constraints; application checks are only a fast path.

use super::{
    BookingRepository, CreateOutcome, RequestLedger, SessionQuery, SessionStore, SortOrder,
    StateFilter, StoreError, StoreFuture,
};
use crate::types::{
    EntityId, OwnerId, Rating, RequestId, RequestStatus, ServiceType, Session, SessionId,
    SessionRequest, SessionStatus, TimeSlot, UserId,
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use std::time::Duration;
use uuid::Uuid;

const SESSION_COLUMNS: &str = "session_id, entity_id, owner_id, date, start_time, end_time, \
     user_id, is_cancelled, is_completed, cancellation_reason, feedback, rating, booking_id, \
     location, sport, price_cents, created_at";

const REQUEST_COLUMNS: &str =
    "request_id, session_id, user_id, requested_at, status, notes, rejection_reason, decided_at";

const fn sessions_table(service_type: ServiceType) -> &'static str {
    match service_type {
        ServiceType::AcademyBatch => "academy_batch_sessions",
        ServiceType::AcademyProgram => "academy_program_sessions",
        ServiceType::Coach => "coach_sessions",
        ServiceType::Turf => "turf_sessions",
    }
}

const fn requests_table(service_type: ServiceType) -> &'static str {
    match service_type {
        ServiceType::AcademyBatch => "academy_batch_requests",
        ServiceType::AcademyProgram => "academy_program_requests",
        ServiceType::Coach => "coach_requests",
        ServiceType::Turf => "turf_requests",
    }
}

fn db_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |e| StoreError::Database(format!("{context}: {e}"))
}

/// Persisted session columns
#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    session_id: Uuid,
    entity_id: String,
    owner_id: String,
    date: NaiveDate,
    start_time: NaiveTime,
    end_time: NaiveTime,
    user_id: Option<String>,
    is_cancelled: bool,
    is_completed: bool,
    cancellation_reason: Option<String>,
    feedback: Option<String>,
    rating: Option<i16>,
    booking_id: Option<Uuid>,
    location: Option<String>,
    sport: Option<String>,
    price_cents: Option<i64>,
    created_at: DateTime<Utc>,
}

impl SessionRow {
    fn into_session(self, service_type: ServiceType) -> Result<Session, StoreError> {
        let corrupt = |reason: String| StoreError::CorruptRow {
            table: sessions_table(service_type).to_string(),
            reason: format!("session {}: {reason}", self.session_id),
        };

        let user_id = self.user_id.clone().map(UserId::new);
        let status = match (user_id, self.is_cancelled, self.is_completed) {
            (_, true, true) => return Err(corrupt("both cancelled and completed".to_string())),
            (None, false, true) => return Err(corrupt("completed without a user".to_string())),
            (Some(user_id), false, true) => SessionStatus::Completed { user_id },
            (user_id, true, false) => SessionStatus::Cancelled { user_id },
            (Some(user_id), false, false) => SessionStatus::Booked { user_id },
            (None, false, false) => SessionStatus::Open,
        };
        let slot = TimeSlot::new(self.start_time, self.end_time).map_err(|e| corrupt(e.to_string()))?;
        let rating = self
            .rating
            .map(|r| Rating::new(i64::from(r)))
            .transpose()
            .map_err(|e| corrupt(e.to_string()))?;

        Ok(Session {
            session_id: SessionId::from_uuid(self.session_id),
            service_type,
            entity_id: EntityId::new(self.entity_id),
            owner_id: OwnerId::new(self.owner_id),
            date: self.date,
            slot,
            status,
            cancellation_reason: self.cancellation_reason,
            feedback: self.feedback,
            rating,
            booking_id: self.booking_id.map(RequestId::from_uuid),
            location: self.location,
            sport: self.sport,
            price_cents: self.price_cents,
            created_at: self.created_at,
        })
    }
}

/// Persisted request columns
#[derive(Debug, sqlx::FromRow)]
struct RequestRow {
    request_id: Uuid,
    session_id: Uuid,
    user_id: String,
    requested_at: DateTime<Utc>,
    status: String,
    notes: Option<String>,
    rejection_reason: Option<String>,
    decided_at: Option<DateTime<Utc>>,
}

impl RequestRow {
    fn into_request(self, service_type: ServiceType) -> Result<SessionRequest, StoreError> {
        let status: RequestStatus = self.status.parse().map_err(|e: crate::error::ValidationError| {
            StoreError::CorruptRow {
                table: requests_table(service_type).to_string(),
                reason: format!("request {}: {e}", self.request_id),
            }
        })?;

        Ok(SessionRequest {
            request_id: RequestId::from_uuid(self.request_id),
            session_id: SessionId::from_uuid(self.session_id),
            user_id: UserId::new(self.user_id),
            requested_at: self.requested_at,
            status,
            notes: self.notes,
            rejection_reason: self.rejection_reason,
            decided_at: self.decided_at,
        })
    }
}

/// Column values `(user_id, is_cancelled, is_completed)` for a status
fn status_columns(status: &SessionStatus) -> (Option<String>, bool, bool) {
    (
        status.user_id().map(|u| u.as_str().to_string()),
        status.is_cancelled(),
        status.is_completed(),
    )
}

/// `PostgreSQL`-backed [`BookingRepository`].
#[derive(Clone, Debug)]
pub struct PostgresSessionStore {
    pool: PgPool,
}

impl PostgresSessionStore {
    /// Create a store over an existing pool
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a new pool
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the connection fails.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
        connect_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(connect_timeout)
            .connect(database_url)
            .await
            .map_err(db_error("Failed to connect"))?;
        Ok(Self::new(pool))
    }

    /// Run database migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if migrations fail.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl SessionStore for PostgresSessionStore {
    fn find_session(
        &self,
        service_type: ServiceType,
        session_id: SessionId,
    ) -> StoreFuture<'_, Option<Session>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM {} WHERE session_id = $1",
                sessions_table(service_type)
            );
            let row: Option<SessionRow> = sqlx::query_as(&sql)
                .bind(session_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error("Failed to load session"))?;
            row.map(|r| r.into_session(service_type)).transpose()
        })
    }

    fn find_by_slot<'a>(
        &'a self,
        service_type: ServiceType,
        entity_id: &'a EntityId,
        date: NaiveDate,
        start: NaiveTime,
    ) -> StoreFuture<'a, Option<Session>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM {} \
                 WHERE entity_id = $1 AND date = $2 AND start_time = $3",
                sessions_table(service_type)
            );
            let row: Option<SessionRow> = sqlx::query_as(&sql)
                .bind(entity_id.as_str())
                .bind(date)
                .bind(start)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error("Failed to look up slot"))?;
            row.map(|r| r.into_session(service_type)).transpose()
        })
    }

    fn create_session(&self, session: Session) -> StoreFuture<'_, CreateOutcome> {
        Box::pin(async move {
            let sql = format!(
                "INSERT INTO {} ({SESSION_COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17) \
                 ON CONFLICT (entity_id, date, start_time) DO NOTHING \
                 RETURNING session_id",
                sessions_table(session.service_type)
            );
            let (user_id, is_cancelled, is_completed) = status_columns(&session.status);
            let inserted: Option<(Uuid,)> = sqlx::query_as(&sql)
                .bind(session.session_id.as_uuid())
                .bind(session.entity_id.as_str())
                .bind(session.owner_id.as_str())
                .bind(session.date)
                .bind(session.slot.start())
                .bind(session.slot.end())
                .bind(user_id)
                .bind(is_cancelled)
                .bind(is_completed)
                .bind(session.cancellation_reason.as_deref())
                .bind(session.feedback.as_deref())
                .bind(session.rating.map(|r| i16::from(r.value())))
                .bind(session.booking_id.map(|id| *id.as_uuid()))
                .bind(session.location.as_deref())
                .bind(session.sport.as_deref())
                .bind(session.price_cents)
                .bind(session.created_at)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error("Failed to insert session"))?;

            Ok(match inserted {
                Some(_) => CreateOutcome::Created(session),
                None => CreateOutcome::Duplicate,
            })
        })
    }

    fn save_session<'a>(
        &'a self,
        session: &'a Session,
        expected: &'a SessionStatus,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let sql = format!(
                "UPDATE {} SET user_id = $2, is_cancelled = $3, is_completed = $4, \
                 cancellation_reason = $5, feedback = $6, rating = $7, booking_id = $8 \
                 WHERE session_id = $1 AND user_id IS NOT DISTINCT FROM $9 \
                 AND is_cancelled = $10 AND is_completed = $11",
                sessions_table(session.service_type)
            );
            let (user_id, is_cancelled, is_completed) = status_columns(&session.status);
            let (expected_user, expected_cancelled, expected_completed) = status_columns(expected);

            let result = sqlx::query(&sql)
                .bind(session.session_id.as_uuid())
                .bind(user_id)
                .bind(is_cancelled)
                .bind(is_completed)
                .bind(session.cancellation_reason.as_deref())
                .bind(session.feedback.as_deref())
                .bind(session.rating.map(|r| i16::from(r.value())))
                .bind(session.booking_id.map(|id| *id.as_uuid()))
                .bind(expected_user)
                .bind(expected_cancelled)
                .bind(expected_completed)
                .execute(&self.pool)
                .await
                .map_err(db_error("Failed to update session"))?;

            if result.rows_affected() == 0 {
                return Err(StoreError::Conflict(format!(
                    "session {} is no longer {}",
                    session.session_id,
                    expected.state_name()
                )));
            }
            Ok(())
        })
    }

    fn query_sessions<'a>(
        &'a self,
        service_type: ServiceType,
        query: &'a SessionQuery,
    ) -> StoreFuture<'a, Vec<Session>> {
        Box::pin(async move {
            let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
                "SELECT {SESSION_COLUMNS} FROM {} WHERE TRUE",
                sessions_table(service_type)
            ));

            if let Some(user_id) = &query.user_id {
                builder.push(" AND user_id = ").push_bind(user_id.as_str().to_string());
            }
            if let Some(entity_id) = &query.entity_id {
                builder.push(" AND entity_id = ").push_bind(entity_id.as_str().to_string());
            }
            if let Some(owner_id) = &query.owner_id {
                builder.push(" AND owner_id = ").push_bind(owner_id.as_str().to_string());
            }
            if let Some(from) = query.from {
                builder.push(" AND date >= ").push_bind(from);
            }
            if let Some(to) = query.to {
                builder.push(" AND date <= ").push_bind(to);
            }
            if let Some(state) = query.state {
                builder.push(match state {
                    StateFilter::Open => {
                        " AND user_id IS NULL AND NOT is_cancelled AND NOT is_completed"
                    },
                    StateFilter::Booked => {
                        " AND user_id IS NOT NULL AND NOT is_cancelled AND NOT is_completed"
                    },
                    StateFilter::Completed => " AND is_completed",
                    StateFilter::Cancelled => " AND is_cancelled",
                    StateFilter::Active => " AND NOT is_cancelled AND NOT is_completed",
                });
            }
            builder.push(match query.order {
                SortOrder::Chronological => " ORDER BY date ASC, start_time ASC",
                SortOrder::ReverseChronological => " ORDER BY date DESC, end_time DESC",
            });
            if let Some(limit) = query.limit {
                builder
                    .push(" LIMIT ")
                    .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
            }
            if query.offset > 0 {
                builder
                    .push(" OFFSET ")
                    .push_bind(i64::try_from(query.offset).unwrap_or(i64::MAX));
            }

            let rows: Vec<SessionRow> = builder
                .build_query_as::<SessionRow>()
                .fetch_all(&self.pool)
                .await
                .map_err(db_error("Failed to query sessions"))?;

            rows.into_iter()
                .map(|row| row.into_session(service_type))
                .collect()
        })
    }
}

impl RequestLedger for PostgresSessionStore {
    fn insert_request<'a>(
        &'a self,
        service_type: ServiceType,
        request: &'a SessionRequest,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(db_error("Failed to start transaction"))?;

            // Share lock: a concurrent confirm waits for this insert to commit
            let open_sql = format!(
                "SELECT session_id FROM {} \
                 WHERE session_id = $1 AND user_id IS NULL \
                 AND NOT is_cancelled AND NOT is_completed \
                 FOR SHARE",
                sessions_table(service_type)
            );
            let open: Option<(Uuid,)> = sqlx::query_as(&open_sql)
                .bind(request.session_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_error("Failed to lock session"))?;
            if open.is_none() {
                let _ = tx.rollback().await;
                return Err(StoreError::Conflict(format!(
                    "session {} is no longer open",
                    request.session_id
                )));
            }

            let sql = format!(
                "INSERT INTO {} ({REQUEST_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                requests_table(service_type)
            );
            sqlx::query(&sql)
                .bind(request.request_id.as_uuid())
                .bind(request.session_id.as_uuid())
                .bind(request.user_id.as_str())
                .bind(request.requested_at)
                .bind(request.status.as_str())
                .bind(request.notes.as_deref())
                .bind(request.rejection_reason.as_deref())
                .bind(request.decided_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| match e {
                    sqlx::Error::Database(db) if db.is_unique_violation() => {
                        StoreError::DuplicatePending {
                            session_id: request.session_id,
                            user_id: request.user_id.clone(),
                        }
                    },
                    other => StoreError::Database(format!("Failed to insert request: {other}")),
                })?;

            tx.commit()
                .await
                .map_err(db_error("Failed to commit request"))?;
            Ok(())
        })
    }

    fn requests_for_session(
        &self,
        service_type: ServiceType,
        session_id: SessionId,
    ) -> StoreFuture<'_, Vec<SessionRequest>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {REQUEST_COLUMNS} FROM {} WHERE session_id = $1 ORDER BY requested_at ASC",
                requests_table(service_type)
            );
            let rows: Vec<RequestRow> = sqlx::query_as(&sql)
                .bind(session_id.as_uuid())
                .fetch_all(&self.pool)
                .await
                .map_err(db_error("Failed to load requests"))?;
            rows.into_iter()
                .map(|row| row.into_request(service_type))
                .collect()
        })
    }

    fn reject_request<'a>(
        &'a self,
        service_type: ServiceType,
        request_id: RequestId,
        reason: &'a str,
        at: DateTime<Utc>,
    ) -> StoreFuture<'a, SessionRequest> {
        Box::pin(async move {
            let sql = format!(
                "UPDATE {} SET status = 'rejected', rejection_reason = $2, decided_at = $3 \
                 WHERE request_id = $1 AND status = 'pending' RETURNING {REQUEST_COLUMNS}",
                requests_table(service_type)
            );
            let row: Option<RequestRow> = sqlx::query_as(&sql)
                .bind(request_id.as_uuid())
                .bind(reason)
                .bind(at)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error("Failed to reject request"))?;

            row.ok_or_else(|| StoreError::Conflict(format!("request {request_id} is no longer pending")))?
                .into_request(service_type)
        })
    }
}

impl BookingRepository for PostgresSessionStore {
    fn confirm_booking<'a>(
        &'a self,
        service_type: ServiceType,
        session_id: SessionId,
        request_id: RequestId,
        user_id: &'a UserId,
        at: DateTime<Utc>,
    ) -> StoreFuture<'a, (Session, SessionRequest)> {
        Box::pin(async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(db_error("Failed to start transaction"))?;

            let book_sql = format!(
                "UPDATE {} SET user_id = $2, booking_id = $3 \
                 WHERE session_id = $1 AND user_id IS NULL \
                 AND NOT is_cancelled AND NOT is_completed \
                 RETURNING {SESSION_COLUMNS}",
                sessions_table(service_type)
            );
            let booked: Option<SessionRow> = sqlx::query_as(&book_sql)
                .bind(session_id.as_uuid())
                .bind(user_id.as_str())
                .bind(request_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_error("Failed to book session"))?;
            let Some(booked) = booked else {
                let _ = tx.rollback().await;
                return Err(StoreError::Conflict(format!(
                    "session {session_id} is no longer open"
                )));
            };

            let approve_sql = format!(
                "UPDATE {} SET status = 'approved', decided_at = $3 \
                 WHERE request_id = $1 AND session_id = $2 AND status = 'pending' \
                 RETURNING {REQUEST_COLUMNS}",
                requests_table(service_type)
            );
            let approved: Option<RequestRow> = sqlx::query_as(&approve_sql)
                .bind(request_id.as_uuid())
                .bind(session_id.as_uuid())
                .bind(at)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_error("Failed to approve request"))?;
            let Some(approved) = approved else {
                let _ = tx.rollback().await;
                return Err(StoreError::Conflict(format!(
                    "request {request_id} is no longer pending"
                )));
            };

            tx.commit()
                .await
                .map_err(db_error("Failed to commit confirm"))?;

            tracing::debug!(%session_id, %request_id, %service_type, "Booking confirmed");

            Ok((
                booked.into_session(service_type)?,
                approved.into_request(service_type)?,
            ))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn row(user_id: Option<&str>, is_cancelled: bool, is_completed: bool) -> SessionRow {
        SessionRow {
            session_id: Uuid::new_v4(),
            entity_id: "batch-1".to_string(),
            owner_id: "academy-1".to_string(),
            date: NaiveDate::from_ymd_opt(2025, 3, 12).unwrap(),
            start_time: NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            user_id: user_id.map(str::to_string),
            is_cancelled,
            is_completed,
            cancellation_reason: None,
            feedback: None,
            rating: None,
            booking_id: None,
            location: None,
            sport: None,
            price_cents: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_row_mapping_to_status() {
        let open = row(None, false, false).into_session(ServiceType::AcademyBatch).unwrap();
        assert!(open.status.is_open());

        let booked = row(Some("u-1"), false, false)
            .into_session(ServiceType::AcademyBatch)
            .unwrap();
        assert!(booked.status.is_booked());

        let cancelled = row(None, true, false)
            .into_session(ServiceType::AcademyBatch)
            .unwrap();
        assert_eq!(cancelled.status, SessionStatus::Cancelled { user_id: None });
    }

    #[test]
    fn test_invalid_flag_combinations_are_corrupt() {
        assert!(matches!(
            row(None, false, true).into_session(ServiceType::Coach),
            Err(StoreError::CorruptRow { .. })
        ));
        assert!(matches!(
            row(Some("u-1"), true, true).into_session(ServiceType::Coach),
            Err(StoreError::CorruptRow { .. })
        ));
    }

    #[test]
    fn test_status_columns_round_trip() {
        let status = SessionStatus::Completed {
            user_id: UserId::new("u-9"),
        };
        assert_eq!(status_columns(&status), (Some("u-9".to_string()), false, true));
        assert_eq!(status_columns(&SessionStatus::Open), (None, false, false));
    }

    #[test]
    fn test_table_names_are_per_type() {
        let names: Vec<_> = ServiceType::ALL.into_iter().map(sessions_table).collect();
        assert_eq!(
            names,
            vec![
                "academy_batch_sessions",
                "academy_program_sessions",
                "coach_sessions",
                "turf_sessions"
            ]
        );
        assert_eq!(requests_table(ServiceType::Turf), "turf_requests");
    }
}
