//! Booking operations.
//!
//! Every command follows the same cycle:
//!
//! 1. Load the session and its requests into a [`BookingState`]
//! 2. Let [`SessionReducer`] validate the command and emit one event
//! 3. Persist that event (conditional write, or the confirm transaction)
//! 4. Only after the write succeeds, hand the reducer's effects to the runtime
//!
//! A write that loses a race surfaces as [`BookingError::AlreadyProcessed`];
//! nothing is written when validation fails.

use crate::aggregates::{BookingAction, BookingEnvironment, BookingState, SessionReducer};
use crate::calendar::Calendar;
use crate::error::{BookingError, ValidationError};
use crate::metrics::{record_command, record_request};
use crate::projections::{BookingAggregator, BookingFilters, UnifiedBooking};
use crate::store::{
    BookingRepository, SessionQuery, SessionStore, SortOrder, StateFilter, StoreError,
};
use crate::types::{
    EntityId, OwnerId, RequestId, ServiceType, Session, SessionId, SessionRequest, UserId,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use slotwise_core::effect::Effect;
use slotwise_core::reducer::Reducer;
use slotwise_core::SmallVec;
use slotwise_runtime::{EffectHandle, EffectRunner};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Page size used when a listing does not ask for one
pub const DEFAULT_PAGE_SIZE: usize = 50;

type Effects = SmallVec<[Effect<BookingAction>; 4]>;

/// Filters for per-type session listings
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFilters {
    /// Only sessions of this entity
    pub entity_id: Option<EntityId>,
    /// First date, inclusive
    pub from: Option<NaiveDate>,
    /// Last date, inclusive
    pub to: Option<NaiveDate>,
    /// Lifecycle filter (user listings only)
    pub state: Option<StateFilter>,
    /// Result ordering
    #[serde(default)]
    pub order: SortOrder,
    /// Page size
    pub limit: Option<usize>,
    /// Rows to skip
    #[serde(default)]
    pub offset: usize,
}

impl SessionFilters {
    fn validate(&self) -> Result<(), ValidationError> {
        match (self.from, self.to) {
            (Some(from), Some(to)) if from > to => Err(ValidationError::InvalidDateRange { from, to }),
            _ => Ok(()),
        }
    }
}

/// Result of a successful confirmation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    /// The session, now booked
    pub session: Session,
    /// The request, now approved
    pub request: SessionRequest,
}

/// Entry point for every booking operation and query.
pub struct BookingService {
    repository: Arc<dyn BookingRepository>,
    aggregator: BookingAggregator,
    reducer: SessionReducer,
    environment: BookingEnvironment,
    runner: EffectRunner<BookingAction>,
    in_flight: Mutex<Vec<EffectHandle>>,
    calendar: Calendar,
    default_page_size: usize,
}

impl BookingService {
    /// Creates a new `BookingService` over `repository`
    #[must_use]
    pub fn new<R>(repository: Arc<R>, environment: BookingEnvironment, calendar: Calendar) -> Self
    where
        R: BookingRepository + 'static,
    {
        let store: Arc<dyn SessionStore> = Arc::clone(&repository) as Arc<dyn SessionStore>;
        let aggregator = BookingAggregator::new(store, Arc::clone(&environment.clock), calendar);

        Self {
            repository,
            aggregator,
            reducer: SessionReducer::new(),
            environment,
            runner: EffectRunner::new(),
            in_flight: Mutex::new(Vec::new()),
            calendar,
            default_page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Use `size` for listings that do not specify a page size
    #[must_use]
    pub fn with_default_page_size(mut self, size: usize) -> Self {
        self.default_page_size = size.max(1);
        self
    }

    /// Cross-type aggregator sharing this service's store and clock
    #[must_use]
    pub const fn aggregator(&self) -> &BookingAggregator {
        &self.aggregator
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Ask to book an open session. The session itself is unchanged.
    ///
    /// # Errors
    ///
    /// - [`BookingError::SessionNotFound`] / [`BookingError::SessionUnavailable`]
    /// - [`BookingError::DuplicateRequest`] when the user already has a pending request
    #[tracing::instrument(skip(self, notes), fields(service_type = %service_type, session_id = %session_id, user_id = %user_id))]
    pub async fn request_session(
        &self,
        service_type: ServiceType,
        session_id: SessionId,
        user_id: UserId,
        notes: Option<String>,
    ) -> Result<SessionRequest, BookingError> {
        timed("request_session", async {
            let mut state = self.load(service_type, session_id).await?;
            let effects = self.decide(
                &mut state,
                BookingAction::RequestSession {
                    request_id: RequestId::new(),
                    user_id,
                    notes,
                },
            )?;

            let Some(BookingAction::SessionRequested { request }) = state.events.pop() else {
                return Err(BookingError::MissingEvent(session_id));
            };
            self.repository
                .insert_request(service_type, &request)
                .await
                .map_err(|e| on_store_error(e, session_id, None))?;

            self.dispatch(effects);
            record_request(service_type, "created");
            tracing::info!(request_id = %request.request_id, "Session requested");
            Ok(request)
        })
        .await
    }

    /// Approve the oldest pending request and book the session for its user.
    ///
    /// Session and request change in one atomic write.
    ///
    /// # Errors
    ///
    /// - [`BookingError::NoPendingRequest`] when nothing is pending
    /// - [`BookingError::SessionUnavailable`] when the session is not open
    /// - [`BookingError::AlreadyProcessed`] when another confirm already booked it
    #[tracing::instrument(skip(self), fields(service_type = %service_type, session_id = %session_id))]
    pub async fn confirm_session_request(
        &self,
        service_type: ServiceType,
        session_id: SessionId,
    ) -> Result<Confirmation, BookingError> {
        timed("confirm_session_request", async {
            let mut state = self.load(service_type, session_id).await?;
            let effects = self.decide(&mut state, BookingAction::ConfirmRequest)?;

            let Some(BookingAction::RequestConfirmed {
                request_id,
                user_id,
                confirmed_at,
            }) = state.events.pop()
            else {
                return Err(BookingError::MissingEvent(session_id));
            };
            let (session, request) = self
                .repository
                .confirm_booking(service_type, session_id, request_id, &user_id, confirmed_at)
                .await
                .map_err(|e| on_store_error(e, session_id, Some(request_id)))?;

            self.dispatch(effects);
            record_request(service_type, "approved");
            tracing::info!(%request_id, %user_id, "Session request confirmed");
            Ok(Confirmation { session, request })
        })
        .await
    }

    /// Decline the oldest pending request. The session is untouched.
    ///
    /// # Errors
    ///
    /// - [`BookingError::Validation`] when `reason` is blank
    /// - [`BookingError::NoPendingRequest`] when nothing is pending
    #[tracing::instrument(skip(self, reason), fields(service_type = %service_type, session_id = %session_id))]
    pub async fn reject_session_request(
        &self,
        service_type: ServiceType,
        session_id: SessionId,
        reason: String,
    ) -> Result<SessionRequest, BookingError> {
        timed("reject_session_request", async {
            let mut state = self.load(service_type, session_id).await?;
            let effects = self.decide(&mut state, BookingAction::RejectRequest { reason })?;

            let Some(BookingAction::RequestRejected {
                request_id,
                reason,
                rejected_at,
            }) = state.events.pop()
            else {
                return Err(BookingError::MissingEvent(session_id));
            };
            let request = self
                .repository
                .reject_request(service_type, request_id, &reason, rejected_at)
                .await
                .map_err(|e| on_store_error(e, session_id, Some(request_id)))?;

            self.dispatch(effects);
            record_request(service_type, "rejected");
            tracing::info!(%request_id, "Session request rejected");
            Ok(request)
        })
        .await
    }

    /// Cancel an open or booked session.
    ///
    /// # Errors
    ///
    /// [`BookingError::SessionAlreadyClosed`] when already cancelled or completed.
    #[tracing::instrument(skip(self, reason), fields(service_type = %service_type, session_id = %session_id))]
    pub async fn cancel_session(
        &self,
        service_type: ServiceType,
        session_id: SessionId,
        reason: Option<String>,
    ) -> Result<Session, BookingError> {
        timed(
            "cancel_session",
            self.update_session(service_type, session_id, BookingAction::CancelSession { reason }),
        )
        .await
    }

    /// Mark a booked session as having taken place.
    ///
    /// # Errors
    ///
    /// - [`BookingError::SessionUnavailable`] when the session is still open
    /// - [`BookingError::SessionAlreadyClosed`] when already cancelled or completed
    #[tracing::instrument(skip(self), fields(service_type = %service_type, session_id = %session_id))]
    pub async fn complete_session(
        &self,
        service_type: ServiceType,
        session_id: SessionId,
    ) -> Result<Session, BookingError> {
        timed(
            "complete_session",
            self.update_session(service_type, session_id, BookingAction::CompleteSession),
        )
        .await
    }

    /// Attach feedback and a rating to a completed session.
    ///
    /// # Errors
    ///
    /// - [`BookingError::Validation`] when `rating` is outside `[1, 5]` or
    ///   `feedback` is blank; nothing is written
    /// - [`BookingError::SessionUnavailable`] unless the session is completed
    #[tracing::instrument(skip(self, feedback), fields(service_type = %service_type, session_id = %session_id))]
    pub async fn add_session_feedback(
        &self,
        service_type: ServiceType,
        session_id: SessionId,
        feedback: String,
        rating: i64,
    ) -> Result<Session, BookingError> {
        timed(
            "add_session_feedback",
            self.update_session(
                service_type,
                session_id,
                BookingAction::AddFeedback { feedback, rating },
            ),
        )
        .await
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Open sessions from today on, soonest first
    ///
    /// # Errors
    ///
    /// Invalid date range, or a store failure.
    #[tracing::instrument(skip(self, filters), fields(service_type = %service_type))]
    pub async fn get_available_sessions(
        &self,
        service_type: ServiceType,
        filters: &SessionFilters,
    ) -> Result<Vec<Session>, BookingError> {
        filters.validate()?;
        let today = self.calendar.today(self.environment.clock.as_ref());
        let from = filters.from.map_or(today, |from| from.max(today));

        let mut query = SessionQuery::new()
            .between(Some(from), filters.to)
            .in_state(StateFilter::Open)
            .ordered(SortOrder::Chronological)
            .page(Some(filters.limit.unwrap_or(self.default_page_size)), filters.offset);
        if let Some(entity_id) = &filters.entity_id {
            query = query.for_entity(entity_id.clone());
        }

        Ok(self.repository.query_sessions(service_type, &query).await?)
    }

    /// Sessions booked by `user_id` in one service type
    ///
    /// # Errors
    ///
    /// Blank user ID, invalid date range, or a store failure.
    #[tracing::instrument(skip(self, filters), fields(service_type = %service_type, user_id = %user_id))]
    pub async fn get_user_sessions(
        &self,
        service_type: ServiceType,
        user_id: &UserId,
        filters: &SessionFilters,
    ) -> Result<Vec<Session>, BookingError> {
        require_user(user_id)?;
        filters.validate()?;

        let mut query = SessionQuery::new()
            .for_user(user_id.clone())
            .between(filters.from, filters.to)
            .ordered(filters.order)
            .page(Some(filters.limit.unwrap_or(self.default_page_size)), filters.offset);
        if let Some(entity_id) = &filters.entity_id {
            query = query.for_entity(entity_id.clone());
        }
        if let Some(state) = filters.state {
            query = query.in_state(state);
        }

        Ok(self.repository.query_sessions(service_type, &query).await?)
    }

    /// Every booking of `user_id` across service types
    ///
    /// # Errors
    ///
    /// Blank user ID, invalid date range, or any per-type query failing.
    pub async fn get_all_user_bookings(
        &self,
        user_id: &UserId,
        filters: &BookingFilters,
    ) -> Result<Vec<UnifiedBooking>, BookingError> {
        require_user(user_id)?;
        if let (Some(from), Some(to)) = (filters.from, filters.to) {
            if from > to {
                return Err(ValidationError::InvalidDateRange { from, to }.into());
            }
        }
        self.aggregator.get_all_user_bookings(user_id, filters).await
    }

    /// Upcoming booked sessions of `user_id`, optionally for one owner
    ///
    /// # Errors
    ///
    /// Blank user ID or any per-type query failing.
    pub async fn get_upcoming_sessions(
        &self,
        user_id: &UserId,
        scope_id: Option<&OwnerId>,
        limit: usize,
    ) -> Result<Vec<UnifiedBooking>, BookingError> {
        require_user(user_id)?;
        self.aggregator
            .get_upcoming_sessions(user_id, scope_id, limit)
            .await
    }

    /// Latest completed sessions of `user_id`, optionally for one owner
    ///
    /// # Errors
    ///
    /// Blank user ID or any per-type query failing.
    pub async fn get_latest_completed_sessions(
        &self,
        user_id: &UserId,
        scope_id: Option<&OwnerId>,
        limit: usize,
    ) -> Result<Vec<UnifiedBooking>, BookingError> {
        require_user(user_id)?;
        self.aggregator
            .get_latest_completed_sessions(user_id, scope_id, limit)
            .await
    }

    /// Wait for every effect dispatched so far (metrics increments).
    ///
    /// Commands never wait for their effects; this is for shutdown and tests.
    pub async fn settle(&self) {
        let handles = self
            .in_flight
            .lock()
            .map(|mut in_flight| std::mem::take(&mut *in_flight))
            .unwrap_or_default();
        for mut handle in handles {
            handle.wait().await;
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn load(
        &self,
        service_type: ServiceType,
        session_id: SessionId,
    ) -> Result<BookingState, BookingError> {
        let session = self.repository.find_session(service_type, session_id).await?;
        let requests = if session.is_some() {
            self.repository
                .requests_for_session(service_type, session_id)
                .await?
        } else {
            Vec::new()
        };
        Ok(BookingState::new(service_type, session_id, session, requests))
    }

    fn decide(&self, state: &mut BookingState, action: BookingAction) -> Result<Effects, BookingError> {
        let effects = self.reducer.reduce(state, action, &self.environment);
        match state.last_error.take() {
            Some(error) => Err(error),
            None => Ok(effects),
        }
    }

    /// Single-row transitions: cancel, complete, feedback.
    ///
    /// The write only lands if the stored status still equals the one the
    /// decision was made against.
    async fn update_session(
        &self,
        service_type: ServiceType,
        session_id: SessionId,
        action: BookingAction,
    ) -> Result<Session, BookingError> {
        let mut state = self.load(service_type, session_id).await?;
        let expected = state.session.as_ref().map(|s| s.status.clone());
        let effects = self.decide(&mut state, action)?;

        let (Some(event), Some(session), Some(expected)) = (state.events.pop(), state.session, expected)
        else {
            return Err(BookingError::MissingEvent(session_id));
        };
        self.repository
            .save_session(&session, &expected)
            .await
            .map_err(|e| on_store_error(e, session_id, None))?;

        self.dispatch(effects);
        tracing::info!(status = session.status.state_name(), ?event, "Session updated");
        Ok(session)
    }

    fn dispatch(&self, effects: Effects) {
        if effects.is_empty() {
            return;
        }
        let handle = self.runner.run(effects);
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.retain(|h| h.pending() > 0);
            in_flight.push(handle);
        }
    }
}

fn require_user(user_id: &UserId) -> Result<(), ValidationError> {
    if user_id.is_blank() {
        return Err(ValidationError::MissingField("user_id"));
    }
    Ok(())
}

/// Translate store failures into the caller-facing error
fn on_store_error(
    error: StoreError,
    session_id: SessionId,
    request_id: Option<RequestId>,
) -> BookingError {
    match error {
        StoreError::Conflict(reason) => {
            tracing::info!(%session_id, %reason, "Lost a concurrent update");
            BookingError::AlreadyProcessed {
                session_id,
                request_id,
            }
        },
        StoreError::DuplicatePending {
            session_id,
            user_id,
        } => BookingError::DuplicateRequest {
            session_id,
            user_id,
        },
        other => BookingError::Store(other),
    }
}

async fn timed<T, F>(command: &'static str, operation: F) -> Result<T, BookingError>
where
    F: Future<Output = Result<T, BookingError>>,
{
    let started = Instant::now();
    let result = operation.await;
    let outcome = match &result {
        Ok(_) => "ok",
        Err(error) => {
            tracing::debug!(command, %error, "Booking command failed");
            error.kind().as_str()
        },
    };
    record_command(command, outcome, started.elapsed().as_secs_f64());
    result
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetricsHook;
    use crate::store::{CreateOutcome, InMemorySessionStore};
    use crate::types::{ListingProfile, NewSession};
    use slotwise_core::environment::Clock;
    use slotwise_testing::test_clock;

    fn service() -> (BookingService, Arc<InMemorySessionStore>) {
        let store = Arc::new(InMemorySessionStore::new());
        let env = BookingEnvironment::new(Arc::new(test_clock()), Arc::new(NoopMetricsHook));
        (BookingService::new(Arc::clone(&store), env, Calendar::utc()), store)
    }

    async fn open_session(store: &InMemorySessionStore, day: u32) -> Session {
        let new = NewSession {
            service_type: ServiceType::Coach,
            entity_id: EntityId::new("coach-batch-1"),
            owner_id: OwnerId::new("coach-1"),
            date: NaiveDate::from_ymd_opt(2025, 3, day).unwrap(),
            slot: "07:00-08:00".parse().unwrap(),
            profile: ListingProfile::default(),
        };
        match store
            .create_session(new.into_session(SessionId::new(), test_clock().now()))
            .await
            .unwrap()
        {
            CreateOutcome::Created(session) => session,
            CreateOutcome::Duplicate => unreachable!("fresh store"),
        }
    }

    #[tokio::test]
    async fn test_request_then_confirm() {
        let (service, store) = service();
        let session = open_session(&store, 12).await;
        let user = UserId::new("u-1");

        let request = service
            .request_session(ServiceType::Coach, session.session_id, user.clone(), None)
            .await
            .unwrap();
        let confirmation = service
            .confirm_session_request(ServiceType::Coach, session.session_id)
            .await
            .unwrap();

        assert_eq!(confirmation.session.user_id(), Some(&user));
        assert_eq!(confirmation.session.booking_id, Some(request.request_id));
        assert_eq!(confirmation.request.request_id, request.request_id);
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let (service, _store) = service();
        let error = service
            .cancel_session(ServiceType::Turf, SessionId::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(error, BookingError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_available_sessions_hide_past_dates() {
        let (service, store) = service();
        open_session(&store, 3).await;
        let future = open_session(&store, 20).await;

        let available = service
            .get_available_sessions(ServiceType::Coach, &SessionFilters::default())
            .await
            .unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].session_id, future.session_id);
    }

    #[tokio::test]
    async fn test_inverted_date_range_rejected() {
        let (service, _store) = service();
        let filters = SessionFilters {
            from: NaiveDate::from_ymd_opt(2025, 3, 20),
            to: NaiveDate::from_ymd_opt(2025, 3, 10),
            ..SessionFilters::default()
        };
        let error = service
            .get_available_sessions(ServiceType::Coach, &filters)
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            BookingError::Validation(ValidationError::InvalidDateRange { .. })
        ));
    }

    #[tokio::test]
    async fn test_blank_user_rejected() {
        let (service, _store) = service();
        let error = service
            .get_upcoming_sessions(&UserId::new(" "), None, 5)
            .await
            .unwrap_err();
        assert_eq!(error, BookingError::Validation(ValidationError::MissingField("user_id")));
    }
}
