//! Booking state machine for one session.
//!
//! Session lifecycle:
//! 1. **Open** - generated, unbooked
//! 2. **Booked** - a pending request was confirmed
//! 3. **Completed** (terminal) - the booked session took place
//! 4. **Cancelled** (terminal) - reachable from Open or Booked
//!
//! Requests move `pending → approved` or `pending → rejected` exactly once.
//!
//! The reducer validates each command against the loaded session and its
//! requests, applies the resulting event to state, and appends it to
//! `state.events` for the caller to persist. A rejected command records
//! `last_error` and produces neither events nor effects.

use crate::error::{BookingError, ValidationError};
use crate::metrics::{MetricKey, MetricsHook, SessionCounter, increment_best_effort};
use crate::types::{
    Rating, RequestId, RequestStatus, ServiceType, Session, SessionId, SessionRequest,
    SessionStatus, UserId,
};
use chrono::{DateTime, Utc};
use slotwise_core::{SmallVec, async_effect, effect::Effect, environment::Clock, reducer::Reducer, smallvec};
use std::sync::Arc;

// ============================================================================
// Actions (Commands + Events)
// ============================================================================

/// Actions for the booking state machine
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BookingAction {
    // Commands
    /// Ask to book the session
    RequestSession {
        /// ID for the new request
        request_id: RequestId,
        /// Requesting user
        user_id: UserId,
        /// Optional note to the owner
        notes: Option<String>,
    },

    /// Approve the oldest pending request and book the session
    ConfirmRequest,

    /// Decline the oldest pending request
    RejectRequest {
        /// Why the request was declined
        reason: String,
    },

    /// Cancel an open or booked session
    CancelSession {
        /// Why the session was cancelled
        reason: Option<String>,
    },

    /// Mark a booked session as having taken place
    CompleteSession,

    /// Attach feedback and a rating to a completed session
    AddFeedback {
        /// Free-text feedback
        feedback: String,
        /// Raw rating, validated to `[1, 5]`
        rating: i64,
    },

    // Events
    /// A pending request was recorded
    SessionRequested {
        /// The new request
        request: SessionRequest,
    },

    /// A request was approved and the session booked
    RequestConfirmed {
        /// Approved request
        request_id: RequestId,
        /// User the session is now booked for
        user_id: UserId,
        /// When
        confirmed_at: DateTime<Utc>,
    },

    /// A request was rejected
    RequestRejected {
        /// Rejected request
        request_id: RequestId,
        /// Why
        reason: String,
        /// When
        rejected_at: DateTime<Utc>,
    },

    /// The session was cancelled
    SessionCancelled {
        /// Why
        reason: Option<String>,
        /// When
        cancelled_at: DateTime<Utc>,
    },

    /// The session was completed
    SessionCompleted {
        /// User who attended
        user_id: UserId,
        /// When
        completed_at: DateTime<Utc>,
    },

    /// Feedback was attached
    FeedbackAdded {
        /// Free-text feedback
        feedback: String,
        /// Validated rating
        rating: Rating,
    },

    /// A command was rejected
    ValidationFailed {
        /// Why
        error: BookingError,
    },
}

// ============================================================================
// State
// ============================================================================

/// Everything the state machine needs to decide about one session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BookingState {
    /// Service type of the session
    pub service_type: ServiceType,
    /// ID of the session being acted on
    pub session_id: SessionId,
    /// The session, if it exists
    pub session: Option<Session>,
    /// Requests for the session, oldest first
    pub requests: Vec<SessionRequest>,
    /// Events produced by the last command, not yet persisted
    pub events: Vec<BookingAction>,
    /// Error from the last rejected command
    pub last_error: Option<BookingError>,
}

impl BookingState {
    /// State for a session loaded from the store (`None` when it does not exist)
    #[must_use]
    pub fn new(
        service_type: ServiceType,
        session_id: SessionId,
        session: Option<Session>,
        requests: Vec<SessionRequest>,
    ) -> Self {
        Self {
            service_type,
            session_id,
            session,
            requests,
            events: Vec::new(),
            last_error: None,
        }
    }

    /// Oldest pending request
    #[must_use]
    pub fn oldest_pending(&self) -> Option<&SessionRequest> {
        self.requests
            .iter()
            .filter(|r| r.is_pending())
            .min_by_key(|r| r.requested_at)
    }

    /// Whether `user_id` has a pending request
    #[must_use]
    pub fn has_pending_for(&self, user_id: &UserId) -> bool {
        self.requests
            .iter()
            .any(|r| r.is_pending() && &r.user_id == user_id)
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Environment dependencies for the booking state machine
#[derive(Clone)]
pub struct BookingEnvironment {
    /// Clock for request and decision timestamps
    pub clock: Arc<dyn Clock>,
    /// Counter hook fired on complete and cancel
    pub metrics: Arc<dyn MetricsHook>,
}

impl BookingEnvironment {
    /// Creates a new `BookingEnvironment`
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, metrics: Arc<dyn MetricsHook>) -> Self {
        Self { clock, metrics }
    }
}

// ============================================================================
// Reducer
// ============================================================================

/// Reducer for the booking state machine
#[derive(Clone, Debug, Default)]
pub struct SessionReducer;

impl SessionReducer {
    /// Creates a new `SessionReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn session<'a>(state: &'a BookingState) -> Result<&'a Session, BookingError> {
        state
            .session
            .as_ref()
            .ok_or(BookingError::SessionNotFound(state.session_id))
    }

    fn validate_request(state: &BookingState, user_id: &UserId) -> Result<(), BookingError> {
        if user_id.is_blank() {
            return Err(ValidationError::MissingField("user_id").into());
        }
        let session = Self::session(state)?;
        if !session.status.is_open() {
            return Err(BookingError::SessionUnavailable {
                session_id: session.session_id,
                state: session.status.state_name(),
                operation: "requested",
            });
        }
        if state.has_pending_for(user_id) {
            return Err(BookingError::DuplicateRequest {
                session_id: session.session_id,
                user_id: user_id.clone(),
            });
        }
        Ok(())
    }

    fn validate_confirm(state: &BookingState) -> Result<&SessionRequest, BookingError> {
        let session = Self::session(state)?;
        let approved = state
            .requests
            .iter()
            .find(|r| r.status == RequestStatus::Approved);
        if matches!(session.status, SessionStatus::Booked { .. }) {
            return Err(BookingError::AlreadyProcessed {
                session_id: session.session_id,
                request_id: session.booking_id.or(approved.map(|r| r.request_id)),
            });
        }
        let Some(pending) = state.oldest_pending() else {
            // Session read before a concurrent confirm committed, requests after
            if let Some(approved) = approved {
                return Err(BookingError::AlreadyProcessed {
                    session_id: session.session_id,
                    request_id: Some(approved.request_id),
                });
            }
            return Err(BookingError::NoPendingRequest(session.session_id));
        };
        if !session.status.is_open() {
            return Err(BookingError::SessionUnavailable {
                session_id: session.session_id,
                state: session.status.state_name(),
                operation: "confirmed",
            });
        }
        Ok(pending)
    }

    fn validate_reject<'a>(
        state: &'a BookingState,
        reason: &str,
    ) -> Result<&'a SessionRequest, BookingError> {
        if reason.trim().is_empty() {
            return Err(ValidationError::MissingField("reason").into());
        }
        let session = Self::session(state)?;
        state
            .oldest_pending()
            .ok_or(BookingError::NoPendingRequest(session.session_id))
    }

    fn validate_cancel(state: &BookingState) -> Result<&Session, BookingError> {
        let session = Self::session(state)?;
        if session.status.is_terminal() {
            return Err(BookingError::SessionAlreadyClosed {
                session_id: session.session_id,
                state: session.status.state_name(),
            });
        }
        Ok(session)
    }

    fn validate_complete(state: &BookingState) -> Result<(&Session, UserId), BookingError> {
        let session = Self::session(state)?;
        match &session.status {
            SessionStatus::Booked { user_id } => Ok((session, user_id.clone())),
            SessionStatus::Open => Err(BookingError::SessionUnavailable {
                session_id: session.session_id,
                state: session.status.state_name(),
                operation: "completed",
            }),
            SessionStatus::Completed { .. } | SessionStatus::Cancelled { .. } => {
                Err(BookingError::SessionAlreadyClosed {
                    session_id: session.session_id,
                    state: session.status.state_name(),
                })
            },
        }
    }

    fn validate_feedback(
        state: &BookingState,
        feedback: &str,
        rating: i64,
    ) -> Result<Rating, BookingError> {
        // Input checks come before any state is consulted.
        let rating = Rating::new(rating)?;
        if feedback.trim().is_empty() {
            return Err(ValidationError::MissingField("feedback").into());
        }
        let session = Self::session(state)?;
        if !session.status.is_completed() {
            return Err(BookingError::SessionUnavailable {
                session_id: session.session_id,
                state: session.status.state_name(),
                operation: "rated",
            });
        }
        Ok(rating)
    }

    /// Applies an event to state
    fn apply_event(state: &mut BookingState, action: &BookingAction) {
        match action {
            BookingAction::SessionRequested { request } => {
                state.requests.push(request.clone());
                state.last_error = None;
            },

            BookingAction::RequestConfirmed {
                request_id,
                user_id,
                confirmed_at,
            } => {
                if let Some(session) = state.session.as_mut() {
                    session.status = SessionStatus::Booked {
                        user_id: user_id.clone(),
                    };
                    session.booking_id = Some(*request_id);
                }
                if let Some(request) = state.requests.iter_mut().find(|r| r.request_id == *request_id) {
                    request.status = RequestStatus::Approved;
                    request.decided_at = Some(*confirmed_at);
                }
                state.last_error = None;
            },

            BookingAction::RequestRejected {
                request_id,
                reason,
                rejected_at,
            } => {
                if let Some(request) = state.requests.iter_mut().find(|r| r.request_id == *request_id) {
                    request.status = RequestStatus::Rejected;
                    request.rejection_reason = Some(reason.clone());
                    request.decided_at = Some(*rejected_at);
                }
                state.last_error = None;
            },

            BookingAction::SessionCancelled { reason, .. } => {
                if let Some(session) = state.session.as_mut() {
                    session.status = SessionStatus::Cancelled {
                        user_id: session.status.user_id().cloned(),
                    };
                    session.cancellation_reason.clone_from(reason);
                }
                state.last_error = None;
            },

            BookingAction::SessionCompleted { user_id, .. } => {
                if let Some(session) = state.session.as_mut() {
                    session.status = SessionStatus::Completed {
                        user_id: user_id.clone(),
                    };
                }
                state.last_error = None;
            },

            BookingAction::FeedbackAdded { feedback, rating } => {
                if let Some(session) = state.session.as_mut() {
                    session.feedback = Some(feedback.clone());
                    session.rating = Some(*rating);
                }
                state.last_error = None;
            },

            BookingAction::ValidationFailed { error } => {
                state.last_error = Some(error.clone());
            },

            // Commands don't modify state
            BookingAction::RequestSession { .. }
            | BookingAction::ConfirmRequest
            | BookingAction::RejectRequest { .. }
            | BookingAction::CancelSession { .. }
            | BookingAction::CompleteSession
            | BookingAction::AddFeedback { .. } => {},
        }
    }

    /// Apply `event` and queue it for persistence
    fn emit(state: &mut BookingState, event: BookingAction) {
        Self::apply_event(state, &event);
        state.events.push(event);
    }

    fn reject(state: &mut BookingState, error: BookingError) -> SmallVec<[Effect<BookingAction>; 4]> {
        tracing::debug!(session_id = %state.session_id, %error, "Booking command rejected");
        Self::apply_event(state, &BookingAction::ValidationFailed { error });
        SmallVec::new()
    }

    fn counter_effect(
        env: &BookingEnvironment,
        session: &Session,
        counter: SessionCounter,
    ) -> Effect<BookingAction> {
        let hook = Arc::clone(&env.metrics);
        let key = MetricKey::for_session(session.owner_id.clone(), session.date);
        async_effect! {
            increment_best_effort(hook, key, counter).await;
            None
        }
    }
}

impl Reducer for SessionReducer {
    type State = BookingState;
    type Action = BookingAction;
    type Environment = BookingEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        state.events.clear();

        match action {
            BookingAction::RequestSession {
                request_id,
                user_id,
                notes,
            } => {
                if let Err(error) = Self::validate_request(state, &user_id) {
                    return Self::reject(state, error);
                }

                let request = SessionRequest {
                    request_id,
                    session_id: state.session_id,
                    user_id,
                    requested_at: env.clock.now(),
                    status: RequestStatus::Pending,
                    notes,
                    rejection_reason: None,
                    decided_at: None,
                };
                Self::emit(state, BookingAction::SessionRequested { request });
                SmallVec::new()
            },

            BookingAction::ConfirmRequest => {
                let event = match Self::validate_confirm(state) {
                    Ok(pending) => BookingAction::RequestConfirmed {
                        request_id: pending.request_id,
                        user_id: pending.user_id.clone(),
                        confirmed_at: env.clock.now(),
                    },
                    Err(error) => return Self::reject(state, error),
                };
                Self::emit(state, event);
                SmallVec::new()
            },

            BookingAction::RejectRequest { reason } => {
                let event = match Self::validate_reject(state, &reason) {
                    Ok(pending) => BookingAction::RequestRejected {
                        request_id: pending.request_id,
                        reason,
                        rejected_at: env.clock.now(),
                    },
                    Err(error) => return Self::reject(state, error),
                };
                Self::emit(state, event);
                SmallVec::new()
            },

            BookingAction::CancelSession { reason } => {
                let effect = match Self::validate_cancel(state) {
                    Ok(session) => Self::counter_effect(env, session, SessionCounter::CancelledSessions),
                    Err(error) => return Self::reject(state, error),
                };
                Self::emit(
                    state,
                    BookingAction::SessionCancelled {
                        reason,
                        cancelled_at: env.clock.now(),
                    },
                );
                smallvec![effect]
            },

            BookingAction::CompleteSession => {
                let (effect, user_id) = match Self::validate_complete(state) {
                    Ok((session, user_id)) => (
                        Self::counter_effect(env, session, SessionCounter::CompletedSessions),
                        user_id,
                    ),
                    Err(error) => return Self::reject(state, error),
                };
                Self::emit(
                    state,
                    BookingAction::SessionCompleted {
                        user_id,
                        completed_at: env.clock.now(),
                    },
                );
                smallvec![effect]
            },

            BookingAction::AddFeedback { feedback, rating } => {
                match Self::validate_feedback(state, &feedback, rating) {
                    Ok(rating) => Self::emit(state, BookingAction::FeedbackAdded { feedback, rating }),
                    Err(error) => return Self::reject(state, error),
                }
                SmallVec::new()
            },

            // ========== Events (replayed from storage) ==========
            event => {
                Self::apply_event(state, &event);
                SmallVec::new()
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::metrics::NoopMetricsHook;
    use crate::types::{EntityId, OwnerId};
    use chrono::NaiveDate;
    use slotwise_testing::{ReducerTest, assertions, test_clock};

    fn create_test_env() -> BookingEnvironment {
        BookingEnvironment::new(Arc::new(test_clock()), Arc::new(NoopMetricsHook))
    }

    fn session(status: SessionStatus) -> Session {
        Session {
            session_id: SessionId::new(),
            service_type: ServiceType::AcademyBatch,
            entity_id: EntityId::new("batch-1"),
            owner_id: OwnerId::new("academy-1"),
            date: NaiveDate::from_ymd_opt(2025, 3, 12).unwrap(),
            slot: "16:00-17:00".parse().unwrap(),
            status,
            cancellation_reason: None,
            feedback: None,
            rating: None,
            booking_id: None,
            location: Some("North field".to_string()),
            sport: Some("football".to_string()),
            price_cents: Some(1500),
            created_at: test_clock().now(),
        }
    }

    fn state_with(status: SessionStatus, requests: Vec<SessionRequest>) -> BookingState {
        let session = session(status);
        BookingState::new(
            ServiceType::AcademyBatch,
            session.session_id,
            Some(session),
            requests,
        )
    }

    fn pending(session_id: SessionId, user: &str, minutes_ago: i64) -> SessionRequest {
        SessionRequest {
            request_id: RequestId::new(),
            session_id,
            user_id: UserId::new(user),
            requested_at: test_clock().now() - chrono::Duration::minutes(minutes_ago),
            status: RequestStatus::Pending,
            notes: None,
            rejection_reason: None,
            decided_at: None,
        }
    }

    fn booked(user: &str) -> SessionStatus {
        SessionStatus::Booked {
            user_id: UserId::new(user),
        }
    }

    fn error_kind(state: &BookingState) -> Option<ErrorKind> {
        state.last_error.as_ref().map(BookingError::kind)
    }

    #[test]
    fn test_request_open_session() {
        let request_id = RequestId::new();

        ReducerTest::new(SessionReducer::new())
            .with_env(create_test_env())
            .given_state(state_with(SessionStatus::Open, Vec::new()))
            .when_action(BookingAction::RequestSession {
                request_id,
                user_id: UserId::new("u-1"),
                notes: Some("first time".to_string()),
            })
            .then_state(move |state| {
                assert!(state.last_error.is_none());
                assert_eq!(state.requests.len(), 1);
                assert_eq!(state.requests[0].request_id, request_id);
                assert!(state.requests[0].is_pending());
                assert_eq!(state.events.len(), 1);
                // Requesting never touches the session
                assert!(state.session.as_ref().unwrap().status.is_open());
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn test_request_rejects_duplicate_pending() {
        let mut state = state_with(SessionStatus::Open, Vec::new());
        state.requests.push(pending(state.session_id, "u-1", 5));

        ReducerTest::new(SessionReducer::new())
            .with_env(create_test_env())
            .given_state(state)
            .when_action(BookingAction::RequestSession {
                request_id: RequestId::new(),
                user_id: UserId::new("u-1"),
                notes: None,
            })
            .then_state(|state| {
                assert!(matches!(state.last_error, Some(BookingError::DuplicateRequest { .. })));
                assert_eq!(state.requests.len(), 1);
                assert!(state.events.is_empty());
            })
            .run();
    }

    #[test]
    fn test_request_booked_session_is_unavailable() {
        ReducerTest::new(SessionReducer::new())
            .with_env(create_test_env())
            .given_state(state_with(booked("u-2"), Vec::new()))
            .when_action(BookingAction::RequestSession {
                request_id: RequestId::new(),
                user_id: UserId::new("u-1"),
                notes: None,
            })
            .then_state(|state| {
                assert_eq!(error_kind(state), Some(ErrorKind::Unavailable));
            })
            .run();
    }

    #[test]
    fn test_request_missing_session_is_not_found() {
        ReducerTest::new(SessionReducer::new())
            .with_env(create_test_env())
            .given_state(BookingState::new(
                ServiceType::Coach,
                SessionId::new(),
                None,
                Vec::new(),
            ))
            .when_action(BookingAction::RequestSession {
                request_id: RequestId::new(),
                user_id: UserId::new("u-1"),
                notes: None,
            })
            .then_state(|state| {
                assert!(matches!(state.last_error, Some(BookingError::SessionNotFound(_))));
            })
            .run();
    }

    #[test]
    fn test_confirm_books_oldest_pending_request() {
        let mut state = state_with(SessionStatus::Open, Vec::new());
        let newer = pending(state.session_id, "u-newer", 1);
        let older = pending(state.session_id, "u-older", 30);
        let older_id = older.request_id;
        state.requests = vec![newer, older];

        ReducerTest::new(SessionReducer::new())
            .with_env(create_test_env())
            .given_state(state)
            .when_action(BookingAction::ConfirmRequest)
            .then_state(move |state| {
                let session = state.session.as_ref().unwrap();
                assert_eq!(session.user_id(), Some(&UserId::new("u-older")));
                assert_eq!(session.booking_id, Some(older_id));
                let approved = state.requests.iter().find(|r| r.request_id == older_id).unwrap();
                assert_eq!(approved.status, RequestStatus::Approved);
                assert!(matches!(
                    state.events.as_slice(),
                    [BookingAction::RequestConfirmed { request_id, .. }] if *request_id == older_id
                ));
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn test_confirm_without_pending_request_is_not_found() {
        ReducerTest::new(SessionReducer::new())
            .with_env(create_test_env())
            .given_state(state_with(SessionStatus::Open, Vec::new()))
            .when_action(BookingAction::ConfirmRequest)
            .then_state(|state| {
                assert!(matches!(state.last_error, Some(BookingError::NoPendingRequest(_))));
                assert_eq!(error_kind(state), Some(ErrorKind::NotFound));
                assert!(state.session.as_ref().unwrap().status.is_open());
                assert!(state.events.is_empty());
            })
            .run();
    }

    #[test]
    fn test_confirm_on_booked_session_with_other_pending_is_already_processed() {
        let mut state = state_with(booked("u-1"), Vec::new());
        let booking_id = RequestId::new();
        if let Some(session) = state.session.as_mut() {
            session.booking_id = Some(booking_id);
        }
        let waiting = pending(state.session_id, "u-2", 5);
        state.requests = vec![waiting.clone()];

        ReducerTest::new(SessionReducer::new())
            .with_env(create_test_env())
            .given_state(state)
            .when_action(BookingAction::ConfirmRequest)
            .then_state(move |state| {
                assert_eq!(error_kind(state), Some(ErrorKind::AlreadyProcessed));
                assert_eq!(state.requests, vec![waiting]);
                assert_eq!(
                    state.session.as_ref().unwrap().user_id(),
                    Some(&UserId::new("u-1"))
                );
                assert!(state.events.is_empty());
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn test_second_confirm_is_already_processed() {
        let mut state = state_with(booked("u-1"), Vec::new());
        let booking_id = RequestId::new();
        if let Some(session) = state.session.as_mut() {
            session.booking_id = Some(booking_id);
        }

        ReducerTest::new(SessionReducer::new())
            .with_env(create_test_env())
            .given_state(state)
            .when_action(BookingAction::ConfirmRequest)
            .then_state(move |state| {
                assert!(matches!(
                    state.last_error,
                    Some(BookingError::AlreadyProcessed { request_id: Some(id), .. }) if id == booking_id
                ));
                assert!(state.events.is_empty());
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn test_reject_requires_reason() {
        let mut state = state_with(SessionStatus::Open, Vec::new());
        state.requests.push(pending(state.session_id, "u-1", 5));

        ReducerTest::new(SessionReducer::new())
            .with_env(create_test_env())
            .given_state(state)
            .when_action(BookingAction::RejectRequest {
                reason: "  ".to_string(),
            })
            .then_state(|state| {
                assert_eq!(error_kind(state), Some(ErrorKind::Validation));
                assert!(state.requests[0].is_pending());
            })
            .run();
    }

    #[test]
    fn test_reject_pending_request() {
        let mut state = state_with(SessionStatus::Open, Vec::new());
        state.requests.push(pending(state.session_id, "u-1", 5));

        ReducerTest::new(SessionReducer::new())
            .with_env(create_test_env())
            .given_state(state)
            .when_action(BookingAction::RejectRequest {
                reason: "Batch is full".to_string(),
            })
            .then_state(|state| {
                let request = &state.requests[0];
                assert_eq!(request.status, RequestStatus::Rejected);
                assert_eq!(request.rejection_reason.as_deref(), Some("Batch is full"));
                assert!(state.session.as_ref().unwrap().status.is_open());
            })
            .run();
    }

    #[test]
    fn test_complete_open_session_fails() {
        ReducerTest::new(SessionReducer::new())
            .with_env(create_test_env())
            .given_state(state_with(SessionStatus::Open, Vec::new()))
            .when_action(BookingAction::CompleteSession)
            .then_state(|state| {
                assert_eq!(error_kind(state), Some(ErrorKind::Unavailable));
                assert!(state.session.as_ref().unwrap().status.is_open());
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn test_complete_booked_session_fires_metrics_effect() {
        ReducerTest::new(SessionReducer::new())
            .with_env(create_test_env())
            .given_state(state_with(booked("u-1"), Vec::new()))
            .when_action(BookingAction::CompleteSession)
            .then_state(|state| {
                assert!(state.last_error.is_none());
                assert_eq!(
                    state.session.as_ref().unwrap().status,
                    SessionStatus::Completed {
                        user_id: UserId::new("u-1")
                    }
                );
            })
            .then_effects(|effects| {
                assertions::assert_effects_count(effects, 1);
                assertions::assert_has_future_effect(effects);
            })
            .run();
    }

    #[test]
    fn test_cancel_completed_session_fails() {
        ReducerTest::new(SessionReducer::new())
            .with_env(create_test_env())
            .given_state(state_with(
                SessionStatus::Completed {
                    user_id: UserId::new("u-1"),
                },
                Vec::new(),
            ))
            .when_action(BookingAction::CancelSession {
                reason: Some("rain".to_string()),
            })
            .then_state(|state| {
                assert_eq!(error_kind(state), Some(ErrorKind::AlreadyProcessed));
                assert!(state.session.as_ref().unwrap().status.is_completed());
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn test_cancel_booked_session_keeps_user() {
        ReducerTest::new(SessionReducer::new())
            .with_env(create_test_env())
            .given_state(state_with(booked("u-1"), Vec::new()))
            .when_action(BookingAction::CancelSession {
                reason: Some("coach unwell".to_string()),
            })
            .then_state(|state| {
                let session = state.session.as_ref().unwrap();
                assert_eq!(
                    session.status,
                    SessionStatus::Cancelled {
                        user_id: Some(UserId::new("u-1"))
                    }
                );
                assert_eq!(session.cancellation_reason.as_deref(), Some("coach unwell"));
            })
            .then_effects(assertions::assert_has_future_effect)
            .run();
    }

    #[test]
    fn test_cancel_twice_fails() {
        ReducerTest::new(SessionReducer::new())
            .with_env(create_test_env())
            .given_state(state_with(SessionStatus::Cancelled { user_id: None }, Vec::new()))
            .when_action(BookingAction::CancelSession { reason: None })
            .then_state(|state| {
                assert!(matches!(
                    state.last_error,
                    Some(BookingError::SessionAlreadyClosed { state: "cancelled", .. })
                ));
            })
            .run();
    }

    #[test]
    fn test_rating_six_rejected_before_any_write() {
        ReducerTest::new(SessionReducer::new())
            .with_env(create_test_env())
            .given_state(state_with(
                SessionStatus::Completed {
                    user_id: UserId::new("u-1"),
                },
                Vec::new(),
            ))
            .when_action(BookingAction::AddFeedback {
                feedback: "Great session".to_string(),
                rating: 6,
            })
            .then_state(|state| {
                assert_eq!(
                    state.last_error,
                    Some(BookingError::Validation(ValidationError::InvalidRating(6)))
                );
                let session = state.session.as_ref().unwrap();
                assert!(session.feedback.is_none());
                assert!(session.rating.is_none());
            })
            .run();
    }

    #[test]
    fn test_rating_checked_even_when_session_missing() {
        ReducerTest::new(SessionReducer::new())
            .with_env(create_test_env())
            .given_state(BookingState::new(ServiceType::Turf, SessionId::new(), None, Vec::new()))
            .when_action(BookingAction::AddFeedback {
                feedback: "ok".to_string(),
                rating: 0,
            })
            .then_state(|state| {
                assert_eq!(error_kind(state), Some(ErrorKind::Validation));
            })
            .run();
    }

    #[test]
    fn test_feedback_on_completed_session() {
        ReducerTest::new(SessionReducer::new())
            .with_env(create_test_env())
            .given_state(state_with(
                SessionStatus::Completed {
                    user_id: UserId::new("u-1"),
                },
                Vec::new(),
            ))
            .when_action(BookingAction::AddFeedback {
                feedback: "Great session".to_string(),
                rating: 5,
            })
            .then_state(|state| {
                let session = state.session.as_ref().unwrap();
                assert_eq!(session.feedback.as_deref(), Some("Great session"));
                assert_eq!(session.rating.map(Rating::value), Some(5));
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn test_feedback_on_booked_session_is_unavailable() {
        ReducerTest::new(SessionReducer::new())
            .with_env(create_test_env())
            .given_state(state_with(booked("u-1"), Vec::new()))
            .when_action(BookingAction::AddFeedback {
                feedback: "Great session".to_string(),
                rating: 4,
            })
            .then_state(|state| {
                assert_eq!(error_kind(state), Some(ErrorKind::Unavailable));
            })
            .run();
    }

    #[test]
    fn test_replayed_event_applies_without_effects() {
        let state = state_with(booked("u-1"), Vec::new());

        ReducerTest::new(SessionReducer::new())
            .with_env(create_test_env())
            .given_state(state)
            .when_action(BookingAction::SessionCompleted {
                user_id: UserId::new("u-1"),
                completed_at: test_clock().now(),
            })
            .then_state(|state| {
                assert!(state.session.as_ref().unwrap().status.is_completed());
                assert!(state.events.is_empty());
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }
}
