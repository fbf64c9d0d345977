//! Persistence boundary for sessions and their request ledgers.
//!
//! One interface covers all four service types; implementations keep a
//! separate table per type and dispatch on [`ServiceType`]. Slot uniqueness
//! `(entity, date, start)` is enforced here, not by callers.

use crate::types::{
    EntityId, NewSession, OwnerId, RequestId, ServiceType, Session, SessionId, SessionRequest,
    SessionStatus, UserId,
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::InMemorySessionStore;
pub use postgres::PostgresSessionStore;

/// Errors from store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Row changed (or vanished) since it was read
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A pending request for the same session and user already exists
    #[error("Pending request already exists for session {session_id} and user {user_id}")]
    DuplicatePending {
        /// Session ID
        session_id: SessionId,
        /// Requesting user
        user_id: UserId,
    },

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(String),

    /// Persisted row cannot be mapped to a valid domain value
    #[error("Corrupt row in {table}: {reason}")]
    CorruptRow {
        /// Table the row came from
        table: String,
        /// What is wrong with it
        reason: String,
    },
}

/// Boxed future returned by store methods
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Result of an idempotent create
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    /// A new session was stored
    Created(Session),
    /// A session with the same `(entity, date, start)` already existed
    Duplicate,
}

/// State filter for session queries
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateFilter {
    /// Unbooked
    Open,
    /// Booked, not yet completed or cancelled
    Booked,
    /// Completed
    Completed,
    /// Cancelled
    Cancelled,
    /// Open or booked
    Active,
}

impl StateFilter {
    /// Whether a session in `status` passes this filter
    #[must_use]
    pub const fn matches(self, status: &SessionStatus) -> bool {
        match self {
            Self::Open => status.is_open(),
            Self::Booked => status.is_booked(),
            Self::Completed => status.is_completed(),
            Self::Cancelled => status.is_cancelled(),
            Self::Active => !status.is_terminal(),
        }
    }
}

/// Result ordering for session queries
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Ascending by `(date, start)`
    #[default]
    Chronological,
    /// Descending by `(date, end)`
    ReverseChronological,
}

impl SortOrder {
    /// Compare two sessions under this ordering
    #[must_use]
    pub fn compare(self, a: &Session, b: &Session) -> std::cmp::Ordering {
        match self {
            Self::Chronological => (a.date, a.slot.start()).cmp(&(b.date, b.slot.start())),
            Self::ReverseChronological => (b.date, b.slot.end()).cmp(&(a.date, a.slot.end())),
        }
    }
}

/// Filters for listing sessions of one service type
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionQuery {
    /// Only sessions booked (or completed/cancelled) by this user
    pub user_id: Option<UserId>,
    /// Only sessions of this entity
    pub entity_id: Option<EntityId>,
    /// Only sessions of this owner
    pub owner_id: Option<OwnerId>,
    /// Earliest date, inclusive
    pub from: Option<NaiveDate>,
    /// Latest date, inclusive
    pub to: Option<NaiveDate>,
    /// Lifecycle filter
    pub state: Option<StateFilter>,
    /// Result ordering
    pub order: SortOrder,
    /// Maximum number of rows
    pub limit: Option<usize>,
    /// Rows to skip
    pub offset: usize,
}

impl SessionQuery {
    /// Query matching every session
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to a user's sessions
    #[must_use]
    pub fn for_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Restrict to one entity
    #[must_use]
    pub fn for_entity(mut self, entity_id: EntityId) -> Self {
        self.entity_id = Some(entity_id);
        self
    }

    /// Restrict to one owner (academy, coach or turf)
    #[must_use]
    pub fn for_owner(mut self, owner_id: Option<OwnerId>) -> Self {
        self.owner_id = owner_id;
        self
    }

    /// Restrict to an inclusive date range; either end may be open
    #[must_use]
    pub const fn between(mut self, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    /// Restrict by lifecycle state
    #[must_use]
    pub const fn in_state(mut self, state: StateFilter) -> Self {
        self.state = Some(state);
        self
    }

    /// Set the ordering
    #[must_use]
    pub const fn ordered(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    /// Page through results
    #[must_use]
    pub const fn page(mut self, limit: Option<usize>, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    /// Whether `session` passes every filter (ordering and paging aside)
    #[must_use]
    pub fn matches(&self, session: &Session) -> bool {
        self.user_id
            .as_ref()
            .is_none_or(|user| session.user_id() == Some(user))
            && self
                .entity_id
                .as_ref()
                .is_none_or(|entity| &session.entity_id == entity)
            && self
                .owner_id
                .as_ref()
                .is_none_or(|owner| &session.owner_id == owner)
            && self.from.is_none_or(|from| session.date >= from)
            && self.to.is_none_or(|to| session.date <= to)
            && self.state.is_none_or(|state| state.matches(&session.status))
    }
}

/// Session persistence for all service types.
///
/// Dyn-compatible so services can hold `Arc<dyn SessionStore>`.
pub trait SessionStore: Send + Sync {
    /// Load a session by ID
    fn find_session(
        &self,
        service_type: ServiceType,
        session_id: SessionId,
    ) -> StoreFuture<'_, Option<Session>>;

    /// Load a session by its natural key
    fn find_by_slot<'a>(
        &'a self,
        service_type: ServiceType,
        entity_id: &'a EntityId,
        date: NaiveDate,
        start: NaiveTime,
    ) -> StoreFuture<'a, Option<Session>>;

    /// Create an open session unless its slot already exists
    ///
    /// Slot uniqueness is guaranteed by the store; a concurrent or repeated
    /// create of the same slot yields [`CreateOutcome::Duplicate`].
    fn create_session(&self, session: Session) -> StoreFuture<'_, CreateOutcome>;

    /// Overwrite a session's mutable fields if its persisted status still
    /// equals `expected`
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] when the session is missing or its status moved.
    fn save_session<'a>(
        &'a self,
        session: &'a Session,
        expected: &'a SessionStatus,
    ) -> StoreFuture<'a, ()>;

    /// List sessions of one type
    fn query_sessions<'a>(
        &'a self,
        service_type: ServiceType,
        query: &'a SessionQuery,
    ) -> StoreFuture<'a, Vec<Session>>;
}

/// Per-type request ledgers.
pub trait RequestLedger: Send + Sync {
    /// Record a new pending request while its session is still open
    ///
    /// # Errors
    ///
    /// - [`StoreError::DuplicatePending`] when the user already has a pending
    ///   request for the session
    /// - [`StoreError::Conflict`] when the session is missing or no longer open
    fn insert_request<'a>(
        &'a self,
        service_type: ServiceType,
        request: &'a SessionRequest,
    ) -> StoreFuture<'a, ()>;

    /// Every request for a session, oldest first
    fn requests_for_session(
        &self,
        service_type: ServiceType,
        session_id: SessionId,
    ) -> StoreFuture<'_, Vec<SessionRequest>>;

    /// Move a pending request to rejected
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] unless the request exists and is still pending.
    fn reject_request<'a>(
        &'a self,
        service_type: ServiceType,
        request_id: RequestId,
        reason: &'a str,
        at: DateTime<Utc>,
    ) -> StoreFuture<'a, SessionRequest>;
}

/// Sessions and requests together, plus the one multi-row transition.
pub trait BookingRepository: SessionStore + RequestLedger {
    /// Atomically book `session_id` for `user_id` and approve `request_id`.
    ///
    /// Both rows change or neither does.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] when the session is no longer open or the
    /// request is no longer pending.
    fn confirm_booking<'a>(
        &'a self,
        service_type: ServiceType,
        session_id: SessionId,
        request_id: RequestId,
        user_id: &'a UserId,
        at: DateTime<Utc>,
    ) -> StoreFuture<'a, (Session, SessionRequest)>;
}

/// Convenience for callers holding a [`NewSession`]
pub trait SessionStoreExt: SessionStore {
    /// Materialize and create `new` with a fresh ID
    fn create_new_session(
        &self,
        new: NewSession,
        created_at: DateTime<Utc>,
    ) -> StoreFuture<'_, CreateOutcome> {
        self.create_session(new.into_session(SessionId::new(), created_at))
    }
}

impl<T: SessionStore + ?Sized> SessionStoreExt for T {}

/// Sort, offset and truncate rows in memory
pub(crate) fn apply_order_and_page(mut sessions: Vec<Session>, query: &SessionQuery) -> Vec<Session> {
    sessions.sort_by(|a, b| query.order.compare(a, b));
    sessions
        .into_iter()
        .skip(query.offset)
        .take(query.limit.unwrap_or(usize::MAX))
        .collect()
}
