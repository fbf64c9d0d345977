//! Error types for booking operations.
//!
//! Validation failures are rejected before any state is read or written.
//! Domain failures name the violated state. Infrastructure failures wrap the
//! store error that caused them.

use crate::store::StoreError;
use crate::types::{RequestId, SessionId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Input rejected at the boundary, before any state change.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Service type outside the closed set
    #[error("Unknown service type: {0}")]
    UnknownServiceType(String),

    /// Malformed or empty time slot
    #[error("Invalid time slot: {0} (expected HH:MM-HH:MM with start before end)")]
    InvalidTimeSlot(String),

    /// Invalid calendar month
    #[error("Invalid month: {0}")]
    InvalidMonth(String),

    /// Rating outside `[1, 5]`
    #[error("Rating must be an integer between 1 and 5 (got {0})")]
    InvalidRating(i64),

    /// Request status not recognised
    #[error("Unknown request status: {0}")]
    UnknownRequestStatus(String),

    /// Required field missing or blank
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// Date range whose start is after its end
    #[error("Invalid date range: {from} is after {to}")]
    InvalidDateRange {
        /// Range start
        from: chrono::NaiveDate,
        /// Range end
        to: chrono::NaiveDate,
    },
}

/// Coarse classification of a [`BookingError`], for callers mapping errors to
/// responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input
    Validation,
    /// Session or pending request does not exist
    NotFound,
    /// Session is in the wrong state for the operation
    Unavailable,
    /// The transition already happened (or a concurrent caller won)
    AlreadyProcessed,
    /// Store or other infrastructure failure
    Infrastructure,
}

impl ErrorKind {
    /// Label used in logs and metrics
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Unavailable => "unavailable",
            Self::AlreadyProcessed => "already_processed",
            Self::Infrastructure => "infrastructure",
        }
    }
}

/// Errors returned by booking operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BookingError {
    /// Input failed validation
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Session does not exist
    #[error("Session {0} not found")]
    SessionNotFound(SessionId),

    /// Confirm or reject with nothing to decide
    #[error("No pending request for session {0}")]
    NoPendingRequest(SessionId),

    /// Session is not in a state that allows the operation
    #[error("Session {session_id} is {state} and cannot be {operation}")]
    SessionUnavailable {
        /// Session ID
        session_id: SessionId,
        /// Current state name
        state: &'static str,
        /// Attempted operation, past participle ("requested", "completed", ...)
        operation: &'static str,
    },

    /// Session already reached a terminal state
    #[error("Session {session_id} is already {state}")]
    SessionAlreadyClosed {
        /// Session ID
        session_id: SessionId,
        /// Terminal state name
        state: &'static str,
    },

    /// User already has a pending request for this session
    #[error("User {user_id} already has a pending request for session {session_id}")]
    DuplicateRequest {
        /// Session ID
        session_id: SessionId,
        /// Requesting user
        user_id: UserId,
    },

    /// A concurrent operation changed the session or request first
    #[error("Session {session_id} was already processed by a concurrent operation")]
    AlreadyProcessed {
        /// Session ID
        session_id: SessionId,
        /// Request involved, if any
        request_id: Option<RequestId>,
    },

    /// A command succeeded but left nothing to persist
    #[error("Command on session {0} produced no event to persist")]
    MissingEvent(SessionId),

    /// Store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl BookingError {
    /// Classify this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::SessionNotFound(_) | Self::NoPendingRequest(_) => ErrorKind::NotFound,
            Self::SessionUnavailable { .. } => ErrorKind::Unavailable,
            Self::SessionAlreadyClosed { .. }
            | Self::DuplicateRequest { .. }
            | Self::AlreadyProcessed { .. } => ErrorKind::AlreadyProcessed,
            Self::MissingEvent(_) | Self::Store(_) => ErrorKind::Infrastructure,
        }
    }
}
