//! Slotwise booking core - recurring sessions, request/approval booking, and a
//! unified cross-type booking view.
//!
//! The platform brokers bookable time for four service types: academy batches,
//! academy programs, coaches and turf grounds. This crate covers:
//!
//! - **Recurrence expansion**: weekly rules and fixed daily slot lists become
//!   concrete dated sessions for a month, never in the past
//! - **Idempotent generation**: repeated or overlapping runs never duplicate a
//!   session; the store's `(entity, date, start)` uniqueness is the guarantee
//! - **Booking state machine**: request → confirm/reject, cancel, complete,
//!   feedback, with the confirm step applied as one atomic write
//! - **Unified view**: four per-type queries run concurrently and merge into
//!   one sorted, status-annotated list
//!
//! # Architecture
//!
//! ```text
//! Scheduler ──> SessionGenerator ──> recurrence::expand ──> SessionStore (create)
//!
//! BookingService ──> SessionReducer (decide) ──> BookingRepository (persist)
//!                                         └──> EffectRunner ──> MetricsHook
//!
//! BookingAggregator ──> 4 × SessionStore::query_sessions ──> merge + sort
//! ```
//!
//! # Usage
//!
//! See [`service::BookingService`] for the operation surface and
//! [`aggregates::session`] for the state machine and its tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregates;
pub mod app;
pub mod calendar;
pub mod config;
pub mod error;
pub mod generation;
pub mod metrics;
pub mod projections;
pub mod recurrence;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod types;

pub use aggregates::{BookingAction, BookingEnvironment, BookingState, SessionReducer};
pub use app::SlotwiseApp;
pub use calendar::Calendar;
pub use config::Config;
pub use error::{BookingError, ErrorKind, ValidationError};
pub use generation::{GenerationReport, SessionGenerator};
pub use projections::{BookingAggregator, BookingFilters, TemporalStatus, UnifiedBooking};
pub use scheduler::Scheduler;
pub use service::{BookingService, Confirmation, SessionFilters};
pub use types::*;
