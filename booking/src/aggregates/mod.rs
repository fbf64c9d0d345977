//! Aggregate reducers for the booking core.
//!
//! - Session: request/confirm/reject/cancel/complete/feedback state machine

pub mod session;

pub use session::{BookingAction, BookingEnvironment, BookingState, SessionReducer};
