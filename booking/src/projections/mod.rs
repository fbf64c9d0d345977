//! Read-side views over the per-type session stores.
//!
//! - [`unified`]: one merged, status-annotated booking list across all four
//!   service types

pub mod unified;

pub use unified::{BookingAggregator, BookingFilters, TemporalStatus, UnifiedBooking};
