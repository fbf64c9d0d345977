//! Application coordinator - wires together all components.
//!
//! This module builds the running application from [`Config`](crate::config::Config):
//! - Session store (in-memory or `PostgreSQL`)
//! - Booking service (commands and queries)
//! - Session generator and the periodic job scheduler

mod coordinator;

pub use coordinator::{AppError, SlotwiseApp};
