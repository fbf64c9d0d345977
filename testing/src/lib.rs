//! # Slotwise Testing
//!
//! Testing utilities for Slotwise reducers and services.
//!
//! This crate provides:
//! - Deterministic [`Clock`] implementations
//! - The [`ReducerTest`] Given-When-Then harness
//! - Assertion helpers for reducer effects
//!
//! ## Example
//!
//! ```ignore
//! use slotwise_testing::{ReducerTest, test_clock};
//!
//! ReducerTest::new(SessionReducer::new())
//!     .with_env(BookingEnvironment::new(Arc::new(test_clock()), hook))
//!     .given_state(state)
//!     .when_action(BookingAction::CompleteSession)
//!     .then_state(|s| assert!(s.last_error.is_none()))
//!     .run();
//! ```

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use slotwise_core::environment::Clock;
use std::sync::{Arc, RwLock};


pub use reducer_test::{ReducerTest, assertions};

/// Mock implementations of Environment traits.
pub mod mocks {
    use super::{Arc, Clock, DateTime, NaiveDate, NaiveTime, RwLock, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use slotwise_testing::mocks::FixedClock;
    /// use slotwise_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }

        /// Fixed clock at 08:00 UTC on the given calendar day
        ///
        /// Returns `None` for an invalid date.
        #[must_use]
        pub fn on_date(year: i32, month: u32, day: u32) -> Option<Self> {
            let date = NaiveDate::from_ymd_opt(year, month, day)?;
            let time = NaiveTime::from_hms_opt(8, 0, 0)?;
            Some(Self::new(date.and_time(time).and_utc()))
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock whose time can be moved by the test
    ///
    /// Clones share the same underlying time, so a test can keep one handle
    /// and pass another into the system under test.
    #[derive(Debug, Clone)]
    pub struct SettableClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl SettableClock {
        /// Create a clock starting at `time`
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Move the clock to `time`
        pub fn set(&self, time: DateTime<Utc>) {
            if let Ok(mut guard) = self.time.write() {
                *guard = time;
            }
        }

        /// Move the clock forward by `by`
        pub fn advance(&self, by: chrono::Duration) {
            if let Ok(mut guard) = self.time.write() {
                *guard += by;
            }
        }
    }

    impl Clock for SettableClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
                .read()
                .map_or_else(|poisoned| *poisoned.into_inner(), |guard| *guard)
        }
    }

    /// Create a default fixed clock for tests (2025-03-10 08:00:00 UTC, a Monday)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-03-10T08:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, SettableClock, test_clock};

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
        assert_eq!(time1.weekday(), chrono::Weekday::Mon);
    }

    #[test]
    fn test_fixed_clock_on_date() {
        let clock = FixedClock::on_date(2025, 2, 28);
        assert_eq!(
            clock.map(|c| c.now().date_naive()),
            NaiveDate::from_ymd_opt(2025, 2, 28)
        );
        assert!(FixedClock::on_date(2025, 2, 30).is_none());
    }

    #[test]
    fn test_settable_clock_shares_time_between_clones() {
        let clock = SettableClock::new(test_clock().now());
        let observer = clock.clone();

        clock.advance(chrono::Duration::days(1));

        assert_eq!(
            observer.now().date_naive(),
            NaiveDate::from_ymd_opt(2025, 3, 11).unwrap_or_default()
        );
    }
}
