//! Business-calendar view of the clock.
//!
//! "Today" decides which generated dates are in the past and how unified
//! bookings are labelled, so it is computed in the platform's configured UTC
//! offset rather than in UTC.

use chrono::{Datelike, FixedOffset, NaiveDate, Offset, Utc};
use slotwise_core::environment::Clock;

use crate::types::YearMonth;

/// Days before month end during which next month is generated too
pub const ROLLOVER_WINDOW_DAYS: u32 = 7;

/// Fixed-offset business calendar
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Calendar {
    offset: FixedOffset,
}

impl Calendar {
    /// Calendar in `offset`
    #[must_use]
    pub const fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    /// Calendar from an offset in minutes east of UTC, `None` when out of range
    #[must_use]
    pub fn from_offset_minutes(minutes: i32) -> Option<Self> {
        minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .map(Self::new)
    }

    /// UTC calendar
    #[must_use]
    pub fn utc() -> Self {
        Self::new(Utc.fix())
    }

    /// Configured offset
    #[must_use]
    pub const fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Current local date
    #[must_use]
    pub fn today(&self, clock: &dyn Clock) -> NaiveDate {
        clock.now().with_timezone(&self.offset).date_naive()
    }

    /// Months a generation run covers on `today`.
    ///
    /// Always the current month; during the last [`ROLLOVER_WINDOW_DAYS`]
    /// days of the month also the next one.
    #[must_use]
    pub fn target_months(today: NaiveDate) -> Vec<YearMonth> {
        let current = YearMonth::of(today);
        let remaining = current.days_in_month() - today.day();
        if remaining < ROLLOVER_WINDOW_DAYS {
            vec![current, current.next()]
        } else {
            vec![current]
        }
    }
}

impl Default for Calendar {
    fn default() -> Self {
        Self::utc()
    }
}
