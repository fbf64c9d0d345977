//! Domain types for the booking core.
//!
//! Value objects and entities shared by recurrence expansion, the session
//! store, the booking state machine and the cross-type aggregator.

use crate::error::ValidationError;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Service types
// ============================================================================

/// The closed set of bookable service categories.
///
/// Each category has its own session table and request ledger, but all of
/// them share one state machine and one store interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    /// Recurring class run by an academy batch
    AcademyBatch,
    /// Recurring class run by an academy program
    AcademyProgram,
    /// One-on-one coaching session
    Coach,
    /// Hourly ground/turf slot
    Turf,
}

impl ServiceType {
    /// Every service type, in a fixed order
    pub const ALL: [Self; 4] = [
        Self::AcademyBatch,
        Self::AcademyProgram,
        Self::Coach,
        Self::Turf,
    ];

    /// Wire name (`academy_batch`, `academy_program`, `coach`, `turf`)
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AcademyBatch => "academy_batch",
            Self::AcademyProgram => "academy_program",
            Self::Coach => "coach",
            Self::Turf => "turf",
        }
    }

    /// Kind of supplier that owns sessions of this type
    #[must_use]
    pub const fn supplier_type(self) -> SupplierType {
        match self {
            Self::AcademyBatch | Self::AcademyProgram => SupplierType::Academy,
            Self::Coach => SupplierType::Coach,
            Self::Turf => SupplierType::Turf,
        }
    }

    /// Stable position of this type inside [`ServiceType::ALL`]
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::AcademyBatch => 0,
            Self::AcademyProgram => 1,
            Self::Coach => 2,
            Self::Turf => 3,
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|service_type| service_type.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownServiceType(s.to_string()))
    }
}

/// Owner category of a session (academy, coach or turf)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupplierType {
    /// Sports academy (batches and programs)
    Academy,
    /// Individual coach
    Coach,
    /// Turf/ground operator
    Turf,
}

impl SupplierType {
    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Academy => "academy",
            Self::Coach => "coach",
            Self::Turf => "turf",
        }
    }
}

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Creates a new random `SessionId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `SessionId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a session request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Creates a new random `RequestId`
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a `RequestId` from a `Uuid`
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque string identifiers issued by other systems.
macro_rules! external_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            #[doc = concat!("Creates a `", stringify!($name), "` from any string")]
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the raw identifier
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// True when the identifier is empty or whitespace
            #[must_use]
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }
    };
}

external_id!(
    /// The batch, program, coach or ground that owns recurring sessions
    EntityId
);
external_id!(
    /// The academy, coach or turf operator behind an entity
    OwnerId
);
external_id!(
    /// A platform user who books sessions
    UserId
);

// ============================================================================
// Calendar values
// ============================================================================

/// A start/end pair on one day, written `HH:MM-HH:MM`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeSlot {
    start: NaiveTime,
    end: NaiveTime,
}

impl TimeSlot {
    /// Create a slot
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidTimeSlot`] unless `start < end`.
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, ValidationError> {
        if end <= start {
            return Err(ValidationError::InvalidTimeSlot(format!(
                "{}-{}",
                start.format("%H:%M"),
                end.format("%H:%M")
            )));
        }
        Ok(Self { start, end })
    }

    /// Slot start time
    #[must_use]
    pub const fn start(&self) -> NaiveTime {
        self.start
    }

    /// Slot end time
    #[must_use]
    pub const fn end(&self) -> NaiveTime {
        self.end
    }

    /// Length of the slot in whole minutes
    #[must_use]
    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }
}

impl FromStr for TimeSlot {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidTimeSlot(s.to_string());
        let (start, end) = s.trim().split_once('-').ok_or_else(invalid)?;
        let start = NaiveTime::parse_from_str(start.trim(), "%H:%M").map_err(|_| invalid())?;
        let end = NaiveTime::parse_from_str(end.trim(), "%H:%M").map_err(|_| invalid())?;
        Self::new(start, end).map_err(|_| invalid())
    }
}

impl TryFrom<String> for TimeSlot {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeSlot> for String {
    fn from(slot: TimeSlot) -> Self {
        slot.to_string()
    }
}

impl fmt::Display for TimeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}-{:02}:{:02}",
            self.start.hour(),
            self.start.minute(),
            self.end.hour(),
            self.end.minute()
        )
    }
}

/// A calendar month.
///
/// Internally the first day of the month, so every accessor is total.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct YearMonth(NaiveDate);

impl YearMonth {
    /// Create a month from year and 1-based month number
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidMonth`] for a month outside `1..=12`
    /// or a year outside `1..=9999`.
    pub fn new(year: i32, month: u32) -> Result<Self, ValidationError> {
        if !(1..=9999).contains(&year) {
            return Err(ValidationError::InvalidMonth(format!("{year}-{month:02}")));
        }
        NaiveDate::from_ymd_opt(year, month, 1)
            .map(Self)
            .ok_or_else(|| ValidationError::InvalidMonth(format!("{year}-{month:02}")))
    }

    /// The month containing `date`
    #[must_use]
    pub fn of(date: NaiveDate) -> Self {
        Self(date - Duration::days(i64::from(date.day0())))
    }

    /// Calendar year
    #[must_use]
    pub fn year(&self) -> i32 {
        self.0.year()
    }

    /// Month number, 1-based
    #[must_use]
    pub fn month(&self) -> u32 {
        self.0.month()
    }

    /// First day of the month
    #[must_use]
    pub const fn first_day(&self) -> NaiveDate {
        self.0
    }

    /// Number of days in the month (28..=31)
    #[must_use]
    pub fn days_in_month(&self) -> u32 {
        match self.month() {
            4 | 6 | 9 | 11 => 30,
            2 if is_leap_year(self.year()) => 29,
            2 => 28,
            _ => 31,
        }
    }

    /// Last day of the month
    #[must_use]
    pub fn last_day(&self) -> NaiveDate {
        self.0 + Duration::days(i64::from(self.days_in_month()) - 1)
    }

    /// Whether `date` falls inside this month
    #[must_use]
    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year() && date.month() == self.month()
    }

    /// The following month
    #[must_use]
    pub fn next(&self) -> Self {
        Self(self.last_day() + Duration::days(1))
    }

    /// Every day of the month, in order
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.0.iter_days().take(self.days_in_month() as usize)
    }
}

const fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year(), self.month())
    }
}

impl FromStr for YearMonth {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidMonth(s.to_string());
        let (year, month) = s.trim().split_once('-').ok_or_else(invalid)?;
        let year = year.parse().map_err(|_| invalid())?;
        let month = month.parse().map_err(|_| invalid())?;
        Self::new(year, month)
    }
}

impl TryFrom<String> for YearMonth {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<YearMonth> for String {
    fn from(month: YearMonth) -> Self {
        month.to_string()
    }
}

// ============================================================================
// Session lifecycle
// ============================================================================

/// Lifecycle state of a session.
///
/// `Completed` and `Cancelled` are terminal. A completed session always has a
/// booking user; a cancelled one keeps the user it had, if any.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionStatus {
    /// Unbooked and bookable
    Open,
    /// Booked by a user
    Booked {
        /// Booking user
        user_id: UserId,
    },
    /// Took place (terminal)
    Completed {
        /// User who attended
        user_id: UserId,
    },
    /// Cancelled (terminal)
    Cancelled {
        /// User who had booked, if the session was booked
        user_id: Option<UserId>,
    },
}

impl SessionStatus {
    /// Booking user, if any
    #[must_use]
    pub const fn user_id(&self) -> Option<&UserId> {
        match self {
            Self::Open | Self::Cancelled { user_id: None } => None,
            Self::Booked { user_id }
            | Self::Completed { user_id }
            | Self::Cancelled {
                user_id: Some(user_id),
            } => Some(user_id),
        }
    }

    /// Unbooked and bookable
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Booked and not yet completed or cancelled
    #[must_use]
    pub const fn is_booked(&self) -> bool {
        matches!(self, Self::Booked { .. })
    }

    /// Completed
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// Cancelled
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Completed or cancelled
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.is_completed() || self.is_cancelled()
    }

    /// Lowercase state name, used in errors and logs
    #[must_use]
    pub const fn state_name(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Booked { .. } => "booked",
            Self::Completed { .. } => "completed",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

/// Feedback rating, an integer in `[1, 5]`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Rating(u8);

impl Rating {
    /// Validate a raw rating
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidRating`] outside `[1, 5]`.
    pub fn new(value: i64) -> Result<Self, ValidationError> {
        match u8::try_from(value) {
            Ok(v @ 1..=5) => Ok(Self(v)),
            _ => Err(ValidationError::InvalidRating(value)),
        }
    }

    /// Rating value
    #[must_use]
    pub const fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Rating {
    type Error = ValidationError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Rating> for i64 {
    fn from(rating: Rating) -> Self {
        i64::from(rating.0)
    }
}

/// Listing metadata copied onto every session generated for an entity
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingProfile {
    /// Venue or area
    #[serde(default)]
    pub location: Option<String>,
    /// Sport played
    #[serde(default)]
    pub sport: Option<String>,
    /// Price per session in minor units
    #[serde(default)]
    pub price_cents: Option<i64>,
}

/// A single bookable, dated, timed unit belonging to one entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Session ID
    pub session_id: SessionId,
    /// Service category
    pub service_type: ServiceType,
    /// Owning batch/program/coach/ground
    pub entity_id: EntityId,
    /// Academy, coach or turf behind the entity
    pub owner_id: OwnerId,
    /// Calendar date
    pub date: NaiveDate,
    /// Start and end time
    pub slot: TimeSlot,
    /// Lifecycle state
    pub status: SessionStatus,
    /// Why the session was cancelled
    pub cancellation_reason: Option<String>,
    /// Free-text feedback after completion
    pub feedback: Option<String>,
    /// Rating given with the feedback
    pub rating: Option<Rating>,
    /// Approved request that booked the session
    pub booking_id: Option<RequestId>,
    /// Venue or area
    pub location: Option<String>,
    /// Sport played
    pub sport: Option<String>,
    /// Price in minor units
    pub price_cents: Option<i64>,
    /// When the session was generated
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Booking user, if any
    #[must_use]
    pub const fn user_id(&self) -> Option<&UserId> {
        self.status.user_id()
    }

    /// The month this session belongs to
    #[must_use]
    pub fn month(&self) -> YearMonth {
        YearMonth::of(self.date)
    }

    /// Composite uniqueness key `(entity, date, start)`
    #[must_use]
    pub fn slot_key(&self) -> SlotKey {
        SlotKey {
            entity_id: self.entity_id.clone(),
            date: self.date,
            start: self.slot.start(),
        }
    }
}

/// Natural key of a session within one service type
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    /// Owning entity
    pub entity_id: EntityId,
    /// Calendar date
    pub date: NaiveDate,
    /// Start time
    pub start: NaiveTime,
}

/// A session the expander wants to exist.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSession {
    /// Service category
    pub service_type: ServiceType,
    /// Owning entity
    pub entity_id: EntityId,
    /// Owner of the entity
    pub owner_id: OwnerId,
    /// Calendar date
    pub date: NaiveDate,
    /// Start and end time
    pub slot: TimeSlot,
    /// Listing metadata to copy onto the session
    pub profile: ListingProfile,
}

impl NewSession {
    /// Natural key of the session to be created
    #[must_use]
    pub fn slot_key(&self) -> SlotKey {
        SlotKey {
            entity_id: self.entity_id.clone(),
            date: self.date,
            start: self.slot.start(),
        }
    }

    /// Materialize an open session
    #[must_use]
    pub fn into_session(self, session_id: SessionId, created_at: DateTime<Utc>) -> Session {
        Session {
            session_id,
            service_type: self.service_type,
            entity_id: self.entity_id,
            owner_id: self.owner_id,
            date: self.date,
            slot: self.slot,
            status: SessionStatus::Open,
            cancellation_reason: None,
            feedback: None,
            rating: None,
            booking_id: None,
            location: self.profile.location,
            sport: self.profile.sport,
            price_cents: self.profile.price_cents,
            created_at,
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Status of a session request; `Approved` and `Rejected` are terminal
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Awaiting a decision
    Pending,
    /// Confirmed; the session is booked for the requester
    Approved,
    /// Declined
    Rejected,
}

impl RequestStatus {
    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl FromStr for RequestStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(ValidationError::UnknownRequestStatus(other.to_string())),
        }
    }
}

/// A user's request to book a session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    /// Request ID
    pub request_id: RequestId,
    /// Requested session
    pub session_id: SessionId,
    /// Requesting user
    pub user_id: UserId,
    /// When the request was made
    pub requested_at: DateTime<Utc>,
    /// Decision state
    pub status: RequestStatus,
    /// Optional note from the user
    pub notes: Option<String>,
    /// Why the request was rejected
    pub rejection_reason: Option<String>,
    /// When the request was approved or rejected
    pub decided_at: Option<DateTime<Utc>>,
}

impl SessionRequest {
    /// Still awaiting a decision
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self.status, RequestStatus::Pending)
    }
}
