//! Recurrence expansion.
//!
//! Turns weekly rules (batches, programs, coach batches) and fixed daily slot
//! lists (grounds) into concrete dated occurrences for one month. Everything
//! here is a pure function of its inputs: the schedule snapshot, the target
//! month and "today".

use crate::types::{EntityId, ListingProfile, NewSession, OwnerId, ServiceType, TimeSlot, YearMonth};
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

// ============================================================================
// Rules
// ============================================================================

/// Set of weekdays, stored as a bitmask (bit 0 = Monday).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<Weekday>", into = "Vec<Weekday>")]
pub struct DaysOfWeek(u8);

impl DaysOfWeek {
    /// No days
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Add a day
    pub fn insert(&mut self, day: Weekday) {
        self.0 |= 1 << day.num_days_from_monday();
    }

    /// Whether `day` is in the set
    #[must_use]
    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    /// True when no day is set
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Days in Monday-first order
    pub fn iter(&self) -> impl Iterator<Item = Weekday> + '_ {
        [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ]
        .into_iter()
        .filter(|day| self.contains(*day))
    }
}

impl FromIterator<Weekday> for DaysOfWeek {
    fn from_iter<I: IntoIterator<Item = Weekday>>(iter: I) -> Self {
        let mut days = Self::empty();
        for day in iter {
            days.insert(day);
        }
        days
    }
}

impl From<Vec<Weekday>> for DaysOfWeek {
    fn from(days: Vec<Weekday>) -> Self {
        days.into_iter().collect()
    }
}

impl From<DaysOfWeek> for Vec<Weekday> {
    fn from(days: DaysOfWeek) -> Self {
        days.iter().collect()
    }
}

/// How an entity's sessions recur.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecurrenceRule {
    /// One slot on each configured weekday
    Weekly {
        /// Days the entity runs
        days: DaysOfWeek,
        /// Start and end time on each of those days
        slot: TimeSlot,
    },
    /// The same ordered slot list on every calendar day (grounds)
    DailySlots {
        /// Slots in display order
        slots: Vec<TimeSlot>,
    },
}

/// Recurrence configuration of one entity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchedule {
    /// Service category the entity's sessions belong to
    pub service_type: ServiceType,
    /// The batch, program, coach or ground
    pub entity_id: EntityId,
    /// Owner (academy, coach or turf)
    pub owner_id: OwnerId,
    /// Entity-specific rule; falls back to the service default when absent
    #[serde(default)]
    pub rule: Option<RecurrenceRule>,
    /// Listing metadata copied onto every generated session
    #[serde(default)]
    pub profile: ListingProfile,
}

/// Service-level default rules, used when an entity has no override.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceDefaults {
    /// Default for academy batches
    #[serde(default)]
    pub academy_batch: Option<RecurrenceRule>,
    /// Default for academy programs
    #[serde(default)]
    pub academy_program: Option<RecurrenceRule>,
    /// Default for coach batches
    #[serde(default)]
    pub coach: Option<RecurrenceRule>,
    /// Default for grounds
    #[serde(default)]
    pub turf: Option<RecurrenceRule>,
}

impl RecurrenceDefaults {
    /// Default rule for a service type
    #[must_use]
    pub const fn get(&self, service_type: ServiceType) -> Option<&RecurrenceRule> {
        match service_type {
            ServiceType::AcademyBatch => self.academy_batch.as_ref(),
            ServiceType::AcademyProgram => self.academy_program.as_ref(),
            ServiceType::Coach => self.coach.as_ref(),
            ServiceType::Turf => self.turf.as_ref(),
        }
    }

    /// Rule in force for `entity`: its override, else the service default
    #[must_use]
    pub fn resolve_rule<'a>(&'a self, entity: &'a EntitySchedule) -> Option<&'a RecurrenceRule> {
        entity.rule.as_ref().or_else(|| self.get(entity.service_type))
    }
}

/// An entity entry that could not be decoded.
///
/// Only that entity is skipped; the rest of the snapshot stays usable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectedEntity {
    /// Position in the `entities` list
    pub index: usize,
    /// `entity_id`, when the entry carried a readable one
    pub entity_id: Option<EntityId>,
    /// `service_type`, when the entry carried a readable one
    pub service_type: Option<ServiceType>,
    /// Decoder message
    pub reason: String,
}

impl RejectedEntity {
    fn from_value(index: usize, value: &serde_json::Value, reason: String) -> Self {
        Self {
            index,
            entity_id: value
                .get("entity_id")
                .and_then(serde_json::Value::as_str)
                .map(EntityId::new),
            service_type: value
                .get("service_type")
                .and_then(|v| serde_json::from_value(v.clone()).ok()),
            reason,
        }
    }

    /// ID to report: the entity's own, else its position
    #[must_use]
    pub fn label(&self) -> EntityId {
        self.entity_id
            .clone()
            .unwrap_or_else(|| EntityId::new(format!("entities[{}]", self.index)))
    }
}

/// All recurrence configuration, fetched fresh at the start of a generation run.
///
/// Entities decode one by one: a malformed entry lands in `rejected`
/// instead of failing the whole snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawSnapshot")]
pub struct ScheduleSnapshot {
    /// Entities to generate for
    pub entities: Vec<EntitySchedule>,
    /// Service-level defaults
    pub defaults: RecurrenceDefaults,
    /// Entries that could not be decoded
    #[serde(skip)]
    pub rejected: Vec<RejectedEntity>,
}

#[derive(Deserialize)]
struct RawSnapshot {
    #[serde(default)]
    entities: Vec<serde_json::Value>,
    #[serde(default)]
    defaults: RecurrenceDefaults,
}

impl From<RawSnapshot> for ScheduleSnapshot {
    fn from(raw: RawSnapshot) -> Self {
        let mut entities = Vec::with_capacity(raw.entities.len());
        let mut rejected = Vec::new();
        for (index, value) in raw.entities.into_iter().enumerate() {
            match EntitySchedule::deserialize(&value) {
                Ok(entity) => entities.push(entity),
                Err(e) => rejected.push(RejectedEntity::from_value(index, &value, e.to_string())),
            }
        }
        Self {
            entities,
            defaults: raw.defaults,
            rejected,
        }
    }
}

impl ScheduleSnapshot {
    /// Entities belonging to any of `services`
    pub fn entities_for<'a>(
        &'a self,
        services: &'a [ServiceType],
    ) -> impl Iterator<Item = &'a EntitySchedule> + 'a {
        self.entities
            .iter()
            .filter(move |entity| services.contains(&entity.service_type))
    }

    /// Rejected entries that may belong to `services`.
    ///
    /// An entry whose service type is unreadable counts for every service.
    pub fn rejected_for<'a>(
        &'a self,
        services: &'a [ServiceType],
    ) -> impl Iterator<Item = &'a RejectedEntity> + 'a {
        self.rejected.iter().filter(move |rejected| {
            rejected
                .service_type
                .is_none_or(|service_type| services.contains(&service_type))
        })
    }
}

// ============================================================================
// Expansion
// ============================================================================

/// One concrete date + time instance of a rule
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Occurrence {
    /// Calendar date
    pub date: NaiveDate,
    /// Start and end time
    pub slot: TimeSlot,
}

/// Every date in `month` falling on `weekday`, ascending.
#[must_use]
pub fn weekday_dates(month: YearMonth, weekday: Weekday) -> Vec<NaiveDate> {
    let Some(first) = month
        .days()
        .take(7)
        .find(|date| date.weekday() == weekday)
    else {
        return Vec::new();
    };

    std::iter::successors(Some(first), |date| Some(*date + Duration::days(7)))
        .take_while(|date| month.contains(*date))
        .collect()
}

/// Occurrences of `rule` in `month`, skipping dates before `today`.
///
/// Ordered by `(date, start)`. Repeated slots in a daily list collapse to one
/// occurrence per start time.
#[must_use]
pub fn expand_entity(rule: &RecurrenceRule, month: YearMonth, today: NaiveDate) -> Vec<Occurrence> {
    let mut occurrences: Vec<Occurrence> = match rule {
        RecurrenceRule::Weekly { days, slot } => days
            .iter()
            .flat_map(|day| weekday_dates(month, day))
            .filter(|date| *date >= today)
            .map(|date| Occurrence { date, slot: *slot })
            .collect(),
        RecurrenceRule::DailySlots { slots } => month
            .days()
            .filter(|date| *date >= today)
            .flat_map(|date| slots.iter().map(move |slot| Occurrence { date, slot: *slot }))
            .collect(),
    };

    occurrences.sort_by_key(|o| (o.date, o.slot.start()));
    occurrences.dedup_by_key(|o| (o.date, o.slot.start()));
    occurrences
}

/// Sessions `entity` should have in `month`, or none when it has no rule.
#[must_use]
pub fn plan_entity(
    entity: &EntitySchedule,
    defaults: &RecurrenceDefaults,
    month: YearMonth,
    today: NaiveDate,
) -> Vec<NewSession> {
    let Some(rule) = defaults.resolve_rule(entity) else {
        return Vec::new();
    };

    expand_entity(rule, month, today)
        .into_iter()
        .map(|occurrence| NewSession {
            service_type: entity.service_type,
            entity_id: entity.entity_id.clone(),
            owner_id: entity.owner_id.clone(),
            date: occurrence.date,
            slot: occurrence.slot,
            profile: entity.profile.clone(),
        })
        .collect()
}

/// Expand every entity in the snapshot for `month`.
///
/// Output is grouped by entity in snapshot order, then ordered by
/// `(date, start)`.
#[must_use]
pub fn expand(snapshot: &ScheduleSnapshot, month: YearMonth, today: NaiveDate) -> Vec<NewSession> {
    snapshot
        .entities
        .iter()
        .flat_map(|entity| plan_entity(entity, &snapshot.defaults, month, today))
        .collect()
}
