use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tuft_core::{StudioError, StudioResult};
use uuid::Uuid;

use crate::class::{Class, FrameSize, NewClass};
use crate::holiday::HolidayCalendar;

/// Weekly template for a class that repeats on the same weekday and time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecurringClassPattern {
    pub id: Uuid,
    pub class_type_id: Uuid,
    pub title: String,
    pub location: String,
    pub instructor_id: Option<Uuid>,
    pub day_of_week: Weekday,
    /// Studio-local wall clock time.
    pub start_time: NaiveTime,
    pub duration_minutes: u32,
    pub capacity: u32,
    #[serde(default)]
    pub frame_capacity: BTreeMap<FrameSize, u32>,
    pub price_cents: i64,
    pub valid_from: NaiveDate,
    pub valid_until: Option<NaiveDate>,
    pub is_active: bool,
}

impl RecurringClassPattern {
    pub fn validate(&self) -> Result<(), PatternError> {
        if self.duration_minutes == 0 {
            return Err(PatternError::InvalidDuration);
        }
        if self.capacity == 0 {
            return Err(PatternError::InvalidCapacity);
        }
        if let Some(until) = self.valid_until {
            if until < self.valid_from {
                return Err(PatternError::InvalidWindow {
                    valid_from: self.valid_from,
                    valid_until: until,
                });
            }
        }
        Ok(())
    }

    pub fn is_valid_on(&self, date: NaiveDate) -> bool {
        date >= self.valid_from && self.valid_until.map_or(true, |until| date <= until)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub weeks_ahead: u32,
    #[serde(default = "default_skip_holidays")]
    pub skip_holidays: bool,
    pub start_from: NaiveDate,
}

fn default_skip_holidays() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipReason {
    Holiday,
    OutsideValidity,
    AlreadyExists,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GenerationOutcome {
    pub created: Vec<Class>,
    pub skipped: Vec<(NaiveDate, SkipReason)>,
}

/// Identity of a generated slot: same type, same room, same start.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub class_type_id: Uuid,
    pub location: String,
    pub starts_at: DateTime<Utc>,
}

impl SlotKey {
    pub fn of(class: &Class) -> Self {
        Self {
            class_type_id: class.class_type_id,
            location: class.location.clone(),
            starts_at: class.starts_at,
        }
    }
}

pub const DEFAULT_MAX_WEEKS_AHEAD: u32 = 104;

/// Expands patterns into concrete classes in the studio's timezone.
pub struct PatternGenerator {
    offset: FixedOffset,
    max_weeks_ahead: u32,
}

impl PatternGenerator {
    pub fn new(offset: FixedOffset) -> Self {
        Self {
            offset,
            max_weeks_ahead: DEFAULT_MAX_WEEKS_AHEAD,
        }
    }

    pub fn with_max_weeks_ahead(mut self, max_weeks_ahead: u32) -> Self {
        self.max_weeks_ahead = max_weeks_ahead;
        self
    }

    pub fn utc() -> Self {
        Self::new(Utc.fix())
    }

    /// Studio-local calendar date of an instant.
    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset).date_naive()
    }

    /// First date on or after `from` that falls on `weekday`.
    /// `None` when that date is past the end of the calendar.
    pub fn next_weekday(from: NaiveDate, weekday: Weekday) -> Option<NaiveDate> {
        let ahead = (7 + weekday.num_days_from_monday() as i64
            - from.weekday().num_days_from_monday() as i64)
            % 7;
        from.checked_add_signed(Duration::days(ahead))
    }

    /// Creates one class per week offset, skipping holidays, dates outside the
    /// pattern's validity window, and slots already present in `existing`.
    /// Running it again with the same inputs creates nothing new.
    pub fn generate(
        &self,
        pattern: &RecurringClassPattern,
        request: &GenerateRequest,
        holidays: &HolidayCalendar,
        existing: &HashSet<SlotKey>,
        now: DateTime<Utc>,
    ) -> StudioResult<GenerationOutcome> {
        pattern.validate()?;
        if !pattern.is_active {
            return Err(PatternError::Inactive(pattern.id).into());
        }

        if request.weeks_ahead == 0 || request.weeks_ahead > self.max_weeks_ahead {
            return Err(PatternError::WeeksAheadOutOfRange {
                requested: request.weeks_ahead,
                max: self.max_weeks_ahead,
            }
            .into());
        }

        let mut outcome = GenerationOutcome::default();

        for week in 0..request.weeks_ahead {
            let date = request
                .start_from
                .checked_add_signed(Duration::weeks(i64::from(week)))
                .and_then(|base| Self::next_weekday(base, pattern.day_of_week))
                .ok_or(PatternError::DateOutOfRange(request.start_from))?;

            if request.skip_holidays && holidays.contains(date) {
                outcome.skipped.push((date, SkipReason::Holiday));
                continue;
            }
            if !pattern.is_valid_on(date) {
                outcome.skipped.push((date, SkipReason::OutsideValidity));
                continue;
            }

            let starts_at = self.to_utc(date, pattern.start_time)?;
            let key = SlotKey {
                class_type_id: pattern.class_type_id,
                location: pattern.location.clone(),
                starts_at,
            };
            if existing.contains(&key) {
                outcome.skipped.push((date, SkipReason::AlreadyExists));
                continue;
            }

            let ends_at = starts_at
                .checked_add_signed(Duration::minutes(i64::from(pattern.duration_minutes)))
                .ok_or(PatternError::DateOutOfRange(date))?;
            let mut class = Class::new(
                NewClass {
                    class_type_id: pattern.class_type_id,
                    title: pattern.title.clone(),
                    location: pattern.location.clone(),
                    instructor_id: pattern.instructor_id,
                    starts_at,
                    ends_at,
                    capacity: pattern.capacity,
                    frame_capacity: pattern.frame_capacity.clone(),
                    price_cents: pattern.price_cents,
                },
                now,
            )?;
            class.pattern_id = Some(pattern.id);
            outcome.created.push(class);
        }

        tracing::info!(
            "Pattern {} generated {} classes, skipped {}",
            pattern.id,
            outcome.created.len(),
            outcome.skipped.len()
        );

        Ok(outcome)
    }

    fn to_utc(&self, date: NaiveDate, time: NaiveTime) -> Result<DateTime<Utc>, PatternError> {
        self.offset
            .from_local_datetime(&date.and_time(time))
            .single()
            .map(|local| local.with_timezone(&Utc))
            .ok_or(PatternError::UnrepresentableTime(date))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("Pattern duration must be positive")]
    InvalidDuration,

    #[error("Pattern capacity must be at least 1")]
    InvalidCapacity,

    #[error("Pattern validity window is inverted: {valid_from} > {valid_until}")]
    InvalidWindow {
        valid_from: NaiveDate,
        valid_until: NaiveDate,
    },

    #[error("Pattern is inactive: {0}")]
    Inactive(Uuid),

    #[error("weeks_ahead must be between 1 and {max}, got {requested}")]
    WeeksAheadOutOfRange { requested: u32, max: u32 },

    #[error("Generating from {0} runs past the end of the calendar")]
    DateOutOfRange(NaiveDate),

    #[error("Start time on {0} cannot be represented in the studio timezone")]
    UnrepresentableTime(NaiveDate),
}

impl From<PatternError> for StudioError {
    fn from(err: PatternError) -> Self {
        StudioError::ValidationError(err.to_string())
    }
}
