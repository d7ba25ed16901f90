use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tuft_core::{StudioError, StudioResult};
use uuid::Uuid;

/// Class lifecycle. FULL is derived from reservation counts; the rest are
/// explicit transitions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClassStatus {
    Scheduled,
    InProgress,
    Full,
    Completed,
    Cancelled,
}

impl ClassStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassStatus::Scheduled => "SCHEDULED",
            ClassStatus::InProgress => "IN_PROGRESS",
            ClassStatus::Full => "FULL",
            ClassStatus::Completed => "COMPLETED",
            ClassStatus::Cancelled => "CANCELLED",
        }
    }

    /// Scheduled or full: the class has not started and still takes changes.
    pub fn is_open(&self) -> bool {
        matches!(self, ClassStatus::Scheduled | ClassStatus::Full)
    }
}

impl fmt::Display for ClassStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClassStatus {
    type Err = StudioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCHEDULED" => Ok(ClassStatus::Scheduled),
            "IN_PROGRESS" => Ok(ClassStatus::InProgress),
            "FULL" => Ok(ClassStatus::Full),
            "COMPLETED" => Ok(ClassStatus::Completed),
            "CANCELLED" => Ok(ClassStatus::Cancelled),
            other => Err(StudioError::ValidationError(format!("unknown class status {}", other))),
        }
    }
}

/// Tufting frame category. Some classes hand out seats per frame size.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameSize {
    Small,
    Medium,
    Large,
}

impl FrameSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameSize::Small => "SMALL",
            FrameSize::Medium => "MEDIUM",
            FrameSize::Large => "LARGE",
        }
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FrameSize {
    type Err = StudioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SMALL" => Ok(FrameSize::Small),
            "MEDIUM" => Ok(FrameSize::Medium),
            "LARGE" => Ok(FrameSize::Large),
            other => Err(StudioError::ValidationError(format!("unknown frame size {}", other))),
        }
    }
}

/// A scheduled session students can book.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Class {
    pub id: Uuid,
    pub class_type_id: Uuid,
    pub title: String,
    pub location: String,
    pub instructor_id: Option<Uuid>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub capacity: u32,
    /// Per-frame seat counts; empty when the class does not track frames.
    pub frame_capacity: BTreeMap<FrameSize, u32>,
    pub price_cents: i64,
    pub status: ClassStatus,
    pub pattern_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a class by hand or from a pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewClass {
    pub class_type_id: Uuid,
    pub title: String,
    pub location: String,
    pub instructor_id: Option<Uuid>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub capacity: u32,
    #[serde(default)]
    pub frame_capacity: BTreeMap<FrameSize, u32>,
    pub price_cents: i64,
}

impl Class {
    pub fn new(new: NewClass, now: DateTime<Utc>) -> StudioResult<Self> {
        if new.ends_at <= new.starts_at {
            return Err(StudioError::ValidationError(
                "class must end after it starts".to_string(),
            ));
        }
        if new.capacity == 0 {
            return Err(StudioError::ValidationError(
                "class capacity must be at least 1".to_string(),
            ));
        }
        if new.price_cents < 0 {
            return Err(StudioError::ValidationError(
                "class price cannot be negative".to_string(),
            ));
        }

        let class = Self {
            id: Uuid::new_v4(),
            class_type_id: new.class_type_id,
            title: new.title,
            location: new.location,
            instructor_id: new.instructor_id,
            starts_at: new.starts_at,
            ends_at: new.ends_at,
            capacity: new.capacity,
            frame_capacity: new.frame_capacity,
            price_cents: new.price_cents,
            status: ClassStatus::Scheduled,
            pattern_id: None,
            created_at: now,
            updated_at: now,
        };

        if !class.frame_capacity_covers_capacity() {
            tracing::warn!(
                "Class {} frame capacity {} is below overall capacity {}",
                class.id,
                class.frame_capacity_total(),
                class.capacity
            );
        }

        Ok(class)
    }

    pub fn is_frame_typed(&self) -> bool {
        !self.frame_capacity.is_empty()
    }

    pub fn frame_capacity_total(&self) -> u32 {
        self.frame_capacity.values().sum()
    }

    /// Integrity expectation for frame-typed classes. Not enforced.
    pub fn frame_capacity_covers_capacity(&self) -> bool {
        !self.is_frame_typed() || self.frame_capacity_total() >= self.capacity
    }

    pub fn time_until_start(&self, now: DateTime<Utc>) -> Duration {
        self.starts_at - now
    }

    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        self.starts_at <= now
    }

    pub fn update_status(&mut self, status: ClassStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }

    /// SCHEDULED/FULL → IN_PROGRESS.
    pub fn start(&mut self, now: DateTime<Utc>) -> StudioResult<()> {
        if !self.status.is_open() {
            return Err(StudioError::transition(
                "class",
                self.status.as_str(),
                ClassStatus::InProgress.as_str(),
            ));
        }
        self.update_status(ClassStatus::InProgress, now);
        Ok(())
    }

    /// Keeps SCHEDULED/FULL in line with the number of active seats.
    /// Other statuses are left alone.
    pub fn sync_fullness(&mut self, active: u32, now: DateTime<Utc>) {
        if !self.status.is_open() {
            return;
        }
        let next = if active >= self.capacity {
            ClassStatus::Full
        } else {
            ClassStatus::Scheduled
        };
        if next != self.status {
            tracing::info!("Class {} status {} -> {}", self.id, self.status, next);
            self.update_status(next, now);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn sample_new_class(capacity: u32) -> NewClass {
        let starts_at = Utc.with_ymd_and_hms(2026, 11, 2, 18, 0, 0).unwrap();
        NewClass {
            class_type_id: Uuid::new_v4(),
            title: "Intro to Tufting".to_string(),
            location: "Studio A".to_string(),
            instructor_id: None,
            starts_at,
            ends_at: starts_at + Duration::hours(3),
            capacity,
            frame_capacity: BTreeMap::new(),
            price_cents: 8500,
        }
    }

    #[test]
    fn test_new_class_is_scheduled() {
        let class = Class::new(sample_new_class(4), Utc::now()).unwrap();
        assert_eq!(class.status, ClassStatus::Scheduled);
        assert!(!class.is_frame_typed());
        assert!(class.frame_capacity_covers_capacity());
    }

    #[test]
    fn test_rejects_inverted_times() {
        let mut new = sample_new_class(4);
        new.ends_at = new.starts_at - Duration::minutes(1);
        assert!(matches!(
            Class::new(new, Utc::now()),
            Err(StudioError::ValidationError(_))
        ));
    }

    #[test]
    fn test_frame_capacity_shortfall_is_reported_not_enforced() {
        let mut new = sample_new_class(6);
        new.frame_capacity = BTreeMap::from([(FrameSize::Small, 2), (FrameSize::Large, 2)]);
        let class = Class::new(new, Utc::now()).unwrap();
        assert!(class.is_frame_typed());
        assert_eq!(class.frame_capacity_total(), 4);
        assert!(!class.frame_capacity_covers_capacity());
    }

    #[test]
    fn test_sync_fullness_toggles_only_open_classes() {
        let now = Utc::now();
        let mut class = Class::new(sample_new_class(2), now).unwrap();

        class.sync_fullness(2, now);
        assert_eq!(class.status, ClassStatus::Full);
        class.sync_fullness(1, now);
        assert_eq!(class.status, ClassStatus::Scheduled);

        class.start(now).unwrap();
        class.sync_fullness(2, now);
        assert_eq!(class.status, ClassStatus::InProgress);
    }

    #[test]
    fn test_start_requires_open_class() {
        let now = Utc::now();
        let mut class = Class::new(sample_new_class(2), now).unwrap();
        class.update_status(ClassStatus::Cancelled, now);
        assert!(matches!(
            class.start(now),
            Err(StudioError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [
            ClassStatus::Scheduled,
            ClassStatus::InProgress,
            ClassStatus::Full,
            ClassStatus::Completed,
            ClassStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<ClassStatus>().unwrap(), status);
        }
    }
}
