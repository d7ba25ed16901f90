//! Row shapes for the Postgres tables and their conversion into domain types.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};
use serde_json::Value;
use std::collections::BTreeMap;
use tuft_booking::{
    CreditMovement, Package, Reservation, WaitlistEntry,
};
use tuft_catalog::{Class, FrameSize, Holiday, RecurringClassPattern};
use tuft_core::{StudioError, StudioResult};
use uuid::Uuid;

#[derive(sqlx::FromRow)]
pub(crate) struct ClassRow {
    pub id: Uuid,
    pub class_type_id: Uuid,
    pub title: String,
    pub location: String,
    pub instructor_id: Option<Uuid>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub capacity: i32,
    pub frame_capacity: Value,
    pub price_cents: i64,
    pub status: String,
    pub pattern_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) const CLASS_COLUMNS: &str = "id, class_type_id, title, location, instructor_id, starts_at, ends_at, capacity, frame_capacity, price_cents, status, pattern_id, created_at, updated_at";

impl TryFrom<ClassRow> for Class {
    type Error = StudioError;

    fn try_from(row: ClassRow) -> StudioResult<Self> {
        Ok(Class {
            id: row.id,
            class_type_id: row.class_type_id,
            title: row.title,
            location: row.location,
            instructor_id: row.instructor_id,
            starts_at: row.starts_at,
            ends_at: row.ends_at,
            capacity: to_u32(row.capacity, "classes.capacity")?,
            frame_capacity: frames_from_json(row.frame_capacity)?,
            price_cents: row.price_cents,
            status: row.status.parse()?,
            pattern_id: row.pattern_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct ReservationRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub class_id: Uuid,
    pub status: String,
    pub package_id: Option<Uuid>,
    pub frame_size: Option<String>,
    pub payment_deadline: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub checked_in_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) const RESERVATION_COLUMNS: &str = "id, user_id, class_id, status, package_id, frame_size, payment_deadline, paid_at, cancellation_reason, cancelled_at, checked_in_at, created_at, updated_at";

impl TryFrom<ReservationRow> for Reservation {
    type Error = StudioError;

    fn try_from(row: ReservationRow) -> StudioResult<Self> {
        Ok(Reservation {
            id: row.id,
            user_id: row.user_id,
            class_id: row.class_id,
            status: row.status.parse()?,
            package_id: row.package_id,
            frame_size: parse_frame(row.frame_size)?,
            payment_deadline: row.payment_deadline,
            paid_at: row.paid_at,
            cancellation_reason: row.cancellation_reason,
            cancelled_at: row.cancelled_at,
            checked_in_at: row.checked_in_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct PackageRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub kind: String,
    pub total_credits: i32,
    pub used_credits: i32,
    pub status: String,
    pub class_type_id: Option<Uuid>,
    pub price_cents: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub expiry_warning_sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) const PACKAGE_COLUMNS: &str = "id, user_id, name, kind, total_credits, used_credits, status, class_type_id, price_cents, expires_at, expiry_warning_sent_at, created_at, updated_at";

impl TryFrom<PackageRow> for Package {
    type Error = StudioError;

    fn try_from(row: PackageRow) -> StudioResult<Self> {
        Ok(Package {
            id: row.id,
            user_id: row.user_id,
            name: row.name,
            kind: row.kind.parse()?,
            total_credits: to_u32(row.total_credits, "packages.total_credits")?,
            used_credits: to_u32(row.used_credits, "packages.used_credits")?,
            status: row.status.parse()?,
            class_type_id: row.class_type_id,
            price_cents: row.price_cents,
            expires_at: row.expires_at,
            expiry_warning_sent_at: row.expiry_warning_sent_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct WaitlistRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub class_id: Uuid,
    pub frame_size: Option<String>,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<WaitlistRow> for WaitlistEntry {
    type Error = StudioError;

    fn try_from(row: WaitlistRow) -> StudioResult<Self> {
        Ok(WaitlistEntry {
            id: row.id,
            user_id: row.user_id,
            class_id: row.class_id,
            frame_size: parse_frame(row.frame_size)?,
            priority: to_u32(row.priority, "waitlist_entries.priority")?,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct MovementRow {
    pub id: Uuid,
    pub package_id: Uuid,
    pub reservation_id: Option<Uuid>,
    pub kind: String,
    pub amount: i32,
    pub used_after: i32,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<MovementRow> for CreditMovement {
    type Error = StudioError;

    fn try_from(row: MovementRow) -> StudioResult<Self> {
        Ok(CreditMovement {
            id: row.id,
            package_id: row.package_id,
            reservation_id: row.reservation_id,
            kind: row.kind.parse()?,
            amount: to_u32(row.amount, "credit_movements.amount")?,
            used_after: to_u32(row.used_after, "credit_movements.used_after")?,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct PatternRow {
    pub id: Uuid,
    pub class_type_id: Uuid,
    pub title: String,
    pub location: String,
    pub instructor_id: Option<Uuid>,
    pub day_of_week: i16,
    pub start_time: NaiveTime,
    pub duration_minutes: i32,
    pub capacity: i32,
    pub frame_capacity: Value,
    pub price_cents: i64,
    pub valid_from: NaiveDate,
    pub valid_until: Option<NaiveDate>,
    pub is_active: bool,
}

pub(crate) const PATTERN_COLUMNS: &str = "id, class_type_id, title, location, instructor_id, day_of_week, start_time, duration_minutes, capacity, frame_capacity, price_cents, valid_from, valid_until, is_active";

impl TryFrom<PatternRow> for RecurringClassPattern {
    type Error = StudioError;

    fn try_from(row: PatternRow) -> StudioResult<Self> {
        Ok(RecurringClassPattern {
            id: row.id,
            class_type_id: row.class_type_id,
            title: row.title,
            location: row.location,
            instructor_id: row.instructor_id,
            day_of_week: weekday_from_index(row.day_of_week)?,
            start_time: row.start_time,
            duration_minutes: to_u32(row.duration_minutes, "recurring_patterns.duration_minutes")?,
            capacity: to_u32(row.capacity, "recurring_patterns.capacity")?,
            frame_capacity: frames_from_json(row.frame_capacity)?,
            price_cents: row.price_cents,
            valid_from: row.valid_from,
            valid_until: row.valid_until,
            is_active: row.is_active,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct HolidayRow {
    pub id: Uuid,
    pub date: NaiveDate,
    pub name: String,
}

impl From<HolidayRow> for Holiday {
    fn from(row: HolidayRow) -> Self {
        Holiday {
            id: row.id,
            date: row.date,
            name: row.name,
        }
    }
}

pub(crate) fn to_u32(value: i32, column: &str) -> StudioResult<u32> {
    u32::try_from(value).map_err(|_| StudioError::Storage(format!("negative value {} in {}", value, column)))
}

pub(crate) fn to_i32(value: u32) -> StudioResult<i32> {
    i32::try_from(value).map_err(|_| StudioError::ValidationError(format!("value {} too large", value)))
}

fn parse_frame(value: Option<String>) -> StudioResult<Option<FrameSize>> {
    value.map(|s| s.parse()).transpose()
}

pub(crate) fn frames_to_json(frames: &BTreeMap<FrameSize, u32>) -> Value {
    serde_json::to_value(frames).unwrap_or_else(|_| Value::Object(Default::default()))
}

fn frames_from_json(value: Value) -> StudioResult<BTreeMap<FrameSize, u32>> {
    if value.is_null() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_value(value).map_err(|e| StudioError::Storage(format!("bad frame_capacity: {}", e)))
}

pub(crate) fn weekday_index(day: Weekday) -> i16 {
    day.num_days_from_monday() as i16
}

fn weekday_from_index(index: i16) -> StudioResult<Weekday> {
    u8::try_from(index)
        .ok()
        .and_then(|i| Weekday::try_from(i).ok())
        .ok_or_else(|| StudioError::Storage(format!("bad day_of_week {}", index)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_capacity_json_round_trip() {
        let frames = BTreeMap::from([(FrameSize::Small, 3), (FrameSize::Large, 1)]);
        let json = frames_to_json(&frames);
        assert_eq!(json, serde_json::json!({ "SMALL": 3, "LARGE": 1 }));
        assert_eq!(frames_from_json(json).unwrap(), frames);
        assert!(frames_from_json(Value::Null).unwrap().is_empty());
    }

    #[test]
    fn test_weekday_index_matches_monday_first() {
        assert_eq!(weekday_index(Weekday::Mon), 0);
        assert_eq!(weekday_from_index(6).unwrap(), Weekday::Sun);
        assert!(weekday_from_index(7).is_err());
    }

    #[test]
    fn test_negative_counts_are_storage_errors() {
        assert!(matches!(to_u32(-1, "packages.used_credits"), Err(StudioError::Storage(_))));
    }
}
