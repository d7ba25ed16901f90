use chrono::{DateTime, Utc};
use serde::Serialize;
use tuft_core::{Caller, StudioError, StudioResult};
use tuft_shared::{Notification, NotificationKind};
use uuid::Uuid;

use crate::manager::{ensure_class_type, ClassBook, Promotion};
use crate::models::{Package, Reservation, ReservationStatus};
use crate::policy::BookingPolicy;

#[derive(Debug, Clone, Serialize)]
pub struct RescheduleOutcome {
    pub cancelled: Reservation,
    pub reservation: Reservation,
    pub promoted: Option<Promotion>,
    #[serde(skip)]
    pub notifications: Vec<Notification>,
}

/// Moves a CONFIRMED reservation from `from` to `to`.
///
/// The old seat is released (and offered to the waitlist), a new seat is
/// taken in the target class, and the package link moves with it. No
/// credit changes hands.
pub fn reschedule(
    from: &mut ClassBook,
    to: &mut ClassBook,
    reservation_id: Uuid,
    caller: &Caller,
    package: Option<&Package>,
    policy: &BookingPolicy,
    now: DateTime<Utc>,
) -> StudioResult<RescheduleOutcome> {
    if from.class.id == to.class.id {
        return Err(StudioError::ValidationError(
            "reservation is already in that class".to_string(),
        ));
    }

    let current = from.reservation(reservation_id)?.clone();
    caller.ensure_can_act_for(current.user_id, "reservation")?;
    if current.status != ReservationStatus::Confirmed {
        return Err(StudioError::transition(
            "reservation",
            current.status.as_str(),
            "RESCHEDULED",
        ));
    }

    let remaining = from.class.time_until_start(now);
    if remaining <= chrono::Duration::zero()
        || (!caller.is_admin() && remaining < policy.cancellation_window())
    {
        return Err(StudioError::CancellationWindowViolation {
            minutes_remaining: remaining.num_minutes(),
            required_hours: policy.cancellation_window_hours,
        });
    }

    to.ensure_bookable(now)?;
    let target_notice = to.class.time_until_start(now);
    if target_notice < policy.reschedule_min_notice() {
        return Err(StudioError::CancellationWindowViolation {
            minutes_remaining: target_notice.num_minutes(),
            required_hours: policy.reschedule_min_hours,
        });
    }
    to.ensure_frame_known(current.frame_size)?;
    if to.active_reservation_for(current.user_id).is_some() {
        return Err(StudioError::AlreadyExists {
            entity: "reservation",
            detail: format!(
                "user {} already holds a seat in class {}",
                current.user_id, to.class.id
            ),
        });
    }
    to.availability().ensure_seat(current.frame_size)?;

    if let Some(package_id) = current.package_id {
        let package = package
            .filter(|p| p.id == package_id)
            .ok_or_else(|| StudioError::not_found("package", package_id))?;
        ensure_class_type(package, &to.class)?;
    }

    // All checks passed.
    let mut cancelled = current.clone();
    cancelled.transition(ReservationStatus::Cancelled, now)?;
    cancelled.cancellation_reason = Some(format!("RESCHEDULED_TO:{}", to.class.id));
    cancelled.cancelled_at = Some(now);
    if let Some(slot) = from.reservations.iter_mut().find(|r| r.id == reservation_id) {
        *slot = cancelled.clone();
    }

    let reservation = Reservation {
        id: Uuid::new_v4(),
        class_id: to.class.id,
        status: ReservationStatus::Confirmed,
        cancellation_reason: None,
        cancelled_at: None,
        checked_in_at: None,
        created_at: now,
        updated_at: now,
        ..current
    };
    to.waitlist.discard_user(reservation.user_id);
    to.reservations.push(reservation.clone());
    to.sync_status(now);

    let promoted = from.promote(cancelled.frame_size, policy, now);
    from.sync_status(now);

    tracing::info!(
        "Reservation {} rescheduled from class {} to class {} as {}",
        cancelled.id,
        from.class.id,
        to.class.id,
        reservation.id
    );

    let mut notifications = vec![to
        .notification(NotificationKind::Rescheduled, &reservation, now)
        .with_payload(serde_json::json!({
            "from_class_id": from.class.id,
            "from_starts_at": from.class.starts_at,
            "class_title": to.class.title,
            "starts_at": to.class.starts_at,
        }))];
    if let Some(promotion) = &promoted {
        notifications.push(from.promotion_notification(promotion, now));
    }

    Ok(RescheduleOutcome {
        cancelled,
        reservation,
        promoted,
        notifications,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::tests::active_package;
    use crate::manager::tests::{book_for, now};
    use chrono::Duration;
    use tuft_catalog::ClassStatus;

    #[test]
    fn test_reschedule_moves_package_link() {
        let policy = BookingPolicy::default();
        let mut from = book_for(2, Duration::days(3));
        let mut to = book_for(2, Duration::days(5));
        let user = Uuid::new_v4();
        let mut package = active_package(user, 4, now());
        let booked = from.book(user, None, Some(&mut package), &policy, now()).unwrap();

        let outcome = reschedule(
            &mut from,
            &mut to,
            booked.reservation.id,
            &Caller::student(user),
            Some(&package),
            &policy,
            now(),
        )
        .unwrap();

        assert_eq!(outcome.cancelled.status, ReservationStatus::Cancelled);
        assert_eq!(outcome.reservation.class_id, to.class.id);
        assert_eq!(outcome.reservation.package_id, Some(package.id));
        assert_eq!(package.used_credits, 1);
        assert_eq!(from.active_count(), 0);
        assert_eq!(to.active_count(), 1);
        assert_eq!(outcome.notifications[0].kind, NotificationKind::Rescheduled);
    }

    #[test]
    fn test_reschedule_into_full_class_changes_nothing() {
        let policy = BookingPolicy::default();
        let mut from = book_for(2, Duration::days(3));
        let mut to = book_for(1, Duration::days(5));
        let user = Uuid::new_v4();
        let booked = from.book(user, None, None, &policy, now()).unwrap();
        to.book(Uuid::new_v4(), None, None, &policy, now()).unwrap();

        let err = reschedule(&mut from, &mut to, booked.reservation.id, &Caller::student(user), None, &policy, now())
            .unwrap_err();

        assert!(matches!(err, StudioError::CapacityExceeded { .. }));
        assert_eq!(from.reservation(booked.reservation.id).unwrap().status, ReservationStatus::Confirmed);
        assert_eq!(to.active_count(), 1);
    }

    #[test]
    fn test_reschedule_to_class_soon_rejected() {
        let policy = BookingPolicy::default();
        let mut from = book_for(2, Duration::days(3));
        let mut to = book_for(2, Duration::hours(12));
        let user = Uuid::new_v4();
        let booked = from.book(user, None, None, &policy, now()).unwrap();

        let err = reschedule(&mut from, &mut to, booked.reservation.id, &Caller::student(user), None, &policy, now())
            .unwrap_err();
        assert!(matches!(err, StudioError::CancellationWindowViolation { required_hours: 24, .. }));
    }

    #[test]
    fn test_reschedule_bound_package_mismatch() {
        let policy = BookingPolicy::default();
        let mut from = book_for(2, Duration::days(3));
        let mut to = book_for(2, Duration::days(5));
        let user = Uuid::new_v4();
        let mut package = active_package(user, 4, now());
        package.class_type_id = Some(from.class.class_type_id);
        let booked = from.book(user, None, Some(&mut package), &policy, now()).unwrap();

        let err = reschedule(
            &mut from,
            &mut to,
            booked.reservation.id,
            &Caller::student(user),
            Some(&package),
            &policy,
            now(),
        )
        .unwrap_err();
        assert!(matches!(err, StudioError::PackageClassTypeMismatch { .. }));
    }

    #[test]
    fn test_reschedule_frees_seat_for_waitlist() {
        let policy = BookingPolicy::default();
        let mut from = book_for(1, Duration::days(3));
        let mut to = book_for(2, Duration::days(5));
        let user = Uuid::new_v4();
        let waiting = Uuid::new_v4();
        let booked = from.book(user, None, None, &policy, now()).unwrap();
        from.waitlist.join(waiting, None, None, now()).unwrap();

        let outcome = reschedule(&mut from, &mut to, booked.reservation.id, &Caller::student(user), None, &policy, now())
            .unwrap();

        assert_eq!(outcome.promoted.unwrap().reservation.user_id, waiting);
        assert_eq!(from.class.status, ClassStatus::Full);
        assert_eq!(outcome.notifications.len(), 2);
    }
}
