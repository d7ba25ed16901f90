use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tuft_catalog::{Availability, Class, ClassStatus, FrameSize};
use tuft_core::{Caller, StudioError, StudioResult};
use tuft_shared::{Notification, NotificationKind};
use uuid::Uuid;

use crate::ledger::CreditLedger;
use crate::models::{CreditMovement, Package, Reservation, ReservationStatus, WaitlistEntry};
use crate::policy::BookingPolicy;
use crate::waitlist::Waitlist;

pub const PAYMENT_DEADLINE_REASON: &str = "payment deadline expired";

/// Who is cancelling. Admins and system sweeps skip the notice window.
#[derive(Debug, Clone)]
pub enum CancelActor {
    Caller(Caller),
    System,
}

impl CancelActor {
    pub fn bypasses_window(&self) -> bool {
        match self {
            CancelActor::Caller(caller) => caller.is_admin(),
            CancelActor::System => true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Promotion {
    pub reservation: Reservation,
    pub entry: WaitlistEntry,
}

#[derive(Debug, Clone, Serialize)]
pub struct BookingOutcome {
    pub reservation: Reservation,
    pub class_status: ClassStatus,
    pub credit: Option<CreditMovement>,
    #[serde(skip)]
    pub notifications: Vec<Notification>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancellationOutcome {
    pub reservation: Reservation,
    pub credit_restored: Option<CreditMovement>,
    pub promoted: Option<Promotion>,
    pub class_status: ClassStatus,
    #[serde(skip)]
    pub notifications: Vec<Notification>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapacityChangeOutcome {
    pub class: Class,
    pub promoted: Vec<Promotion>,
    #[serde(skip)]
    pub notifications: Vec<Notification>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CompletionOutcome {
    pub class: Class,
    pub completed: Vec<Uuid>,
    /// Still CONFIRMED when the class ended; left for staff to mark.
    pub unresolved: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassCancellationOutcome {
    pub class: Class,
    pub cancelled: Vec<Reservation>,
    pub credits_restored: Vec<CreditMovement>,
    pub waitlist_cleared: usize,
    #[serde(skip)]
    pub notifications: Vec<Notification>,
}

/// One class together with its reservations and waitlist.
///
/// Every operation validates first and mutates only after all checks pass,
/// so a returned error leaves the book untouched. Callers persist the book
/// and then dispatch the returned notifications.
#[derive(Debug, Clone)]
pub struct ClassBook {
    pub class: Class,
    pub reservations: Vec<Reservation>,
    pub waitlist: Waitlist,
}

impl ClassBook {
    pub fn new(class: Class) -> Self {
        let waitlist = Waitlist::new(class.id);
        Self {
            class,
            reservations: Vec::new(),
            waitlist,
        }
    }

    pub fn from_parts(class: Class, reservations: Vec<Reservation>, waitlist: Vec<WaitlistEntry>) -> Self {
        let waitlist = Waitlist::from_entries(class.id, waitlist);
        Self {
            class,
            reservations,
            waitlist,
        }
    }

    pub fn availability(&self) -> Availability {
        Availability::calculate(
            &self.class,
            self.reservations
                .iter()
                .filter(|r| r.is_active())
                .map(|r| r.frame_size),
        )
    }

    pub fn active_count(&self) -> u32 {
        self.reservations.iter().filter(|r| r.is_active()).count() as u32
    }

    pub fn reservation(&self, reservation_id: Uuid) -> StudioResult<&Reservation> {
        self.reservations
            .iter()
            .find(|r| r.id == reservation_id)
            .ok_or_else(|| StudioError::not_found("reservation", reservation_id))
    }

    pub fn active_reservation_for(&self, user_id: Uuid) -> Option<&Reservation> {
        self.reservations
            .iter()
            .find(|r| r.user_id == user_id && r.is_active())
    }

    fn index_of(&self, reservation_id: Uuid) -> StudioResult<usize> {
        self.reservations
            .iter()
            .position(|r| r.id == reservation_id)
            .ok_or_else(|| StudioError::not_found("reservation", reservation_id))
    }

    /// Open and not yet started.
    pub(crate) fn ensure_bookable(&self, now: DateTime<Utc>) -> StudioResult<()> {
        if !self.class.status.is_open() {
            return Err(StudioError::transition(
                "class",
                self.class.status.as_str(),
                "BOOKED",
            ));
        }
        if self.class.has_started(now) {
            return Err(StudioError::ValidationError(format!(
                "class {} has already started",
                self.class.id
            )));
        }
        Ok(())
    }

    pub(crate) fn ensure_frame_known(&self, frame_size: Option<FrameSize>) -> StudioResult<()> {
        match frame_size {
            Some(frame) if self.class.is_frame_typed() && !self.class.frame_capacity.contains_key(&frame) => {
                Err(StudioError::ValidationError(format!(
                    "class {} offers no {} frames",
                    self.class.id, frame
                )))
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn sync_status(&mut self, now: DateTime<Utc>) {
        let active = self.active_count();
        self.class.sync_fullness(active, now);
    }

    /// Books a seat, debiting one credit from `package` when given or
    /// starting a pay-later deadline otherwise. Removes the user's waitlist
    /// entry for this class if they had one.
    pub fn book(
        &mut self,
        user_id: Uuid,
        frame_size: Option<FrameSize>,
        package: Option<&mut Package>,
        policy: &BookingPolicy,
        now: DateTime<Utc>,
    ) -> StudioResult<BookingOutcome> {
        self.ensure_bookable(now)?;
        self.ensure_frame_known(frame_size)?;
        if self.active_reservation_for(user_id).is_some() {
            return Err(StudioError::AlreadyExists {
                entity: "reservation",
                detail: format!("user {} already holds a seat in class {}", user_id, self.class.id),
            });
        }
        self.availability().ensure_seat(frame_size)?;

        let reservation_id = Uuid::new_v4();
        let (reservation, credit) = match package {
            Some(package) => {
                if package.user_id != user_id {
                    return Err(StudioError::Unauthorized(format!(
                        "package {} belongs to another user",
                        package.id
                    )));
                }
                ensure_class_type(package, &self.class)?;
                // Last fallible step: nothing has been written yet.
                let movement = CreditLedger::debit(package, 1, Some(reservation_id), now)?;
                let reservation =
                    Reservation::funded(reservation_id, user_id, self.class.id, frame_size, package.id, now);
                (reservation, Some(movement))
            }
            None => {
                let reservation = Reservation::pay_later(
                    reservation_id,
                    user_id,
                    self.class.id,
                    frame_size,
                    now + policy.payment_deadline(),
                    now,
                );
                (reservation, None)
            }
        };

        self.waitlist.discard_user(user_id);
        self.reservations.push(reservation.clone());
        self.sync_status(now);

        tracing::info!(
            "Reservation {} confirmed for user {} in class {} ({} of {})",
            reservation.id,
            user_id,
            self.class.id,
            self.active_count(),
            self.class.capacity
        );

        let notifications = vec![self.notification(NotificationKind::BookingConfirmed, &reservation, now)];
        Ok(BookingOutcome {
            reservation,
            class_status: self.class.status,
            credit,
            notifications,
        })
    }

    /// Queues a user for a class that has no seat for them right now.
    pub fn join_waitlist(
        &mut self,
        user_id: Uuid,
        frame_size: Option<FrameSize>,
        priority: Option<u32>,
        now: DateTime<Utc>,
    ) -> StudioResult<WaitlistEntry> {
        self.ensure_bookable(now)?;
        self.ensure_frame_known(frame_size)?;
        if self.active_reservation_for(user_id).is_some() {
            return Err(StudioError::AlreadyExists {
                entity: "reservation",
                detail: format!("user {} already holds a seat in class {}", user_id, self.class.id),
            });
        }
        if self.availability().has_seat(frame_size) {
            return Err(StudioError::ValidationError(format!(
                "class {} has a free seat; book it instead",
                self.class.id
            )));
        }
        let entry = self.waitlist.join(user_id, frame_size, priority, now)?;
        tracing::info!(
            "User {} joined waitlist of class {} at position {}",
            user_id,
            self.class.id,
            entry.priority
        );
        Ok(entry)
    }

    /// Cancels an active reservation, returns its credit and offers the seat
    /// to the waitlist.
    pub fn cancel(
        &mut self,
        reservation_id: Uuid,
        actor: &CancelActor,
        reason: Option<String>,
        package: Option<&mut Package>,
        policy: &BookingPolicy,
        now: DateTime<Utc>,
    ) -> StudioResult<CancellationOutcome> {
        let index = self.index_of(reservation_id)?;
        let current = &self.reservations[index];

        if let CancelActor::Caller(caller) = actor {
            caller.ensure_can_act_for(current.user_id, "reservation")?;
        }
        if !current.status.can_transition_to(ReservationStatus::Cancelled) {
            return Err(StudioError::transition(
                "reservation",
                current.status.as_str(),
                ReservationStatus::Cancelled.as_str(),
            ));
        }
        let remaining = self.class.time_until_start(now);
        if remaining <= chrono::Duration::zero()
            || (!actor.bypasses_window() && remaining < policy.cancellation_window())
        {
            return Err(StudioError::CancellationWindowViolation {
                minutes_remaining: remaining.num_minutes(),
                required_hours: policy.cancellation_window_hours,
            });
        }
        let package = match current.package_id {
            Some(package_id) => match package {
                Some(p) if p.id == package_id => Some(p),
                _ => return Err(StudioError::not_found("package", package_id)),
            },
            None => None,
        };

        let reservation = &mut self.reservations[index];
        reservation.transition(ReservationStatus::Cancelled, now)?;
        reservation.cancellation_reason = reason;
        reservation.cancelled_at = Some(now);
        let reservation = reservation.clone();

        let credit_restored =
            package.map(|p| CreditLedger::restore(p, 1, Some(reservation.id), now));

        let promoted = self.promote(reservation.frame_size, policy, now);
        self.sync_status(now);

        tracing::info!(
            "Reservation {} cancelled in class {}; promoted: {}",
            reservation.id,
            self.class.id,
            promoted.as_ref().map(|p| p.reservation.user_id.to_string()).unwrap_or_else(|| "none".to_string())
        );

        let mut notifications = vec![self
            .notification(NotificationKind::BookingCancelled, &reservation, now)
            .with_payload(serde_json::json!({
                "class_title": self.class.title,
                "starts_at": self.class.starts_at,
                "reason": reservation.cancellation_reason,
            }))];
        if let Some(promotion) = &promoted {
            notifications.push(self.promotion_notification(promotion, now));
        }

        Ok(CancellationOutcome {
            reservation,
            credit_restored,
            promoted,
            class_status: self.class.status,
            notifications,
        })
    }

    /// Offers one free seat to the first eligible waitlist entry. The promoted
    /// reservation is unfunded with a fresh payment deadline.
    pub fn promote(
        &mut self,
        vacated: Option<FrameSize>,
        policy: &BookingPolicy,
        now: DateTime<Utc>,
    ) -> Option<Promotion> {
        if !self.class.status.is_open() || self.class.has_started(now) {
            return None;
        }

        loop {
            let availability = self.availability();
            let candidate = self
                .waitlist
                .next_candidate(&availability, vacated, policy.frame_matching)?
                .clone();
            self.waitlist.remove_entry(candidate.id).ok()?;

            if self.active_reservation_for(candidate.user_id).is_some() {
                tracing::warn!(
                    "Dropping stale waitlist entry {} for user {} who already holds a seat",
                    candidate.id,
                    candidate.user_id
                );
                continue;
            }

            let reservation = Reservation::pay_later(
                Uuid::new_v4(),
                candidate.user_id,
                self.class.id,
                candidate.frame_size,
                now + policy.payment_deadline(),
                now,
            );
            self.reservations.push(reservation.clone());

            tracing::info!(
                "Promoted user {} from waitlist position {} in class {}",
                candidate.user_id,
                candidate.priority,
                self.class.id
            );

            return Some(Promotion {
                reservation,
                entry: candidate,
            });
        }
    }

    /// Fills every free seat from the waitlist.
    pub fn promote_all(&mut self, policy: &BookingPolicy, now: DateTime<Utc>) -> Vec<Promotion> {
        let mut promoted = Vec::new();
        while let Some(promotion) = self.promote(None, policy, now) {
            promoted.push(promotion);
        }
        promoted
    }

    /// Changes seat counts. Never drops below the seats already taken;
    /// added seats are filled from the waitlist.
    pub fn set_capacity(
        &mut self,
        capacity: u32,
        frame_capacity: Option<BTreeMap<FrameSize, u32>>,
        policy: &BookingPolicy,
        now: DateTime<Utc>,
    ) -> StudioResult<CapacityChangeOutcome> {
        if !self.class.status.is_open() {
            return Err(StudioError::transition(
                "class",
                self.class.status.as_str(),
                "RESIZED",
            ));
        }
        if capacity == 0 {
            return Err(StudioError::ValidationError(
                "class capacity must be at least 1".to_string(),
            ));
        }
        let availability = self.availability();
        if capacity < availability.active {
            return Err(StudioError::ValidationError(format!(
                "capacity {} is below the {} seats already taken",
                capacity, availability.active
            )));
        }
        if let Some(frames) = &frame_capacity {
            for (frame, bucket) in &availability.frames {
                let next = frames.get(frame).copied().unwrap_or(0);
                if next < bucket.active {
                    return Err(StudioError::ValidationError(format!(
                        "{} frame capacity {} is below the {} seats already taken",
                        frame, next, bucket.active
                    )));
                }
            }
        }

        self.class.capacity = capacity;
        if let Some(frames) = frame_capacity {
            self.class.frame_capacity = frames;
        }
        self.class.updated_at = now;

        let promoted = self.promote_all(policy, now);
        self.sync_status(now);

        let notifications = promoted
            .iter()
            .map(|p| self.promotion_notification(p, now))
            .collect();

        Ok(CapacityChangeOutcome {
            class: self.class.clone(),
            promoted,
            notifications,
        })
    }

    pub fn check_in(&mut self, reservation_id: Uuid, now: DateTime<Utc>) -> StudioResult<Reservation> {
        if !matches!(
            self.class.status,
            ClassStatus::Scheduled | ClassStatus::Full | ClassStatus::InProgress
        ) {
            return Err(StudioError::transition(
                "class",
                self.class.status.as_str(),
                "CHECK_IN",
            ));
        }
        let index = self.index_of(reservation_id)?;
        let reservation = &mut self.reservations[index];
        reservation.transition(ReservationStatus::CheckedIn, now)?;
        reservation.checked_in_at = Some(now);
        Ok(reservation.clone())
    }

    /// Staff marks a CONFIRMED student absent. The seat stays consumed.
    pub fn mark_no_show(&mut self, reservation_id: Uuid, now: DateTime<Utc>) -> StudioResult<Reservation> {
        let index = self.index_of(reservation_id)?;
        let reservation = &mut self.reservations[index];
        reservation.transition(ReservationStatus::NoShow, now)?;
        Ok(reservation.clone())
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> StudioResult<Class> {
        self.class.start(now)?;
        tracing::info!("Class {} started", self.class.id);
        Ok(self.class.clone())
    }

    /// IN_PROGRESS → COMPLETED. Every CHECKED_IN reservation completes with it.
    pub fn complete(&mut self, now: DateTime<Utc>) -> StudioResult<CompletionOutcome> {
        if self.class.status != ClassStatus::InProgress {
            return Err(StudioError::NotInProgress(self.class.id));
        }
        if !self
            .reservations
            .iter()
            .any(|r| r.status == ReservationStatus::CheckedIn)
        {
            return Err(StudioError::NoCheckedInStudents(self.class.id));
        }

        let mut completed = Vec::new();
        let mut unresolved = Vec::new();
        for reservation in &mut self.reservations {
            match reservation.status {
                ReservationStatus::CheckedIn => {
                    reservation.transition(ReservationStatus::Completed, now)?;
                    completed.push(reservation.id);
                }
                ReservationStatus::Confirmed => unresolved.push(reservation.id),
                _ => {}
            }
        }
        self.class.update_status(ClassStatus::Completed, now);

        tracing::info!(
            "Class {} completed: {} attended, {} unresolved",
            self.class.id,
            completed.len(),
            unresolved.len()
        );

        Ok(CompletionOutcome {
            class: self.class.clone(),
            completed,
            unresolved,
        })
    }

    /// Cancels the whole class: every active reservation is cancelled with
    /// its credit returned and the waitlist is cleared.
    pub fn cancel_class(
        &mut self,
        reason: Option<String>,
        packages: &mut HashMap<Uuid, Package>,
        now: DateTime<Utc>,
    ) -> StudioResult<ClassCancellationOutcome> {
        if !self.class.status.is_open() {
            return Err(StudioError::transition(
                "class",
                self.class.status.as_str(),
                ClassStatus::Cancelled.as_str(),
            ));
        }
        for reservation in self.reservations.iter().filter(|r| r.is_active()) {
            if let Some(package_id) = reservation.package_id {
                if !packages.contains_key(&package_id) {
                    return Err(StudioError::not_found("package", package_id));
                }
            }
        }

        let reason = reason.unwrap_or_else(|| "CLASS_CANCELLED".to_string());
        let mut cancelled = Vec::new();
        let mut credits_restored = Vec::new();
        for reservation in self.reservations.iter_mut().filter(|r| r.is_active()) {
            reservation.transition(ReservationStatus::Cancelled, now)?;
            reservation.cancellation_reason = Some(reason.clone());
            reservation.cancelled_at = Some(now);
            if let Some(package) = reservation.package_id.and_then(|id| packages.get_mut(&id)) {
                credits_restored.push(CreditLedger::restore(package, 1, Some(reservation.id), now));
            }
            cancelled.push(reservation.clone());
        }
        let waitlisted = self.waitlist.clear();
        self.class.update_status(ClassStatus::Cancelled, now);

        let payload = serde_json::json!({
            "class_title": self.class.title,
            "starts_at": self.class.starts_at,
            "reason": reason,
        });
        let mut notifications: Vec<Notification> = cancelled
            .iter()
            .map(|r| {
                Notification::new(NotificationKind::ClassCancelled, r.user_id, now)
                    .for_class(self.class.id)
                    .for_reservation(r.id)
                    .with_payload(payload.clone())
            })
            .collect();
        notifications.extend(waitlisted.iter().map(|e| {
            Notification::new(NotificationKind::ClassCancelled, e.user_id, now)
                .for_class(self.class.id)
                .with_payload(payload.clone())
        }));

        tracing::info!(
            "Class {} cancelled: {} reservations, {} waitlisted",
            self.class.id,
            cancelled.len(),
            waitlisted.len()
        );

        Ok(ClassCancellationOutcome {
            class: self.class.clone(),
            cancelled,
            credits_restored,
            waitlist_cleared: waitlisted.len(),
            notifications,
        })
    }

    /// Marks a pay-later reservation as paid; its deadline no longer applies.
    pub fn record_payment(&mut self, reservation_id: Uuid, now: DateTime<Utc>) -> StudioResult<Reservation> {
        let index = self.index_of(reservation_id)?;
        let reservation = &mut self.reservations[index];
        if !reservation.is_active() {
            return Err(StudioError::transition(
                "reservation",
                reservation.status.as_str(),
                "PAID",
            ));
        }
        if reservation.is_funded() || reservation.paid_at.is_some() {
            return Err(StudioError::ValidationError(format!(
                "reservation {} has nothing left to pay",
                reservation.id
            )));
        }
        reservation.paid_at = Some(now);
        reservation.payment_deadline = None;
        reservation.updated_at = now;
        Ok(reservation.clone())
    }

    pub fn overdue_reservations(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        if self.class.has_started(now) || !self.class.status.is_open() {
            return Vec::new();
        }
        self.reservations
            .iter()
            .filter(|r| r.is_payment_overdue(now))
            .map(|r| r.id)
            .collect()
    }

    /// System cancellation of every unpaid reservation past its deadline.
    pub fn cancel_overdue_payments(
        &mut self,
        policy: &BookingPolicy,
        now: DateTime<Utc>,
    ) -> StudioResult<Vec<CancellationOutcome>> {
        let mut outcomes = Vec::new();
        for reservation_id in self.overdue_reservations(now) {
            let outcome = self.cancel(
                reservation_id,
                &CancelActor::System,
                Some(PAYMENT_DEADLINE_REASON.to_string()),
                None,
                policy,
                now,
            )?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    pub(crate) fn notification(
        &self,
        kind: NotificationKind,
        reservation: &Reservation,
        now: DateTime<Utc>,
    ) -> Notification {
        Notification::new(kind, reservation.user_id, now)
            .for_class(self.class.id)
            .for_reservation(reservation.id)
            .with_payload(serde_json::json!({
                "class_title": self.class.title,
                "location": self.class.location,
                "starts_at": self.class.starts_at,
                "frame_size": reservation.frame_size,
            }))
    }

    pub(crate) fn promotion_notification(&self, promotion: &Promotion, now: DateTime<Utc>) -> Notification {
        Notification::new(NotificationKind::WaitlistPromoted, promotion.reservation.user_id, now)
            .for_class(self.class.id)
            .for_reservation(promotion.reservation.id)
            .with_payload(serde_json::json!({
                "class_title": self.class.title,
                "starts_at": self.class.starts_at,
                "payment_deadline": promotion.reservation.payment_deadline,
            }))
    }
}

pub(crate) fn ensure_class_type(package: &Package, class: &Class) -> StudioResult<()> {
    match package.class_type_id {
        Some(class_type_id) if class_type_id != class.class_type_id => {
            Err(StudioError::PackageClassTypeMismatch {
                package_id: package.id,
                package_class_type: class_type_id,
                target_class_type: class.class_type_id,
            })
        }
        _ => Ok(()),
    }
}
