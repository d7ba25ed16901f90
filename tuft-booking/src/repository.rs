use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tuft_catalog::{
    Availability, Class, FrameSize, GenerateRequest, GenerationOutcome, Holiday, NewClass,
    PatternGenerator, RecurringClassPattern,
};
use tuft_core::{Caller, StudioResult};
use uuid::Uuid;

use crate::changes::RescheduleOutcome;
use crate::expiry::ExpirySweep;
use crate::manager::{
    BookingOutcome, CancelActor, CancellationOutcome, CapacityChangeOutcome,
    ClassCancellationOutcome, CompletionOutcome,
};
use crate::models::{CreditMovement, NewPackage, Package, Reservation, WaitlistEntry};
use crate::policy::BookingPolicy;
use crate::studio::Studio;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookRequest {
    pub class_id: Uuid,
    pub user_id: Uuid,
    #[serde(default)]
    pub frame_size: Option<FrameSize>,
    #[serde(default)]
    pub package_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassView {
    pub class: Class,
    pub availability: Availability,
    pub waitlist_length: usize,
}

/// Transactional access to the studio. Each mutating call is atomic: it
/// either applies completely or leaves storage as it was.
#[async_trait]
pub trait BookingRepository: Send + Sync {
    fn policy(&self) -> BookingPolicy;

    async fn create_class(&self, new: NewClass, now: DateTime<Utc>) -> StudioResult<Class>;
    async fn get_class(&self, class_id: Uuid) -> StudioResult<ClassView>;
    async fn list_classes(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> StudioResult<Vec<Class>>;
    async fn update_capacity(
        &self,
        class_id: Uuid,
        capacity: u32,
        frame_capacity: Option<BTreeMap<FrameSize, u32>>,
        now: DateTime<Utc>,
    ) -> StudioResult<CapacityChangeOutcome>;
    async fn start_class(&self, class_id: Uuid, now: DateTime<Utc>) -> StudioResult<Class>;
    async fn complete_class(&self, class_id: Uuid, now: DateTime<Utc>) -> StudioResult<CompletionOutcome>;
    async fn cancel_class(
        &self,
        class_id: Uuid,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> StudioResult<ClassCancellationOutcome>;
    async fn start_due_classes(&self, now: DateTime<Utc>) -> StudioResult<Vec<Uuid>>;

    async fn book(&self, caller: &Caller, request: &BookRequest, now: DateTime<Utc>) -> StudioResult<BookingOutcome>;
    async fn cancel_reservation(
        &self,
        actor: &CancelActor,
        reservation_id: Uuid,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> StudioResult<CancellationOutcome>;
    async fn reschedule(
        &self,
        caller: &Caller,
        reservation_id: Uuid,
        target_class_id: Uuid,
        now: DateTime<Utc>,
    ) -> StudioResult<RescheduleOutcome>;
    async fn check_in(&self, reservation_id: Uuid, now: DateTime<Utc>) -> StudioResult<Reservation>;
    async fn mark_no_show(&self, reservation_id: Uuid, now: DateTime<Utc>) -> StudioResult<Reservation>;
    async fn record_payment(&self, reservation_id: Uuid, now: DateTime<Utc>) -> StudioResult<Reservation>;
    async fn get_reservation(&self, reservation_id: Uuid) -> StudioResult<Reservation>;
    async fn list_user_reservations(&self, user_id: Uuid) -> StudioResult<Vec<Reservation>>;
    async fn cancel_overdue_payments(&self, now: DateTime<Utc>) -> StudioResult<Vec<CancellationOutcome>>;

    async fn join_waitlist(
        &self,
        caller: &Caller,
        class_id: Uuid,
        user_id: Uuid,
        frame_size: Option<FrameSize>,
        now: DateTime<Utc>,
    ) -> StudioResult<WaitlistEntry>;
    async fn leave_waitlist(&self, caller: &Caller, class_id: Uuid, user_id: Uuid) -> StudioResult<WaitlistEntry>;
    async fn reorder_waitlist(
        &self,
        class_id: Uuid,
        entry_id: Uuid,
        new_priority: u32,
    ) -> StudioResult<Vec<WaitlistEntry>>;
    async fn list_waitlist(&self, class_id: Uuid) -> StudioResult<Vec<WaitlistEntry>>;

    async fn create_package(&self, new: NewPackage, now: DateTime<Utc>) -> StudioResult<Package>;
    async fn activate_package(&self, package_id: Uuid, now: DateTime<Utc>) -> StudioResult<Package>;
    async fn get_package(&self, package_id: Uuid) -> StudioResult<Package>;
    async fn list_user_packages(&self, user_id: Uuid) -> StudioResult<Vec<Package>>;
    async fn list_credit_movements(&self, package_id: Uuid) -> StudioResult<Vec<CreditMovement>>;
    async fn sweep_package_expiry(&self, now: DateTime<Utc>) -> StudioResult<ExpirySweep>;

    async fn create_pattern(&self, pattern: RecurringClassPattern) -> StudioResult<RecurringClassPattern>;
    async fn list_patterns(&self) -> StudioResult<Vec<RecurringClassPattern>>;
    async fn add_holiday(&self, holiday: Holiday) -> StudioResult<Holiday>;
    async fn list_holidays(&self) -> StudioResult<Vec<Holiday>>;
    async fn generate_classes(
        &self,
        pattern_id: Uuid,
        request: &GenerateRequest,
        now: DateTime<Utc>,
    ) -> StudioResult<GenerationOutcome>;
}

/// Process-local repository. One lock serializes every operation.
pub struct MemoryBookingRepository {
    studio: Mutex<Studio>,
    policy: BookingPolicy,
}

impl MemoryBookingRepository {
    pub fn new(policy: BookingPolicy, generator: PatternGenerator) -> Self {
        Self {
            studio: Mutex::new(Studio::new(policy.clone(), generator)),
            policy,
        }
    }
}

impl Default for MemoryBookingRepository {
    fn default() -> Self {
        Self::new(BookingPolicy::default(), PatternGenerator::utc())
    }
}

#[async_trait]
impl BookingRepository for MemoryBookingRepository {
    fn policy(&self) -> BookingPolicy {
        self.policy.clone()
    }

    async fn create_class(&self, new: NewClass, now: DateTime<Utc>) -> StudioResult<Class> {
        self.studio.lock().await.create_class(new, now)
    }

    async fn get_class(&self, class_id: Uuid) -> StudioResult<ClassView> {
        self.studio.lock().await.class_view(class_id)
    }

    async fn list_classes(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> StudioResult<Vec<Class>> {
        Ok(self.studio.lock().await.list_classes(from, to))
    }

    async fn update_capacity(
        &self,
        class_id: Uuid,
        capacity: u32,
        frame_capacity: Option<BTreeMap<FrameSize, u32>>,
        now: DateTime<Utc>,
    ) -> StudioResult<CapacityChangeOutcome> {
        self.studio
            .lock()
            .await
            .update_capacity(class_id, capacity, frame_capacity, now)
    }

    async fn start_class(&self, class_id: Uuid, now: DateTime<Utc>) -> StudioResult<Class> {
        self.studio.lock().await.start_class(class_id, now)
    }

    async fn complete_class(&self, class_id: Uuid, now: DateTime<Utc>) -> StudioResult<CompletionOutcome> {
        self.studio.lock().await.complete_class(class_id, now)
    }

    async fn cancel_class(
        &self,
        class_id: Uuid,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> StudioResult<ClassCancellationOutcome> {
        self.studio.lock().await.cancel_class(class_id, reason, now)
    }

    async fn start_due_classes(&self, now: DateTime<Utc>) -> StudioResult<Vec<Uuid>> {
        Ok(self.studio.lock().await.start_due_classes(now))
    }

    async fn book(&self, caller: &Caller, request: &BookRequest, now: DateTime<Utc>) -> StudioResult<BookingOutcome> {
        self.studio.lock().await.book_seat(caller, request, now)
    }

    async fn cancel_reservation(
        &self,
        actor: &CancelActor,
        reservation_id: Uuid,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> StudioResult<CancellationOutcome> {
        self.studio
            .lock()
            .await
            .cancel_reservation(actor, reservation_id, reason, now)
    }

    async fn reschedule(
        &self,
        caller: &Caller,
        reservation_id: Uuid,
        target_class_id: Uuid,
        now: DateTime<Utc>,
    ) -> StudioResult<RescheduleOutcome> {
        self.studio
            .lock()
            .await
            .reschedule(caller, reservation_id, target_class_id, now)
    }

    async fn check_in(&self, reservation_id: Uuid, now: DateTime<Utc>) -> StudioResult<Reservation> {
        self.studio.lock().await.check_in(reservation_id, now)
    }

    async fn mark_no_show(&self, reservation_id: Uuid, now: DateTime<Utc>) -> StudioResult<Reservation> {
        self.studio.lock().await.mark_no_show(reservation_id, now)
    }

    async fn record_payment(&self, reservation_id: Uuid, now: DateTime<Utc>) -> StudioResult<Reservation> {
        self.studio.lock().await.record_payment(reservation_id, now)
    }

    async fn get_reservation(&self, reservation_id: Uuid) -> StudioResult<Reservation> {
        self.studio.lock().await.reservation(reservation_id)
    }

    async fn list_user_reservations(&self, user_id: Uuid) -> StudioResult<Vec<Reservation>> {
        Ok(self.studio.lock().await.user_reservations(user_id))
    }

    async fn cancel_overdue_payments(&self, now: DateTime<Utc>) -> StudioResult<Vec<CancellationOutcome>> {
        self.studio.lock().await.cancel_overdue_payments(now)
    }

    async fn join_waitlist(
        &self,
        caller: &Caller,
        class_id: Uuid,
        user_id: Uuid,
        frame_size: Option<FrameSize>,
        now: DateTime<Utc>,
    ) -> StudioResult<WaitlistEntry> {
        self.studio
            .lock()
            .await
            .join_waitlist(caller, class_id, user_id, frame_size, now)
    }

    async fn leave_waitlist(&self, caller: &Caller, class_id: Uuid, user_id: Uuid) -> StudioResult<WaitlistEntry> {
        self.studio.lock().await.leave_waitlist(caller, class_id, user_id)
    }

    async fn reorder_waitlist(
        &self,
        class_id: Uuid,
        entry_id: Uuid,
        new_priority: u32,
    ) -> StudioResult<Vec<WaitlistEntry>> {
        self.studio
            .lock()
            .await
            .reorder_waitlist(class_id, entry_id, new_priority)
    }

    async fn list_waitlist(&self, class_id: Uuid) -> StudioResult<Vec<WaitlistEntry>> {
        self.studio.lock().await.waitlist(class_id)
    }

    async fn create_package(&self, new: NewPackage, now: DateTime<Utc>) -> StudioResult<Package> {
        self.studio.lock().await.create_package(new, now)
    }

    async fn activate_package(&self, package_id: Uuid, now: DateTime<Utc>) -> StudioResult<Package> {
        self.studio.lock().await.activate_package(package_id, now)
    }

    async fn get_package(&self, package_id: Uuid) -> StudioResult<Package> {
        self.studio.lock().await.package(package_id)
    }

    async fn list_user_packages(&self, user_id: Uuid) -> StudioResult<Vec<Package>> {
        Ok(self.studio.lock().await.user_packages(user_id))
    }

    async fn list_credit_movements(&self, package_id: Uuid) -> StudioResult<Vec<CreditMovement>> {
        Ok(self.studio.lock().await.credit_movements(package_id))
    }

    async fn sweep_package_expiry(&self, now: DateTime<Utc>) -> StudioResult<ExpirySweep> {
        Ok(self.studio.lock().await.sweep_package_expiry(now))
    }

    async fn create_pattern(&self, pattern: RecurringClassPattern) -> StudioResult<RecurringClassPattern> {
        self.studio.lock().await.create_pattern(pattern)
    }

    async fn list_patterns(&self) -> StudioResult<Vec<RecurringClassPattern>> {
        Ok(self.studio.lock().await.patterns())
    }

    async fn add_holiday(&self, holiday: Holiday) -> StudioResult<Holiday> {
        self.studio.lock().await.add_holiday(holiday)
    }

    async fn list_holidays(&self) -> StudioResult<Vec<Holiday>> {
        Ok(self.studio.lock().await.holidays())
    }

    async fn generate_classes(
        &self,
        pattern_id: Uuid,
        request: &GenerateRequest,
        now: DateTime<Utc>,
    ) -> StudioResult<GenerationOutcome> {
        self.studio
            .lock()
            .await
            .generate_classes(pattern_id, request, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;
    use tuft_core::StudioError;

    fn new_class(capacity: u32, now: DateTime<Utc>) -> NewClass {
        let starts_at = now + Duration::days(2);
        NewClass {
            class_type_id: Uuid::new_v4(),
            title: "Coaster Set".to_string(),
            location: "Studio C".to_string(),
            instructor_id: None,
            starts_at,
            ends_at: starts_at + Duration::hours(2),
            capacity,
            frame_capacity: BTreeMap::new(),
            price_cents: 4500,
        }
    }

    #[tokio::test]
    async fn test_concurrent_bookings_never_oversell() {
        let repo = Arc::new(MemoryBookingRepository::default());
        let now = Utc::now();
        let class = repo.create_class(new_class(3, now), now).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                let user_id = Uuid::new_v4();
                let request = BookRequest {
                    class_id: class.id,
                    user_id,
                    frame_size: None,
                    package_id: None,
                };
                repo.book(&Caller::student(user_id), &request, now).await
            }));
        }

        let mut confirmed = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => confirmed += 1,
                Err(StudioError::CapacityExceeded { .. }) => rejected += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(confirmed, 3);
        assert_eq!(rejected, 7);
        assert_eq!(repo.get_class(class.id).await.unwrap().availability.available, 0);
    }

    #[tokio::test]
    async fn test_missing_class_is_not_found() {
        let repo = MemoryBookingRepository::default();
        assert!(matches!(
            repo.get_class(Uuid::new_v4()).await,
            Err(StudioError::NotFound { entity: "class", .. })
        ));
    }
}
