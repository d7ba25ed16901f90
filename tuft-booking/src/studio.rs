use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tuft_catalog::{
    Class, FrameSize, GenerateRequest, GenerationOutcome, Holiday, HolidayCalendar, NewClass,
    PatternGenerator, RecurringClassPattern, SlotKey,
};
use tuft_core::{Caller, StudioError, StudioResult};
use uuid::Uuid;

use crate::changes::{reschedule, RescheduleOutcome};
use crate::expiry::{ExpirySweep, PackageExpirySweeper};
use crate::manager::{
    BookingOutcome, CancelActor, CancellationOutcome, CapacityChangeOutcome, ClassBook,
    ClassCancellationOutcome, CompletionOutcome,
};
use crate::models::{CreditMovement, NewPackage, Package, Reservation, WaitlistEntry};
use crate::policy::BookingPolicy;
use crate::repository::{BookRequest, ClassView};

/// The whole studio held in memory.
///
/// Each operation works on copies of the class books and packages it touches
/// and writes them back only when the operation succeeds.
pub struct Studio {
    policy: BookingPolicy,
    generator: PatternGenerator,
    books: HashMap<Uuid, ClassBook>,
    packages: HashMap<Uuid, Package>,
    patterns: HashMap<Uuid, RecurringClassPattern>,
    holidays: Vec<Holiday>,
    credit_movements: Vec<CreditMovement>,
}

impl Studio {
    pub fn new(policy: BookingPolicy, generator: PatternGenerator) -> Self {
        Self {
            policy,
            generator,
            books: HashMap::new(),
            packages: HashMap::new(),
            patterns: HashMap::new(),
            holidays: Vec::new(),
            credit_movements: Vec::new(),
        }
    }

    pub fn policy(&self) -> &BookingPolicy {
        &self.policy
    }

    // Classes

    pub fn create_class(&mut self, new: NewClass, now: DateTime<Utc>) -> StudioResult<Class> {
        let class = Class::new(new, now)?;
        self.books.insert(class.id, ClassBook::new(class.clone()));
        Ok(class)
    }

    pub fn class_view(&self, class_id: Uuid) -> StudioResult<ClassView> {
        let book = self.book(class_id)?;
        Ok(ClassView {
            class: book.class.clone(),
            availability: book.availability(),
            waitlist_length: book.waitlist.len(),
        })
    }

    pub fn list_classes(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Class> {
        let mut classes: Vec<Class> = self
            .books
            .values()
            .map(|b| b.class.clone())
            .filter(|c| c.starts_at >= from && c.starts_at < to)
            .collect();
        classes.sort_by_key(|c| c.starts_at);
        classes
    }

    pub fn update_capacity(
        &mut self,
        class_id: Uuid,
        capacity: u32,
        frame_capacity: Option<BTreeMap<FrameSize, u32>>,
        now: DateTime<Utc>,
    ) -> StudioResult<CapacityChangeOutcome> {
        let mut book = self.book(class_id)?.clone();
        let outcome = book.set_capacity(capacity, frame_capacity, &self.policy, now)?;
        self.books.insert(class_id, book);
        Ok(outcome)
    }

    pub fn start_class(&mut self, class_id: Uuid, now: DateTime<Utc>) -> StudioResult<Class> {
        let mut book = self.book(class_id)?.clone();
        let class = book.start(now)?;
        self.books.insert(class_id, book);
        Ok(class)
    }

    pub fn complete_class(&mut self, class_id: Uuid, now: DateTime<Utc>) -> StudioResult<CompletionOutcome> {
        let mut book = self.book(class_id)?.clone();
        let outcome = book.complete(now)?;
        self.books.insert(class_id, book);
        Ok(outcome)
    }

    pub fn cancel_class(
        &mut self,
        class_id: Uuid,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> StudioResult<ClassCancellationOutcome> {
        let mut book = self.book(class_id)?.clone();
        let mut packages: HashMap<Uuid, Package> = book
            .reservations
            .iter()
            .filter(|r| r.is_active())
            .filter_map(|r| r.package_id)
            .filter_map(|id| self.packages.get(&id).map(|p| (id, p.clone())))
            .collect();
        let outcome = book.cancel_class(reason, &mut packages, now)?;
        self.books.insert(class_id, book);
        self.packages.extend(packages);
        self.credit_movements.extend(outcome.credits_restored.iter().cloned());
        Ok(outcome)
    }

    /// Open classes whose start time has passed move to IN_PROGRESS.
    pub fn start_due_classes(&mut self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut started = Vec::new();
        for book in self.books.values_mut() {
            if book.class.status.is_open() && book.class.has_started(now) && book.start(now).is_ok() {
                started.push(book.class.id);
            }
        }
        started
    }

    // Reservations

    pub fn book_seat(
        &mut self,
        caller: &Caller,
        request: &BookRequest,
        now: DateTime<Utc>,
    ) -> StudioResult<BookingOutcome> {
        caller.ensure_can_act_for(request.user_id, "booking")?;
        let mut book = self.book(request.class_id)?.clone();
        let mut package = match request.package_id {
            Some(id) => Some(self.package(id)?),
            None => None,
        };
        let outcome = book.book(request.user_id, request.frame_size, package.as_mut(), &self.policy, now)?;
        self.books.insert(request.class_id, book);
        if let Some(package) = package {
            self.packages.insert(package.id, package);
        }
        self.credit_movements.extend(outcome.credit.iter().cloned());
        Ok(outcome)
    }

    pub fn cancel_reservation(
        &mut self,
        actor: &CancelActor,
        reservation_id: Uuid,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> StudioResult<CancellationOutcome> {
        let class_id = self.class_of_reservation(reservation_id)?;
        let mut book = self.book(class_id)?.clone();
        let mut package = match book.reservation(reservation_id)?.package_id {
            Some(id) => Some(self.package(id)?),
            None => None,
        };
        let outcome = book.cancel(reservation_id, actor, reason, package.as_mut(), &self.policy, now)?;
        self.books.insert(class_id, book);
        if let Some(package) = package {
            self.packages.insert(package.id, package);
        }
        self.credit_movements.extend(outcome.credit_restored.iter().cloned());
        Ok(outcome)
    }

    pub fn reschedule(
        &mut self,
        caller: &Caller,
        reservation_id: Uuid,
        target_class_id: Uuid,
        now: DateTime<Utc>,
    ) -> StudioResult<RescheduleOutcome> {
        let class_id = self.class_of_reservation(reservation_id)?;
        if class_id == target_class_id {
            return Err(StudioError::ValidationError(
                "reservation is already in that class".to_string(),
            ));
        }
        let mut from = self.book(class_id)?.clone();
        let mut to = self.book(target_class_id)?.clone();
        let package = match from.reservation(reservation_id)?.package_id {
            Some(id) => Some(self.package(id)?),
            None => None,
        };
        let outcome = reschedule(&mut from, &mut to, reservation_id, caller, package.as_ref(), &self.policy, now)?;
        self.books.insert(class_id, from);
        self.books.insert(target_class_id, to);
        Ok(outcome)
    }

    pub fn check_in(&mut self, reservation_id: Uuid, now: DateTime<Utc>) -> StudioResult<Reservation> {
        self.with_reservation_book(reservation_id, |book| book.check_in(reservation_id, now))
    }

    pub fn mark_no_show(&mut self, reservation_id: Uuid, now: DateTime<Utc>) -> StudioResult<Reservation> {
        self.with_reservation_book(reservation_id, |book| book.mark_no_show(reservation_id, now))
    }

    pub fn record_payment(&mut self, reservation_id: Uuid, now: DateTime<Utc>) -> StudioResult<Reservation> {
        self.with_reservation_book(reservation_id, |book| book.record_payment(reservation_id, now))
    }

    pub fn reservation(&self, reservation_id: Uuid) -> StudioResult<Reservation> {
        let class_id = self.class_of_reservation(reservation_id)?;
        self.book(class_id)?.reservation(reservation_id).cloned()
    }

    pub fn user_reservations(&self, user_id: Uuid) -> Vec<Reservation> {
        let mut reservations: Vec<Reservation> = self
            .books
            .values()
            .flat_map(|b| b.reservations.iter())
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        reservations.sort_by_key(|r| r.created_at);
        reservations
    }

    pub fn cancel_overdue_payments(&mut self, now: DateTime<Utc>) -> StudioResult<Vec<CancellationOutcome>> {
        let due: Vec<Uuid> = self
            .books
            .values()
            .filter(|b| !b.overdue_reservations(now).is_empty())
            .map(|b| b.class.id)
            .collect();

        let mut outcomes = Vec::new();
        for class_id in due {
            let mut book = self.book(class_id)?.clone();
            let cancelled = book.cancel_overdue_payments(&self.policy, now)?;
            self.books.insert(class_id, book);
            outcomes.extend(cancelled);
        }
        Ok(outcomes)
    }

    // Waitlist

    pub fn join_waitlist(
        &mut self,
        caller: &Caller,
        class_id: Uuid,
        user_id: Uuid,
        frame_size: Option<FrameSize>,
        now: DateTime<Utc>,
    ) -> StudioResult<WaitlistEntry> {
        caller.ensure_can_act_for(user_id, "waitlist entry")?;
        let mut book = self.book(class_id)?.clone();
        let entry = book.join_waitlist(user_id, frame_size, None, now)?;
        self.books.insert(class_id, book);
        Ok(entry)
    }

    pub fn leave_waitlist(&mut self, caller: &Caller, class_id: Uuid, user_id: Uuid) -> StudioResult<WaitlistEntry> {
        caller.ensure_can_act_for(user_id, "waitlist entry")?;
        let book = self.book_mut(class_id)?;
        book.waitlist.leave(user_id)
    }

    pub fn reorder_waitlist(
        &mut self,
        class_id: Uuid,
        entry_id: Uuid,
        new_priority: u32,
    ) -> StudioResult<Vec<WaitlistEntry>> {
        let book = self.book_mut(class_id)?;
        book.waitlist.reorder(entry_id, new_priority)?;
        Ok(book.waitlist.entries().to_vec())
    }

    pub fn waitlist(&self, class_id: Uuid) -> StudioResult<Vec<WaitlistEntry>> {
        Ok(self.book(class_id)?.waitlist.entries().to_vec())
    }

    // Packages

    pub fn create_package(&mut self, new: NewPackage, now: DateTime<Utc>) -> StudioResult<Package> {
        let package = Package::new(new, now)?;
        self.packages.insert(package.id, package.clone());
        Ok(package)
    }

    pub fn activate_package(&mut self, package_id: Uuid, now: DateTime<Utc>) -> StudioResult<Package> {
        let package = self
            .packages
            .get_mut(&package_id)
            .ok_or_else(|| StudioError::not_found("package", package_id))?;
        package.activate(now)?;
        Ok(package.clone())
    }

    pub fn package(&self, package_id: Uuid) -> StudioResult<Package> {
        self.packages
            .get(&package_id)
            .cloned()
            .ok_or_else(|| StudioError::not_found("package", package_id))
    }

    pub fn user_packages(&self, user_id: Uuid) -> Vec<Package> {
        let mut packages: Vec<Package> = self
            .packages
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        packages.sort_by_key(|p| p.created_at);
        packages
    }

    pub fn credit_movements(&self, package_id: Uuid) -> Vec<CreditMovement> {
        self.credit_movements
            .iter()
            .filter(|m| m.package_id == package_id)
            .cloned()
            .collect()
    }

    pub fn sweep_package_expiry(&mut self, now: DateTime<Utc>) -> ExpirySweep {
        PackageExpirySweeper::new(&self.policy).sweep(self.packages.values_mut(), now)
    }

    // Schedule

    pub fn create_pattern(&mut self, pattern: RecurringClassPattern) -> StudioResult<RecurringClassPattern> {
        pattern.validate()?;
        if self.patterns.contains_key(&pattern.id) {
            return Err(StudioError::AlreadyExists {
                entity: "pattern",
                detail: pattern.id.to_string(),
            });
        }
        self.patterns.insert(pattern.id, pattern.clone());
        Ok(pattern)
    }

    pub fn patterns(&self) -> Vec<RecurringClassPattern> {
        self.patterns.values().cloned().collect()
    }

    pub fn add_holiday(&mut self, holiday: Holiday) -> StudioResult<Holiday> {
        if self.holidays.iter().any(|h| h.date == holiday.date) {
            return Err(StudioError::AlreadyExists {
                entity: "holiday",
                detail: holiday.date.to_string(),
            });
        }
        self.holidays.push(holiday.clone());
        self.holidays.sort_by_key(|h| h.date);
        Ok(holiday)
    }

    pub fn holidays(&self) -> Vec<Holiday> {
        self.holidays.clone()
    }

    pub fn generate_classes(
        &mut self,
        pattern_id: Uuid,
        request: &GenerateRequest,
        now: DateTime<Utc>,
    ) -> StudioResult<GenerationOutcome> {
        let pattern = self
            .patterns
            .get(&pattern_id)
            .ok_or_else(|| StudioError::not_found("pattern", pattern_id))?;
        let calendar: HolidayCalendar = self.holidays.iter().collect();
        let existing: HashSet<SlotKey> = self.books.values().map(|b| SlotKey::of(&b.class)).collect();

        let outcome = self.generator.generate(pattern, request, &calendar, &existing, now)?;
        for class in &outcome.created {
            self.books.insert(class.id, ClassBook::new(class.clone()));
        }
        Ok(outcome)
    }

    fn book(&self, class_id: Uuid) -> StudioResult<&ClassBook> {
        self.books
            .get(&class_id)
            .ok_or_else(|| StudioError::not_found("class", class_id))
    }

    fn book_mut(&mut self, class_id: Uuid) -> StudioResult<&mut ClassBook> {
        self.books
            .get_mut(&class_id)
            .ok_or_else(|| StudioError::not_found("class", class_id))
    }

    fn class_of_reservation(&self, reservation_id: Uuid) -> StudioResult<Uuid> {
        self.books
            .values()
            .find(|b| b.reservations.iter().any(|r| r.id == reservation_id))
            .map(|b| b.class.id)
            .ok_or_else(|| StudioError::not_found("reservation", reservation_id))
    }

    fn with_reservation_book<T>(
        &mut self,
        reservation_id: Uuid,
        op: impl FnOnce(&mut ClassBook) -> StudioResult<T>,
    ) -> StudioResult<T> {
        let class_id = self.class_of_reservation(reservation_id)?;
        let mut book = self.book(class_id)?.clone();
        let result = op(&mut book)?;
        self.books.insert(class_id, book);
        Ok(result)
    }
}
