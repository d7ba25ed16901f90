use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{info, warn};
use tuft_booking::changes::reschedule;
use tuft_booking::{
    BookRequest, BookingOutcome, BookingPolicy, BookingRepository, CancelActor, CancellationOutcome,
    CapacityChangeOutcome, ClassBook, ClassCancellationOutcome, ClassView, CompletionOutcome,
    CreditMovement, ExpirySweep, NewPackage, Package, PackageExpirySweeper, RescheduleOutcome,
    Reservation, WaitlistEntry,
};
use tuft_catalog::{
    Class, FrameSize, GenerateRequest, GenerationOutcome, Holiday, HolidayCalendar, NewClass,
    PatternGenerator, RecurringClassPattern, SkipReason, SlotKey,
};
use tuft_core::{Caller, StudioError, StudioResult};
use uuid::Uuid;

use crate::database::{map_sqlx_error, retry_on_conflict};
use crate::rows::{
    frames_to_json, to_i32, weekday_index, ClassRow, HolidayRow, MovementRow, PackageRow, PatternRow,
    ReservationRow, WaitlistRow, CLASS_COLUMNS, PACKAGE_COLUMNS, PATTERN_COLUMNS, RESERVATION_COLUMNS,
};

/// Postgres-backed repository.
///
/// Every mutation runs in one transaction that locks the class rows it
/// touches (`SELECT ... FOR UPDATE`, classes before packages, classes in id
/// order), applies the change to an in-memory `ClassBook`, and writes back
/// only the rows that changed. Serialization failures and deadlocks are
/// retried a bounded number of times.
pub struct PgBookingRepository {
    pool: PgPool,
    policy: BookingPolicy,
    generator: PatternGenerator,
    max_attempts: u32,
}

impl PgBookingRepository {
    pub fn new(pool: PgPool, policy: BookingPolicy, generator: PatternGenerator, max_attempts: u32) -> Self {
        Self {
            pool,
            policy,
            generator,
            max_attempts,
        }
    }

    async fn begin(&self) -> StudioResult<sqlx::Transaction<'static, sqlx::Postgres>> {
        self.pool.begin().await.map_err(map_sqlx_error)
    }

    async fn try_update_capacity(
        &self,
        class_id: Uuid,
        capacity: u32,
        frame_capacity: Option<BTreeMap<FrameSize, u32>>,
        now: DateTime<Utc>,
    ) -> StudioResult<CapacityChangeOutcome> {
        let mut tx = self.begin().await?;
        let before = load_book(&mut tx, class_id, true).await?;
        let mut book = before.clone();
        let outcome = book.set_capacity(capacity, frame_capacity, &self.policy, now)?;
        save_book(&mut tx, &before, &book).await?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(outcome)
    }

    async fn with_locked_book<T: Send>(
        &self,
        class_id: Uuid,
        op: impl FnOnce(&mut ClassBook) -> StudioResult<T> + Send,
    ) -> StudioResult<T> {
        let mut tx = self.begin().await?;
        let before = load_book(&mut tx, class_id, true).await?;
        let mut book = before.clone();
        let result = op(&mut book)?;
        save_book(&mut tx, &before, &book).await?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(result)
    }

    async fn try_cancel_class(
        &self,
        class_id: Uuid,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> StudioResult<ClassCancellationOutcome> {
        let mut tx = self.begin().await?;
        let before = load_book(&mut tx, class_id, true).await?;
        let mut package_ids: Vec<Uuid> = before
            .reservations
            .iter()
            .filter(|r| r.is_active())
            .filter_map(|r| r.package_id)
            .collect();
        package_ids.sort();
        package_ids.dedup();

        let mut packages = HashMap::new();
        for id in package_ids {
            packages.insert(id, fetch_package(&mut tx, id, true).await?);
        }

        let mut book = before.clone();
        let outcome = book.cancel_class(reason, &mut packages, now)?;
        save_book(&mut tx, &before, &book).await?;
        for package in packages.values() {
            save_package(&mut tx, package).await?;
        }
        insert_movements(&mut tx, &outcome.credits_restored).await?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(outcome)
    }

    async fn try_book(&self, request: &BookRequest, now: DateTime<Utc>) -> StudioResult<BookingOutcome> {
        let mut tx = self.begin().await?;
        let before = load_book(&mut tx, request.class_id, true).await?;
        let mut package = match request.package_id {
            Some(id) => Some(fetch_package(&mut tx, id, true).await?),
            None => None,
        };

        let mut book = before.clone();
        let outcome = book.book(request.user_id, request.frame_size, package.as_mut(), &self.policy, now)?;

        save_book(&mut tx, &before, &book).await?;
        if let Some(package) = &package {
            save_package(&mut tx, package).await?;
        }
        insert_movements(&mut tx, outcome.credit.as_slice()).await?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(outcome)
    }

    async fn try_cancel(
        &self,
        actor: &CancelActor,
        reservation_id: Uuid,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> StudioResult<CancellationOutcome> {
        let mut tx = self.begin().await?;
        let class_id = class_of_reservation(&mut tx, reservation_id).await?;
        let before = load_book(&mut tx, class_id, true).await?;
        let mut package = match before.reservation(reservation_id)?.package_id {
            Some(id) => Some(fetch_package(&mut tx, id, true).await?),
            None => None,
        };

        let mut book = before.clone();
        let outcome = book.cancel(reservation_id, actor, reason, package.as_mut(), &self.policy, now)?;

        save_book(&mut tx, &before, &book).await?;
        if let Some(package) = &package {
            save_package(&mut tx, package).await?;
        }
        insert_movements(&mut tx, outcome.credit_restored.as_slice()).await?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(outcome)
    }

    async fn try_reschedule(
        &self,
        caller: &Caller,
        reservation_id: Uuid,
        target_class_id: Uuid,
        now: DateTime<Utc>,
    ) -> StudioResult<RescheduleOutcome> {
        let mut tx = self.begin().await?;
        let class_id = class_of_reservation(&mut tx, reservation_id).await?;
        if class_id == target_class_id {
            return Err(StudioError::ValidationError(
                "reservation is already in that class".to_string(),
            ));
        }

        // Lock both classes in id order so two opposite reschedules cannot deadlock.
        let (first, second) = if class_id < target_class_id {
            (class_id, target_class_id)
        } else {
            (target_class_id, class_id)
        };
        let first_book = load_book(&mut tx, first, true).await?;
        let second_book = load_book(&mut tx, second, true).await?;
        let (from_before, to_before) = if first == class_id {
            (first_book, second_book)
        } else {
            (second_book, first_book)
        };

        let package = match from_before.reservation(reservation_id)?.package_id {
            Some(id) => Some(fetch_package(&mut tx, id, true).await?),
            None => None,
        };

        let mut from = from_before.clone();
        let mut to = to_before.clone();
        let outcome = reschedule(&mut from, &mut to, reservation_id, caller, package.as_ref(), &self.policy, now)?;

        // Release the old seat before taking the new one.
        save_book(&mut tx, &from_before, &from).await?;
        save_book(&mut tx, &to_before, &to).await?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(outcome)
    }

    async fn try_cancel_overdue_for(&self, class_id: Uuid, now: DateTime<Utc>) -> StudioResult<Vec<CancellationOutcome>> {
        let policy = &self.policy;
        self.with_locked_book(class_id, |book| book.cancel_overdue_payments(policy, now))
            .await
    }

    async fn try_join_waitlist(
        &self,
        class_id: Uuid,
        user_id: Uuid,
        frame_size: Option<FrameSize>,
        now: DateTime<Utc>,
    ) -> StudioResult<WaitlistEntry> {
        self.with_locked_book(class_id, |book| book.join_waitlist(user_id, frame_size, None, now))
            .await
    }

    async fn try_activate_package(&self, package_id: Uuid, now: DateTime<Utc>) -> StudioResult<Package> {
        let mut tx = self.begin().await?;
        let mut package = fetch_package(&mut tx, package_id, true).await?;
        package.activate(now)?;
        save_package(&mut tx, &package).await?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(package)
    }

    async fn try_sweep_packages(&self, now: DateTime<Utc>) -> StudioResult<ExpirySweep> {
        let warn_before = now + self.policy.expiry_warning();
        let mut tx = self.begin().await?;
        let sql = format!(
            "SELECT {} FROM packages WHERE status = 'ACTIVE' AND expires_at IS NOT NULL \
             AND (expires_at < $1 OR (expiry_warning_sent_at IS NULL AND expires_at <= $2)) \
             ORDER BY id FOR UPDATE SKIP LOCKED",
            PACKAGE_COLUMNS
        );
        let rows: Vec<PackageRow> = sqlx::query_as(&sql)
            .bind(now)
            .bind(warn_before)
            .fetch_all(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        let mut packages = rows
            .into_iter()
            .map(Package::try_from)
            .collect::<StudioResult<Vec<_>>>()?;

        let sweep = PackageExpirySweeper::new(&self.policy).sweep(packages.iter_mut(), now);
        for package in &packages {
            save_package(&mut tx, package).await?;
        }
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(sweep)
    }

    async fn try_generate(
        &self,
        pattern_id: Uuid,
        request: &GenerateRequest,
        now: DateTime<Utc>,
    ) -> StudioResult<GenerationOutcome> {
        let pattern = self.fetch_pattern(pattern_id).await?;
        let calendar: HolidayCalendar = self.fetch_holidays().await?.iter().collect();

        #[derive(sqlx::FromRow)]
        struct SlotRow {
            class_type_id: Uuid,
            location: String,
            starts_at: DateTime<Utc>,
        }
        let slots: Vec<SlotRow> = sqlx::query_as(
            "SELECT class_type_id, location, starts_at FROM classes WHERE class_type_id = $1 AND location = $2",
        )
        .bind(pattern.class_type_id)
        .bind(&pattern.location)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        let existing: HashSet<SlotKey> = slots
            .into_iter()
            .map(|s| SlotKey {
                class_type_id: s.class_type_id,
                location: s.location,
                starts_at: s.starts_at,
            })
            .collect();

        let planned = self.generator.generate(&pattern, request, &calendar, &existing, now)?;

        let mut outcome = GenerationOutcome {
            created: Vec::new(),
            skipped: planned.skipped,
        };
        let mut tx = self.begin().await?;
        for class in planned.created {
            if insert_class(&mut tx, &class, true).await? {
                outcome.created.push(class);
            } else {
                // Raced with another generator run.
                outcome
                    .skipped
                    .push((self.generator.local_date(class.starts_at), SkipReason::AlreadyExists));
            }
        }
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(outcome)
    }

    async fn fetch_pattern(&self, pattern_id: Uuid) -> StudioResult<RecurringClassPattern> {
        let sql = format!("SELECT {} FROM recurring_patterns WHERE id = $1", PATTERN_COLUMNS);
        let row: Option<PatternRow> = sqlx::query_as(&sql)
            .bind(pattern_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.ok_or_else(|| StudioError::not_found("pattern", pattern_id))?
            .try_into()
    }

    async fn fetch_holidays(&self) -> StudioResult<Vec<Holiday>> {
        let rows: Vec<HolidayRow> = sqlx::query_as("SELECT id, date, name FROM holidays ORDER BY date")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(rows.into_iter().map(Holiday::from).collect())
    }
}

#[async_trait]
impl BookingRepository for PgBookingRepository {
    fn policy(&self) -> BookingPolicy {
        self.policy.clone()
    }

    async fn create_class(&self, new: NewClass, now: DateTime<Utc>) -> StudioResult<Class> {
        let class = Class::new(new, now)?;
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        insert_class(&mut conn, &class, false).await?;
        info!("Class {} created for {}", class.id, class.starts_at);
        Ok(class)
    }

    async fn get_class(&self, class_id: Uuid) -> StudioResult<ClassView> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        let book = load_book(&mut conn, class_id, false).await?;
        Ok(ClassView {
            availability: book.availability(),
            waitlist_length: book.waitlist.len(),
            class: book.class,
        })
    }

    async fn list_classes(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> StudioResult<Vec<Class>> {
        let sql = format!(
            "SELECT {} FROM classes WHERE starts_at >= $1 AND starts_at < $2 ORDER BY starts_at",
            CLASS_COLUMNS
        );
        let rows: Vec<ClassRow> = sqlx::query_as(&sql)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.into_iter().map(Class::try_from).collect()
    }

    async fn update_capacity(
        &self,
        class_id: Uuid,
        capacity: u32,
        frame_capacity: Option<BTreeMap<FrameSize, u32>>,
        now: DateTime<Utc>,
    ) -> StudioResult<CapacityChangeOutcome> {
        retry_on_conflict(self.max_attempts, move || {
            self.try_update_capacity(class_id, capacity, frame_capacity.clone(), now)
        })
        .await
    }

    async fn start_class(&self, class_id: Uuid, now: DateTime<Utc>) -> StudioResult<Class> {
        retry_on_conflict(self.max_attempts, move || {
            self.with_locked_book(class_id, move |book| book.start(now))
        })
        .await
    }

    async fn complete_class(&self, class_id: Uuid, now: DateTime<Utc>) -> StudioResult<CompletionOutcome> {
        retry_on_conflict(self.max_attempts, move || {
            self.with_locked_book(class_id, move |book| book.complete(now))
        })
        .await
    }

    async fn cancel_class(
        &self,
        class_id: Uuid,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> StudioResult<ClassCancellationOutcome> {
        retry_on_conflict(self.max_attempts, move || {
            self.try_cancel_class(class_id, reason.clone(), now)
        })
        .await
    }

    async fn start_due_classes(&self, now: DateTime<Utc>) -> StudioResult<Vec<Uuid>> {
        let due: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM classes WHERE status IN ('SCHEDULED', 'FULL') AND starts_at <= $1 ORDER BY starts_at",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let mut started = Vec::new();
        for (class_id,) in due {
            match self.start_class(class_id, now).await {
                Ok(_) => started.push(class_id),
                // Another worker got there first.
                Err(StudioError::InvalidStateTransition { .. }) => {}
                Err(e) => warn!("Failed to start class {}: {}", class_id, e),
            }
        }
        Ok(started)
    }

    async fn book(&self, caller: &Caller, request: &BookRequest, now: DateTime<Utc>) -> StudioResult<BookingOutcome> {
        caller.ensure_can_act_for(request.user_id, "booking")?;
        retry_on_conflict(self.max_attempts, move || self.try_book(request, now))
            .await
            .map_err(|e| match e {
                // Lost the race on the live-reservation index.
                StudioError::AlreadyExists { entity: "row", .. } => StudioError::AlreadyExists {
                    entity: "reservation",
                    detail: format!(
                        "user {} already holds a seat in class {}",
                        request.user_id, request.class_id
                    ),
                },
                other => other,
            })
    }

    async fn cancel_reservation(
        &self,
        actor: &CancelActor,
        reservation_id: Uuid,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> StudioResult<CancellationOutcome> {
        retry_on_conflict(self.max_attempts, move || {
            self.try_cancel(actor, reservation_id, reason.clone(), now)
        })
        .await
    }

    async fn reschedule(
        &self,
        caller: &Caller,
        reservation_id: Uuid,
        target_class_id: Uuid,
        now: DateTime<Utc>,
    ) -> StudioResult<RescheduleOutcome> {
        retry_on_conflict(self.max_attempts, move || {
            self.try_reschedule(caller, reservation_id, target_class_id, now)
        })
        .await
    }

    async fn check_in(&self, reservation_id: Uuid, now: DateTime<Utc>) -> StudioResult<Reservation> {
        let class_id = self.get_reservation(reservation_id).await?.class_id;
        retry_on_conflict(self.max_attempts, move || {
            self.with_locked_book(class_id, move |book| book.check_in(reservation_id, now))
        })
        .await
    }

    async fn mark_no_show(&self, reservation_id: Uuid, now: DateTime<Utc>) -> StudioResult<Reservation> {
        let class_id = self.get_reservation(reservation_id).await?.class_id;
        retry_on_conflict(self.max_attempts, move || {
            self.with_locked_book(class_id, move |book| book.mark_no_show(reservation_id, now))
        })
        .await
    }

    async fn record_payment(&self, reservation_id: Uuid, now: DateTime<Utc>) -> StudioResult<Reservation> {
        let class_id = self.get_reservation(reservation_id).await?.class_id;
        retry_on_conflict(self.max_attempts, move || {
            self.with_locked_book(class_id, move |book| book.record_payment(reservation_id, now))
        })
        .await
    }

    async fn get_reservation(&self, reservation_id: Uuid) -> StudioResult<Reservation> {
        let sql = format!("SELECT {} FROM reservations WHERE id = $1", RESERVATION_COLUMNS);
        let row: Option<ReservationRow> = sqlx::query_as(&sql)
            .bind(reservation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.ok_or_else(|| StudioError::not_found("reservation", reservation_id))?
            .try_into()
    }

    async fn list_user_reservations(&self, user_id: Uuid) -> StudioResult<Vec<Reservation>> {
        let sql = format!(
            "SELECT {} FROM reservations WHERE user_id = $1 ORDER BY created_at",
            RESERVATION_COLUMNS
        );
        let rows: Vec<ReservationRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.into_iter().map(Reservation::try_from).collect()
    }

    async fn cancel_overdue_payments(&self, now: DateTime<Utc>) -> StudioResult<Vec<CancellationOutcome>> {
        let due: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT DISTINCT r.class_id FROM reservations r JOIN classes c ON c.id = r.class_id \
             WHERE r.status = 'CONFIRMED' AND r.package_id IS NULL AND r.paid_at IS NULL \
             AND r.payment_deadline < $1 AND c.starts_at > $1 AND c.status IN ('SCHEDULED', 'FULL')",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let mut outcomes = Vec::new();
        for (class_id,) in due {
            match retry_on_conflict(self.max_attempts, move || self.try_cancel_overdue_for(class_id, now)).await {
                Ok(cancelled) => outcomes.extend(cancelled),
                Err(e) => warn!("Overdue payment sweep failed for class {}: {}", class_id, e),
            }
        }
        Ok(outcomes)
    }

    async fn join_waitlist(
        &self,
        caller: &Caller,
        class_id: Uuid,
        user_id: Uuid,
        frame_size: Option<FrameSize>,
        now: DateTime<Utc>,
    ) -> StudioResult<WaitlistEntry> {
        caller.ensure_can_act_for(user_id, "waitlist entry")?;
        retry_on_conflict(self.max_attempts, move || {
            self.try_join_waitlist(class_id, user_id, frame_size, now)
        })
        .await
    }

    async fn leave_waitlist(&self, caller: &Caller, class_id: Uuid, user_id: Uuid) -> StudioResult<WaitlistEntry> {
        caller.ensure_can_act_for(user_id, "waitlist entry")?;
        retry_on_conflict(self.max_attempts, move || {
            self.with_locked_book(class_id, move |book| book.waitlist.leave(user_id))
        })
        .await
    }

    async fn reorder_waitlist(
        &self,
        class_id: Uuid,
        entry_id: Uuid,
        new_priority: u32,
    ) -> StudioResult<Vec<WaitlistEntry>> {
        retry_on_conflict(self.max_attempts, move || {
            self.with_locked_book(class_id, move |book| {
                book.waitlist.reorder(entry_id, new_priority)?;
                Ok(book.waitlist.entries().to_vec())
            })
        })
        .await
    }

    async fn list_waitlist(&self, class_id: Uuid) -> StudioResult<Vec<WaitlistEntry>> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        let book = load_book(&mut conn, class_id, false).await?;
        Ok(book.waitlist.entries().to_vec())
    }

    async fn create_package(&self, new: NewPackage, now: DateTime<Utc>) -> StudioResult<Package> {
        let package = Package::new(new, now)?;
        sqlx::query(
            "INSERT INTO packages (id, user_id, name, kind, total_credits, used_credits, status, class_type_id, \
             price_cents, expires_at, expiry_warning_sent_at, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(package.id)
        .bind(package.user_id)
        .bind(&package.name)
        .bind(package.kind.as_str())
        .bind(to_i32(package.total_credits)?)
        .bind(to_i32(package.used_credits)?)
        .bind(package.status.as_str())
        .bind(package.class_type_id)
        .bind(package.price_cents)
        .bind(package.expires_at)
        .bind(package.expiry_warning_sent_at)
        .bind(package.created_at)
        .bind(package.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        info!("Package {} created for user {}", package.id, package.user_id);
        Ok(package)
    }

    async fn activate_package(&self, package_id: Uuid, now: DateTime<Utc>) -> StudioResult<Package> {
        retry_on_conflict(self.max_attempts, move || self.try_activate_package(package_id, now)).await
    }

    async fn get_package(&self, package_id: Uuid) -> StudioResult<Package> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        fetch_package(&mut conn, package_id, false).await
    }

    async fn list_user_packages(&self, user_id: Uuid) -> StudioResult<Vec<Package>> {
        let sql = format!(
            "SELECT {} FROM packages WHERE user_id = $1 ORDER BY created_at",
            PACKAGE_COLUMNS
        );
        let rows: Vec<PackageRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.into_iter().map(Package::try_from).collect()
    }

    async fn list_credit_movements(&self, package_id: Uuid) -> StudioResult<Vec<CreditMovement>> {
        let rows: Vec<MovementRow> = sqlx::query_as(
            "SELECT id, package_id, reservation_id, kind, amount, used_after, created_at \
             FROM credit_movements WHERE package_id = $1 ORDER BY created_at",
        )
        .bind(package_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        rows.into_iter().map(CreditMovement::try_from).collect()
    }

    async fn sweep_package_expiry(&self, now: DateTime<Utc>) -> StudioResult<ExpirySweep> {
        retry_on_conflict(self.max_attempts, move || self.try_sweep_packages(now)).await
    }

    async fn create_pattern(&self, pattern: RecurringClassPattern) -> StudioResult<RecurringClassPattern> {
        pattern.validate()?;
        sqlx::query(
            "INSERT INTO recurring_patterns (id, class_type_id, title, location, instructor_id, day_of_week, \
             start_time, duration_minutes, capacity, frame_capacity, price_cents, valid_from, valid_until, is_active) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(pattern.id)
        .bind(pattern.class_type_id)
        .bind(&pattern.title)
        .bind(&pattern.location)
        .bind(pattern.instructor_id)
        .bind(weekday_index(pattern.day_of_week))
        .bind(pattern.start_time)
        .bind(to_i32(pattern.duration_minutes)?)
        .bind(to_i32(pattern.capacity)?)
        .bind(frames_to_json(&pattern.frame_capacity))
        .bind(pattern.price_cents)
        .bind(pattern.valid_from)
        .bind(pattern.valid_until)
        .bind(pattern.is_active)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(pattern)
    }

    async fn list_patterns(&self) -> StudioResult<Vec<RecurringClassPattern>> {
        let sql = format!("SELECT {} FROM recurring_patterns ORDER BY day_of_week, start_time", PATTERN_COLUMNS);
        let rows: Vec<PatternRow> = sqlx::query_as(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.into_iter().map(RecurringClassPattern::try_from).collect()
    }

    async fn add_holiday(&self, holiday: Holiday) -> StudioResult<Holiday> {
        sqlx::query("INSERT INTO holidays (id, date, name) VALUES ($1, $2, $3)")
            .bind(holiday.id)
            .bind(holiday.date)
            .bind(&holiday.name)
            .execute(&self.pool)
            .await
            .map_err(|e| match map_sqlx_error(e) {
                StudioError::AlreadyExists { .. } => StudioError::AlreadyExists {
                    entity: "holiday",
                    detail: holiday.date.to_string(),
                },
                other => other,
            })?;
        Ok(holiday)
    }

    async fn list_holidays(&self) -> StudioResult<Vec<Holiday>> {
        self.fetch_holidays().await
    }

    async fn generate_classes(
        &self,
        pattern_id: Uuid,
        request: &GenerateRequest,
        now: DateTime<Utc>,
    ) -> StudioResult<GenerationOutcome> {
        retry_on_conflict(self.max_attempts, move || self.try_generate(pattern_id, request, now)).await
    }
}

async fn fetch_class(conn: &mut PgConnection, class_id: Uuid, lock: bool) -> StudioResult<Class> {
    let sql = format!(
        "SELECT {} FROM classes WHERE id = $1{}",
        CLASS_COLUMNS,
        if lock { " FOR UPDATE" } else { "" }
    );
    let row: Option<ClassRow> = sqlx::query_as(&sql)
        .bind(class_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;
    row.ok_or_else(|| StudioError::not_found("class", class_id))?
        .try_into()
}

/// Loads a class with its reservations and waitlist. With `lock` the class
/// row is held until the transaction ends, which serializes every writer
/// of this class.
async fn load_book(conn: &mut PgConnection, class_id: Uuid, lock: bool) -> StudioResult<ClassBook> {
    let class = fetch_class(conn, class_id, lock).await?;

    let sql = format!(
        "SELECT {} FROM reservations WHERE class_id = $1 ORDER BY created_at, id",
        RESERVATION_COLUMNS
    );
    let reservations: Vec<ReservationRow> = sqlx::query_as(&sql)
        .bind(class_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;

    let waitlist: Vec<WaitlistRow> = sqlx::query_as(
        "SELECT id, user_id, class_id, frame_size, priority, created_at FROM waitlist_entries \
         WHERE class_id = $1 ORDER BY priority",
    )
    .bind(class_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(map_sqlx_error)?;

    Ok(ClassBook::from_parts(
        class,
        reservations
            .into_iter()
            .map(Reservation::try_from)
            .collect::<StudioResult<_>>()?,
        waitlist
            .into_iter()
            .map(WaitlistEntry::try_from)
            .collect::<StudioResult<_>>()?,
    ))
}

async fn fetch_package(conn: &mut PgConnection, package_id: Uuid, lock: bool) -> StudioResult<Package> {
    let sql = format!(
        "SELECT {} FROM packages WHERE id = $1{}",
        PACKAGE_COLUMNS,
        if lock { " FOR UPDATE" } else { "" }
    );
    let row: Option<PackageRow> = sqlx::query_as(&sql)
        .bind(package_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;
    row.ok_or_else(|| StudioError::not_found("package", package_id))?
        .try_into()
}

async fn class_of_reservation(conn: &mut PgConnection, reservation_id: Uuid) -> StudioResult<Uuid> {
    let row: Option<(Uuid,)> = sqlx::query_as("SELECT class_id FROM reservations WHERE id = $1")
        .bind(reservation_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;
    row.map(|(class_id,)| class_id)
        .ok_or_else(|| StudioError::not_found("reservation", reservation_id))
}

/// Returns false when `skip_existing` is set and the slot was already taken.
async fn insert_class(conn: &mut PgConnection, class: &Class, skip_existing: bool) -> StudioResult<bool> {
    let sql = format!(
        "INSERT INTO classes ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14){}",
        CLASS_COLUMNS,
        if skip_existing {
            " ON CONFLICT (class_type_id, location, starts_at) DO NOTHING"
        } else {
            ""
        }
    );
    let result = sqlx::query(&sql)
        .bind(class.id)
        .bind(class.class_type_id)
        .bind(&class.title)
        .bind(&class.location)
        .bind(class.instructor_id)
        .bind(class.starts_at)
        .bind(class.ends_at)
        .bind(to_i32(class.capacity)?)
        .bind(frames_to_json(&class.frame_capacity))
        .bind(class.price_cents)
        .bind(class.status.as_str())
        .bind(class.pattern_id)
        .bind(class.created_at)
        .bind(class.updated_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| match map_sqlx_error(e) {
            StudioError::AlreadyExists { .. } => StudioError::AlreadyExists {
                entity: "class",
                detail: format!("{} at {} in {}", class.class_type_id, class.starts_at, class.location),
            },
            other => other,
        })?;
    Ok(result.rows_affected() > 0)
}

/// Writes the difference between two versions of a class book.
async fn save_book(conn: &mut PgConnection, before: &ClassBook, after: &ClassBook) -> StudioResult<()> {
    if before.class != after.class {
        sqlx::query(
            "UPDATE classes SET capacity = $2, frame_capacity = $3, status = $4, updated_at = $5 WHERE id = $1",
        )
        .bind(after.class.id)
        .bind(to_i32(after.class.capacity)?)
        .bind(frames_to_json(&after.class.frame_capacity))
        .bind(after.class.status.as_str())
        .bind(after.class.updated_at)
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;
    }

    let previous: HashMap<Uuid, &Reservation> = before.reservations.iter().map(|r| (r.id, r)).collect();
    for reservation in &after.reservations {
        if previous.get(&reservation.id).map_or(true, |old| *old != reservation) {
            upsert_reservation(conn, reservation).await?;
        }
    }

    if before.waitlist != after.waitlist {
        sqlx::query("DELETE FROM waitlist_entries WHERE class_id = $1")
            .bind(after.class.id)
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx_error)?;
        for entry in after.waitlist.entries() {
            sqlx::query(
                "INSERT INTO waitlist_entries (id, user_id, class_id, frame_size, priority, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(entry.id)
            .bind(entry.user_id)
            .bind(entry.class_id)
            .bind(entry.frame_size.map(|f| f.as_str()))
            .bind(to_i32(entry.priority)?)
            .bind(entry.created_at)
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx_error)?;
        }
    }
    Ok(())
}

async fn upsert_reservation(conn: &mut PgConnection, reservation: &Reservation) -> StudioResult<()> {
    let sql = format!(
        "INSERT INTO reservations ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
         ON CONFLICT (id) DO UPDATE SET status = EXCLUDED.status, package_id = EXCLUDED.package_id, \
         frame_size = EXCLUDED.frame_size, payment_deadline = EXCLUDED.payment_deadline, \
         paid_at = EXCLUDED.paid_at, cancellation_reason = EXCLUDED.cancellation_reason, \
         cancelled_at = EXCLUDED.cancelled_at, checked_in_at = EXCLUDED.checked_in_at, \
         updated_at = EXCLUDED.updated_at",
        RESERVATION_COLUMNS
    );
    sqlx::query(&sql)
        .bind(reservation.id)
        .bind(reservation.user_id)
        .bind(reservation.class_id)
        .bind(reservation.status.as_str())
        .bind(reservation.package_id)
        .bind(reservation.frame_size.map(|f| f.as_str()))
        .bind(reservation.payment_deadline)
        .bind(reservation.paid_at)
        .bind(&reservation.cancellation_reason)
        .bind(reservation.cancelled_at)
        .bind(reservation.checked_in_at)
        .bind(reservation.created_at)
        .bind(reservation.updated_at)
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;
    Ok(())
}

async fn save_package(conn: &mut PgConnection, package: &Package) -> StudioResult<()> {
    sqlx::query(
        "UPDATE packages SET used_credits = $2, status = $3, expiry_warning_sent_at = $4, updated_at = $5 WHERE id = $1",
    )
    .bind(package.id)
    .bind(to_i32(package.used_credits)?)
    .bind(package.status.as_str())
    .bind(package.expiry_warning_sent_at)
    .bind(package.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(map_sqlx_error)?;
    Ok(())
}

async fn insert_movements(conn: &mut PgConnection, movements: &[CreditMovement]) -> StudioResult<()> {
    for movement in movements {
        sqlx::query(
            "INSERT INTO credit_movements (id, package_id, reservation_id, kind, amount, used_after, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(movement.id)
        .bind(movement.package_id)
        .bind(movement.reservation_id)
        .bind(movement.kind.as_str())
        .bind(to_i32(movement.amount)?)
        .bind(to_i32(movement.used_after)?)
        .bind(movement.created_at)
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;
    }
    Ok(())
}
