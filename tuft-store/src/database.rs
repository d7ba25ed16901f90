use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};
use tuft_booking::{BookingPolicy, FrameMatching};
use tuft_core::{StudioError, StudioResult};

#[derive(Clone)]
pub struct DbClient {
    pub pool: Pool<Postgres>,
}

impl DbClient {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(3))
            .connect(connection_string)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        info!("Running database migrations...");
        sqlx::migrate!("../migrations").run(&self.pool).await?;
        info!("Migrations completed successfully.");
        Ok(())
    }

    /// Overlays rows of `business_rules` on the configured policy. Each row
    /// stores `{"value": ...}`; unknown keys and mistyped values are ignored.
    pub async fn fetch_business_rules(&self, defaults: BookingPolicy) -> Result<BookingPolicy, sqlx::Error> {
        #[derive(sqlx::FromRow)]
        struct RuleRow {
            rule_key: String,
            rule_value: Value,
        }

        let rows: Vec<RuleRow> = sqlx::query_as("SELECT rule_key, rule_value FROM business_rules")
            .fetch_all(&self.pool)
            .await?;

        let mut rules = defaults;
        for row in rows {
            if let Some(v) = row.rule_value.get("value") {
                apply_rule(&mut rules, &row.rule_key, v);
            }
        }
        Ok(rules)
    }
}

fn apply_rule(rules: &mut BookingPolicy, key: &str, v: &Value) {
    match key {
        "cancellation_window_hours" => {
            if let Some(h) = v.as_i64() {
                rules.cancellation_window_hours = h;
            }
        }
        "payment_deadline_hours" => {
            if let Some(h) = v.as_i64() {
                rules.payment_deadline_hours = h;
            }
        }
        "reschedule_min_hours" => {
            if let Some(h) = v.as_i64() {
                rules.reschedule_min_hours = h;
            }
        }
        "expiry_warning_days" => {
            if let Some(d) = v.as_i64() {
                rules.expiry_warning_days = d;
            }
        }
        "frame_matching" => match v.as_str() {
            Some("STRICT_WHEN_TYPED") => rules.frame_matching = FrameMatching::StrictWhenTyped,
            Some("FIFO") => rules.frame_matching = FrameMatching::Fifo,
            other => warn!("Ignoring frame_matching rule {:?}", other),
        },
        other => warn!("Unknown business rule {}", other),
    }
}

/// Maps driver errors onto the studio taxonomy. Serialization failures and
/// deadlocks become `Conflict` so the whole transaction can be retried.
pub fn map_sqlx_error(err: sqlx::Error) -> StudioError {
    match &err {
        sqlx::Error::RowNotFound => StudioError::Storage("row not found".to_string()),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("40001") | Some("40P01") => StudioError::Conflict(db.message().to_string()),
            Some("23505") => StudioError::AlreadyExists {
                entity: "row",
                detail: db
                    .constraint()
                    .map(str::to_string)
                    .unwrap_or_else(|| db.message().to_string()),
            },
            Some("23514") => StudioError::ValidationError(db.message().to_string()),
            _ => StudioError::Storage(err.to_string()),
        },
        _ => StudioError::Storage(err.to_string()),
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` is used up.
pub async fn retry_on_conflict<T, F, Fut>(max_attempts: u32, mut op: F) -> StudioResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StudioResult<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                warn!("Transaction conflict (attempt {}/{}): {}", attempt, max_attempts, e);
                tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_rules_overlay() {
        let mut rules = BookingPolicy::default();
        apply_rule(&mut rules, "cancellation_window_hours", &serde_json::json!(48));
        apply_rule(&mut rules, "frame_matching", &serde_json::json!("FIFO"));
        apply_rule(&mut rules, "payment_deadline_hours", &serde_json::json!("soon"));

        assert_eq!(rules.cancellation_window_hours, 48);
        assert_eq!(rules.frame_matching, FrameMatching::Fifo);
        assert_eq!(rules.payment_deadline_hours, 24);
    }

    #[tokio::test]
    async fn test_retry_stops_after_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = retry_on_conflict(3, move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(StudioError::Conflict("serialization failure".to_string()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_gives_up_and_skips_business_errors() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: StudioResult<()> = retry_on_conflict(3, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StudioError::Conflict("deadlock".to_string()))
        })
        .await;
        assert!(matches!(result, Err(StudioError::Conflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: StudioResult<()> = retry_on_conflict(3, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StudioError::ValidationError("no".to_string()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
