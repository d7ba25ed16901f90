use serde::Serialize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use tuft_core::notify::dispatch_all;
use uuid::Uuid;

use crate::state::AppState;

const SWEEP_LOCK: &str = "studio-sweeps";

/// What one pass of the periodic sweeps changed.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub classes_started: usize,
    pub payments_cancelled: usize,
    pub packages_expired: usize,
    pub expiry_warnings: usize,
    pub notifications_sent: usize,
}

/// Runs every sweep once. A failing sweep is logged and does not stop the
/// ones after it.
pub async fn run_sweeps(state: &AppState) -> SweepReport {
    let now = state.clock.now();
    let mut report = SweepReport::default();

    match state.repo.start_due_classes(now).await {
        Ok(started) => report.classes_started = started.len(),
        Err(e) => error!("Class start sweep failed: {}", e),
    }

    match state.repo.cancel_overdue_payments(now).await {
        Ok(outcomes) => {
            report.payments_cancelled = outcomes.len();
            for outcome in &outcomes {
                report.notifications_sent += dispatch_all(state.notifier.as_ref(), &outcome.notifications).await;
            }
        }
        Err(e) => error!("Payment deadline sweep failed: {}", e),
    }

    match state.repo.sweep_package_expiry(now).await {
        Ok(sweep) => {
            report.packages_expired = sweep.expired.len();
            report.expiry_warnings = sweep.warned.len();
            report.notifications_sent += dispatch_all(state.notifier.as_ref(), &sweep.notifications).await;
        }
        Err(e) => error!("Package expiry sweep failed: {}", e),
    }

    report
}

/// Ticks every `period`. With Redis configured only the instance holding the
/// sweep lock does the work.
pub fn spawn_sweeper(state: AppState, period: Duration) -> JoinHandle<()> {
    let owner = Uuid::new_v4().to_string();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Sweep worker {} started, every {:?}", owner, period);

        loop {
            ticker.tick().await;

            if let Some(redis) = &state.redis {
                match redis.acquire_lock(SWEEP_LOCK, &owner, period.as_secs().max(1)).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!("Sweep lock held elsewhere, skipping tick");
                        continue;
                    }
                    // Fail open like the rate limiter; every write is transactional anyway.
                    Err(e) => warn!("Sweep lock unavailable, sweeping anyway: {}", e),
                }
            }

            let report = run_sweeps(&state).await;
            if report != SweepReport::default() {
                info!(?report, "Sweep finished");
            }

            if let Some(redis) = &state.redis {
                if let Err(e) = redis.release_lock(SWEEP_LOCK, &owner).await {
                    warn!("Failed to release sweep lock: {}", e);
                }
            }
        }
    })
}
