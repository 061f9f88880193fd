//! Renewal scheduling.
//!
//! A single loop: wait out a short startup grace (so the initial
//! event-driven reconciliation wins the race), run a renewal pass, then
//! repeat daily. The pass itself takes the reconciler's pass mutex, so
//! renewals and event-driven passes never overlap.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::reconciler::Reconciler;

#[derive(Debug, Clone)]
pub struct RenewalSchedule {
    /// Delay before the first check after startup.
    pub grace: Duration,
    /// Interval between checks. Not cron-aligned; drift is fine.
    pub interval: Duration,
    /// Certificates expiring within this window are reissued.
    pub threshold: chrono::Duration,
}

impl Default for RenewalSchedule {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(60),
            interval: Duration::from_secs(24 * 60 * 60),
            threshold: chrono::Duration::days(30),
        }
    }
}

/// Run renewal passes on the schedule until cancelled.
pub async fn run_renewal_loop(
    reconciler: Arc<Reconciler>,
    schedule: RenewalSchedule,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(schedule.grace) => {}
    }

    loop {
        let outcome = reconciler.reconcile_renewal(schedule.threshold).await;
        if !outcome.issued.is_empty() || !outcome.failed.is_empty() {
            tracing::info!(
                renewed = outcome.issued.len(),
                failed = outcome.failed.len(),
                "Renewal check finished"
            );
        } else {
            tracing::debug!("No certificates due for renewal");
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(schedule.interval) => {}
        }
    }
}
