use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};

use crate::use_cases::reconciliation::ReconciliationUseCases;

/// Periodically expires subscriptions whose paid period ended without a
/// renewal. Runs one pass at a time; a slow pass delays the next tick.
pub async fn run_lapse_sweep_loop(
    reconciliation: Arc<ReconciliationUseCases>,
    every: Duration,
    lookahead: chrono::Duration,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        "Lapse sweeper started (every {}s, lookahead {}s)",
        every.as_secs(),
        lookahead.num_seconds()
    );

    loop {
        ticker.tick().await;

        match reconciliation.sweep_lapsed(Utc::now(), lookahead).await {
            Ok(report) if report.checked > 0 => {
                info!(
                    checked = report.checked,
                    refreshed = report.refreshed,
                    expired = report.expired,
                    failed = report.failed,
                    "Lapse sweep finished"
                );
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "Lapse sweep failed");
            }
        }
    }
}
