//! Daily snapshot collection task
//!
//! Collects yesterday's campaign insights for every registered ad account
//! on each tick. Yesterday is fetched again on later ticks of the same day
//! so late-attributed conversions are picked up. Once per day, after the
//! first collection of a new date, patterns are relearned for every account.

use crate::intelligence::{yesterday, PatternLearner, SnapshotCollector};
use chrono::NaiveDate;
use std::sync::Arc;
use tokio::time::{interval, Duration};

/// Spawn the background snapshot collection task
pub fn spawn_snapshot_collector_task(
    collector: Arc<SnapshotCollector>,
    learner: Arc<PatternLearner>,
    interval_secs: u64,
) {
    let interval_secs = interval_secs.max(60);
    tracing::info!(interval_secs = interval_secs, "Starting snapshot collection task");

    tokio::spawn(async move {
        // Let startup finish before the first round of Graph calls
        tokio::time::sleep(Duration::from_secs(30)).await;

        let mut tick = interval(Duration::from_secs(interval_secs));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut last_learned: Option<NaiveDate> = None;

        loop {
            tick.tick().await;

            let date = yesterday();
            match collector.collect_all(date).await {
                Ok(summary) => tracing::info!(
                    date = %date,
                    accounts = summary.accounts,
                    snapshots = summary.snapshots,
                    deferred = summary.deferred,
                    failed = summary.failed,
                    "Snapshot collection completed"
                ),
                Err(e) => {
                    tracing::error!(date = %date, error = %e, "Snapshot collection failed");
                    continue;
                }
            }

            if last_learned != Some(date) {
                match learner.learn_all().await {
                    Ok(accounts) => {
                        tracing::info!(accounts = accounts, "Daily pattern learning completed");
                        last_learned = Some(date);
                    }
                    Err(e) => tracing::warn!(error = %e, "Daily pattern learning failed"),
                }
            }
        }
    });
}
