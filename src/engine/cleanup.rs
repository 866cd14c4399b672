//! Housekeeping of rate-limit counters and finished queue rows
//!
//! Hourly counters are only read for the current hour, and finished queued
//! requests are kept for a week so users can see what happened to them.

use crate::db::{timestamp, QueuedRequest, RateLimitStatus};
use crate::ratelimit::hour_bucket;
use crate::DbPool;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::time::{interval, Duration};

/// Rate-limit counters older than this are deleted
pub const RATE_LIMIT_RETENTION_HOURS: i64 = 48;
/// Completed, failed and cancelled requests older than this are deleted
pub const QUEUE_RETENTION_DAYS: i64 = 7;
const CLEANUP_INTERVAL_SECS: u64 = 3600;

/// Statistics from a cleanup run
#[derive(Debug, Default, PartialEq)]
pub struct CleanupStats {
    pub rate_limit_rows_removed: u64,
    pub queued_requests_removed: u64,
}

/// Run a single cleanup cycle as of `now`
pub async fn run_cleanup(db: &DbPool, now: DateTime<Utc>) -> Result<CleanupStats> {
    let bucket = hour_bucket(now - ChronoDuration::hours(RATE_LIMIT_RETENTION_HOURS));
    let rate_limit_rows_removed = RateLimitStatus::cleanup_before(db, &bucket, &timestamp(now)).await?;

    let cutoff = timestamp(now - ChronoDuration::days(QUEUE_RETENTION_DAYS));
    let queued_requests_removed = QueuedRequest::cleanup_finished(db, &cutoff).await?;

    Ok(CleanupStats {
        rate_limit_rows_removed,
        queued_requests_removed,
    })
}

/// Spawn the background cleanup task
pub fn spawn_cleanup_task(db: DbPool) {
    tracing::info!(
        rate_limit_retention_hours = RATE_LIMIT_RETENTION_HOURS,
        queue_retention_days = QUEUE_RETENTION_DAYS,
        "Starting cleanup task"
    );

    tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(CLEANUP_INTERVAL_SECS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tick.tick().await;
            match run_cleanup(&db, Utc::now()).await {
                Ok(stats) => {
                    if stats.rate_limit_rows_removed > 0 || stats.queued_requests_removed > 0 {
                        tracing::info!(
                            rate_limit_rows = stats.rate_limit_rows_removed,
                            queued_requests = stats.queued_requests_removed,
                            "Cleanup cycle removed old rows"
                        );
                    }
                }
                Err(e) => tracing::error!(error = %e, "Cleanup cycle failed"),
            }
        }
    });
}
