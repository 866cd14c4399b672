//! Queued request processor
//!
//! Requests that could not be sent because every credential was rate limited
//! wait in `queued_requests`. This task claims the ones that are due and
//! replays them through the campaign service. A request that is deferred
//! again, or fails with a transient error, goes back in the queue with an
//! exponential backoff until it has used up `max_attempts`.

use crate::campaigns::CampaignService;
use crate::config::RateLimitConfig;
use crate::db::{timestamp, QueuedRequest};
use crate::error::{ServiceError, ServiceResult};
use crate::ratelimit::Attempt;
use crate::DbPool;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio::time::{interval, Duration};

/// Requests claimed per cycle
const BATCH_SIZE: i64 = 25;
/// A request left `processing` this long belonged to a crashed process
const STALE_PROCESSING_MINS: i64 = 10;
const MAX_BACKOFF_SECS: i64 = 6 * 3600;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct QueueRunStats {
    pub claimed: usize,
    pub completed: usize,
    pub rescheduled: usize,
    pub failed: usize,
    pub requeued_stale: u64,
}

/// Delay before retry number `attempts + 1`
pub fn backoff(retry_delay_secs: i64, attempts: i64) -> ChronoDuration {
    let exponent = (attempts - 1).clamp(0, 16) as u32;
    let secs = retry_delay_secs
        .max(1)
        .saturating_mul(2i64.saturating_pow(exponent))
        .min(MAX_BACKOFF_SECS);
    ChronoDuration::seconds(secs)
}

/// Errors that will not go away by trying again
fn is_permanent(error: &ServiceError) -> bool {
    matches!(
        error,
        ServiceError::Validation(_)
            | ServiceError::NotFound(_)
            | ServiceError::Conflict(_)
            | ServiceError::Unauthorized(_)
            | ServiceError::Internal(_)
    )
}

pub struct QueueProcessor {
    db: DbPool,
    campaigns: Arc<CampaignService>,
    config: RateLimitConfig,
}

impl QueueProcessor {
    pub fn new(db: DbPool, campaigns: Arc<CampaignService>, config: RateLimitConfig) -> Self {
        Self { db, campaigns, config }
    }

    /// Run one processing cycle
    pub async fn process_due(&self) -> ServiceResult<QueueRunStats> {
        self.process_due_at(Utc::now()).await
    }

    pub async fn process_due_at(&self, now: DateTime<Utc>) -> ServiceResult<QueueRunStats> {
        let mut stats = QueueRunStats::default();

        let stale_before = timestamp(now - ChronoDuration::minutes(STALE_PROCESSING_MINS));
        stats.requeued_stale = QueuedRequest::requeue_stale(&self.db, &stale_before).await?;
        if stats.requeued_stale > 0 {
            tracing::warn!(count = stats.requeued_stale, "Requeued requests left in processing");
        }

        let claimed = QueuedRequest::claim_due(&self.db, &timestamp(now), BATCH_SIZE).await?;
        stats.claimed = claimed.len();

        for request in &claimed {
            match self.campaigns.execute_queued(request).await {
                Ok(Attempt::Done(result)) => {
                    QueuedRequest::complete(&self.db, &request.id, &result.to_string()).await?;
                    stats.completed += 1;
                    tracing::info!(
                        request_id = %request.id,
                        user_id = %request.user_id,
                        attempts = request.attempts,
                        "Queued request completed"
                    );
                }
                Ok(Attempt::Deferred { process_after }) => {
                    let retry_at = process_after.max(now + backoff(self.config.retry_delay_secs, request.attempts));
                    if self.retry_or_fail(request, retry_at, "Still rate limited").await? {
                        stats.rescheduled += 1;
                    } else {
                        stats.failed += 1;
                    }
                }
                Err(e) if is_permanent(&e) => {
                    QueuedRequest::fail(&self.db, &request.id, &e.to_string()).await?;
                    stats.failed += 1;
                    tracing::warn!(request_id = %request.id, error = %e, "Queued request failed");
                }
                Err(e) => {
                    let retry_at = now + backoff(self.config.retry_delay_secs, request.attempts);
                    if self.retry_or_fail(request, retry_at, &e.to_string()).await? {
                        stats.rescheduled += 1;
                    } else {
                        stats.failed += 1;
                    }
                }
            }
        }

        Ok(stats)
    }

    /// Reschedule the request, or fail it once its attempts are used up.
    /// Returns whether it was rescheduled.
    async fn retry_or_fail(
        &self,
        request: &QueuedRequest,
        retry_at: DateTime<Utc>,
        reason: &str,
    ) -> ServiceResult<bool> {
        if request.attempts >= self.config.max_attempts {
            let message = format!("{} after {} attempts", reason, request.attempts);
            QueuedRequest::fail(&self.db, &request.id, &message).await?;
            tracing::warn!(request_id = %request.id, attempts = request.attempts, "Queued request gave up: {}", reason);
            return Ok(false);
        }

        QueuedRequest::reschedule(&self.db, &request.id, &timestamp(retry_at), Some(reason)).await?;
        tracing::debug!(
            request_id = %request.id,
            attempts = request.attempts,
            retry_at = %retry_at,
            "Queued request rescheduled"
        );
        Ok(true)
    }
}

/// Spawn the background queue processing task
pub fn spawn_queue_processor_task(db: DbPool, campaigns: Arc<CampaignService>, config: RateLimitConfig) {
    let interval_secs = config.queue_poll_interval_secs.max(1);
    tracing::info!(
        interval_secs = interval_secs,
        max_attempts = config.max_attempts,
        "Starting queued request processor"
    );

    let processor = QueueProcessor::new(db, campaigns, config);

    tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(interval_secs));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tick.tick().await;
            match processor.process_due().await {
                Ok(stats) if stats.claimed > 0 => {
                    tracing::info!(
                        claimed = stats.claimed,
                        completed = stats.completed,
                        rescheduled = stats.rescheduled,
                        failed = stats.failed,
                        "Queue processing cycle completed"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Queue processing cycle failed"),
            }
        }
    });
}
