//! Historical snapshot backfill jobs.
//!
//! A job walks its accounts one after another and each account's days from
//! oldest to newest. Position is saved after every day so a paused,
//! failed or interrupted job can continue where it stopped.

use chrono::{Duration, NaiveDate, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::snapshots::{format_date, parse_date, yesterday, SnapshotCollector};
use crate::api::metrics::record_backfill_day;
use crate::config::IntelligenceConfig;
use crate::db::{normalize_account_id, AdAccount, BackfillProgress, BackfillStatus, DbPool};
use crate::error::{ServiceError, ServiceResult};
use crate::ratelimit::Attempt;

#[derive(Debug, Default, Deserialize)]
pub struct StartBackfillRequest {
    /// Defaults to every account the user has registered
    pub ad_account_ids: Option<Vec<String>>,
    pub days: Option<i64>,
}

enum AccountRun {
    Finished,
    /// The job is no longer active
    Stopped,
    Failed(String),
}

/// The partial unique index on active jobs rejects a second one per user
fn already_running(e: sqlx::Error) -> ServiceError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            ServiceError::Conflict("A backfill is already running".to_string())
        }
        _ => ServiceError::Database(e),
    }
}

pub struct BackfillService {
    db: DbPool,
    collector: Arc<SnapshotCollector>,
    config: IntelligenceConfig,
    /// Jobs with a task currently driving them
    running: DashMap<String, ()>,
}

impl BackfillService {
    pub fn new(db: DbPool, collector: Arc<SnapshotCollector>, config: IntelligenceConfig) -> Self {
        Self {
            db,
            collector,
            config,
            running: DashMap::new(),
        }
    }

    async fn resolve_accounts(&self, user_id: &str, requested: Option<&[String]>) -> ServiceResult<Vec<String>> {
        let ids = match requested {
            Some(ids) if !ids.is_empty() => {
                let mut resolved: Vec<String> = Vec::with_capacity(ids.len());
                for raw in ids {
                    let id = normalize_account_id(raw)
                        .ok_or_else(|| ServiceError::invalid("ad_account_ids", format!("Invalid ad account id: {}", raw)))?;
                    if AdAccount::get(&self.db, user_id, &id).await?.is_none() {
                        return Err(ServiceError::not_found(format!("Ad account {}", id)));
                    }
                    if !resolved.contains(&id) {
                        resolved.push(id);
                    }
                }
                resolved
            }
            _ => AdAccount::list_for_user(&self.db, user_id)
                .await?
                .into_iter()
                .map(|a| a.id)
                .collect(),
        };

        if ids.is_empty() {
            return Err(ServiceError::invalid("ad_account_ids", "No ad accounts to backfill"));
        }
        Ok(ids)
    }

    /// Create a job covering the `days` days up to yesterday and start it.
    pub async fn start(self: &Arc<Self>, user_id: &str, request: StartBackfillRequest) -> ServiceResult<BackfillProgress> {
        let days = request.days.unwrap_or(self.config.default_backfill_days);
        let max = self.config.max_backfill_days;
        if !(1..=max).contains(&days) {
            return Err(ServiceError::invalid("days", format!("Days must be between 1 and {}", max)));
        }

        let accounts = self
            .resolve_accounts(user_id, request.ad_account_ids.as_deref())
            .await?;

        if BackfillProgress::find_active_for_user(&self.db, user_id).await?.is_some() {
            return Err(ServiceError::Conflict("A backfill is already running".to_string()));
        }

        let end = yesterday();
        let start = end - Duration::days(days - 1);
        let job = BackfillProgress::create(
            &self.db,
            user_id,
            &format_date(start),
            &format_date(end),
            &accounts,
            days * accounts.len() as i64,
        )
        .await
        .map_err(already_running)?;

        info!(
            user_id,
            job_id = %job.id,
            accounts = accounts.len(),
            days,
            "Backfill created"
        );
        self.spawn(job.id.clone());
        Ok(job)
    }

    pub async fn get(&self, user_id: &str, id: &str) -> ServiceResult<BackfillProgress> {
        BackfillProgress::get_for_user(&self.db, user_id, id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Backfill"))
    }

    pub async fn list(&self, user_id: &str) -> ServiceResult<Vec<BackfillProgress>> {
        Ok(BackfillProgress::list_for_user(&self.db, user_id).await?)
    }

    /// Stop the job at the next day boundary.
    pub async fn pause(&self, user_id: &str, id: &str) -> ServiceResult<BackfillProgress> {
        let job = self.get(user_id, id).await?;
        let paused = BackfillProgress::transition(
            &self.db,
            &job.id,
            &[BackfillStatus::Pending, BackfillStatus::InProgress],
            BackfillStatus::Paused,
        )
        .await?;
        if !paused {
            return Err(ServiceError::Conflict(format!(
                "Backfill is {} and cannot be paused",
                job.status
            )));
        }
        info!(user_id, job_id = %job.id, "Backfill paused");
        self.get(user_id, id).await
    }

    /// Continue a paused job from its saved position. A failed job starts
    /// over from its first account.
    pub async fn resume(self: &Arc<Self>, user_id: &str, id: &str) -> ServiceResult<BackfillProgress> {
        let job = self.get(user_id, id).await?;
        let status = job.status_enum();
        if !matches!(status, BackfillStatus::Paused | BackfillStatus::Failed) {
            return Err(ServiceError::Conflict(format!(
                "Backfill is {} and cannot be resumed",
                job.status
            )));
        }
        if BackfillProgress::find_active_for_user(&self.db, user_id).await?.is_some() {
            return Err(ServiceError::Conflict("A backfill is already running".to_string()));
        }

        if status == BackfillStatus::Failed {
            BackfillProgress::rewind(&self.db, &job.id).await?;
        }
        let pending = BackfillProgress::transition(&self.db, &job.id, &[status], BackfillStatus::Pending)
            .await
            .map_err(already_running)?;
        if !pending {
            return Err(ServiceError::Conflict("Backfill changed state, try again".to_string()));
        }

        info!(user_id, job_id = %job.id, from = %status, "Backfill resumed");
        self.spawn(job.id.clone());
        self.get(user_id, id).await
    }

    /// Restart jobs that were running when the process stopped.
    pub async fn resume_interrupted(self: &Arc<Self>) -> ServiceResult<usize> {
        let jobs = BackfillProgress::list_interrupted(&self.db).await?;
        for job in &jobs {
            info!(job_id = %job.id, user_id = %job.user_id, "Resuming interrupted backfill");
            self.spawn(job.id.clone());
        }
        Ok(jobs.len())
    }

    fn spawn(self: &Arc<Self>, id: String) {
        if self.running.insert(id.clone(), ()).is_some() {
            return;
        }

        let service = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(e) = service.run(&id).await {
                    error!(job_id = %id, error = %e, "Backfill aborted");
                    let message = e.to_string();
                    if let Err(e) =
                        BackfillProgress::finish(&service.db, &id, BackfillStatus::Failed, Some(&message)).await
                    {
                        warn!(job_id = %id, error = %e, "Failed to record backfill failure");
                    }
                }
                service.running.remove(&id);

                // A resume between the loop exiting and the removal above
                // found the job still running and did not spawn
                match BackfillProgress::get(&service.db, &id).await {
                    Ok(Some(job)) if job.status_enum().is_active() => {
                        if service.running.insert(id.clone(), ()).is_some() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
        });
    }

    /// Make sure the job may fetch another day, moving `pending` to
    /// `in_progress` on the way.
    async fn claim_day(&self, id: &str) -> ServiceResult<bool> {
        let Some(job) = BackfillProgress::get(&self.db, id).await? else {
            return Ok(false);
        };
        match job.status_enum() {
            BackfillStatus::InProgress => Ok(true),
            BackfillStatus::Pending => Ok(BackfillProgress::transition(
                &self.db,
                id,
                &[BackfillStatus::Pending],
                BackfillStatus::InProgress,
            )
            .await?),
            _ => Ok(false),
        }
    }

    /// Drive a job from its saved position until it finishes or is paused.
    pub(crate) async fn run(&self, id: &str) -> ServiceResult<()> {
        let Some(job) = BackfillProgress::get(&self.db, id).await? else {
            return Ok(());
        };
        if !self.claim_day(id).await? {
            return Ok(());
        }

        let start = parse_date("start_date", &job.start_date)?;
        let end = parse_date("end_date", &job.end_date)?;
        let accounts = job.accounts();
        let first = job.current_account_index.max(0) as usize;
        let resume_from = match job.cursor_date.as_deref() {
            Some(d) => parse_date("cursor_date", d)?.max(start),
            None => start,
        };
        let mut days_completed = job.days_completed;

        info!(
            job_id = id,
            user_id = %job.user_id,
            account_index = first,
            from = %resume_from,
            "Backfill running"
        );

        for (index, account_id) in accounts.iter().enumerate().skip(first) {
            let from = if index == first {
                resume_from
            } else {
                BackfillProgress::advance(&self.db, id, index as i64, Some(&format_date(start)), days_completed)
                    .await?;
                start
            };

            let run = self
                .backfill_account(id, &job.user_id, index, account_id, from, end, &mut days_completed)
                .await?;
            match run {
                AccountRun::Finished => {}
                AccountRun::Stopped => {
                    info!(job_id = id, account_id = %account_id, "Backfill stopped");
                    return Ok(());
                }
                AccountRun::Failed(message) => {
                    warn!(job_id = id, account_id = %account_id, error = %message, "Backfill failed for account");
                    BackfillProgress::record_account_failure(&self.db, id, account_id, &message).await?;
                }
            }

            if index + 1 < accounts.len() && self.config.backfill_account_delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.config.backfill_account_delay_ms)).await;
            }
        }

        BackfillProgress::advance(&self.db, id, accounts.len() as i64, None, days_completed).await?;
        let job = BackfillProgress::get(&self.db, id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Backfill"))?;
        if !job.status_enum().is_active() {
            return Ok(());
        }

        let status = if !accounts.is_empty() && job.accounts_failed >= accounts.len() as i64 {
            BackfillStatus::Failed
        } else {
            BackfillStatus::Completed
        };
        BackfillProgress::finish(&self.db, id, status, None).await?;
        info!(
            job_id = id,
            status = %status,
            days_completed,
            accounts_failed = job.accounts_failed,
            "Backfill finished"
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn backfill_account(
        &self,
        id: &str,
        user_id: &str,
        index: usize,
        account_id: &str,
        from: NaiveDate,
        end: NaiveDate,
        days_completed: &mut i64,
    ) -> ServiceResult<AccountRun> {
        let Some(account) = AdAccount::get(&self.db, user_id, account_id).await? else {
            return Ok(AccountRun::Failed("Ad account not found".to_string()));
        };

        let mut day = from;
        while day <= end {
            if !self.claim_day(id).await? {
                return Ok(AccountRun::Stopped);
            }

            match self.collector.collect_for_account(user_id, &account, day).await {
                Ok(Attempt::Done(_)) => {
                    *days_completed += 1;
                    day += Duration::days(1);
                    BackfillProgress::advance(&self.db, id, index as i64, Some(&format_date(day)), *days_completed)
                        .await?;
                    record_backfill_day();
                }
                Ok(Attempt::Deferred { process_after }) => {
                    let wait = (process_after - Utc::now()).to_std().unwrap_or_default();
                    info!(
                        job_id = id,
                        account_id,
                        wait_secs = wait.as_secs(),
                        "Backfill waiting for rate limits to reset"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Ok(AccountRun::Failed(e.to_string())),
            }
        }

        Ok(AccountRun::Finished)
    }
}
