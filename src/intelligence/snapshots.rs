//! Daily performance snapshots built from campaign insights.

use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::{normalize_account_id, AdAccount, DbPool, NewSnapshot, PerformanceSnapshot};
use crate::error::{ServiceError, ServiceResult};
use crate::facebook::InsightRow;
use crate::ratelimit::{Attempt, RateLimitRouter};

pub const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn parse_date(field: &str, value: &str) -> ServiceResult<NaiveDate> {
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .map_err(|_| ServiceError::invalid(field, "Date must be formatted as YYYY-MM-DD"))
}

pub fn yesterday() -> NaiveDate {
    Utc::now().date_naive() - Duration::days(1)
}

#[derive(Debug, Default, Deserialize)]
pub struct CollectRequest {
    pub ad_account_id: Option<String>,
    pub date: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SnapshotQuery {
    pub ad_account_id: String,
    pub from: Option<String>,
    pub to: Option<String>,
}

/// Result of a collection run over one or more accounts
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct CollectSummary {
    pub accounts: usize,
    pub snapshots: usize,
    /// Accounts skipped because every credential was rate limited
    pub deferred: usize,
    pub failed: usize,
}

fn to_snapshot(user_id: &str, account_id: &str, row: &InsightRow) -> NewSnapshot {
    NewSnapshot {
        user_id: user_id.to_string(),
        ad_account_id: account_id.to_string(),
        entity_type: "campaign".to_string(),
        entity_id: row.campaign_id.clone(),
        entity_name: row.campaign_name.clone(),
        snapshot_date: format_date(row.date),
        impressions: row.impressions,
        clicks: row.clicks,
        reach: row.reach,
        spend: row.spend,
        conversions: row.conversions.round() as i64,
        revenue: row.revenue,
    }
}

pub struct SnapshotCollector {
    db: DbPool,
    router: Arc<RateLimitRouter>,
}

impl SnapshotCollector {
    pub fn new(db: DbPool, router: Arc<RateLimitRouter>) -> Self {
        Self { db, router }
    }

    /// Fetch one day of campaign insights for `account` and store them.
    ///
    /// Returns the number of snapshots written, or `Deferred` when no
    /// credential can make the call right now.
    pub async fn collect_for_account(
        &self,
        user_id: &str,
        account: &AdAccount,
        date: NaiveDate,
    ) -> ServiceResult<Attempt<usize>> {
        let api = self.router.api();
        let account_id = account.id.as_str();
        let attempt = self
            .router
            .execute(user_id, account, |credential| async move {
                api.get_insights(&credential.token, account_id, date).await
            })
            .await?;

        let rows = match attempt {
            Attempt::Done(rows) => rows,
            Attempt::Deferred { process_after } => return Ok(Attempt::Deferred { process_after }),
        };

        for row in &rows {
            PerformanceSnapshot::upsert(&self.db, &to_snapshot(user_id, account_id, row)).await?;
        }

        debug!(
            user_id,
            account_id,
            date = %date,
            snapshots = rows.len(),
            "Collected performance snapshots"
        );
        Ok(Attempt::Done(rows.len()))
    }

    async fn collect_accounts(&self, accounts: &[AdAccount], date: NaiveDate) -> CollectSummary {
        let mut summary = CollectSummary::default();

        for account in accounts {
            summary.accounts += 1;
            match self.collect_for_account(&account.user_id, account, date).await {
                Ok(Attempt::Done(n)) => summary.snapshots += n,
                Ok(Attempt::Deferred { process_after }) => {
                    summary.deferred += 1;
                    info!(
                        account_id = %account.id,
                        retry_at = %process_after,
                        "Snapshot collection deferred by rate limits"
                    );
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(
                        user_id = %account.user_id,
                        account_id = %account.id,
                        error = %e,
                        "Snapshot collection failed"
                    );
                }
            }
        }

        summary
    }

    /// Collect for one of the user's accounts, or all of them.
    pub async fn collect_for_user(&self, user_id: &str, request: CollectRequest) -> ServiceResult<CollectSummary> {
        let date = match request.date.as_deref() {
            Some(d) => parse_date("date", d)?,
            None => yesterday(),
        };
        if date > Utc::now().date_naive() {
            return Err(ServiceError::invalid("date", "Date cannot be in the future"));
        }

        let accounts = match request.ad_account_id.as_deref() {
            Some(id) => {
                let id = normalize_account_id(id)
                    .ok_or_else(|| ServiceError::invalid("ad_account_id", "Invalid ad account id"))?;
                let account = AdAccount::get(&self.db, user_id, &id)
                    .await?
                    .ok_or_else(|| ServiceError::not_found("Ad account"))?;
                vec![account]
            }
            None => AdAccount::list_for_user(&self.db, user_id).await?,
        };

        Ok(self.collect_accounts(&accounts, date).await)
    }

    /// Collect `date` for every registered account of every user.
    pub async fn collect_all(&self, date: NaiveDate) -> ServiceResult<CollectSummary> {
        let accounts = AdAccount::list_all(&self.db).await?;
        Ok(self.collect_accounts(&accounts, date).await)
    }

    /// Stored snapshots for one account, defaulting to the last 30 days.
    pub async fn list(&self, user_id: &str, query: &SnapshotQuery) -> ServiceResult<Vec<PerformanceSnapshot>> {
        let account_id = normalize_account_id(&query.ad_account_id)
            .ok_or_else(|| ServiceError::invalid("ad_account_id", "Invalid ad account id"))?;
        let to = match query.to.as_deref() {
            Some(d) => parse_date("to", d)?,
            None => Utc::now().date_naive(),
        };
        let from = match query.from.as_deref() {
            Some(d) => parse_date("from", d)?,
            None => to - Duration::days(30),
        };
        if from > to {
            return Err(ServiceError::invalid("from", "Start date must not be after end date"));
        }

        Ok(PerformanceSnapshot::list_range(
            &self.db,
            user_id,
            &account_id,
            &format_date(from),
            &format_date(to),
        )
        .await?)
    }
}
