//! Progress rows for intelligence backfill jobs.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackfillStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Paused,
}

impl BackfillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

impl std::fmt::Display for BackfillStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for BackfillStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "in_progress" => Self::InProgress,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "paused" => Self::Paused,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct BackfillProgress {
    pub id: String,
    pub user_id: String,
    pub status: String,
    pub start_date: String,
    pub end_date: String,
    /// JSON array of ad account ids, processed in order
    pub account_ids: String,
    pub current_account_index: i64,
    /// Next date to fetch for the current account
    pub cursor_date: Option<String>,
    pub total_days: i64,
    pub days_completed: i64,
    pub accounts_failed: i64,
    pub error_message: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl BackfillProgress {
    pub fn status_enum(&self) -> BackfillStatus {
        BackfillStatus::from(self.status.clone())
    }

    pub fn accounts(&self) -> Vec<String> {
        serde_json::from_str(&self.account_ids).unwrap_or_default()
    }

    pub fn percent_complete(&self) -> f64 {
        if self.total_days <= 0 {
            return 0.0;
        }
        (self.days_completed as f64 / self.total_days as f64 * 100.0).min(100.0)
    }

    pub async fn create(
        db: &SqlitePool,
        user_id: &str,
        start_date: &str,
        end_date: &str,
        account_ids: &[String],
        total_days: i64,
    ) -> Result<BackfillProgress, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = crate::db::now();
        let accounts = serde_json::to_string(account_ids).unwrap_or_else(|_| "[]".into());

        sqlx::query(
            r#"
            INSERT INTO intel_backfill_progress (
                id, user_id, status, start_date, end_date, account_ids,
                current_account_index, cursor_date, total_days, created_at, updated_at
            )
            VALUES (?, ?, 'pending', ?, ?, ?, 0, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(start_date)
        .bind(end_date)
        .bind(accounts)
        .bind(start_date)
        .bind(total_days)
        .bind(&now)
        .bind(&now)
        .execute(db)
        .await?;

        Self::get(db, &id).await?.ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn get(db: &SqlitePool, id: &str) -> Result<Option<BackfillProgress>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM intel_backfill_progress WHERE id = ?")
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn get_for_user(
        db: &SqlitePool,
        user_id: &str,
        id: &str,
    ) -> Result<Option<BackfillProgress>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM intel_backfill_progress WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .fetch_optional(db)
            .await
    }

    pub async fn list_for_user(db: &SqlitePool, user_id: &str) -> Result<Vec<BackfillProgress>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM intel_backfill_progress WHERE user_id = ? ORDER BY created_at DESC LIMIT 50",
        )
        .bind(user_id)
        .fetch_all(db)
        .await
    }

    pub async fn find_active_for_user(
        db: &SqlitePool,
        user_id: &str,
    ) -> Result<Option<BackfillProgress>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM intel_backfill_progress WHERE user_id = ? AND status IN ('pending', 'in_progress') LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(db)
        .await
    }

    /// Jobs interrupted by a restart, to be resumed at startup
    pub async fn list_interrupted(db: &SqlitePool) -> Result<Vec<BackfillProgress>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM intel_backfill_progress WHERE status IN ('pending', 'in_progress') ORDER BY created_at ASC",
        )
        .fetch_all(db)
        .await
    }

    /// Move the job to `to` only if it is currently in one of `from`
    pub async fn transition(
        db: &SqlitePool,
        id: &str,
        from: &[BackfillStatus],
        to: BackfillStatus,
    ) -> Result<bool, sqlx::Error> {
        let current = match Self::get(db, id).await? {
            Some(p) => p.status_enum(),
            None => return Ok(false),
        };
        if !from.contains(&current) {
            return Ok(false);
        }

        let now = crate::db::now();
        let result = sqlx::query(
            r#"
            UPDATE intel_backfill_progress SET
                status = ?,
                started_at = CASE WHEN ? = 'in_progress' AND started_at IS NULL THEN ? ELSE started_at END,
                updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(to.as_str())
        .bind(to.as_str())
        .bind(&now)
        .bind(&now)
        .bind(id)
        .bind(current.as_str())
        .execute(db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Persist the position after a day was fetched
    pub async fn advance(
        db: &SqlitePool,
        id: &str,
        account_index: i64,
        cursor_date: Option<&str>,
        days_completed: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE intel_backfill_progress SET
                current_account_index = ?, cursor_date = ?, days_completed = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(account_index)
        .bind(cursor_date)
        .bind(days_completed)
        .bind(crate::db::now())
        .bind(id)
        .execute(db)
        .await?;
        Ok(())
    }

    /// Rewind a job to its first account and day, clearing failures
    pub async fn rewind(db: &SqlitePool, id: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE intel_backfill_progress SET
                current_account_index = 0, cursor_date = start_date, days_completed = 0,
                accounts_failed = 0, error_message = NULL, completed_at = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(crate::db::now())
        .bind(id)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn record_account_failure(
        db: &SqlitePool,
        id: &str,
        account_id: &str,
        error: &str,
    ) -> Result<(), sqlx::Error> {
        let line = format!("{}: {}", account_id, error);
        sqlx::query(
            r#"
            UPDATE intel_backfill_progress SET
                accounts_failed = accounts_failed + 1,
                error_message = CASE WHEN error_message IS NULL THEN ? ELSE error_message || char(10) || ? END,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&line)
        .bind(&line)
        .bind(crate::db::now())
        .bind(id)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn finish(
        db: &SqlitePool,
        id: &str,
        status: BackfillStatus,
        error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        let now = crate::db::now();
        sqlx::query(
            r#"
            UPDATE intel_backfill_progress SET
                status = ?,
                error_message = COALESCE(?, error_message),
                completed_at = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(db)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transitions_respect_current_status() {
        let db = crate::db::init_memory().await.unwrap();
        let accounts = vec!["act_1".to_string(), "act_2".to_string()];
        let job = BackfillProgress::create(&db, "u1", "2026-10-01", "2026-10-10", &accounts, 20)
            .await
            .unwrap();
        assert_eq!(job.status_enum(), BackfillStatus::Pending);
        assert_eq!(job.cursor_date.as_deref(), Some("2026-10-01"));
        assert_eq!(job.accounts(), accounts);

        assert!(!BackfillProgress::transition(&db, &job.id, &[BackfillStatus::Paused], BackfillStatus::Pending)
            .await
            .unwrap());
        assert!(BackfillProgress::transition(
            &db,
            &job.id,
            &[BackfillStatus::Pending],
            BackfillStatus::InProgress
        )
        .await
        .unwrap());

        let job = BackfillProgress::get(&db, &job.id).await.unwrap().unwrap();
        assert_eq!(job.status_enum(), BackfillStatus::InProgress);
        assert!(job.started_at.is_some());
        assert!(BackfillProgress::find_active_for_user(&db, "u1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_one_active_job_per_user() {
        let db = crate::db::init_memory().await.unwrap();
        let first = BackfillProgress::create(&db, "u1", "2026-10-01", "2026-10-01", &["act_1".into()], 1)
            .await
            .unwrap();

        let err = BackfillProgress::create(&db, "u1", "2026-10-02", "2026-10-02", &["act_1".into()], 1)
            .await
            .unwrap_err();
        assert!(err.as_database_error().is_some_and(|e| e.is_unique_violation()));

        // Other users are unaffected
        BackfillProgress::create(&db, "u2", "2026-10-01", "2026-10-01", &["act_2".into()], 1)
            .await
            .unwrap();

        // Once the first is paused a new job fits, and the paused one can
        // no longer become active
        assert!(BackfillProgress::transition(&db, &first.id, &[BackfillStatus::Pending], BackfillStatus::Paused)
            .await
            .unwrap());
        BackfillProgress::create(&db, "u1", "2026-10-02", "2026-10-02", &["act_1".into()], 1)
            .await
            .unwrap();
        let err = BackfillProgress::transition(&db, &first.id, &[BackfillStatus::Paused], BackfillStatus::Pending)
            .await
            .unwrap_err();
        assert!(err.as_database_error().is_some_and(|e| e.is_unique_violation()));
    }

    #[tokio::test]
    async fn test_failures_accumulate_messages() {
        let db = crate::db::init_memory().await.unwrap();
        let job = BackfillProgress::create(&db, "u1", "2026-10-01", "2026-10-01", &["act_1".into()], 1)
            .await
            .unwrap();
        BackfillProgress::record_account_failure(&db, &job.id, "act_1", "token expired")
            .await
            .unwrap();
        BackfillProgress::record_account_failure(&db, &job.id, "act_2", "boom")
            .await
            .unwrap();
        BackfillProgress::finish(&db, &job.id, BackfillStatus::Failed, None)
            .await
            .unwrap();

        let job = BackfillProgress::get(&db, &job.id).await.unwrap().unwrap();
        assert_eq!(job.accounts_failed, 2);
        assert_eq!(job.error_message.as_deref(), Some("act_1: token expired\nact_2: boom"));
        assert_eq!(job.status_enum(), BackfillStatus::Failed);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_percent_complete() {
        let mut job = BackfillProgress {
            id: "j".into(),
            user_id: "u".into(),
            status: "in_progress".into(),
            start_date: "2026-10-01".into(),
            end_date: "2026-10-10".into(),
            account_ids: "[]".into(),
            current_account_index: 0,
            cursor_date: None,
            total_days: 20,
            days_completed: 5,
            accounts_failed: 0,
            error_message: None,
            started_at: None,
            completed_at: None,
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert_eq!(job.percent_complete(), 25.0);
        job.total_days = 0;
        assert_eq!(job.percent_complete(), 0.0);
    }
}
