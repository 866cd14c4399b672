//! Requests deferred because every credential was rate limited.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl From<String> for QueueStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => Self::Queued,
        }
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct QueuedRequest {
    pub id: String,
    pub user_id: String,
    pub ad_account_id: String,
    /// Serialized operation to replay
    pub operation: String,
    pub status: String,
    pub attempts: i64,
    pub process_after: String,
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl QueuedRequest {
    pub fn status_enum(&self) -> QueueStatus {
        QueueStatus::from(self.status.clone())
    }

    pub async fn create(
        db: &SqlitePool,
        user_id: &str,
        ad_account_id: &str,
        operation: &str,
        process_after: &str,
    ) -> Result<QueuedRequest, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = crate::db::now();
        sqlx::query(
            r#"
            INSERT INTO queued_requests (id, user_id, ad_account_id, operation, status, process_after, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'queued', ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(ad_account_id)
        .bind(operation)
        .bind(process_after)
        .bind(&now)
        .bind(&now)
        .execute(db)
        .await?;

        Self::get(db, &id).await?.ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn get(db: &SqlitePool, id: &str) -> Result<Option<QueuedRequest>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM queued_requests WHERE id = ?")
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn list_for_user(
        db: &SqlitePool,
        user_id: &str,
        status: Option<&str>,
    ) -> Result<Vec<QueuedRequest>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM queued_requests
            WHERE user_id = ? AND (? IS NULL OR status = ?)
            ORDER BY created_at DESC
            LIMIT 200
            "#,
        )
        .bind(user_id)
        .bind(status)
        .bind(status)
        .fetch_all(db)
        .await
    }

    pub async fn count_pending_for_user(db: &SqlitePool, user_id: &str) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM queued_requests WHERE user_id = ? AND status IN ('queued', 'processing')",
        )
        .bind(user_id)
        .fetch_one(db)
        .await
    }

    /// Cancel a request that has not started processing
    pub async fn cancel(db: &SqlitePool, user_id: &str, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE queued_requests SET status = 'cancelled', updated_at = ? WHERE id = ? AND user_id = ? AND status = 'queued'",
        )
        .bind(crate::db::now())
        .bind(id)
        .bind(user_id)
        .execute(db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move due requests to `processing` and return the ones this caller claimed.
    pub async fn claim_due(
        db: &SqlitePool,
        now: &str,
        limit: i64,
    ) -> Result<Vec<QueuedRequest>, sqlx::Error> {
        let due: Vec<QueuedRequest> = sqlx::query_as(
            r#"
            SELECT * FROM queued_requests
            WHERE status = 'queued' AND process_after <= ?
            ORDER BY process_after ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(db)
        .await?;

        let mut claimed = Vec::with_capacity(due.len());
        for mut request in due {
            let result = sqlx::query(
                r#"
                UPDATE queued_requests
                SET status = 'processing', attempts = attempts + 1, updated_at = ?
                WHERE id = ? AND status = 'queued'
                "#,
            )
            .bind(now)
            .bind(&request.id)
            .execute(db)
            .await?;

            if result.rows_affected() == 1 {
                request.status = QueueStatus::Processing.to_string();
                request.attempts += 1;
                claimed.push(request);
            }
        }
        Ok(claimed)
    }

    pub async fn complete(db: &SqlitePool, id: &str, result: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE queued_requests SET status = 'completed', result = ?, error_message = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(result)
        .bind(crate::db::now())
        .bind(id)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn fail(db: &SqlitePool, id: &str, error: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE queued_requests SET status = 'failed', error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(crate::db::now())
        .bind(id)
        .execute(db)
        .await?;
        Ok(())
    }

    /// Put a request back in the queue to be retried at `process_after`
    pub async fn reschedule(
        db: &SqlitePool,
        id: &str,
        process_after: &str,
        error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE queued_requests SET status = 'queued', process_after = ?, error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(process_after)
        .bind(error)
        .bind(crate::db::now())
        .bind(id)
        .execute(db)
        .await?;
        Ok(())
    }

    /// Requests left in `processing` by a crashed process go back to the queue
    pub async fn requeue_stale(db: &SqlitePool, older_than: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE queued_requests SET status = 'queued' WHERE status = 'processing' AND updated_at < ?",
        )
        .bind(older_than)
        .execute(db)
        .await?;
        Ok(result.rows_affected())
    }

    /// Delete finished requests last touched before `cutoff`
    pub async fn cleanup_finished(db: &SqlitePool, cutoff: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM queued_requests WHERE status IN ('completed', 'failed', 'cancelled') AND updated_at < ?",
        )
        .bind(cutoff)
        .execute(db)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_claim_only_due_requests() {
        let db = crate::db::init_memory().await.unwrap();
        let due = QueuedRequest::create(&db, "u1", "act_1", "{}", "2026-10-18T10:00:00Z")
            .await
            .unwrap();
        QueuedRequest::create(&db, "u1", "act_1", "{}", "2026-10-18T12:00:00Z")
            .await
            .unwrap();

        let claimed = QueuedRequest::claim_due(&db, "2026-10-18T11:00:00Z", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, due.id);
        assert_eq!(claimed[0].attempts, 1);
        assert_eq!(claimed[0].status_enum(), QueueStatus::Processing);

        // Already claimed
        let again = QueuedRequest::claim_due(&db, "2026-10-18T11:00:00Z", 10).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_only_queued() {
        let db = crate::db::init_memory().await.unwrap();
        let req = QueuedRequest::create(&db, "u1", "act_1", "{}", "2026-10-18T10:00:00Z")
            .await
            .unwrap();

        assert!(!QueuedRequest::cancel(&db, "someone-else", &req.id).await.unwrap());
        assert!(QueuedRequest::cancel(&db, "u1", &req.id).await.unwrap());
        assert!(!QueuedRequest::cancel(&db, "u1", &req.id).await.unwrap());
        assert_eq!(QueuedRequest::count_pending_for_user(&db, "u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reschedule_and_complete() {
        let db = crate::db::init_memory().await.unwrap();
        let req = QueuedRequest::create(&db, "u1", "act_1", "{}", "2026-10-18T10:00:00Z")
            .await
            .unwrap();
        QueuedRequest::claim_due(&db, "2026-10-18T10:00:00Z", 10).await.unwrap();
        QueuedRequest::reschedule(&db, &req.id, "2026-10-18T11:00:00Z", Some("still limited"))
            .await
            .unwrap();

        let listed = QueuedRequest::list_for_user(&db, "u1", Some("queued")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].error_message.as_deref(), Some("still limited"));

        QueuedRequest::complete(&db, &req.id, "{\"ok\":true}").await.unwrap();
        let done = QueuedRequest::get(&db, &req.id).await.unwrap().unwrap();
        assert_eq!(done.status_enum(), QueueStatus::Completed);
        assert!(done.error_message.is_none());
    }
}
