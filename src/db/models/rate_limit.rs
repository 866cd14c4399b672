//! Per-user hourly Graph call counters.

use serde::Serialize;
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct RateLimitStatus {
    pub user_id: String,
    pub hour_bucket: String,
    pub call_count: i64,
    /// Highest `x-app-usage` percentage seen this hour
    pub app_usage_pct: f64,
    /// Highest `x-business-use-case-usage` percentage seen this hour
    pub buc_usage_pct: f64,
    pub throttled_until: Option<String>,
    pub updated_at: String,
}

impl RateLimitStatus {
    pub async fn get(
        db: &SqlitePool,
        user_id: &str,
        bucket: &str,
    ) -> Result<Option<RateLimitStatus>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM rate_limit_status WHERE user_id = ? AND hour_bucket = ?")
            .bind(user_id)
            .bind(bucket)
            .fetch_optional(db)
            .await
    }

    /// Count one call for the user unless the hour's threshold is reached.
    ///
    /// The check and the increment are a single conditional upsert, so
    /// concurrent requests cannot push the counter past `threshold`.
    pub async fn try_increment(
        db: &SqlitePool,
        user_id: &str,
        bucket: &str,
        threshold: i64,
    ) -> Result<bool, sqlx::Error> {
        Self::try_add(db, user_id, bucket, 1, threshold).await
    }

    /// Count `units` calls if they all fit under `threshold`. An operation
    /// larger than the whole threshold needs an otherwise unused hour.
    pub async fn try_add(
        db: &SqlitePool,
        user_id: &str,
        bucket: &str,
        units: i64,
        threshold: i64,
    ) -> Result<bool, sqlx::Error> {
        if threshold <= 0 {
            return Ok(false);
        }
        let units = units.clamp(1, threshold);
        let result = sqlx::query(
            r#"
            INSERT INTO rate_limit_status (user_id, hour_bucket, call_count, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id, hour_bucket) DO UPDATE SET
                call_count = call_count + excluded.call_count,
                updated_at = excluded.updated_at
            WHERE call_count + excluded.call_count <= ?
            "#,
        )
        .bind(user_id)
        .bind(bucket)
        .bind(units)
        .bind(crate::db::now())
        .bind(threshold)
        .execute(db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Count a call without enforcing any threshold
    pub async fn increment(db: &SqlitePool, user_id: &str, bucket: &str) -> Result<(), sqlx::Error> {
        Self::add(db, user_id, bucket, 1).await
    }

    pub async fn add(db: &SqlitePool, user_id: &str, bucket: &str, units: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO rate_limit_status (user_id, hour_bucket, call_count, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id, hour_bucket) DO UPDATE SET
                call_count = call_count + excluded.call_count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(bucket)
        .bind(units.max(1))
        .bind(crate::db::now())
        .execute(db)
        .await?;
        Ok(())
    }

    /// Remember the highest usage percentages reported by Graph this hour
    pub async fn record_usage(
        db: &SqlitePool,
        user_id: &str,
        bucket: &str,
        app_usage_pct: f64,
        buc_usage_pct: f64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO rate_limit_status (user_id, hour_bucket, call_count, app_usage_pct, buc_usage_pct, updated_at)
            VALUES (?, ?, 0, ?, ?, ?)
            ON CONFLICT(user_id, hour_bucket) DO UPDATE SET
                app_usage_pct = MAX(app_usage_pct, excluded.app_usage_pct),
                buc_usage_pct = MAX(buc_usage_pct, excluded.buc_usage_pct),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(bucket)
        .bind(app_usage_pct)
        .bind(buc_usage_pct)
        .bind(crate::db::now())
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn throttle(
        db: &SqlitePool,
        user_id: &str,
        bucket: &str,
        until: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO rate_limit_status (user_id, hour_bucket, call_count, throttled_until, updated_at)
            VALUES (?, ?, 0, ?, ?)
            ON CONFLICT(user_id, hour_bucket) DO UPDATE SET
                throttled_until = excluded.throttled_until,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(bucket)
        .bind(until)
        .bind(crate::db::now())
        .execute(db)
        .await?;
        Ok(())
    }

    /// Latest throttle expiry for the user still in the future
    pub async fn active_throttle(
        db: &SqlitePool,
        user_id: &str,
        now: &str,
    ) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT MAX(throttled_until) FROM rate_limit_status WHERE user_id = ? AND throttled_until > ?",
        )
        .bind(user_id)
        .bind(now)
        .fetch_one(db)
        .await
    }

    /// Delete counters for hours before `bucket`
    pub async fn cleanup_before(db: &SqlitePool, bucket: &str, now: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM rate_limit_status WHERE hour_bucket < ? AND (throttled_until IS NULL OR throttled_until <= ?)",
        )
        .bind(bucket)
        .bind(now)
        .execute(db)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_try_increment_stops_at_threshold() {
        let db = crate::db::init_memory().await.unwrap();
        for _ in 0..3 {
            assert!(RateLimitStatus::try_increment(&db, "u1", "2026-10-18T10", 3).await.unwrap());
        }
        assert!(!RateLimitStatus::try_increment(&db, "u1", "2026-10-18T10", 3).await.unwrap());

        let status = RateLimitStatus::get(&db, "u1", "2026-10-18T10").await.unwrap().unwrap();
        assert_eq!(status.call_count, 3);

        // Other users and other hours are independent
        assert!(RateLimitStatus::try_increment(&db, "u2", "2026-10-18T10", 3).await.unwrap());
        assert!(RateLimitStatus::try_increment(&db, "u1", "2026-10-18T11", 3).await.unwrap());
    }

    #[tokio::test]
    async fn test_multi_call_operations_are_charged_in_full() {
        let db = crate::db::init_memory().await.unwrap();
        let bucket = "2026-10-18T10";
        assert!(RateLimitStatus::try_add(&db, "u1", bucket, 7, 10).await.unwrap());
        // 7 + 5 would pass the threshold
        assert!(!RateLimitStatus::try_add(&db, "u1", bucket, 5, 10).await.unwrap());
        assert!(RateLimitStatus::try_add(&db, "u1", bucket, 3, 10).await.unwrap());
        assert_eq!(RateLimitStatus::get(&db, "u1", bucket).await.unwrap().unwrap().call_count, 10);

        // Larger than the threshold: only fits an unused hour, which it fills
        assert!(RateLimitStatus::try_add(&db, "u2", bucket, 25, 10).await.unwrap());
        assert_eq!(RateLimitStatus::get(&db, "u2", bucket).await.unwrap().unwrap().call_count, 10);
        assert!(!RateLimitStatus::try_add(&db, "u2", bucket, 1, 10).await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_threshold_refuses() {
        let db = crate::db::init_memory().await.unwrap();
        assert!(!RateLimitStatus::try_increment(&db, "u1", "2026-10-18T10", 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_usage_keeps_maximum() {
        let db = crate::db::init_memory().await.unwrap();
        RateLimitStatus::record_usage(&db, "u1", "b", 40.0, 10.0).await.unwrap();
        RateLimitStatus::record_usage(&db, "u1", "b", 20.0, 55.0).await.unwrap();
        let status = RateLimitStatus::get(&db, "u1", "b").await.unwrap().unwrap();
        assert_eq!(status.app_usage_pct, 40.0);
        assert_eq!(status.buc_usage_pct, 55.0);
        assert_eq!(status.call_count, 0);
    }

    #[tokio::test]
    async fn test_throttle_and_cleanup() {
        let db = crate::db::init_memory().await.unwrap();
        RateLimitStatus::increment(&db, "u1", "2026-10-16T08").await.unwrap();
        RateLimitStatus::throttle(&db, "u1", "2026-10-18T10", "2026-10-18T10:30:00Z")
            .await
            .unwrap();

        let active = RateLimitStatus::active_throttle(&db, "u1", "2026-10-18T10:10:00Z")
            .await
            .unwrap();
        assert_eq!(active.as_deref(), Some("2026-10-18T10:30:00Z"));
        assert!(RateLimitStatus::active_throttle(&db, "u1", "2026-10-18T10:31:00Z")
            .await
            .unwrap()
            .is_none());

        let removed = RateLimitStatus::cleanup_before(&db, "2026-10-17T00", "2026-10-18T10:10:00Z")
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }
}
