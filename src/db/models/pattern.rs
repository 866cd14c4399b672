//! Patterns learned from performance snapshots.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LearnedPattern {
    pub id: String,
    pub user_id: String,
    pub ad_account_id: String,
    /// `metric_baseline`, `best_weekday` or `fatigue_threshold`
    pub pattern_type: String,
    pub metric: String,
    /// Pattern-specific JSON payload
    pub data: String,
    pub sample_size: i64,
    pub confidence: f64,
    pub learned_at: String,
}

impl LearnedPattern {
    pub fn data_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.data).unwrap_or(serde_json::Value::Null)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn upsert(
        db: &SqlitePool,
        user_id: &str,
        ad_account_id: &str,
        pattern_type: &str,
        metric: &str,
        data: &serde_json::Value,
        sample_size: i64,
        confidence: f64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO intel_learned_patterns (id, user_id, ad_account_id, pattern_type, metric, data, sample_size, confidence, learned_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(ad_account_id, pattern_type, metric) DO UPDATE SET
                user_id = excluded.user_id,
                data = excluded.data,
                sample_size = excluded.sample_size,
                confidence = excluded.confidence,
                learned_at = excluded.learned_at
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(ad_account_id)
        .bind(pattern_type)
        .bind(metric)
        .bind(data.to_string())
        .bind(sample_size)
        .bind(confidence)
        .bind(crate::db::now())
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn get(
        db: &SqlitePool,
        ad_account_id: &str,
        pattern_type: &str,
        metric: &str,
    ) -> Result<Option<LearnedPattern>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM intel_learned_patterns WHERE ad_account_id = ? AND pattern_type = ? AND metric = ?",
        )
        .bind(ad_account_id)
        .bind(pattern_type)
        .bind(metric)
        .fetch_optional(db)
        .await
    }

    pub async fn list_for_user(
        db: &SqlitePool,
        user_id: &str,
        ad_account_id: Option<&str>,
    ) -> Result<Vec<LearnedPattern>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM intel_learned_patterns
            WHERE user_id = ? AND (? IS NULL OR ad_account_id = ?)
            ORDER BY ad_account_id, pattern_type, metric
            "#,
        )
        .bind(user_id)
        .bind(ad_account_id)
        .bind(ad_account_id)
        .fetch_all(db)
        .await
    }
}
