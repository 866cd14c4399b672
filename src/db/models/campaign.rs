//! Locally tracked campaigns created through the service.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Campaign {
    pub id: String,
    pub user_id: String,
    pub ad_account_id: String,
    pub fb_campaign_id: String,
    pub name: String,
    pub objective: String,
    pub status: String,
    pub daily_budget: Option<i64>,
    pub lifetime_budget: Option<i64>,
    /// Local id of the campaign this one was duplicated from
    pub source_campaign_id: Option<String>,
    /// `duplicate` or `1-n-1` when produced by a duplication flow
    pub strategy: Option<String>,
    /// JSON array of Graph ad set ids
    pub fb_ad_set_ids: String,
    /// JSON array of Graph ad ids
    pub fb_ad_ids: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields needed to record a campaign after Graph created it
#[derive(Debug, Clone, Default)]
pub struct NewCampaign {
    pub user_id: String,
    pub ad_account_id: String,
    pub fb_campaign_id: String,
    pub name: String,
    pub objective: String,
    pub status: String,
    pub daily_budget: Option<i64>,
    pub lifetime_budget: Option<i64>,
    pub source_campaign_id: Option<String>,
    pub strategy: Option<String>,
    pub fb_ad_set_ids: Vec<String>,
    pub fb_ad_ids: Vec<String>,
}

impl Campaign {
    pub fn ad_set_ids(&self) -> Vec<String> {
        serde_json::from_str(&self.fb_ad_set_ids).unwrap_or_default()
    }

    pub fn ad_ids(&self) -> Vec<String> {
        serde_json::from_str(&self.fb_ad_ids).unwrap_or_default()
    }

    pub async fn create(db: &SqlitePool, new: &NewCampaign) -> Result<Campaign, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = crate::db::now();
        let ad_set_ids = serde_json::to_string(&new.fb_ad_set_ids).unwrap_or_else(|_| "[]".into());
        let ad_ids = serde_json::to_string(&new.fb_ad_ids).unwrap_or_else(|_| "[]".into());

        sqlx::query(
            r#"
            INSERT INTO campaigns (
                id, user_id, ad_account_id, fb_campaign_id, name, objective, status,
                daily_budget, lifetime_budget, source_campaign_id, strategy,
                fb_ad_set_ids, fb_ad_ids, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new.user_id)
        .bind(&new.ad_account_id)
        .bind(&new.fb_campaign_id)
        .bind(&new.name)
        .bind(&new.objective)
        .bind(&new.status)
        .bind(new.daily_budget)
        .bind(new.lifetime_budget)
        .bind(&new.source_campaign_id)
        .bind(&new.strategy)
        .bind(ad_set_ids)
        .bind(ad_ids)
        .bind(&now)
        .bind(&now)
        .execute(db)
        .await?;

        Self::get(db, &new.user_id, &id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn get(db: &SqlitePool, user_id: &str, id: &str) -> Result<Option<Campaign>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM campaigns WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .fetch_optional(db)
            .await
    }

    pub async fn get_by_fb_id(
        db: &SqlitePool,
        user_id: &str,
        fb_campaign_id: &str,
    ) -> Result<Option<Campaign>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM campaigns WHERE fb_campaign_id = ? AND user_id = ?")
            .bind(fb_campaign_id)
            .bind(user_id)
            .fetch_optional(db)
            .await
    }

    pub async fn list_for_user(
        db: &SqlitePool,
        user_id: &str,
        ad_account_id: Option<&str>,
    ) -> Result<Vec<Campaign>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM campaigns
            WHERE user_id = ? AND (? IS NULL OR ad_account_id = ?)
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .bind(ad_account_id)
        .bind(ad_account_id)
        .fetch_all(db)
        .await
    }

    pub async fn update_status(
        db: &SqlitePool,
        user_id: &str,
        id: &str,
        status: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE campaigns SET status = ?, updated_at = ? WHERE id = ? AND user_id = ?",
        )
        .bind(status)
        .bind(crate::db::now())
        .bind(id)
        .bind(user_id)
        .execute(db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Status update keyed by Graph id, used by automation
    pub async fn update_status_by_fb_id(
        db: &SqlitePool,
        fb_campaign_id: &str,
        status: &str,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE campaigns SET status = ?, updated_at = ? WHERE fb_campaign_id = ?",
        )
        .bind(status)
        .bind(crate::db::now())
        .bind(fb_campaign_id)
        .execute(db)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete(db: &SqlitePool, user_id: &str, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM campaigns WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
