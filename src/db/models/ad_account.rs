//! Ad account models and DTOs.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AdAccount {
    /// Graph id including the `act_` prefix
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub business_id: Option<String>,
    /// Owned by a business whose system user may act on it
    pub is_internal: bool,
    pub currency: String,
    pub timezone: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAdAccountRequest {
    pub id: String,
    pub name: String,
    pub business_id: Option<String>,
    #[serde(default)]
    pub is_internal: bool,
    pub currency: Option<String>,
    pub timezone: Option<String>,
}

/// Normalize an ad account id to the `act_<digits>` form the Graph API uses.
pub fn normalize_account_id(id: &str) -> Option<String> {
    let digits = id.trim().strip_prefix("act_").unwrap_or(id.trim());
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(format!("act_{}", digits))
}

impl AdAccount {
    pub async fn upsert(
        db: &SqlitePool,
        user_id: &str,
        account_id: &str,
        req: &CreateAdAccountRequest,
    ) -> Result<AdAccount, sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO ad_accounts (id, user_id, name, business_id, is_internal, currency, timezone, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id, user_id) DO UPDATE SET
                name = excluded.name,
                business_id = excluded.business_id,
                is_internal = excluded.is_internal,
                currency = excluded.currency,
                timezone = excluded.timezone
            "#,
        )
        .bind(account_id)
        .bind(user_id)
        .bind(&req.name)
        .bind(&req.business_id)
        .bind(req.is_internal)
        .bind(req.currency.as_deref().unwrap_or("USD"))
        .bind(req.timezone.as_deref().unwrap_or("UTC"))
        .bind(crate::db::now())
        .execute(db)
        .await?;

        Self::get(db, user_id, account_id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn get(
        db: &SqlitePool,
        user_id: &str,
        account_id: &str,
    ) -> Result<Option<AdAccount>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM ad_accounts WHERE id = ? AND user_id = ?")
            .bind(account_id)
            .bind(user_id)
            .fetch_optional(db)
            .await
    }

    pub async fn list_for_user(db: &SqlitePool, user_id: &str) -> Result<Vec<AdAccount>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM ad_accounts WHERE user_id = ? ORDER BY name ASC")
            .bind(user_id)
            .fetch_all(db)
            .await
    }

    /// Every registered account across all users
    pub async fn list_all(db: &SqlitePool) -> Result<Vec<AdAccount>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM ad_accounts ORDER BY user_id, id")
            .fetch_all(db)
            .await
    }

    pub async fn delete(db: &SqlitePool, user_id: &str, account_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM ad_accounts WHERE id = ? AND user_id = ?")
            .bind(account_id)
            .bind(user_id)
            .execute(db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_account_id() {
        assert_eq!(normalize_account_id("123456").as_deref(), Some("act_123456"));
        assert_eq!(normalize_account_id("act_987").as_deref(), Some("act_987"));
        assert_eq!(normalize_account_id(" act_42 ").as_deref(), Some("act_42"));
        assert!(normalize_account_id("act_").is_none());
        assert!(normalize_account_id("abc").is_none());
        assert!(normalize_account_id("").is_none());
    }

    #[tokio::test]
    async fn test_accounts_are_scoped_to_user() {
        let db = crate::db::init_memory().await.unwrap();
        let req = CreateAdAccountRequest {
            id: "act_1".into(),
            name: "Main".into(),
            business_id: Some("biz".into()),
            is_internal: true,
            currency: None,
            timezone: None,
        };
        let account = AdAccount::upsert(&db, "user-a", "act_1", &req).await.unwrap();
        assert!(account.is_internal);
        assert_eq!(account.currency, "USD");

        assert!(AdAccount::get(&db, "user-b", "act_1").await.unwrap().is_none());
        assert_eq!(AdAccount::list_for_user(&db, "user-a").await.unwrap().len(), 1);
        assert!(AdAccount::delete(&db, "user-a", "act_1").await.unwrap());
        assert!(!AdAccount::delete(&db, "user-a", "act_1").await.unwrap());
    }
}
