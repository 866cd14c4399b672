//! Stored Facebook OAuth tokens.

use serde::Serialize;
use sqlx::{FromRow, SqlitePool};

/// A user's connected Facebook token, encrypted at rest
#[derive(Debug, Clone, FromRow)]
pub struct FacebookAuth {
    pub user_id: String,
    pub encrypted_token: String,
    pub fb_user_id: Option<String>,
    pub expires_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Connection state returned to clients (never includes the token)
#[derive(Debug, Clone, Serialize)]
pub struct FacebookConnection {
    pub connected: bool,
    pub fb_user_id: Option<String>,
    pub expires_at: Option<String>,
}

impl From<Option<FacebookAuth>> for FacebookConnection {
    fn from(auth: Option<FacebookAuth>) -> Self {
        match auth {
            Some(a) => Self {
                connected: true,
                fb_user_id: a.fb_user_id,
                expires_at: a.expires_at,
            },
            None => Self {
                connected: false,
                fb_user_id: None,
                expires_at: None,
            },
        }
    }
}

impl FacebookAuth {
    pub async fn upsert(
        db: &SqlitePool,
        user_id: &str,
        encrypted_token: &str,
        fb_user_id: Option<&str>,
        expires_at: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        let now = crate::db::now();
        sqlx::query(
            r#"
            INSERT INTO facebook_auth (user_id, encrypted_token, fb_user_id, expires_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                encrypted_token = excluded.encrypted_token,
                fb_user_id = excluded.fb_user_id,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(encrypted_token)
        .bind(fb_user_id)
        .bind(expires_at)
        .bind(&now)
        .bind(&now)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn get(db: &SqlitePool, user_id: &str) -> Result<Option<FacebookAuth>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM facebook_auth WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(db)
            .await
    }

    pub async fn delete(db: &SqlitePool, user_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM facebook_auth WHERE user_id = ?")
            .bind(user_id)
            .execute(db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
