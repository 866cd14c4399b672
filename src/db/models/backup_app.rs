//! Backup Facebook apps used when a user's own token is exhausted.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, FromRow)]
pub struct BackupApp {
    pub id: String,
    pub app_id: String,
    pub name: String,
    pub encrypted_token: String,
    pub app_secret: Option<String>,
    /// Lower values are tried first
    pub priority: i64,
    pub hourly_limit: i64,
    pub calls_this_hour: i64,
    /// Hour the counter belongs to (`YYYY-MM-DDTHH`)
    pub hour_bucket: String,
    pub cooldown_until: Option<String>,
    pub is_active: bool,
    pub last_used_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBackupAppRequest {
    pub app_id: String,
    pub name: String,
    pub access_token: String,
    pub app_secret: Option<String>,
    #[serde(default)]
    pub priority: i64,
    pub hourly_limit: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateBackupAppRequest {
    pub name: Option<String>,
    pub access_token: Option<String>,
    pub app_secret: Option<String>,
    pub priority: Option<i64>,
    pub hourly_limit: Option<i64>,
    pub is_active: Option<bool>,
    /// Clears any cooldown when set to true
    #[serde(default)]
    pub reset_cooldown: bool,
}

/// Backup app as returned by the API, without credentials
#[derive(Debug, Clone, Serialize)]
pub struct BackupAppResponse {
    pub id: String,
    pub app_id: String,
    pub name: String,
    pub priority: i64,
    pub hourly_limit: i64,
    pub calls_this_hour: i64,
    pub cooldown_until: Option<String>,
    pub is_active: bool,
    pub last_used_at: Option<String>,
}

impl BackupApp {
    /// Calls made in `bucket`; the stored counter is stale once the hour rolls over
    pub fn calls_in(&self, bucket: &str) -> i64 {
        if self.hour_bucket == bucket {
            self.calls_this_hour
        } else {
            0
        }
    }

    pub fn to_response(&self, bucket: &str) -> BackupAppResponse {
        BackupAppResponse {
            id: self.id.clone(),
            app_id: self.app_id.clone(),
            name: self.name.clone(),
            priority: self.priority,
            hourly_limit: self.hourly_limit,
            calls_this_hour: self.calls_in(bucket),
            cooldown_until: self.cooldown_until.clone(),
            is_active: self.is_active,
            last_used_at: self.last_used_at.clone(),
        }
    }

    pub async fn create(
        db: &SqlitePool,
        req: &CreateBackupAppRequest,
        encrypted_token: &str,
    ) -> Result<BackupApp, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO backup_apps (id, app_id, name, encrypted_token, app_secret, priority, hourly_limit, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&req.app_id)
        .bind(&req.name)
        .bind(encrypted_token)
        .bind(&req.app_secret)
        .bind(req.priority)
        .bind(req.hourly_limit.unwrap_or(200))
        .bind(crate::db::now())
        .execute(db)
        .await?;

        Self::get(db, &id).await?.ok_or(sqlx::Error::RowNotFound)
    }

    /// Insert or refresh an app from static configuration, keeping its counters
    pub async fn upsert_by_app_id(
        db: &SqlitePool,
        req: &CreateBackupAppRequest,
        encrypted_token: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO backup_apps (id, app_id, name, encrypted_token, app_secret, priority, hourly_limit, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(app_id) DO UPDATE SET
                name = excluded.name,
                encrypted_token = excluded.encrypted_token,
                app_secret = excluded.app_secret,
                priority = excluded.priority,
                hourly_limit = excluded.hourly_limit
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&req.app_id)
        .bind(&req.name)
        .bind(encrypted_token)
        .bind(&req.app_secret)
        .bind(req.priority)
        .bind(req.hourly_limit.unwrap_or(200))
        .bind(crate::db::now())
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn get(db: &SqlitePool, id: &str) -> Result<Option<BackupApp>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM backup_apps WHERE id = ?")
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn list(db: &SqlitePool) -> Result<Vec<BackupApp>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM backup_apps ORDER BY priority ASC, name ASC")
            .fetch_all(db)
            .await
    }

    /// Active apps not cooling down at `now`, in rotation order
    pub async fn list_available(
        db: &SqlitePool,
        bucket: &str,
        now: &str,
    ) -> Result<Vec<BackupApp>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM backup_apps
            WHERE is_active = 1
              AND (cooldown_until IS NULL OR cooldown_until <= ?)
              AND hourly_limit > 0
              AND (hour_bucket != ? OR calls_this_hour < hourly_limit)
            ORDER BY priority ASC,
                     CASE WHEN hour_bucket = ? THEN calls_this_hour ELSE 0 END ASC,
                     last_used_at ASC
            "#,
        )
        .bind(now)
        .bind(bucket)
        .bind(bucket)
        .fetch_all(db)
        .await
    }

    /// Atomically count one call against the app if it still has capacity.
    ///
    /// Returns false when the app filled up or went into cooldown since it was listed.
    pub async fn try_reserve(
        db: &SqlitePool,
        id: &str,
        bucket: &str,
        now: &str,
    ) -> Result<bool, sqlx::Error> {
        Self::try_reserve_units(db, id, bucket, now, 1).await
    }

    /// [`try_reserve`](Self::try_reserve) for an operation making `units`
    /// calls. Operations larger than the limit need a fresh hour.
    pub async fn try_reserve_units(
        db: &SqlitePool,
        id: &str,
        bucket: &str,
        now: &str,
        units: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE backup_apps SET
                calls_this_hour = CASE WHEN hour_bucket = ? THEN calls_this_hour ELSE 0 END + MIN(?, hourly_limit),
                hour_bucket = ?,
                last_used_at = ?
            WHERE id = ?
              AND is_active = 1
              AND (cooldown_until IS NULL OR cooldown_until <= ?)
              AND hourly_limit > 0
              AND CASE WHEN hour_bucket = ? THEN calls_this_hour ELSE 0 END + MIN(?, hourly_limit) <= hourly_limit
            "#,
        )
        .bind(bucket)
        .bind(units.max(1))
        .bind(bucket)
        .bind(now)
        .bind(id)
        .bind(now)
        .bind(bucket)
        .bind(units.max(1))
        .execute(db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_cooldown(db: &SqlitePool, id: &str, until: Option<&str>) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE backup_apps SET cooldown_until = ? WHERE id = ?")
            .bind(until)
            .bind(id)
            .execute(db)
            .await?;
        Ok(())
    }

    /// Earliest moment a cooling-down active app becomes usable again
    pub async fn earliest_cooldown_end(db: &SqlitePool, now: &str) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT MIN(cooldown_until) FROM backup_apps WHERE is_active = 1 AND cooldown_until > ?",
        )
        .bind(now)
        .fetch_one(db)
        .await
    }

    pub async fn update(
        db: &SqlitePool,
        id: &str,
        req: &UpdateBackupAppRequest,
        encrypted_token: Option<&str>,
    ) -> Result<Option<BackupApp>, sqlx::Error> {
        let Some(existing) = Self::get(db, id).await? else {
            return Ok(None);
        };

        let cooldown_until = if req.reset_cooldown {
            None
        } else {
            existing.cooldown_until.clone()
        };

        sqlx::query(
            r#"
            UPDATE backup_apps SET
                name = ?, encrypted_token = ?, app_secret = ?, priority = ?,
                hourly_limit = ?, is_active = ?, cooldown_until = ?
            WHERE id = ?
            "#,
        )
        .bind(req.name.as_ref().unwrap_or(&existing.name))
        .bind(encrypted_token.unwrap_or(&existing.encrypted_token))
        .bind(req.app_secret.clone().or_else(|| existing.app_secret.clone()))
        .bind(req.priority.unwrap_or(existing.priority))
        .bind(req.hourly_limit.unwrap_or(existing.hourly_limit))
        .bind(req.is_active.unwrap_or(existing.is_active))
        .bind(cooldown_until)
        .bind(id)
        .execute(db)
        .await?;

        Self::get(db, id).await
    }

    pub async fn delete(db: &SqlitePool, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM backup_apps WHERE id = ?")
            .bind(id)
            .execute(db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(app_id: &str, priority: i64, limit: i64) -> CreateBackupAppRequest {
        CreateBackupAppRequest {
            app_id: app_id.to_string(),
            name: format!("App {}", app_id),
            access_token: "tok".to_string(),
            app_secret: None,
            priority,
            hourly_limit: Some(limit),
        }
    }

    #[tokio::test]
    async fn test_reserve_never_exceeds_limit() {
        let db = crate::db::init_memory().await.unwrap();
        let app = BackupApp::create(&db, &request("1", 0, 2), "ENC:x").await.unwrap();
        let bucket = "2026-10-18T10";
        let now = "2026-10-18T10:15:00Z";

        assert!(BackupApp::try_reserve(&db, &app.id, bucket, now).await.unwrap());
        assert!(BackupApp::try_reserve(&db, &app.id, bucket, now).await.unwrap());
        assert!(!BackupApp::try_reserve(&db, &app.id, bucket, now).await.unwrap());

        // A new hour resets the counter
        assert!(BackupApp::try_reserve(&db, &app.id, "2026-10-18T11", "2026-10-18T11:00:01Z")
            .await
            .unwrap());
        let app = BackupApp::get(&db, &app.id).await.unwrap().unwrap();
        assert_eq!(app.calls_in("2026-10-18T11"), 1);
    }

    #[tokio::test]
    async fn test_reserve_units_must_fit() {
        let db = crate::db::init_memory().await.unwrap();
        let app = BackupApp::create(&db, &request("1", 0, 10), "ENC:x").await.unwrap();
        let bucket = "2026-10-18T10";
        let now = "2026-10-18T10:15:00Z";

        assert!(BackupApp::try_reserve_units(&db, &app.id, bucket, now, 8).await.unwrap());
        assert!(!BackupApp::try_reserve_units(&db, &app.id, bucket, now, 3).await.unwrap());
        assert!(BackupApp::try_reserve_units(&db, &app.id, bucket, now, 2).await.unwrap());

        let next = "2026-10-18T11";
        assert!(BackupApp::try_reserve_units(&db, &app.id, next, "2026-10-18T11:00:01Z", 40)
            .await
            .unwrap());
        let app = BackupApp::get(&db, &app.id).await.unwrap().unwrap();
        assert_eq!(app.calls_in(next), 10);
    }

    #[tokio::test]
    async fn test_zero_limit_app_is_never_used() {
        let db = crate::db::init_memory().await.unwrap();
        let app = BackupApp::create(&db, &request("1", 0, 0), "ENC:x").await.unwrap();
        sqlx::query("UPDATE backup_apps SET hourly_limit = 0 WHERE id = ?")
            .bind(&app.id)
            .execute(&db)
            .await
            .unwrap();

        // Fresh hour, where the counter check alone would let one call through
        let bucket = "2026-10-18T10";
        let now = "2026-10-18T10:00:01Z";
        assert!(BackupApp::list_available(&db, bucket, now).await.unwrap().is_empty());
        assert!(!BackupApp::try_reserve(&db, &app.id, bucket, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_available_skips_cooldown_and_full_apps() {
        let db = crate::db::init_memory().await.unwrap();
        let first = BackupApp::create(&db, &request("1", 0, 1), "ENC:x").await.unwrap();
        let second = BackupApp::create(&db, &request("2", 1, 10), "ENC:x").await.unwrap();
        let third = BackupApp::create(&db, &request("3", 2, 10), "ENC:x").await.unwrap();
        let bucket = "2026-10-18T10";
        let now = "2026-10-18T10:15:00Z";

        BackupApp::try_reserve(&db, &first.id, bucket, now).await.unwrap();
        BackupApp::set_cooldown(&db, &second.id, Some("2026-10-18T10:45:00Z"))
            .await
            .unwrap();

        let available = BackupApp::list_available(&db, bucket, now).await.unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].id, third.id);

        let end = BackupApp::earliest_cooldown_end(&db, now).await.unwrap();
        assert_eq!(end.as_deref(), Some("2026-10-18T10:45:00Z"));

        // Cooldown elapsed
        let later = BackupApp::list_available(&db, bucket, "2026-10-18T10:50:00Z")
            .await
            .unwrap();
        assert_eq!(later.len(), 2);
        assert_eq!(later[0].id, second.id);
    }

    #[tokio::test]
    async fn test_update_resets_cooldown() {
        let db = crate::db::init_memory().await.unwrap();
        let app = BackupApp::create(&db, &request("1", 0, 5), "ENC:x").await.unwrap();
        BackupApp::set_cooldown(&db, &app.id, Some("2030-01-01T00:00:00Z"))
            .await
            .unwrap();

        let req = UpdateBackupAppRequest {
            name: Some("Renamed".into()),
            access_token: None,
            app_secret: None,
            priority: None,
            hourly_limit: Some(50),
            is_active: None,
            reset_cooldown: true,
        };
        let updated = BackupApp::update(&db, &app.id, &req, None).await.unwrap().unwrap();
        assert_eq!(updated.name, "Renamed");
        assert_eq!(updated.hourly_limit, 50);
        assert!(updated.cooldown_until.is_none());
        assert_eq!(updated.encrypted_token, "ENC:x");
    }
}
