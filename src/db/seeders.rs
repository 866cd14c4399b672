//! Database seeders for configured data
//!
//! Backup apps listed in the configuration file are upserted on every
//! startup so the rotation table follows the config without losing counters.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::info;

use crate::config::BackupAppConfig;
use crate::crypto::TokenCipher;
use crate::db::{BackupApp, CreateBackupAppRequest};

pub async fn seed_backup_apps(
    pool: &SqlitePool,
    apps: &[BackupAppConfig],
    cipher: &TokenCipher,
) -> Result<()> {
    if apps.is_empty() {
        return Ok(());
    }

    info!(count = apps.len(), "Seeding configured backup apps...");

    for app in apps {
        if app.hourly_limit <= 0 {
            anyhow::bail!("Backup app {} must have a positive hourly_limit", app.app_id);
        }
        let encrypted = cipher
            .encrypt(&app.access_token)
            .with_context(|| format!("Failed to encrypt token for backup app {}", app.app_id))?;
        let req = CreateBackupAppRequest {
            app_id: app.app_id.clone(),
            name: app.name.clone(),
            access_token: String::new(),
            app_secret: app.app_secret.clone(),
            priority: app.priority,
            hourly_limit: Some(app.hourly_limit),
        };
        BackupApp::upsert_by_app_id(pool, &req, &encrypted).await?;
    }

    Ok(())
}
