//! Backup app management.
//!
//! Backup apps are shared by every user, so these routes manage a global
//! pool. Tokens are encrypted before they reach the database and never
//! returned.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Response,
    Json,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

use super::auth::AuthUser;
use super::error::ApiError;
use super::response::{ok, with_status, ApiResult, Deleted};
use crate::db::{BackupApp, BackupAppResponse, CreateBackupAppRequest, UpdateBackupAppRequest};
use crate::ratelimit::hour_bucket;
use crate::AppState;

fn check_hourly_limit(errors: &mut HashMap<String, Vec<String>>, limit: Option<i64>) {
    if matches!(limit, Some(l) if l <= 0) {
        errors
            .entry("hourly_limit".to_string())
            .or_default()
            .push("Hourly limit must be positive".to_string());
    }
}

fn encrypt_token(state: &AppState, token: &str) -> Result<String, ApiError> {
    state.cipher.encrypt(token).map_err(|e| {
        tracing::error!("Failed to encrypt backup app token: {}", e);
        ApiError::internal("Failed to store token")
    })
}

/// GET /api/backup-apps
pub async fn list_backup_apps(
    State(state): State<Arc<AppState>>,
    _user: AuthUser,
) -> ApiResult<Vec<BackupAppResponse>> {
    let bucket = hour_bucket(Utc::now());
    let apps = BackupApp::list(&state.db).await?;
    ok(apps.iter().map(|a| a.to_response(&bucket)).collect())
}

/// POST /api/backup-apps
pub async fn create_backup_app(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<CreateBackupAppRequest>,
) -> Result<Response, ApiError> {
    let mut errors: HashMap<String, Vec<String>> = HashMap::new();
    for (field, value) in [
        ("app_id", &req.app_id),
        ("name", &req.name),
        ("access_token", &req.access_token),
    ] {
        if value.trim().is_empty() {
            errors.insert(field.to_string(), vec![format!("{} is required", field)]);
        }
    }
    check_hourly_limit(&mut errors, req.hourly_limit);
    if !errors.is_empty() {
        return Err(ApiError::validation(errors));
    }

    let encrypted = encrypt_token(&state, req.access_token.trim())?;
    let app = BackupApp::create(&state.db, &req, &encrypted).await?;
    tracing::info!(user_id = %user.id, app_id = %app.app_id, "Backup app added");
    Ok(with_status(
        StatusCode::CREATED,
        app.to_response(&hour_bucket(Utc::now())),
    ))
}

/// PUT /api/backup-apps/:id
pub async fn update_backup_app(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(req): Json<UpdateBackupAppRequest>,
) -> ApiResult<BackupAppResponse> {
    let mut errors: HashMap<String, Vec<String>> = HashMap::new();
    if matches!(&req.name, Some(n) if n.trim().is_empty()) {
        errors.insert("name".to_string(), vec!["name cannot be empty".to_string()]);
    }
    if matches!(&req.access_token, Some(t) if t.trim().is_empty()) {
        errors.insert(
            "access_token".to_string(),
            vec!["access_token cannot be empty".to_string()],
        );
    }
    check_hourly_limit(&mut errors, req.hourly_limit);
    if !errors.is_empty() {
        return Err(ApiError::validation(errors));
    }

    let encrypted = match &req.access_token {
        Some(token) => Some(encrypt_token(&state, token.trim())?),
        None => None,
    };
    let app = BackupApp::update(&state.db, &id, &req, encrypted.as_deref())
        .await?
        .ok_or_else(|| ApiError::not_found("Backup app not found"))?;

    tracing::info!(user_id = %user.id, app_id = %app.app_id, "Backup app updated");
    ok(app.to_response(&hour_bucket(Utc::now())))
}

/// DELETE /api/backup-apps/:id
pub async fn delete_backup_app(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Deleted> {
    if !BackupApp::delete(&state.db, &id).await? {
        return Err(ApiError::not_found("Backup app not found"));
    }
    tracing::info!(user_id = %user.id, backup_app = %id, "Backup app removed");
    ok(Deleted::new(id))
}
