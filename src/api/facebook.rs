use axum::{extract::State, http::StatusCode, response::Response, Json};
use chrono::DateTime;
use serde::Deserialize;
use std::sync::Arc;

use super::auth::AuthUser;
use super::error::ApiError;
use super::response::{ok, with_status, ApiResult};
use crate::db::{FacebookAuth, FacebookConnection};
use crate::facebook::{AccessToken, GraphError};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ConnectTokenRequest {
    pub access_token: String,
    /// RFC 3339 expiry reported by the OAuth flow
    pub expires_at: Option<String>,
}

/// GET /api/facebook/token
pub async fn connection_status(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> ApiResult<FacebookConnection> {
    let auth = FacebookAuth::get(&state.db, &user.id).await?;
    ok(auth.into())
}

/// POST /api/facebook/token
///
/// Verifies the token against the Graph API before storing it encrypted.
pub async fn connect_token(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<ConnectTokenRequest>,
) -> Result<Response, ApiError> {
    let token = req.access_token.trim();
    if token.is_empty() {
        return Err(ApiError::validation_field("access_token", "Access token is required"));
    }
    if let Some(expires_at) = &req.expires_at {
        if DateTime::parse_from_rfc3339(expires_at).is_err() {
            return Err(ApiError::validation_field(
                "expires_at",
                "expires_at must be an RFC 3339 timestamp",
            ));
        }
    }

    let access = AccessToken::with_secret(token, state.config.facebook.app_secret.clone());
    let me = state
        .router
        .api()
        .get_me(&access)
        .await
        .map_err(|e| match e {
            GraphError::InvalidToken(_) => {
                ApiError::validation_field("access_token", "Facebook rejected the access token")
            }
            other => other.into(),
        })?;

    let encrypted = state.cipher.encrypt(token).map_err(|e| {
        tracing::error!("Failed to encrypt Facebook token: {}", e);
        ApiError::internal("Failed to store token")
    })?;
    FacebookAuth::upsert(
        &state.db,
        &user.id,
        &encrypted,
        Some(&me.id),
        req.expires_at.as_deref(),
    )
    .await?;

    tracing::info!(user_id = %user.id, fb_user_id = %me.id, "Facebook account connected");
    let auth = FacebookAuth::get(&state.db, &user.id).await?;
    Ok(with_status(StatusCode::OK, FacebookConnection::from(auth)))
}

/// DELETE /api/facebook/token
pub async fn disconnect(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> ApiResult<FacebookConnection> {
    if !FacebookAuth::delete(&state.db, &user.id).await? {
        return Err(ApiError::not_found("No Facebook account connected"));
    }
    tracing::info!(user_id = %user.id, "Facebook account disconnected");
    ok(FacebookConnection::from(None))
}
