use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Response,
    Json,
};
use std::sync::Arc;

use super::auth::AuthUser;
use super::error::ApiError;
use super::response::{ok, with_status, ApiResult, Deleted};
use crate::db::{normalize_account_id, AdAccount, CreateAdAccountRequest};
use crate::AppState;

const MAX_ACCOUNT_NAME_LENGTH: usize = 200;

/// GET /api/ad-accounts
pub async fn list_ad_accounts(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> ApiResult<Vec<AdAccount>> {
    ok(AdAccount::list_for_user(&state.db, &user.id).await?)
}

/// POST /api/ad-accounts
///
/// Registers an account, or updates it when the user already has it.
pub async fn upsert_ad_account(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(mut req): Json<CreateAdAccountRequest>,
) -> Result<Response, ApiError> {
    let mut errors = std::collections::HashMap::new();
    let account_id = normalize_account_id(&req.id);
    if account_id.is_none() {
        errors.insert(
            "id".to_string(),
            vec!["Ad account id must be numeric, optionally prefixed with act_".to_string()],
        );
    }
    req.name = req.name.trim().to_string();
    if req.name.is_empty() {
        errors.insert("name".to_string(), vec!["Name is required".to_string()]);
    } else if req.name.len() > MAX_ACCOUNT_NAME_LENGTH {
        errors.insert(
            "name".to_string(),
            vec![format!("Name must be at most {} characters", MAX_ACCOUNT_NAME_LENGTH)],
        );
    }
    if req.is_internal && req.business_id.as_deref().map_or(true, |b| b.trim().is_empty()) {
        errors.insert(
            "business_id".to_string(),
            vec!["Internal accounts need the owning business id".to_string()],
        );
    }
    let Some(account_id) = account_id.filter(|_| errors.is_empty()) else {
        return Err(ApiError::validation(errors));
    };

    let account = AdAccount::upsert(&state.db, &user.id, &account_id, &req).await?;
    tracing::info!(user_id = %user.id, ad_account_id = %account.id, "Ad account saved");
    Ok(with_status(StatusCode::CREATED, account))
}

/// DELETE /api/ad-accounts/:id
pub async fn delete_ad_account(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Deleted> {
    let not_found = || ApiError::not_found("Ad account not found");
    let account_id = normalize_account_id(&id).ok_or_else(not_found)?;
    if !AdAccount::delete(&state.db, &user.id, &account_id).await? {
        return Err(not_found());
    }
    tracing::info!(user_id = %user.id, ad_account_id = %account_id, "Ad account removed");
    ok(Deleted::new(account_id))
}
