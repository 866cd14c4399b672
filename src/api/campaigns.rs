use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Response,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use super::auth::AuthUser;
use super::error::ApiError;
use super::response::{ok, outcome, with_status, ApiResult, Deleted};
use crate::campaigns::{
    CreateCampaignRequest, DuplicateCampaignRequest, StrategyRequest, UpdateStatusRequest,
};
use crate::db::{Campaign, QueueStatus, QueuedRequest};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListCampaignsQuery {
    pub ad_account_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListQueueQuery {
    pub status: Option<String>,
}

/// GET /api/campaigns
pub async fn list_campaigns(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(query): Query<ListCampaignsQuery>,
) -> ApiResult<Vec<Campaign>> {
    ok(state
        .campaigns
        .list(&user.id, query.ad_account_id.as_deref())
        .await?)
}

/// POST /api/campaigns
pub async fn create_campaign(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<CreateCampaignRequest>,
) -> Result<Response, ApiError> {
    let result = state.campaigns.create_campaign(&user.id, req).await?;
    Ok(outcome(result, StatusCode::CREATED))
}

/// POST /api/campaigns/strategy
///
/// 1-N-1: one campaign, one ad set per variation, the same ad in each.
pub async fn create_strategy(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<StrategyRequest>,
) -> Result<Response, ApiError> {
    let result = state.campaigns.create_strategy(&user.id, req).await?;
    Ok(outcome(result, StatusCode::CREATED))
}

/// GET /api/campaigns/:id
pub async fn get_campaign(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Campaign> {
    ok(state.campaigns.get(&user.id, &id).await?)
}

/// DELETE /api/campaigns/:id
pub async fn delete_campaign(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let result = state.campaigns.delete_campaign(&user.id, &id).await?;
    Ok(outcome(result.map(|()| Deleted::new(id)), StatusCode::OK))
}

/// PUT /api/campaigns/:id/status
pub async fn update_status(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<Response, ApiError> {
    let result = state
        .campaigns
        .update_status(&user.id, &id, &req.status)
        .await?;
    Ok(outcome(result, StatusCode::OK))
}

/// POST /api/campaigns/:id/duplicate
///
/// Returns 201 when every copy was made, 202 when some had to be queued.
pub async fn duplicate_campaign(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<String>,
    body: Option<Json<DuplicateCampaignRequest>>,
) -> Result<Response, ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let result = state.campaigns.duplicate_campaign(&user.id, &id, req).await?;
    let status = if result.queued.is_some() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CREATED
    };
    Ok(with_status(status, result))
}

/// GET /api/campaigns/queue
pub async fn list_queue(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(query): Query<ListQueueQuery>,
) -> ApiResult<Vec<QueuedRequest>> {
    let status = query.status.as_deref().filter(|s| !s.is_empty());
    if let Some(s) = status {
        // Unknown values would silently match nothing
        if QueueStatus::from(s.to_string()).to_string() != s {
            return Err(ApiError::validation_field("status", format!("Unknown queue status: {}", s)));
        }
    }
    ok(QueuedRequest::list_for_user(&state.db, &user.id, status).await?)
}

/// DELETE /api/campaigns/queue/:id
pub async fn cancel_queued(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<QueuedRequest> {
    if !QueuedRequest::cancel(&state.db, &user.id, &id).await? {
        return match QueuedRequest::get(&state.db, &id).await? {
            Some(existing) if existing.user_id == user.id => Err(ApiError::conflict(format!(
                "Request is {} and can no longer be cancelled",
                existing.status
            ))),
            _ => Err(ApiError::not_found("Queued request not found")),
        };
    }
    tracing::info!(user_id = %user.id, request_id = %id, "Queued request cancelled");
    let cancelled = QueuedRequest::get(&state.db, &id)
        .await?
        .ok_or_else(|| ApiError::not_found("Queued request not found"))?;
    ok(cancelled)
}
