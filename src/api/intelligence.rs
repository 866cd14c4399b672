//! Intelligence routes: snapshots, backfill jobs, learned patterns and
//! automation rules.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Response,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::auth::AuthUser;
use super::error::ApiError;
use super::response::{ok, with_status, ApiResult, Deleted};
use crate::db::{
    AutomationEvent, AutomationRule, BackfillProgress, CreateAutomationRuleRequest,
    LearnedPattern, PerformanceSnapshot, UpdateAutomationRuleRequest,
};
use crate::intelligence::{
    CollectRequest, CollectSummary, EvaluationSummary, EventQuery, SnapshotQuery,
    StartBackfillRequest,
};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct PatternQuery {
    pub ad_account_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LearningStarted {
    pub status: &'static str,
}

// -------------------------------------------------------------------------
// Snapshots
// -------------------------------------------------------------------------

/// GET /api/intelligence/snapshots?ad_account_id=...&from=...&to=...
pub async fn list_snapshots(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(query): Query<SnapshotQuery>,
) -> ApiResult<Vec<PerformanceSnapshot>> {
    ok(state.intelligence.snapshots.list(&user.id, &query).await?)
}

/// POST /api/intelligence/snapshots/collect
///
/// Collects one day (yesterday by default) for one or all of the user's accounts.
pub async fn collect_snapshots(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    body: Option<Json<CollectRequest>>,
) -> ApiResult<CollectSummary> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    ok(state
        .intelligence
        .snapshots
        .collect_for_user(&user.id, req)
        .await?)
}

// -------------------------------------------------------------------------
// Backfill
// -------------------------------------------------------------------------

/// GET /api/intelligence/backfill
pub async fn list_backfills(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> ApiResult<Vec<BackfillProgress>> {
    ok(state.intelligence.backfill.list(&user.id).await?)
}

/// POST /api/intelligence/backfill
///
/// The job runs in the background; poll GET /api/intelligence/backfill/:id.
pub async fn start_backfill(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    body: Option<Json<StartBackfillRequest>>,
) -> Result<Response, ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let job = state.intelligence.backfill.start(&user.id, req).await?;
    Ok(with_status(StatusCode::ACCEPTED, job))
}

/// GET /api/intelligence/backfill/:id
pub async fn get_backfill(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<BackfillProgress> {
    ok(state.intelligence.backfill.get(&user.id, &id).await?)
}

/// POST /api/intelligence/backfill/:id/pause
pub async fn pause_backfill(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<BackfillProgress> {
    ok(state.intelligence.backfill.pause(&user.id, &id).await?)
}

/// POST /api/intelligence/backfill/:id/resume
pub async fn resume_backfill(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<BackfillProgress> {
    ok(state.intelligence.backfill.resume(&user.id, &id).await?)
}

// -------------------------------------------------------------------------
// Patterns
// -------------------------------------------------------------------------

/// GET /api/intelligence/patterns
pub async fn list_patterns(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(query): Query<PatternQuery>,
) -> ApiResult<Vec<LearnedPattern>> {
    ok(state
        .intelligence
        .patterns
        .list(&user.id, query.ad_account_id.as_deref())
        .await?)
}

/// POST /api/intelligence/patterns/learn
pub async fn learn_patterns(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Response {
    state.intelligence.patterns.spawn_learn_for_user(&user.id);
    with_status(StatusCode::ACCEPTED, LearningStarted { status: "learning" })
}

// -------------------------------------------------------------------------
// Automation
// -------------------------------------------------------------------------

/// GET /api/intelligence/automation/rules
pub async fn list_rules(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> ApiResult<Vec<AutomationRule>> {
    ok(state.intelligence.automation.list_rules(&user.id).await?)
}

/// POST /api/intelligence/automation/rules
pub async fn create_rule(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(req): Json<CreateAutomationRuleRequest>,
) -> Result<Response, ApiError> {
    let rule = state
        .intelligence
        .automation
        .create_rule(&user.id, req)
        .await?;
    Ok(with_status(StatusCode::CREATED, rule))
}

/// PUT /api/intelligence/automation/rules/:id
pub async fn update_rule(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<String>,
    Json(req): Json<UpdateAutomationRuleRequest>,
) -> ApiResult<AutomationRule> {
    ok(state
        .intelligence
        .automation
        .update_rule(&user.id, &id, req)
        .await?)
}

/// DELETE /api/intelligence/automation/rules/:id
pub async fn delete_rule(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Deleted> {
    state
        .intelligence
        .automation
        .delete_rule(&user.id, &id)
        .await?;
    ok(Deleted::new(id))
}

/// POST /api/intelligence/automation/evaluate
///
/// Evaluates the caller's enabled rules now instead of waiting for the
/// background evaluator.
pub async fn evaluate_rules(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> ApiResult<EvaluationSummary> {
    ok(state
        .intelligence
        .automation
        .evaluate(Some(&user.id))
        .await?)
}

/// GET /api/intelligence/automation/events
pub async fn list_events(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(query): Query<EventQuery>,
) -> ApiResult<Vec<AutomationEvent>> {
    ok(state
        .intelligence
        .automation
        .events(&user.id, &query)
        .await?)
}
