use axum::extract::State;
use std::sync::Arc;

use super::auth::AuthUser;
use super::response::{ok, ApiResult};
use crate::ratelimit::RateLimitReport;
use crate::AppState;

/// GET /api/rate-limit/status
///
/// The caller's hourly budget, throttles, backup apps and queue depth.
pub async fn rate_limit_status(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> ApiResult<RateLimitReport> {
    ok(state.router.status(&user.id).await?)
}
