//! Success envelopes: `{"success": true, "data": ...}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use super::error::ApiError;
use crate::db::QueuedRequest;
use crate::ratelimit::Outcome;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

/// Body of a 202 for work deferred to the retry queue
#[derive(Debug, Serialize)]
pub struct QueuedResponse {
    pub success: bool,
    pub queued: bool,
    pub message: String,
    pub data: QueuedRequest,
}

#[derive(Debug, Serialize)]
pub struct Deleted {
    pub id: String,
    pub deleted: bool,
}

impl Deleted {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            deleted: true,
        }
    }
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

pub fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse { success: true, data }))
}

pub fn with_status<T: Serialize>(status: StatusCode, data: T) -> Response {
    (status, Json(ApiResponse { success: true, data })).into_response()
}

pub fn queued(request: QueuedRequest) -> Response {
    let body = QueuedResponse {
        success: true,
        queued: true,
        message: format!(
            "Rate limited; request queued until {}",
            request.process_after
        ),
        data: request,
    };
    (StatusCode::ACCEPTED, Json(body)).into_response()
}

/// `status` when the operation ran now, 202 when it was queued
pub fn outcome<T: Serialize>(outcome: Outcome<T>, status: StatusCode) -> Response {
    match outcome {
        Outcome::Done(data) => with_status(status, data),
        Outcome::Queued(request) => queued(request),
    }
}
