//! Bearer token authentication.
//!
//! User JWTs are issued elsewhere and signed with the shared HS256 secret;
//! the `sub` claim is the user id every request is scoped to.

use axum::{
    async_trait,
    body::Body,
    extract::{FromRequestParts, State},
    http::{request::Parts, Request},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::error::ApiError;
use crate::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    pub exp: i64,
}

/// The authenticated caller, inserted by [`auth_middleware`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: String,
}

/// Sign a token for `user_id`, valid for `ttl_secs`
pub fn issue_token(secret: &str, user_id: &str, ttl_secs: i64) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id.to_string(),
        exp: Utc::now().timestamp() + ttl_secs,
    };
    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok(token)
}

pub fn verify_token(secret: &str, token: &str) -> Result<AuthUser, ApiError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|e| {
        tracing::debug!("Rejected bearer token: {}", e);
        ApiError::unauthorized("Invalid or expired token")
    })?;

    if data.claims.sub.trim().is_empty() {
        return Err(ApiError::unauthorized("Token has no subject"));
    }
    Ok(AuthUser { id: data.claims.sub })
}

/// Authentication middleware that validates the bearer JWT
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::unauthorized("Missing bearer token"))?;

    let user = verify_token(&state.config.auth.jwt_secret, token.trim())?;
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or_else(|| ApiError::unauthorized("Not authenticated"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_issued_token_verifies() {
        let token = assert_ok!(issue_token("secret", "user-1", 3600));
        let user = assert_ok!(verify_token("secret", &token));
        assert_eq!(user.id, "user-1");
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let token = issue_token("secret", "user-1", 3600).unwrap();
        let err = verify_token("other", &token).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let token = issue_token("secret", "user-1", -3600).unwrap();
        assert_err!(verify_token("secret", &token));
    }

    #[test]
    fn test_empty_subject_is_rejected() {
        let token = issue_token("secret", " ", 3600).unwrap();
        assert!(verify_token("secret", &token).is_err());
    }
}
