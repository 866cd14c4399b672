mod ad_accounts;
pub mod auth;
mod backup_apps;
mod campaigns;
pub mod error;
mod facebook;
mod intelligence;
pub mod metrics;
mod rate_limit;
pub mod response;

use axum::{
    middleware,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // Protected API routes
    let api_routes = Router::new()
        // Facebook connection
        .route("/facebook/token", get(facebook::connection_status))
        .route("/facebook/token", post(facebook::connect_token))
        .route("/facebook/token", delete(facebook::disconnect))
        // Ad accounts
        .route("/ad-accounts", get(ad_accounts::list_ad_accounts))
        .route("/ad-accounts", post(ad_accounts::upsert_ad_account))
        .route("/ad-accounts/:id", delete(ad_accounts::delete_ad_account))
        // Campaigns
        .route("/campaigns", get(campaigns::list_campaigns))
        .route("/campaigns", post(campaigns::create_campaign))
        .route("/campaigns/strategy", post(campaigns::create_strategy))
        .route("/campaigns/queue", get(campaigns::list_queue))
        .route("/campaigns/queue/:id", delete(campaigns::cancel_queued))
        .route("/campaigns/:id", get(campaigns::get_campaign))
        .route("/campaigns/:id", delete(campaigns::delete_campaign))
        .route("/campaigns/:id/status", put(campaigns::update_status))
        .route("/campaigns/:id/duplicate", post(campaigns::duplicate_campaign))
        // Rate limiting
        .route("/rate-limit/status", get(rate_limit::rate_limit_status))
        .route("/backup-apps", get(backup_apps::list_backup_apps))
        .route("/backup-apps", post(backup_apps::create_backup_app))
        .route("/backup-apps/:id", put(backup_apps::update_backup_app))
        .route("/backup-apps/:id", delete(backup_apps::delete_backup_app))
        // Intelligence
        .route("/intelligence/snapshots", get(intelligence::list_snapshots))
        .route(
            "/intelligence/snapshots/collect",
            post(intelligence::collect_snapshots),
        )
        .route("/intelligence/backfill", get(intelligence::list_backfills))
        .route("/intelligence/backfill", post(intelligence::start_backfill))
        .route("/intelligence/backfill/:id", get(intelligence::get_backfill))
        .route(
            "/intelligence/backfill/:id/pause",
            post(intelligence::pause_backfill),
        )
        .route(
            "/intelligence/backfill/:id/resume",
            post(intelligence::resume_backfill),
        )
        .route("/intelligence/patterns", get(intelligence::list_patterns))
        .route(
            "/intelligence/patterns/learn",
            post(intelligence::learn_patterns),
        )
        .route(
            "/intelligence/automation/rules",
            get(intelligence::list_rules).post(intelligence::create_rule),
        )
        .route(
            "/intelligence/automation/rules/:id",
            put(intelligence::update_rule).delete(intelligence::delete_rule),
        )
        .route(
            "/intelligence/automation/evaluate",
            post(intelligence::evaluate_rules),
        )
        .route(
            "/intelligence/automation/events",
            get(intelligence::list_events),
        )
        // Protected by auth
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics::metrics_endpoint))
        .nest("/api", api_routes)
        .layer(middleware::from_fn(metrics::metrics_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "success": true,
        "data": { "status": "ok", "version": env!("CARGO_PKG_VERSION") }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, RateLimitConfig};
    use crate::crypto::TokenCipher;
    use crate::db::FacebookAuth;
    use crate::facebook::testing::FakeGraph;
    use crate::facebook::GraphMethod;
    use crate::ratelimit::SystemUserManager;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    const SECRET: &str = "test-secret";

    struct TestApp {
        app: Router,
        state: Arc<AppState>,
        fake: Arc<FakeGraph>,
    }

    impl TestApp {
        async fn new(rate_limit: RateLimitConfig) -> Self {
            let mut config = Config::default();
            config.auth.jwt_secret = SECRET.to_string();
            config.rate_limit = rate_limit;

            let db = crate::db::init_memory().await.unwrap();
            let fake = Arc::new(FakeGraph::new());
            let state = Arc::new(AppState::new(
                config,
                db,
                TokenCipher::from_secret("test"),
                fake.clone(),
                Arc::new(SystemUserManager::new()),
            ));
            Self {
                app: create_router(state.clone()),
                state,
                fake,
            }
        }

        async fn connect(&self, user_id: &str) {
            let token = self.state.cipher.encrypt("user-token").unwrap();
            FacebookAuth::upsert(&self.state.db, user_id, &token, None, None)
                .await
                .unwrap();
        }

        async fn send(
            &self,
            method: &str,
            uri: &str,
            user: Option<&str>,
            body: Option<Value>,
        ) -> (StatusCode, Value) {
            let mut builder = Request::builder().method(method).uri(uri);
            if let Some(user) = user {
                let token = auth::issue_token(SECRET, user, 3600).unwrap();
                builder = builder.header("Authorization", format!("Bearer {}", token));
            }
            let request = match body {
                Some(body) => builder
                    .header("Content-Type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };

            let response = self.app.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            (status, json)
        }

        async fn add_account(&self, user: &str, id: &str) {
            let (status, _) = self
                .send(
                    "POST",
                    "/api/ad-accounts",
                    Some(user),
                    Some(json!({"id": id, "name": "Main"})),
                )
                .await;
            assert_eq!(status, StatusCode::CREATED);
        }
    }

    fn campaign_body() -> Value {
        json!({
            "ad_account_id": "act_1",
            "name": "Autumn sale",
            "objective": "OUTCOME_SALES",
            "daily_budget": 5000
        })
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let t = TestApp::new(RateLimitConfig::default()).await;
        let (status, body) = t.send("GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "ok");
    }

    #[tokio::test]
    async fn test_api_requires_bearer_token() {
        let t = TestApp::new(RateLimitConfig::default()).await;
        let (status, body) = t.send("GET", "/api/campaigns", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "unauthorized");

        let request = Request::builder()
            .uri("/api/campaigns")
            .header("Authorization", "Bearer not-a-jwt")
            .body(Body::empty())
            .unwrap();
        let response = t.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_ad_accounts_are_scoped_to_caller() {
        let t = TestApp::new(RateLimitConfig::default()).await;
        let (status, body) = t
            .send(
                "POST",
                "/api/ad-accounts",
                Some("u1"),
                Some(json!({"id": "12345", "name": "  Main  "})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["id"], "act_12345");
        assert_eq!(body["data"]["name"], "Main");

        let (_, mine) = t.send("GET", "/api/ad-accounts", Some("u1"), None).await;
        assert_eq!(mine["data"].as_array().unwrap().len(), 1);
        let (_, theirs) = t.send("GET", "/api/ad-accounts", Some("u2"), None).await;
        assert!(theirs["data"].as_array().unwrap().is_empty());

        let (status, _) = t
            .send("DELETE", "/api/ad-accounts/12345", Some("u2"), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, body) = t
            .send("DELETE", "/api/ad-accounts/12345", Some("u1"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["deleted"], true);
    }

    #[tokio::test]
    async fn test_ad_account_validation_envelope() {
        let t = TestApp::new(RateLimitConfig::default()).await;
        let (status, body) = t
            .send(
                "POST",
                "/api/ad-accounts",
                Some("u1"),
                Some(json!({"id": "abc", "name": ""})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "validation_error");
        assert!(body["details"]["id"].is_array());
        assert!(body["details"]["name"].is_array());
    }

    #[tokio::test]
    async fn test_connect_and_disconnect_facebook() {
        let t = TestApp::new(RateLimitConfig::default()).await;
        t.fake
            .on(GraphMethod::Get, "me", json!({"id": "fb-42", "name": "Ada"}));

        let (status, body) = t
            .send(
                "POST",
                "/api/facebook/token",
                Some("u1"),
                Some(json!({"access_token": "EAAB-token"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["connected"], true);
        assert_eq!(body["data"]["fb_user_id"], "fb-42");

        // Stored encrypted
        let stored = FacebookAuth::get(&t.state.db, "u1").await.unwrap().unwrap();
        assert_ne!(stored.encrypted_token, "EAAB-token");
        assert_eq!(t.state.cipher.decrypt(&stored.encrypted_token).unwrap(), "EAAB-token");

        let (status, _) = t.send("DELETE", "/api/facebook/token", Some("u1"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = t.send("DELETE", "/api/facebook/token", Some("u1"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn test_blank_facebook_token_is_rejected() {
        let t = TestApp::new(RateLimitConfig::default()).await;
        let (status, body) = t
            .send(
                "POST",
                "/api/facebook/token",
                Some("u1"),
                Some(json!({"access_token": "  "})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["details"]["access_token"].is_array());
        assert!(t.fake.requests().is_empty());
    }

    #[tokio::test]
    async fn test_create_campaign() {
        let t = TestApp::new(RateLimitConfig::default()).await;
        t.connect("u1").await;
        t.add_account("u1", "act_1").await;
        t.fake
            .on(GraphMethod::Post, "act_1/campaigns", json!({"id": "c-100"}));

        let (status, body) = t
            .send("POST", "/api/campaigns", Some("u1"), Some(campaign_body()))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["fb_campaign_id"], "c-100");

        let id = body["data"]["id"].as_str().unwrap().to_string();
        let (status, _) = t
            .send("GET", &format!("/api/campaigns/{}", id), Some("u1"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = t
            .send("GET", &format!("/api/campaigns/{}", id), Some("u2"), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_campaign_is_rejected_before_graph() {
        let t = TestApp::new(RateLimitConfig::default()).await;
        t.connect("u1").await;
        t.add_account("u1", "act_1").await;

        let mut body = campaign_body();
        body["objective"] = json!("CONVERSIONS");
        let (status, body) = t
            .send("POST", "/api/campaigns", Some("u1"), Some(body))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["details"]["objective"].is_array());
        assert!(t.fake.requests().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limited_create_is_queued_and_cancellable() {
        let t = TestApp::new(RateLimitConfig {
            user_hourly_threshold: 0,
            ..RateLimitConfig::default()
        })
        .await;
        t.connect("u1").await;
        t.add_account("u1", "act_1").await;

        let (status, body) = t
            .send("POST", "/api/campaigns", Some("u1"), Some(campaign_body()))
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["queued"], true);
        assert_eq!(body["data"]["status"], "queued");
        assert!(t.fake.requests().is_empty());

        let (_, queue) = t
            .send("GET", "/api/campaigns/queue", Some("u1"), None)
            .await;
        assert_eq!(queue["data"].as_array().unwrap().len(), 1);

        let id = body["data"]["id"].as_str().unwrap().to_string();
        let uri = format!("/api/campaigns/queue/{}", id);
        let (status, _) = t.send("DELETE", &uri, Some("u2"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, cancelled) = t.send("DELETE", &uri, Some("u1"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["data"]["status"], "cancelled");
        let (status, _) = t.send("DELETE", &uri, Some("u1"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_unknown_queue_status_filter() {
        let t = TestApp::new(RateLimitConfig::default()).await;
        let (status, _) = t
            .send("GET", "/api/campaigns/queue?status=sleeping", Some("u1"), None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = t
            .send("GET", "/api/campaigns/queue?status=failed", Some("u1"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rate_limit_status() {
        let t = TestApp::new(RateLimitConfig::default()).await;
        let (status, body) = t
            .send("GET", "/api/rate-limit/status", Some("u1"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["call_count"], 0);
        assert_eq!(body["data"]["queued_requests"], 0);
    }

    #[tokio::test]
    async fn test_backup_app_crud() {
        let t = TestApp::new(RateLimitConfig::default()).await;
        let app = json!({
            "app_id": "9001",
            "name": "Spare",
            "access_token": "spare-token",
            "priority": 1
        });

        let (status, body) = t
            .send("POST", "/api/backup-apps", Some("u1"), Some(app.clone()))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(body["data"].get("access_token").is_none());
        assert!(body["data"].get("encrypted_token").is_none());
        let id = body["data"]["id"].as_str().unwrap().to_string();

        let (status, body) = t
            .send("POST", "/api/backup-apps", Some("u1"), Some(app))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "conflict");

        let (status, body) = t
            .send(
                "PUT",
                &format!("/api/backup-apps/{}", id),
                Some("u1"),
                Some(json!({"hourly_limit": 50, "is_active": false})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["hourly_limit"], 50);
        assert_eq!(body["data"]["is_active"], false);

        let (status, _) = t
            .send(
                "PUT",
                "/api/backup-apps/missing",
                Some("u1"),
                Some(json!({"priority": 3})),
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = t
            .send("DELETE", &format!("/api/backup-apps/{}", id), Some("u1"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        let (_, list) = t.send("GET", "/api/backup-apps", Some("u1"), None).await;
        assert!(list["data"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backfill_needs_accounts() {
        let t = TestApp::new(RateLimitConfig::default()).await;
        let (status, body) = t
            .send("POST", "/api/intelligence/backfill", Some("u1"), Some(json!({})))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "validation_error");

        let (status, _) = t
            .send("GET", "/api/intelligence/backfill/nope", Some("u1"), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_automation_rule_lifecycle() {
        let t = TestApp::new(RateLimitConfig::default()).await;
        t.add_account("u1", "act_1").await;

        let (status, body) = t
            .send(
                "POST",
                "/api/intelligence/automation/rules",
                Some("u1"),
                Some(json!({
                    "ad_account_id": "act_1",
                    "name": "Pause expensive",
                    "metric": "cpc",
                    "operator": "gt",
                    "threshold_value": 2.5,
                    "baseline_multiplier": 1.5,
                    "action": "pause"
                })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["details"]["threshold_value"].is_array());

        let (status, body) = t
            .send(
                "POST",
                "/api/intelligence/automation/rules",
                Some("u1"),
                Some(json!({
                    "ad_account_id": "act_1",
                    "name": "Pause expensive",
                    "metric": "cpc",
                    "operator": "gt",
                    "threshold_value": 2.5,
                    "action": "pause"
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["data"]["id"].as_str().unwrap().to_string();

        let (status, body) = t
            .send(
                "POST",
                "/api/intelligence/automation/evaluate",
                Some("u1"),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["rules"], 1);
        assert_eq!(body["data"]["triggered"], 0);

        let uri = format!("/api/intelligence/automation/rules/{}", id);
        let (status, _) = t.send("DELETE", &uri, Some("u2"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = t.send("DELETE", &uri, Some("u1"), None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_learning_runs_in_background() {
        let t = TestApp::new(RateLimitConfig::default()).await;
        let (status, body) = t
            .send("POST", "/api/intelligence/patterns/learn", Some("u1"), None)
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["data"]["status"], "learning");
    }
}
