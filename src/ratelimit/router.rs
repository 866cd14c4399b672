use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    hour_bucket, next_hour, parse_timestamp, Attempt, Credential, CredentialKind, Dispatch, Outcome,
    SystemUserManager, SystemUserStatus,
};
use crate::api::metrics::{record_graph_call, record_rate_limited, record_request_queued};
use crate::config::RateLimitConfig;
use crate::crypto::TokenCipher;
use crate::db::{
    timestamp, AdAccount, BackupApp, BackupAppResponse, DbPool, FacebookAuth, QueuedRequest,
    RateLimitStatus,
};
use crate::error::{ServiceError, ServiceResult};
use crate::facebook::{AccessToken, AdsApi, GraphError, UsageReport};

/// Per-user rate limit state as reported to clients
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitReport {
    pub enabled: bool,
    pub hour_bucket: String,
    pub call_count: i64,
    pub threshold: i64,
    pub remaining: i64,
    pub app_usage_pct: f64,
    pub buc_usage_pct: f64,
    pub throttled_until: Option<String>,
    pub backup_apps_available: usize,
    pub backup_apps: Vec<BackupAppResponse>,
    pub system_users: Vec<SystemUserStatus>,
    pub queued_requests: i64,
}

pub struct RateLimitRouter {
    db: DbPool,
    cipher: TokenCipher,
    api: Arc<AdsApi>,
    system_users: Arc<SystemUserManager>,
    config: RateLimitConfig,
    /// Secret of the primary app that issued users' OAuth tokens
    primary_app_secret: Option<String>,
}

impl RateLimitRouter {
    pub fn new(
        db: DbPool,
        cipher: TokenCipher,
        api: Arc<AdsApi>,
        system_users: Arc<SystemUserManager>,
        config: RateLimitConfig,
        primary_app_secret: Option<String>,
    ) -> Self {
        Self {
            db,
            cipher,
            api,
            system_users,
            config,
            primary_app_secret,
        }
    }

    pub fn api(&self) -> &AdsApi {
        &self.api
    }

    pub fn system_users(&self) -> &SystemUserManager {
        &self.system_users
    }

    async fn user_token(&self, user_id: &str) -> ServiceResult<AccessToken> {
        let auth = FacebookAuth::get(&self.db, user_id)
            .await?
            .ok_or_else(|| ServiceError::Unauthorized("Facebook account not connected".to_string()))?;
        let token = self.cipher.reveal(&auth.encrypted_token)?;
        Ok(AccessToken::with_secret(token, self.primary_app_secret.clone()))
    }

    pub async fn acquire(&self, user_id: &str, account: &AdAccount) -> ServiceResult<Dispatch> {
        self.acquire_at(user_id, account, Utc::now()).await
    }

    /// Pick the credential for one Graph call at `now`.
    pub async fn acquire_at(
        &self,
        user_id: &str,
        account: &AdAccount,
        now: DateTime<Utc>,
    ) -> ServiceResult<Dispatch> {
        self.acquire_units_at(user_id, account, now, 1).await
    }

    /// Pick one credential for an operation making `units` Graph calls,
    /// charging all of them to the credential's hourly budget.
    pub async fn acquire_units_at(
        &self,
        user_id: &str,
        account: &AdAccount,
        now: DateTime<Utc>,
        units: i64,
    ) -> ServiceResult<Dispatch> {
        if account.is_internal {
            if let Some(business_id) = account.business_id.as_deref() {
                if let Some(token) = self.system_users.token_for(business_id, now) {
                    return Ok(Dispatch::Use(Credential {
                        kind: CredentialKind::SystemUser {
                            business_id: business_id.to_string(),
                        },
                        token,
                    }));
                }
            }
        }

        let user_token = self.user_token(user_id).await?;
        let bucket = hour_bucket(now);
        let now_ts = timestamp(now);

        if !self.config.enabled {
            RateLimitStatus::add(&self.db, user_id, &bucket, units).await?;
            return Ok(Dispatch::Use(Credential {
                kind: CredentialKind::User,
                token: user_token,
            }));
        }

        let throttled = RateLimitStatus::active_throttle(&self.db, user_id, &now_ts).await?;
        if throttled.is_none()
            && RateLimitStatus::try_add(
                &self.db,
                user_id,
                &bucket,
                units,
                self.config.user_hourly_threshold,
            )
            .await?
        {
            return Ok(Dispatch::Use(Credential {
                kind: CredentialKind::User,
                token: user_token,
            }));
        }

        for app in BackupApp::list_available(&self.db, &bucket, &now_ts).await? {
            if !BackupApp::try_reserve_units(&self.db, &app.id, &bucket, &now_ts, units).await? {
                continue;
            }
            match self.cipher.reveal(&app.encrypted_token) {
                Ok(token) => {
                    debug!(app_id = %app.app_id, user_id, "Using backup app");
                    return Ok(Dispatch::Use(Credential {
                        kind: CredentialKind::BackupApp {
                            id: app.id.clone(),
                            app_id: app.app_id.clone(),
                        },
                        token: AccessToken::with_secret(token, app.app_secret.clone()),
                    }));
                }
                Err(e) => warn!(app_id = %app.app_id, "Skipping backup app with unreadable token: {}", e),
            }
        }

        Ok(Dispatch::Queue {
            process_after: self.queue_after(user_id, now).await?,
        })
    }

    /// Earliest time any credential is expected to free up, but no sooner
    /// than the configured retry delay.
    async fn queue_after(&self, user_id: &str, now: DateTime<Utc>) -> ServiceResult<DateTime<Utc>> {
        let now_ts = timestamp(now);
        let mut candidates = vec![next_hour(now)];

        if let Some(until) = RateLimitStatus::active_throttle(&self.db, user_id, &now_ts)
            .await?
            .as_deref()
            .and_then(parse_timestamp)
        {
            candidates.push(until);
        }
        if let Some(until) = BackupApp::earliest_cooldown_end(&self.db, &now_ts)
            .await?
            .as_deref()
            .and_then(parse_timestamp)
        {
            candidates.push(until);
        }

        let earliest = candidates.into_iter().min().unwrap_or_else(|| next_hour(now));
        let floor = now + Duration::seconds(self.config.retry_delay_secs.max(0));
        Ok(earliest.max(floor))
    }

    /// Execute a Graph operation with the best available credential.
    ///
    /// A rate-limited credential is marked throttled and the call is retried
    /// once with a fresh credential. When nothing is available the attempt
    /// is [`Attempt::Deferred`] with the time it is worth trying again.
    pub async fn execute<T, F, Fut>(
        &self,
        user_id: &str,
        account: &AdAccount,
        f: F,
    ) -> ServiceResult<Attempt<T>>
    where
        F: Fn(Credential) -> Fut,
        Fut: Future<Output = Result<T, GraphError>>,
    {
        self.execute_units(user_id, account, 1, f).await
    }

    /// [`execute`](Self::execute) for an operation that makes `units` Graph
    /// calls with the one credential.
    pub async fn execute_units<T, F, Fut>(
        &self,
        user_id: &str,
        account: &AdAccount,
        units: i64,
        f: F,
    ) -> ServiceResult<Attempt<T>>
    where
        F: Fn(Credential) -> Fut,
        Fut: Future<Output = Result<T, GraphError>>,
    {
        let mut retried = false;

        loop {
            let credential = match self
                .acquire_units_at(user_id, account, Utc::now(), units)
                .await?
            {
                Dispatch::Use(credential) => credential,
                Dispatch::Queue { process_after } => {
                    return Ok(Attempt::Deferred { process_after });
                }
            };

            record_graph_call(credential.kind.label());
            match f(credential.clone()).await {
                Ok(value) => {
                    self.observe_usage(user_id, &credential).await?;
                    return Ok(Attempt::Done(value));
                }
                Err(GraphError::RateLimited { retry_after, message, .. }) => {
                    record_rate_limited(credential.kind.label());
                    warn!(
                        user_id,
                        credential = credential.kind.label(),
                        "Graph rate limit hit: {}",
                        message
                    );
                    let now = Utc::now();
                    let until = retry_after
                        .filter(|s| *s > 0)
                        .map(|s| now + Duration::seconds(s))
                        .unwrap_or_else(|| next_hour(now));
                    self.throttle(user_id, &credential.kind, until).await?;

                    if retried {
                        return Ok(Attempt::Deferred {
                            process_after: self.queue_after(user_id, now).await?,
                        });
                    }
                    retried = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// [`execute`](Self::execute), queueing the serialized `operation` when
    /// the attempt is deferred.
    pub async fn run<T, Op, F, Fut>(
        &self,
        user_id: &str,
        account: &AdAccount,
        operation: &Op,
        f: F,
    ) -> ServiceResult<Outcome<T>>
    where
        Op: Serialize,
        F: Fn(Credential) -> Fut,
        Fut: Future<Output = Result<T, GraphError>>,
    {
        match self.execute(user_id, account, f).await? {
            Attempt::Done(value) => Ok(Outcome::Done(value)),
            Attempt::Deferred { process_after } => self
                .enqueue(user_id, account, operation, process_after)
                .await
                .map(Outcome::Queued),
        }
    }

    pub async fn enqueue<Op: Serialize>(
        &self,
        user_id: &str,
        account: &AdAccount,
        operation: &Op,
        process_after: DateTime<Utc>,
    ) -> ServiceResult<QueuedRequest> {
        let payload = serde_json::to_string(operation)
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Failed to serialize operation: {}", e)))?;
        let queued = QueuedRequest::create(
            &self.db,
            user_id,
            &account.id,
            &payload,
            &timestamp(process_after),
        )
        .await?;

        record_request_queued();
        info!(
            user_id,
            request_id = %queued.id,
            process_after = %queued.process_after,
            "No credential available, request queued"
        );
        Ok(queued)
    }

    async fn throttle(
        &self,
        user_id: &str,
        kind: &CredentialKind,
        until: DateTime<Utc>,
    ) -> ServiceResult<()> {
        let until_ts = timestamp(until);
        match kind {
            CredentialKind::User => {
                RateLimitStatus::throttle(&self.db, user_id, &hour_bucket(Utc::now()), &until_ts)
                    .await?;
            }
            CredentialKind::BackupApp { id, .. } => {
                BackupApp::set_cooldown(&self.db, id, Some(&until_ts)).await?;
            }
            CredentialKind::SystemUser { business_id } => {
                self.system_users.throttle(business_id, until);
            }
        }
        Ok(())
    }

    /// Record usage headers of the last call and throttle proactively when
    /// a credential is close to its limit.
    async fn observe_usage(&self, user_id: &str, credential: &Credential) -> ServiceResult<()> {
        let Some(usage) = self.api.take_usage(&credential.token.token) else {
            return Ok(());
        };
        let now = Utc::now();

        if credential.kind == CredentialKind::User {
            RateLimitStatus::record_usage(
                &self.db,
                user_id,
                &hour_bucket(now),
                usage.app_pct(),
                usage.business_pct(),
            )
            .await?;
        }

        if self.config.enabled && usage.max_pct() >= self.config.usage_throttle_pct {
            let until = proactive_throttle_end(&usage, now);
            info!(
                user_id,
                credential = credential.kind.label(),
                usage_pct = usage.max_pct(),
                "Usage near limit, throttling credential"
            );
            self.throttle(user_id, &credential.kind, until).await?;
        }
        Ok(())
    }

    pub async fn status(&self, user_id: &str) -> ServiceResult<RateLimitReport> {
        let now = Utc::now();
        let bucket = hour_bucket(now);
        let now_ts = timestamp(now);

        let current = RateLimitStatus::get(&self.db, user_id, &bucket).await?;
        let throttled_until = RateLimitStatus::active_throttle(&self.db, user_id, &now_ts).await?;
        let apps = BackupApp::list(&self.db).await?;
        let available = BackupApp::list_available(&self.db, &bucket, &now_ts).await?.len();
        let queued_requests = QueuedRequest::count_pending_for_user(&self.db, user_id).await?;

        let call_count = current.as_ref().map(|c| c.call_count).unwrap_or(0);
        let threshold = self.config.user_hourly_threshold;

        Ok(RateLimitReport {
            enabled: self.config.enabled,
            hour_bucket: bucket.clone(),
            call_count,
            threshold,
            remaining: (threshold - call_count).max(0),
            app_usage_pct: current.as_ref().map(|c| c.app_usage_pct).unwrap_or(0.0),
            buc_usage_pct: current.as_ref().map(|c| c.buc_usage_pct).unwrap_or(0.0),
            throttled_until,
            backup_apps_available: available,
            backup_apps: apps.iter().map(|a| a.to_response(&bucket)).collect(),
            system_users: self.system_users.statuses(now),
            queued_requests,
        })
    }
}

fn proactive_throttle_end(usage: &UsageReport, now: DateTime<Utc>) -> DateTime<Utc> {
    usage
        .regain_access_after_secs()
        .map(|s| now + Duration::seconds(s))
        .unwrap_or_else(|| next_hour(now))
}
