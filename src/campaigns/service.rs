use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use super::strategy::{self, PlannedAdSet, STRATEGY_NAME};
use super::validation::{validate_copies, validate_status};
use super::{CreateCampaignRequest, DuplicateCampaignRequest, QueuedOperation, StrategyRequest};
use crate::db::{normalize_account_id, AdAccount, Campaign, DbPool, NewCampaign, QueuedRequest};
use crate::error::{ServiceError, ServiceResult, ValidationErrors};
use crate::facebook::{AccessToken, AdSetSpec, AdSpec, AdsApi, CampaignSpec, CopyOptions, GraphError};
use crate::ratelimit::{Attempt, Outcome, RateLimitRouter};

const DUPLICATE_STRATEGY: &str = "duplicate";

/// Copies made now, plus the queued request for any that had to wait
#[derive(Debug, Serialize)]
pub struct DuplicateOutcome {
    pub campaigns: Vec<Campaign>,
    pub queued: Option<QueuedRequest>,
}

/// Graph ids of a campaign tree created in one go
#[derive(Debug, Clone, Default)]
struct CreatedTree {
    campaign_id: String,
    ad_set_ids: Vec<String>,
    ad_ids: Vec<String>,
}

/// Create a campaign and its ad sets and ads. If any later step fails the
/// campaign is deleted again so a retry does not leave duplicates behind.
/// Campaigns that could not be deleted are pushed to `orphans`.
async fn create_tree(
    api: &AdsApi,
    token: &AccessToken,
    account_id: &str,
    campaign: &CampaignSpec,
    ad_sets: &[(AdSetSpec, Option<AdSpec>)],
    orphans: &Mutex<Vec<String>>,
) -> Result<CreatedTree, GraphError> {
    let campaign_id = api.create_campaign(token, account_id, campaign).await?;
    let mut tree = CreatedTree {
        campaign_id,
        ..CreatedTree::default()
    };

    for (ad_set, ad) in ad_sets {
        let ad_set_id = match api
            .create_ad_set(token, account_id, &tree.campaign_id, ad_set)
            .await
        {
            Ok(id) => id,
            Err(e) => return Err(rollback(api, token, &tree.campaign_id, e, orphans).await),
        };
        if let Some(ad) = ad {
            match api.create_ad(token, account_id, &ad_set_id, ad).await {
                Ok(id) => tree.ad_ids.push(id),
                Err(e) => return Err(rollback(api, token, &tree.campaign_id, e, orphans).await),
            }
        }
        tree.ad_set_ids.push(ad_set_id);
    }

    Ok(tree)
}

async fn rollback(
    api: &AdsApi,
    token: &AccessToken,
    campaign_id: &str,
    cause: GraphError,
    orphans: &Mutex<Vec<String>>,
) -> GraphError {
    if let Err(e) = api.delete_object(token, campaign_id).await {
        warn!(campaign_id, "Failed to remove partially created campaign: {}", e);
        if let Ok(mut pending) = orphans.lock() {
            pending.push(campaign_id.to_string());
        }
    }
    cause
}

fn copy_name(base: &str, k: u32) -> String {
    format!("{} - Copy {}", base, k)
}

pub struct CampaignService {
    db: DbPool,
    router: Arc<RateLimitRouter>,
}

impl CampaignService {
    pub fn new(db: DbPool, router: Arc<RateLimitRouter>) -> Self {
        Self { db, router }
    }

    async fn owned_account(&self, user_id: &str, account_id: &str) -> ServiceResult<AdAccount> {
        let id = normalize_account_id(account_id)
            .ok_or_else(|| ServiceError::invalid("ad_account_id", "Invalid ad account id"))?;
        AdAccount::get(&self.db, user_id, &id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Ad account"))
    }

    async fn owned_campaign(&self, user_id: &str, id: &str) -> ServiceResult<Campaign> {
        Campaign::get(&self.db, user_id, id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Campaign"))
    }

    async fn finish<T>(
        &self,
        user_id: &str,
        account: &AdAccount,
        operation: &QueuedOperation,
        attempt: Attempt<T>,
    ) -> ServiceResult<Outcome<T>> {
        match attempt {
            Attempt::Done(value) => Ok(Outcome::Done(value)),
            Attempt::Deferred { process_after } => self
                .router
                .enqueue(user_id, account, operation, process_after)
                .await
                .map(Outcome::Queued),
        }
    }

    pub async fn list(&self, user_id: &str, ad_account_id: Option<&str>) -> ServiceResult<Vec<Campaign>> {
        let account = match ad_account_id {
            Some(id) => Some(
                normalize_account_id(id)
                    .ok_or_else(|| ServiceError::invalid("ad_account_id", "Invalid ad account id"))?,
            ),
            None => None,
        };
        Ok(Campaign::list_for_user(&self.db, user_id, account.as_deref()).await?)
    }

    pub async fn get(&self, user_id: &str, id: &str) -> ServiceResult<Campaign> {
        self.owned_campaign(user_id, id).await
    }

    pub async fn create_campaign(
        &self,
        user_id: &str,
        request: CreateCampaignRequest,
    ) -> ServiceResult<Outcome<Campaign>> {
        request.validate()?;
        let account = self.owned_account(user_id, &request.ad_account_id).await?;
        let attempt = self.perform_create(user_id, &account, &request).await?;
        self.finish(
            user_id,
            &account,
            &QueuedOperation::CreateCampaign { request },
            attempt,
        )
        .await
    }

    async fn perform_create(
        &self,
        user_id: &str,
        account: &AdAccount,
        request: &CreateCampaignRequest,
    ) -> ServiceResult<Attempt<Campaign>> {
        let campaign_spec = request.campaign.to_spec();
        let status = request.campaign.status.as_str();
        let ad_sets: Vec<(AdSetSpec, Option<AdSpec>)> = request
            .ad_set
            .iter()
            .map(|ad_set| {
                let ad = request
                    .ad
                    .as_ref()
                    .map(|ad| ad.to_spec(ad.name.trim().to_string(), status));
                (ad_set.to_spec(status), ad)
            })
            .collect();

        let attempt = self
            .create_tree_routed(user_id, account, &campaign_spec, &ad_sets)
            .await?;
        let tree = match attempt {
            Attempt::Done(tree) => tree,
            Attempt::Deferred { process_after } => return Ok(Attempt::Deferred { process_after }),
        };

        let campaign = Campaign::create(
            &self.db,
            &NewCampaign {
                user_id: user_id.to_string(),
                ad_account_id: account.id.clone(),
                fb_campaign_id: tree.campaign_id,
                name: campaign_spec.name.clone(),
                objective: campaign_spec.objective.clone(),
                status: campaign_spec.status.clone(),
                daily_budget: campaign_spec.daily_budget,
                lifetime_budget: campaign_spec.lifetime_budget,
                fb_ad_set_ids: tree.ad_set_ids,
                fb_ad_ids: tree.ad_ids,
                ..NewCampaign::default()
            },
        )
        .await?;

        info!(user_id, campaign_id = %campaign.id, fb_campaign_id = %campaign.fb_campaign_id, "Campaign created");
        Ok(Attempt::Done(campaign))
    }

    async fn create_tree_routed(
        &self,
        user_id: &str,
        account: &AdAccount,
        campaign: &CampaignSpec,
        ad_sets: &[(AdSetSpec, Option<AdSpec>)],
    ) -> ServiceResult<Attempt<CreatedTree>> {
        let api = self.router.api();
        let account_id = account.id.as_str();
        let orphans = Mutex::new(Vec::new());
        let pending = &orphans;
        let calls = 1 + ad_sets
            .iter()
            .map(|(_, ad)| 1 + ad.is_some() as i64)
            .sum::<i64>();
        let attempt = self
            .router
            .execute_units(user_id, account, calls, |credential| async move {
                create_tree(api, &credential.token, account_id, campaign, ad_sets, pending).await
            })
            .await;

        for campaign_id in orphans.into_inner().unwrap_or_else(|e| e.into_inner()) {
            self.remove_orphan(user_id, account, &campaign_id).await;
        }
        attempt
    }

    /// Delete a campaign whose rollback failed, with whichever credential
    /// is free now. Queued when none is.
    async fn remove_orphan(&self, user_id: &str, account: &AdAccount, campaign_id: &str) {
        let api = self.router.api();
        let attempt = self
            .router
            .execute(user_id, account, |credential| async move {
                api.delete_object(&credential.token, campaign_id).await
            })
            .await;

        match attempt {
            Ok(Attempt::Done(())) => info!(user_id, campaign_id, "Removed partially created campaign"),
            Ok(Attempt::Deferred { process_after }) => {
                let operation = QueuedOperation::DeleteGraphObject {
                    fb_object_id: campaign_id.to_string(),
                };
                if let Err(e) = self.router.enqueue(user_id, account, &operation, process_after).await {
                    warn!(user_id, campaign_id, error = %e, "Failed to queue removal of partial campaign");
                }
            }
            Err(e) => warn!(user_id, campaign_id, error = %e, "Failed to remove partially created campaign"),
        }
    }

    pub async fn create_strategy(
        &self,
        user_id: &str,
        request: StrategyRequest,
    ) -> ServiceResult<Outcome<Campaign>> {
        strategy::validate(&request)?;
        let account = self.owned_account(user_id, &request.ad_account_id).await?;
        let attempt = self.perform_strategy(user_id, &account, &request).await?;
        self.finish(
            user_id,
            &account,
            &QueuedOperation::CreateStrategy { request },
            attempt,
        )
        .await
    }

    async fn perform_strategy(
        &self,
        user_id: &str,
        account: &AdAccount,
        request: &StrategyRequest,
    ) -> ServiceResult<Attempt<Campaign>> {
        let campaign_spec = request.campaign.to_spec();
        let ad_sets: Vec<(AdSetSpec, Option<AdSpec>)> = strategy::plan(request)
            .into_iter()
            .map(|PlannedAdSet { ad_set, ad }| (ad_set, Some(ad)))
            .collect();

        let attempt = self
            .create_tree_routed(user_id, account, &campaign_spec, &ad_sets)
            .await?;
        let tree = match attempt {
            Attempt::Done(tree) => tree,
            Attempt::Deferred { process_after } => return Ok(Attempt::Deferred { process_after }),
        };

        let campaign = Campaign::create(
            &self.db,
            &NewCampaign {
                user_id: user_id.to_string(),
                ad_account_id: account.id.clone(),
                fb_campaign_id: tree.campaign_id,
                name: campaign_spec.name.clone(),
                objective: campaign_spec.objective.clone(),
                status: campaign_spec.status.clone(),
                daily_budget: campaign_spec.daily_budget,
                lifetime_budget: campaign_spec.lifetime_budget,
                strategy: Some(STRATEGY_NAME.to_string()),
                fb_ad_set_ids: tree.ad_set_ids,
                fb_ad_ids: tree.ad_ids,
                ..NewCampaign::default()
            },
        )
        .await?;

        info!(
            user_id,
            campaign_id = %campaign.id,
            ad_sets = request.variations.len(),
            "1-N-1 strategy created"
        );
        Ok(Attempt::Done(campaign))
    }

    pub async fn duplicate_campaign(
        &self,
        user_id: &str,
        campaign_id: &str,
        request: DuplicateCampaignRequest,
    ) -> ServiceResult<DuplicateOutcome> {
        let mut errors = ValidationErrors::new();
        errors.check("copies", validate_copies(request.copies));
        if let Some(status) = &request.status {
            errors.check("status", validate_status(status));
        }
        errors.finish()?;

        let source = self.owned_campaign(user_id, campaign_id).await?;
        let account = self.owned_account(user_id, &source.ad_account_id).await?;
        let status = request.status.unwrap_or_else(|| "PAUSED".to_string());

        let (campaigns, remaining) = self
            .perform_duplicate(user_id, &account, &source, 1, request.copies, &status)
            .await?;

        let queued = match remaining {
            Some((from, process_after)) => Some(
                self.router
                    .enqueue(
                        user_id,
                        &account,
                        &QueuedOperation::DuplicateCampaign {
                            campaign_id: source.id.clone(),
                            from,
                            to: request.copies,
                            status,
                        },
                        process_after,
                    )
                    .await?,
            ),
            None => None,
        };

        Ok(DuplicateOutcome { campaigns, queued })
    }

    /// Make copies `from..=to`. Stops at the first copy no credential can
    /// serve and returns its number with the time to retry.
    async fn perform_duplicate(
        &self,
        user_id: &str,
        account: &AdAccount,
        source: &Campaign,
        from: u32,
        to: u32,
        status: &str,
    ) -> ServiceResult<(Vec<Campaign>, Option<(u32, DateTime<Utc>)>)> {
        let api = self.router.api();
        let fb_source = source.fb_campaign_id.as_str();
        let mut created = Vec::new();

        for k in from..=to {
            let options = CopyOptions {
                deep_copy: true,
                rename_suffix: Some(format!(" - Copy {}", k)),
                status_option: Some(status.to_string()),
            };
            let options = &options;
            let attempt = self
                .router
                .execute(user_id, account, |credential| async move {
                    api.copy_campaign(&credential.token, fb_source, options).await
                })
                .await?;

            let copy = match attempt {
                Attempt::Done(copy) => copy,
                Attempt::Deferred { process_after } => {
                    return Ok((created, Some((k, process_after))));
                }
            };

            created.push(
                Campaign::create(
                    &self.db,
                    &NewCampaign {
                        user_id: user_id.to_string(),
                        ad_account_id: account.id.clone(),
                        fb_campaign_id: copy.campaign_id,
                        name: copy_name(&source.name, k),
                        objective: source.objective.clone(),
                        status: status.to_string(),
                        daily_budget: source.daily_budget,
                        lifetime_budget: source.lifetime_budget,
                        source_campaign_id: Some(source.id.clone()),
                        strategy: Some(DUPLICATE_STRATEGY.to_string()),
                        fb_ad_set_ids: copy.ad_set_ids,
                        fb_ad_ids: copy.ad_ids,
                    },
                )
                .await?,
            );
        }

        info!(user_id, source = %source.id, copies = created.len(), "Campaign duplicated");
        Ok((created, None))
    }

    pub async fn update_status(
        &self,
        user_id: &str,
        campaign_id: &str,
        status: &str,
    ) -> ServiceResult<Outcome<Campaign>> {
        validate_status(status).map_err(|e| ServiceError::invalid("status", e))?;
        let campaign = self.owned_campaign(user_id, campaign_id).await?;
        let account = self.owned_account(user_id, &campaign.ad_account_id).await?;

        let outcome = self
            .set_object_status(user_id, &account, &campaign.fb_campaign_id, status)
            .await?;
        match outcome {
            Outcome::Done(()) => Ok(Outcome::Done(self.owned_campaign(user_id, campaign_id).await?)),
            Outcome::Queued(q) => Ok(Outcome::Queued(q)),
        }
    }

    /// Change the status of any Graph object in `account`, queueing the
    /// change when every credential is rate limited.
    pub async fn set_object_status(
        &self,
        user_id: &str,
        account: &AdAccount,
        fb_object_id: &str,
        status: &str,
    ) -> ServiceResult<Outcome<()>> {
        let attempt = self
            .perform_set_status(user_id, account, fb_object_id, status)
            .await?;
        self.finish(
            user_id,
            account,
            &QueuedOperation::UpdateStatus {
                fb_object_id: fb_object_id.to_string(),
                status: status.to_string(),
            },
            attempt,
        )
        .await
    }

    async fn perform_set_status(
        &self,
        user_id: &str,
        account: &AdAccount,
        fb_object_id: &str,
        status: &str,
    ) -> ServiceResult<Attempt<()>> {
        let api = self.router.api();
        let attempt = self
            .router
            .execute(user_id, account, |credential| async move {
                api.update_status(&credential.token, fb_object_id, status).await
            })
            .await?;
        if let Attempt::Done(()) = attempt {
            Campaign::update_status_by_fb_id(&self.db, fb_object_id, status).await?;
        }
        Ok(attempt)
    }

    pub async fn delete_campaign(&self, user_id: &str, campaign_id: &str) -> ServiceResult<Outcome<()>> {
        let campaign = self.owned_campaign(user_id, campaign_id).await?;
        let account = self.owned_account(user_id, &campaign.ad_account_id).await?;
        let attempt = self.perform_delete(user_id, &account, &campaign).await?;
        self.finish(
            user_id,
            &account,
            &QueuedOperation::DeleteCampaign {
                campaign_id: campaign.id.clone(),
            },
            attempt,
        )
        .await
    }

    async fn perform_delete(
        &self,
        user_id: &str,
        account: &AdAccount,
        campaign: &Campaign,
    ) -> ServiceResult<Attempt<()>> {
        let api = self.router.api();
        let fb_id = campaign.fb_campaign_id.as_str();
        let attempt = self
            .router
            .execute(user_id, account, |credential| async move {
                api.delete_object(&credential.token, fb_id).await
            })
            .await?;
        if let Attempt::Done(()) = attempt {
            Campaign::delete(&self.db, user_id, &campaign.id).await?;
            info!(user_id, campaign_id = %campaign.id, "Campaign deleted");
        }
        Ok(attempt)
    }

    /// Replay a queued operation. `Deferred` means the caller should put the
    /// request back in the queue unchanged.
    pub async fn execute_queued(&self, request: &QueuedRequest) -> ServiceResult<Attempt<Value>> {
        let operation: QueuedOperation = serde_json::from_str(&request.operation).map_err(|e| {
            ServiceError::Internal(anyhow::anyhow!("Unreadable queued operation: {}", e))
        })?;
        let user_id = request.user_id.as_str();
        let account = AdAccount::get(&self.db, user_id, &request.ad_account_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Ad account"))?;

        match operation {
            QueuedOperation::CreateCampaign { request } => {
                let attempt = self.perform_create(user_id, &account, &request).await?;
                to_json(attempt)
            }
            QueuedOperation::CreateStrategy { request } => {
                let attempt = self.perform_strategy(user_id, &account, &request).await?;
                to_json(attempt)
            }
            QueuedOperation::DuplicateCampaign {
                campaign_id,
                from,
                to,
                status,
            } => {
                let source = self.owned_campaign(user_id, &campaign_id).await?;
                let (created, remaining) = self
                    .perform_duplicate(user_id, &account, &source, from, to, &status)
                    .await?;

                match remaining {
                    Some((_, process_after)) if created.is_empty() => {
                        Ok(Attempt::Deferred { process_after })
                    }
                    Some((next, process_after)) => {
                        // Progress was made; the rest continues in a fresh request
                        let rest = self
                            .router
                            .enqueue(
                                user_id,
                                &account,
                                &QueuedOperation::DuplicateCampaign {
                                    campaign_id,
                                    from: next,
                                    to,
                                    status,
                                },
                                process_after,
                            )
                            .await?;
                        Ok(Attempt::Done(json!({ "campaigns": created, "continued_in": rest.id })))
                    }
                    None => Ok(Attempt::Done(json!({ "campaigns": created }))),
                }
            }
            QueuedOperation::UpdateStatus {
                fb_object_id,
                status,
            } => {
                let attempt = self
                    .perform_set_status(user_id, &account, &fb_object_id, &status)
                    .await?;
                Ok(match attempt {
                    Attempt::Done(()) => Attempt::Done(json!({ "id": fb_object_id, "status": status })),
                    Attempt::Deferred { process_after } => Attempt::Deferred { process_after },
                })
            }
            QueuedOperation::DeleteGraphObject { fb_object_id } => {
                let api = self.router.api();
                let id = fb_object_id.as_str();
                let attempt = self
                    .router
                    .execute(user_id, &account, |credential| async move {
                        api.delete_object(&credential.token, id).await
                    })
                    .await?;
                Ok(match attempt {
                    Attempt::Done(()) => Attempt::Done(json!({ "deleted": fb_object_id })),
                    Attempt::Deferred { process_after } => Attempt::Deferred { process_after },
                })
            }
            QueuedOperation::DeleteCampaign { campaign_id } => {
                let Some(campaign) = Campaign::get(&self.db, user_id, &campaign_id).await? else {
                    return Ok(Attempt::Done(json!({ "deleted": campaign_id, "already_gone": true })));
                };
                let attempt = self.perform_delete(user_id, &account, &campaign).await?;
                Ok(match attempt {
                    Attempt::Done(()) => Attempt::Done(json!({ "deleted": campaign_id })),
                    Attempt::Deferred { process_after } => Attempt::Deferred { process_after },
                })
            }
        }
    }
}

fn to_json<T: Serialize>(attempt: Attempt<T>) -> ServiceResult<Attempt<Value>> {
    Ok(match attempt {
        Attempt::Done(value) => Attempt::Done(
            serde_json::to_value(value).map_err(|e| ServiceError::Internal(e.into()))?,
        ),
        Attempt::Deferred { process_after } => Attempt::Deferred { process_after },
    })
}
