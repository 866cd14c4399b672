//! Campaign creation, duplication and the 1-N-1 strategy flow.
//!
//! Every operation that touches Graph is described by a [`QueuedOperation`]
//! so it can be stored and replayed when all credentials are rate limited.

mod service;
pub mod strategy;
pub mod validation;

pub use service::{CampaignService, DuplicateOutcome};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationErrors;
use crate::facebook::{AdSetSpec, AdSpec, CampaignSpec};

fn default_status() -> String {
    "PAUSED".to_string()
}

fn default_optimization_goal() -> String {
    "LINK_CLICKS".to_string()
}

fn default_billing_event() -> String {
    "IMPRESSIONS".to_string()
}

fn default_copies() -> u32 {
    1
}

/// Campaign-level fields shared by the create and strategy requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignFields {
    pub name: String,
    pub objective: String,
    #[serde(default = "default_status")]
    pub status: String,
    pub daily_budget: Option<i64>,
    pub lifetime_budget: Option<i64>,
    #[serde(default)]
    pub special_ad_categories: Vec<String>,
    pub bid_strategy: Option<String>,
}

impl CampaignFields {
    pub fn has_budget(&self) -> bool {
        self.daily_budget.is_some() || self.lifetime_budget.is_some()
    }

    pub fn validate(&self, errors: &mut ValidationErrors) {
        errors
            .check("name", validation::validate_name(&self.name))
            .check("objective", validation::validate_objective(&self.objective))
            .check("status", validation::validate_status(&self.status))
            .check(
                "budget",
                validation::validate_budgets(self.daily_budget, self.lifetime_budget),
            )
            .check(
                "special_ad_categories",
                validation::validate_special_ad_categories(&self.special_ad_categories),
            );
    }

    pub fn to_spec(&self) -> CampaignSpec {
        CampaignSpec {
            name: self.name.trim().to_string(),
            objective: self.objective.clone(),
            status: self.status.clone(),
            daily_budget: self.daily_budget,
            lifetime_budget: self.lifetime_budget,
            special_ad_categories: self.special_ad_categories.clone(),
            bid_strategy: self.bid_strategy.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdSetInput {
    pub name: String,
    /// Defaults to the campaign status
    pub status: Option<String>,
    pub daily_budget: Option<i64>,
    pub lifetime_budget: Option<i64>,
    #[serde(default = "default_optimization_goal")]
    pub optimization_goal: String,
    #[serde(default = "default_billing_event")]
    pub billing_event: String,
    pub bid_amount: Option<i64>,
    pub targeting: Value,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub promoted_object: Option<Value>,
}

impl AdSetInput {
    /// Ad set budgets are mutually exclusive with a campaign budget; without
    /// one the ad set must carry its own.
    pub fn validate(&self, field: &str, campaign_has_budget: bool, errors: &mut ValidationErrors) {
        errors
            .check(format!("{}.name", field), validation::validate_name(&self.name))
            .check(
                format!("{}.targeting", field),
                validation::validate_targeting(&self.targeting),
            );
        if let Some(status) = &self.status {
            errors.check(format!("{}.status", field), validation::validate_status(status));
        }
        check_ad_set_budget(
            field,
            self.daily_budget,
            self.lifetime_budget,
            campaign_has_budget,
            errors,
        );
    }

    pub fn to_spec(&self, campaign_status: &str) -> AdSetSpec {
        AdSetSpec {
            name: self.name.trim().to_string(),
            status: self
                .status
                .clone()
                .unwrap_or_else(|| campaign_status.to_string()),
            daily_budget: self.daily_budget,
            lifetime_budget: self.lifetime_budget,
            optimization_goal: self.optimization_goal.clone(),
            billing_event: self.billing_event.clone(),
            bid_amount: self.bid_amount,
            targeting: self.targeting.clone(),
            start_time: self.start_time.clone(),
            end_time: self.end_time.clone(),
            promoted_object: self.promoted_object.clone(),
        }
    }
}

pub(crate) fn check_ad_set_budget(
    field: &str,
    daily: Option<i64>,
    lifetime: Option<i64>,
    campaign_has_budget: bool,
    errors: &mut ValidationErrors,
) {
    let key = format!("{}.budget", field);
    let has_budget = daily.is_some() || lifetime.is_some();
    if campaign_has_budget && has_budget {
        errors.add(key, "Ad set budgets cannot be combined with a campaign budget");
    } else if !campaign_has_budget && !has_budget {
        errors.add(key, "A budget is required on the campaign or the ad set");
    } else {
        errors.check(key, validation::validate_budgets(daily, lifetime));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdInput {
    pub name: String,
    pub status: Option<String>,
    pub creative: Value,
}

impl AdInput {
    pub fn validate(&self, field: &str, errors: &mut ValidationErrors) {
        errors
            .check(format!("{}.name", field), validation::validate_name(&self.name))
            .check(
                format!("{}.creative", field),
                validation::validate_creative(&self.creative),
            );
        if let Some(status) = &self.status {
            errors.check(format!("{}.status", field), validation::validate_status(status));
        }
    }

    pub fn to_spec(&self, name: String, campaign_status: &str) -> AdSpec {
        AdSpec {
            name,
            status: self
                .status
                .clone()
                .unwrap_or_else(|| campaign_status.to_string()),
            creative: self.creative.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateCampaignRequest {
    pub ad_account_id: String,
    #[serde(flatten)]
    pub campaign: CampaignFields,
    pub ad_set: Option<AdSetInput>,
    pub ad: Option<AdInput>,
}

impl CreateCampaignRequest {
    pub fn validate(&self) -> crate::error::ServiceResult<()> {
        let mut errors = ValidationErrors::new();
        self.campaign.validate(&mut errors);
        if let Some(ad_set) = &self.ad_set {
            ad_set.validate("ad_set", self.campaign.has_budget(), &mut errors);
        }
        match (&self.ad_set, &self.ad) {
            (None, Some(_)) => {
                errors.add("ad", "An ad requires an ad set");
            }
            (_, Some(ad)) => ad.validate("ad", &mut errors),
            _ => {}
        }
        errors.finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateCampaignRequest {
    #[serde(default = "default_copies")]
    pub copies: u32,
    /// Status of the copies; PAUSED when omitted
    pub status: Option<String>,
}

impl Default for DuplicateCampaignRequest {
    fn default() -> Self {
        Self {
            copies: default_copies(),
            status: None,
        }
    }
}

/// Overrides applied to the ad set template for one 1-N-1 variation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdSetVariation {
    pub name: Option<String>,
    pub daily_budget: Option<i64>,
    pub lifetime_budget: Option<i64>,
    /// Merged key by key over the template targeting
    pub targeting: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRequest {
    pub ad_account_id: String,
    #[serde(flatten)]
    pub campaign: CampaignFields,
    /// Template every variation starts from
    pub ad_set: AdSetInput,
    pub variations: Vec<AdSetVariation>,
    /// Creative shared by the ad in every ad set
    pub ad: AdInput,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
}

/// A Graph-touching operation as stored in the retry queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueuedOperation {
    CreateCampaign {
        request: CreateCampaignRequest,
    },
    /// Copies `from..=to` of a local campaign
    DuplicateCampaign {
        campaign_id: String,
        from: u32,
        to: u32,
        status: String,
    },
    CreateStrategy {
        request: StrategyRequest,
    },
    UpdateStatus {
        fb_object_id: String,
        status: String,
    },
    DeleteCampaign {
        campaign_id: String,
    },
    /// A partially created campaign whose rollback could not run at the time
    DeleteGraphObject {
        fb_object_id: String,
    },
}

impl QueuedOperation {
    pub fn kind(&self) -> &'static str {
        match self {
            QueuedOperation::CreateCampaign { .. } => "create_campaign",
            QueuedOperation::DuplicateCampaign { .. } => "duplicate_campaign",
            QueuedOperation::CreateStrategy { .. } => "create_strategy",
            QueuedOperation::UpdateStatus { .. } => "update_status",
            QueuedOperation::DeleteCampaign { .. } => "delete_campaign",
            QueuedOperation::DeleteGraphObject { .. } => "delete_graph_object",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use serde_json::json;

    fn request(value: Value) -> CreateCampaignRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_flattened_fields_and_defaults() {
        let req = request(json!({
            "ad_account_id": "act_1",
            "name": "Spring",
            "objective": "OUTCOME_TRAFFIC",
            "daily_budget": 1000
        }));
        assert_eq!(req.campaign.status, "PAUSED");
        assert!(req.campaign.special_ad_categories.is_empty());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_ad_requires_ad_set() {
        let req = request(json!({
            "ad_account_id": "act_1",
            "name": "Spring",
            "objective": "OUTCOME_TRAFFIC",
            "daily_budget": 1000,
            "ad": {"name": "Ad", "creative": {"creative_id": "9"}}
        }));
        match req.validate() {
            Err(ServiceError::Validation(errors)) => assert!(errors.contains_key("ad")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_budget_placement_rules() {
        let with_both = request(json!({
            "ad_account_id": "act_1",
            "name": "Spring",
            "objective": "OUTCOME_TRAFFIC",
            "daily_budget": 1000,
            "ad_set": {"name": "Set", "daily_budget": 500, "targeting": {"geo_locations": {"countries": ["US"]}}}
        }));
        let with_neither = request(json!({
            "ad_account_id": "act_1",
            "name": "Spring",
            "objective": "OUTCOME_TRAFFIC",
            "ad_set": {"name": "Set", "targeting": {"geo_locations": {"countries": ["US"]}}}
        }));

        for req in [with_both, with_neither] {
            match req.validate() {
                Err(ServiceError::Validation(errors)) => {
                    assert!(errors.contains_key("ad_set.budget"), "{:?}", errors)
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_queued_operation_is_tagged() {
        let op = QueuedOperation::UpdateStatus {
            fb_object_id: "120".into(),
            status: "PAUSED".into(),
        };
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["type"], "update_status");
        assert_eq!(op.kind(), "update_status");

        let stored = serde_json::to_string(&QueuedOperation::CreateCampaign {
            request: request(json!({
                "ad_account_id": "act_1",
                "name": "Spring",
                "objective": "OUTCOME_SALES",
                "lifetime_budget": 20000
            })),
        })
        .unwrap();
        let back: QueuedOperation = serde_json::from_str(&stored).unwrap();
        match back {
            QueuedOperation::CreateCampaign { request } => {
                assert_eq!(request.campaign.lifetime_budget, Some(20000));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
