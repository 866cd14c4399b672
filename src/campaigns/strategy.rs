//! 1-N-1 strategy planning: one campaign, N ad sets from variations of a
//! template, one ad per ad set sharing the same creative.

use serde_json::Value;

use super::{check_ad_set_budget, validation, StrategyRequest};
use crate::error::{ServiceResult, ValidationErrors};
use crate::facebook::{AdSetSpec, AdSpec};

pub const STRATEGY_NAME: &str = "1-n-1";

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedAdSet {
    pub ad_set: AdSetSpec,
    pub ad: AdSpec,
}

/// Overlay `overlay`'s keys onto `base`. Non-object overlays replace `base`.
pub fn merge_targeting(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut merged = base.clone();
            for (key, value) in overlay {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}

pub fn validate(request: &StrategyRequest) -> ServiceResult<()> {
    let mut errors = ValidationErrors::new();
    let campaign_has_budget = request.campaign.has_budget();

    request.campaign.validate(&mut errors);
    request.ad.validate("ad", &mut errors);
    errors
        .check("ad_set.name", validation::validate_name(&request.ad_set.name))
        .check(
            "variations",
            validation::validate_variation_count(request.variations.len()),
        );
    if let Some(status) = &request.ad_set.status {
        errors.check("ad_set.status", validation::validate_status(status));
    }

    for (i, variation) in request.variations.iter().enumerate() {
        let field = format!("variations[{}]", i);
        if let Some(name) = &variation.name {
            errors.check(format!("{}.name", field), validation::validate_name(name));
        }
        let targeting = variation
            .targeting
            .as_ref()
            .map(|t| merge_targeting(&request.ad_set.targeting, t))
            .unwrap_or_else(|| request.ad_set.targeting.clone());
        errors.check(
            format!("{}.targeting", field),
            validation::validate_targeting(&targeting),
        );

        let (daily, lifetime) = variation_budget(request, i);
        check_ad_set_budget(&field, daily, lifetime, campaign_has_budget, &mut errors);
    }

    errors.finish()
}

/// A variation that sets either budget replaces both template budgets.
fn variation_budget(request: &StrategyRequest, index: usize) -> (Option<i64>, Option<i64>) {
    let variation = &request.variations[index];
    if variation.daily_budget.is_some() || variation.lifetime_budget.is_some() {
        (variation.daily_budget, variation.lifetime_budget)
    } else {
        (request.ad_set.daily_budget, request.ad_set.lifetime_budget)
    }
}

pub fn plan(request: &StrategyRequest) -> Vec<PlannedAdSet> {
    let status = request.campaign.status.as_str();

    (0..request.variations.len())
        .map(|i| {
            let variation = &request.variations[i];
            let mut ad_set = request.ad_set.to_spec(status);

            ad_set.name = variation
                .name
                .as_ref()
                .map(|n| n.trim().to_string())
                .unwrap_or_else(|| format!("{} - Variation {}", ad_set.name, i + 1));
            let (daily, lifetime) = variation_budget(request, i);
            ad_set.daily_budget = daily;
            ad_set.lifetime_budget = lifetime;
            if let Some(targeting) = &variation.targeting {
                ad_set.targeting = merge_targeting(&ad_set.targeting, targeting);
            }

            let ad = request
                .ad
                .to_spec(format!("{} - {}", request.ad.name.trim(), ad_set.name), status);
            PlannedAdSet { ad_set, ad }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaigns::{AdInput, AdSetInput, AdSetVariation, CampaignFields};
    use crate::error::ServiceError;
    use serde_json::json;

    fn request(variations: Vec<AdSetVariation>) -> StrategyRequest {
        StrategyRequest {
            ad_account_id: "act_1".into(),
            campaign: CampaignFields {
                name: "Launch".into(),
                objective: "OUTCOME_SALES".into(),
                status: "PAUSED".into(),
                daily_budget: None,
                lifetime_budget: None,
                special_ad_categories: vec![],
                bid_strategy: None,
            },
            ad_set: AdSetInput {
                name: "Base".into(),
                status: None,
                daily_budget: Some(1000),
                lifetime_budget: None,
                optimization_goal: "OFFSITE_CONVERSIONS".into(),
                billing_event: "IMPRESSIONS".into(),
                bid_amount: None,
                targeting: json!({"geo_locations": {"countries": ["US"]}, "age_min": 18}),
                start_time: None,
                end_time: None,
                promoted_object: None,
            },
            variations,
            ad: AdInput {
                name: "Hero".into(),
                status: None,
                creative: json!({"creative_id": "777"}),
            },
        }
    }

    #[test]
    fn test_merge_targeting() {
        let merged = merge_targeting(
            &json!({"geo_locations": {"countries": ["US"]}, "age_min": 18}),
            &json!({"age_min": 25, "age_max": 34}),
        );
        assert_eq!(merged["age_min"], 25);
        assert_eq!(merged["age_max"], 34);
        assert_eq!(merged["geo_locations"]["countries"][0], "US");
    }

    #[test]
    fn test_plan_applies_overrides() {
        let req = request(vec![
            AdSetVariation::default(),
            AdSetVariation {
                name: Some("Young".into()),
                daily_budget: Some(2500),
                lifetime_budget: None,
                targeting: Some(json!({"age_max": 24})),
            },
        ]);
        assert!(validate(&req).is_ok());

        let planned = plan(&req);
        assert_eq!(planned.len(), 2);
        assert_eq!(planned[0].ad_set.name, "Base - Variation 1");
        assert_eq!(planned[0].ad_set.daily_budget, Some(1000));
        assert_eq!(planned[1].ad_set.name, "Young");
        assert_eq!(planned[1].ad_set.daily_budget, Some(2500));
        assert_eq!(planned[1].ad_set.targeting["age_max"], 24);
        assert_eq!(planned[1].ad_set.targeting["age_min"], 18);
        assert_eq!(planned[1].ad.name, "Hero - Young");
        assert_eq!(planned[1].ad.creative, json!({"creative_id": "777"}));
        assert_eq!(planned[1].ad.status, "PAUSED");
    }

    #[test]
    fn test_variation_count_bounds() {
        let none = request(vec![]);
        let too_many = request(vec![AdSetVariation::default(); 51]);
        for req in [none, too_many] {
            match validate(&req) {
                Err(ServiceError::Validation(errors)) => assert!(errors.contains_key("variations")),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_variation_budget_conflicts_with_campaign_budget() {
        let mut req = request(vec![AdSetVariation {
            daily_budget: Some(500),
            ..AdSetVariation::default()
        }]);
        req.campaign.daily_budget = Some(5000);
        req.ad_set.daily_budget = None;

        match validate(&req) {
            Err(ServiceError::Validation(errors)) => {
                assert!(errors.contains_key("variations[0].budget"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
