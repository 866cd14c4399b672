//! Input validation for campaign requests.
//!
//! Each validator returns `Err(message)`; callers collect them with
//! [`ValidationErrors`](crate::error::ValidationErrors).

use serde_json::Value;

pub const MAX_NAME_LENGTH: usize = 400;
/// Smallest budget Graph accepts, in the account currency's minor units
pub const MIN_BUDGET: i64 = 100;
pub const MAX_COPIES: u32 = 20;
pub const MAX_VARIATIONS: usize = 50;

/// Outcome-based objectives
pub const OBJECTIVES: [&str; 6] = [
    "OUTCOME_AWARENESS",
    "OUTCOME_TRAFFIC",
    "OUTCOME_ENGAGEMENT",
    "OUTCOME_LEADS",
    "OUTCOME_APP_PROMOTION",
    "OUTCOME_SALES",
];

pub const STATUSES: [&str; 2] = ["ACTIVE", "PAUSED"];

pub const SPECIAL_AD_CATEGORIES: [&str; 5] = [
    "NONE",
    "EMPLOYMENT",
    "HOUSING",
    "CREDIT",
    "ISSUES_ELECTIONS_POLITICS",
];

pub fn validate_name(name: &str) -> Result<(), String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err("Name is required".to_string());
    }
    if trimmed.chars().count() > MAX_NAME_LENGTH {
        return Err(format!("Name is too long (max {} characters)", MAX_NAME_LENGTH));
    }
    Ok(())
}

pub fn validate_objective(objective: &str) -> Result<(), String> {
    if OBJECTIVES.contains(&objective) {
        Ok(())
    } else {
        Err(format!("Invalid objective. Must be one of: {}", OBJECTIVES.join(", ")))
    }
}

pub fn validate_status(status: &str) -> Result<(), String> {
    if STATUSES.contains(&status) {
        Ok(())
    } else {
        Err("Invalid status. Must be ACTIVE or PAUSED".to_string())
    }
}

/// At most one of daily and lifetime budget, each at least [`MIN_BUDGET`].
pub fn validate_budgets(daily: Option<i64>, lifetime: Option<i64>) -> Result<(), String> {
    if daily.is_some() && lifetime.is_some() {
        return Err("Specify either a daily or a lifetime budget, not both".to_string());
    }
    match daily.or(lifetime) {
        Some(budget) if budget < MIN_BUDGET => Err(format!(
            "Budget must be at least {} (minor currency units)",
            MIN_BUDGET
        )),
        _ => Ok(()),
    }
}

pub fn validate_special_ad_categories(categories: &[String]) -> Result<(), String> {
    match categories
        .iter()
        .find(|c| !SPECIAL_AD_CATEGORIES.contains(&c.as_str()))
    {
        Some(bad) => Err(format!("Unknown special ad category: {}", bad)),
        None => Ok(()),
    }
}

pub fn validate_targeting(targeting: &Value) -> Result<(), String> {
    match targeting {
        Value::Object(map) if map.contains_key("geo_locations") => Ok(()),
        Value::Object(_) => Err("Targeting must include geo_locations".to_string()),
        _ => Err("Targeting must be an object".to_string()),
    }
}

pub fn validate_creative(creative: &Value) -> Result<(), String> {
    match creative {
        Value::Object(map) if !map.is_empty() => Ok(()),
        _ => Err("Creative must be an object such as {\"creative_id\": \"...\"}".to_string()),
    }
}

pub fn validate_copies(copies: u32) -> Result<(), String> {
    if (1..=MAX_COPIES).contains(&copies) {
        Ok(())
    } else {
        Err(format!("Copies must be between 1 and {}", MAX_COPIES))
    }
}

pub fn validate_variation_count(count: usize) -> Result<(), String> {
    if (1..=MAX_VARIATIONS).contains(&count) {
        Ok(())
    } else {
        Err(format!("Variations must contain between 1 and {} entries", MAX_VARIATIONS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("Spring Sale").is_ok());
        assert!(validate_name("   ").is_err());
        assert!(validate_name(&"x".repeat(400)).is_ok());
        assert!(validate_name(&"x".repeat(401)).is_err());
    }

    #[test]
    fn test_validate_objective_and_status() {
        assert!(validate_objective("OUTCOME_SALES").is_ok());
        assert!(validate_objective("CONVERSIONS").is_err());
        assert!(validate_status("PAUSED").is_ok());
        assert!(validate_status("ARCHIVED").is_err());
    }

    #[test]
    fn test_validate_budgets() {
        assert!(validate_budgets(None, None).is_ok());
        assert!(validate_budgets(Some(100), None).is_ok());
        assert!(validate_budgets(None, Some(99)).is_err());
        assert!(validate_budgets(Some(500), Some(500)).is_err());
    }

    #[test]
    fn test_validate_special_ad_categories() {
        assert!(validate_special_ad_categories(&[]).is_ok());
        assert!(validate_special_ad_categories(&["HOUSING".into()]).is_ok());
        let err = validate_special_ad_categories(&["GAMBLING".into()]).unwrap_err();
        assert!(err.contains("GAMBLING"));
    }

    #[test]
    fn test_validate_targeting_and_creative() {
        assert!(validate_targeting(&json!({"geo_locations": {"countries": ["US"]}})).is_ok());
        assert!(validate_targeting(&json!({"age_min": 18})).is_err());
        assert!(validate_targeting(&json!("US")).is_err());
        assert!(validate_creative(&json!({"creative_id": "1"})).is_ok());
        assert!(validate_creative(&json!({})).is_err());
    }

    #[test]
    fn test_limits() {
        assert!(validate_copies(0).is_err());
        assert!(validate_copies(20).is_ok());
        assert!(validate_copies(21).is_err());
        assert!(validate_variation_count(0).is_err());
        assert!(validate_variation_count(50).is_ok());
        assert!(validate_variation_count(51).is_err());
    }
}
