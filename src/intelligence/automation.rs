//! Automation rules evaluated against the latest snapshots.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::patterns::{BASELINE_METRICS, METRIC_BASELINE};
use super::snapshots::format_date;
use crate::api::metrics::record_automation_event;
use crate::campaigns::CampaignService;
use crate::db::{
    normalize_account_id, timestamp, AdAccount, AutomationEvent, AutomationRule, CreateAutomationRuleRequest,
    DbPool, LearnedPattern, PerformanceSnapshot, UpdateAutomationRuleRequest,
};
use crate::error::{ServiceError, ServiceResult, ValidationErrors};
use crate::ratelimit::{parse_timestamp, Outcome};

pub const RULE_METRICS: &[&str] = &["ctr", "cpc", "cpm", "cpa", "roas", "frequency", "spend"];
pub const OPERATORS: &[&str] = &["gt", "lt"];
pub const ACTIONS: &[&str] = &["pause", "notify"];
const MAX_COOLDOWN_HOURS: i64 = 24 * 30;
const MAX_RULE_NAME_LENGTH: usize = 200;
const DEFAULT_EVENT_LIMIT: i64 = 50;
const MAX_EVENT_LIMIT: i64 = 500;
/// Yesterday plus a day of grace; older snapshots belong to entities that
/// stopped delivering
const MAX_SNAPSHOT_AGE_DAYS: i64 = 2;

fn one_of(value: &str, allowed: &[&str], what: &str) -> Result<(), String> {
    if allowed.contains(&value) {
        Ok(())
    } else {
        Err(format!("{} must be one of: {}", what, allowed.join(", ")))
    }
}

pub fn validate_rule_name(name: &str) -> Result<(), String> {
    let name = name.trim();
    if name.is_empty() {
        return Err("Rule name is required".to_string());
    }
    if name.chars().count() > MAX_RULE_NAME_LENGTH {
        return Err(format!("Rule name must be at most {} characters", MAX_RULE_NAME_LENGTH));
    }
    Ok(())
}

/// Exactly one threshold source, and a learned baseline only for metrics
/// that have one.
pub fn validate_threshold(metric: &str, threshold: Option<f64>, multiplier: Option<f64>) -> Result<(), String> {
    match (threshold, multiplier) {
        (Some(_), Some(_)) => Err("Set either threshold_value or baseline_multiplier, not both".to_string()),
        (None, None) => Err("threshold_value or baseline_multiplier is required".to_string()),
        (Some(t), None) if !t.is_finite() || t < 0.0 => Err("Threshold must be a non-negative number".to_string()),
        (None, Some(m)) if !m.is_finite() || m <= 0.0 => Err("Baseline multiplier must be positive".to_string()),
        (None, Some(_)) if !BASELINE_METRICS.contains(&metric) => {
            Err(format!("No learned baseline exists for {}", metric))
        }
        _ => Ok(()),
    }
}

pub fn validate_cooldown(hours: i64) -> Result<(), String> {
    if (0..=MAX_COOLDOWN_HOURS).contains(&hours) {
        Ok(())
    } else {
        Err(format!("Cooldown must be between 0 and {} hours", MAX_COOLDOWN_HOURS))
    }
}

/// What happened when a rule fired for one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Executed,
    Notified,
    Queued,
    Failed,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Executed => "executed",
            Self::Notified => "notified",
            Self::Queued => "queued",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct EvaluationSummary {
    pub rules: usize,
    pub entities: usize,
    pub triggered: usize,
    pub in_cooldown: usize,
    /// Rules with a learned threshold but nothing learned yet
    pub without_baseline: usize,
    pub failed: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventQuery {
    pub rule_id: Option<String>,
    pub limit: Option<i64>,
}

fn breached(operator: &str, value: f64, threshold: f64) -> bool {
    match operator {
        "gt" => value > threshold,
        "lt" => value < threshold,
        _ => false,
    }
}

pub struct AutomationService {
    db: DbPool,
    campaigns: Arc<CampaignService>,
}

impl AutomationService {
    pub fn new(db: DbPool, campaigns: Arc<CampaignService>) -> Self {
        Self { db, campaigns }
    }

    pub async fn create_rule(
        &self,
        user_id: &str,
        mut request: CreateAutomationRuleRequest,
    ) -> ServiceResult<AutomationRule> {
        let mut errors = ValidationErrors::new();
        errors
            .check("name", validate_rule_name(&request.name))
            .check("metric", one_of(&request.metric, RULE_METRICS, "Metric"))
            .check("operator", one_of(&request.operator, OPERATORS, "Operator"))
            .check("action", one_of(&request.action, ACTIONS, "Action"))
            .check(
                "threshold_value",
                validate_threshold(&request.metric, request.threshold_value, request.baseline_multiplier),
            );
        if let Some(hours) = request.cooldown_hours {
            errors.check("cooldown_hours", validate_cooldown(hours));
        }
        let account_id = normalize_account_id(&request.ad_account_id);
        if account_id.is_none() {
            errors.add("ad_account_id", "Invalid ad account id");
        }
        errors.finish()?;

        let account_id = account_id.unwrap_or_default();
        if AdAccount::get(&self.db, user_id, &account_id).await?.is_none() {
            return Err(ServiceError::not_found("Ad account"));
        }
        request.ad_account_id = account_id;
        request.name = request.name.trim().to_string();

        let rule = AutomationRule::create(&self.db, user_id, &request).await?;
        info!(user_id, rule_id = %rule.id, metric = %rule.metric, action = %rule.action, "Automation rule created");
        Ok(rule)
    }

    pub async fn list_rules(&self, user_id: &str) -> ServiceResult<Vec<AutomationRule>> {
        Ok(AutomationRule::list_for_user(&self.db, user_id).await?)
    }

    pub async fn update_rule(
        &self,
        user_id: &str,
        id: &str,
        request: UpdateAutomationRuleRequest,
    ) -> ServiceResult<AutomationRule> {
        let existing = AutomationRule::get(&self.db, user_id, id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Automation rule"))?;

        let metric = request.metric.as_deref().unwrap_or(&existing.metric);
        let mut errors = ValidationErrors::new();
        if let Some(name) = &request.name {
            errors.check("name", validate_rule_name(name));
        }
        errors.check("metric", one_of(metric, RULE_METRICS, "Metric"));
        if let Some(operator) = &request.operator {
            errors.check("operator", one_of(operator, OPERATORS, "Operator"));
        }
        if let Some(action) = &request.action {
            errors.check("action", one_of(action, ACTIONS, "Action"));
        }
        if let Some(hours) = request.cooldown_hours {
            errors.check("cooldown_hours", validate_cooldown(hours));
        }
        let (threshold, multiplier) = match (request.threshold_value, request.baseline_multiplier) {
            (None, None) => (existing.threshold_value, existing.baseline_multiplier),
            explicit => explicit,
        };
        errors.check("threshold_value", validate_threshold(metric, threshold, multiplier));
        errors.finish()?;

        AutomationRule::update(&self.db, user_id, id, &request)
            .await?
            .ok_or_else(|| ServiceError::not_found("Automation rule"))
    }

    pub async fn delete_rule(&self, user_id: &str, id: &str) -> ServiceResult<()> {
        if !AutomationRule::delete(&self.db, user_id, id).await? {
            return Err(ServiceError::not_found("Automation rule"));
        }
        info!(user_id, rule_id = id, "Automation rule deleted");
        Ok(())
    }

    pub async fn events(&self, user_id: &str, query: &EventQuery) -> ServiceResult<Vec<AutomationEvent>> {
        let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT).clamp(1, MAX_EVENT_LIMIT);
        Ok(AutomationEvent::list_for_user(&self.db, user_id, query.rule_id.as_deref(), limit).await?)
    }

    /// Evaluate every enabled rule, or only the given user's.
    pub async fn evaluate(&self, user_id: Option<&str>) -> ServiceResult<EvaluationSummary> {
        self.evaluate_at(user_id, Utc::now()).await
    }

    pub async fn evaluate_at(&self, user_id: Option<&str>, now: DateTime<Utc>) -> ServiceResult<EvaluationSummary> {
        let rules = AutomationRule::list_enabled(&self.db, user_id).await?;
        let mut summary = EvaluationSummary::default();

        for rule in &rules {
            summary.rules += 1;
            if let Err(e) = self.evaluate_rule(rule, now, &mut summary).await {
                summary.failed += 1;
                warn!(rule_id = %rule.id, error = %e, "Automation rule evaluation failed");
            }
        }

        if summary.triggered > 0 {
            info!(
                rules = summary.rules,
                triggered = summary.triggered,
                failed = summary.failed,
                "Automation evaluation completed"
            );
        }
        Ok(summary)
    }

    async fn threshold_for(&self, rule: &AutomationRule) -> ServiceResult<Option<f64>> {
        if let Some(multiplier) = rule.baseline_multiplier {
            let pattern = LearnedPattern::get(&self.db, &rule.ad_account_id, METRIC_BASELINE, &rule.metric).await?;
            return Ok(pattern
                .and_then(|p| p.data_json().get("mean").and_then(serde_json::Value::as_f64))
                .map(|mean| mean * multiplier));
        }
        Ok(rule.threshold_value)
    }

    async fn in_cooldown(&self, rule: &AutomationRule, entity_id: &str, now: DateTime<Utc>) -> ServiceResult<bool> {
        let last = AutomationEvent::last_for(&self.db, &rule.id, entity_id).await?;
        Ok(last
            .as_deref()
            .and_then(parse_timestamp)
            .is_some_and(|at| now - at < Duration::hours(rule.cooldown_hours)))
    }

    async fn evaluate_rule(
        &self,
        rule: &AutomationRule,
        now: DateTime<Utc>,
        summary: &mut EvaluationSummary,
    ) -> ServiceResult<()> {
        let Some(threshold) = self.threshold_for(rule).await? else {
            summary.without_baseline += 1;
            debug!(rule_id = %rule.id, "No learned baseline yet, skipping rule");
            return Ok(());
        };

        let oldest = format_date(now.date_naive() - Duration::days(MAX_SNAPSHOT_AGE_DAYS));
        let snapshots: Vec<PerformanceSnapshot> =
            PerformanceSnapshot::latest_per_entity(&self.db, &rule.ad_account_id)
                .await?
                .into_iter()
                .filter(|s| s.user_id == rule.user_id && s.impressions > 0 && s.snapshot_date >= oldest)
                .collect();

        for snapshot in &snapshots {
            summary.entities += 1;
            let Some(value) = snapshot.metric(&rule.metric) else {
                continue;
            };
            if !breached(&rule.operator, value, threshold) {
                continue;
            }
            if self.in_cooldown(rule, &snapshot.entity_id, now).await? {
                summary.in_cooldown += 1;
                continue;
            }

            let (outcome, message) = self.act(rule, &snapshot.entity_id).await;
            let at = timestamp(now);
            AutomationEvent::create(
                &self.db,
                rule,
                &snapshot.entity_id,
                value,
                threshold,
                outcome.as_str(),
                message.as_deref(),
                &at,
            )
            .await?;
            record_automation_event(outcome.as_str());

            if outcome == EventOutcome::Failed {
                summary.failed += 1;
            } else {
                summary.triggered += 1;
                AutomationRule::mark_triggered(&self.db, &rule.id, &at).await?;
            }
            info!(
                rule_id = %rule.id,
                entity_id = %snapshot.entity_id,
                metric = %rule.metric,
                value,
                threshold,
                outcome = outcome.as_str(),
                "Automation rule fired"
            );
        }
        Ok(())
    }

    async fn act(&self, rule: &AutomationRule, entity_id: &str) -> (EventOutcome, Option<String>) {
        if rule.action != "pause" {
            return (EventOutcome::Notified, None);
        }

        let account = match AdAccount::get(&self.db, &rule.user_id, &rule.ad_account_id).await {
            Ok(Some(account)) => account,
            Ok(None) => return (EventOutcome::Failed, Some("Ad account not found".to_string())),
            Err(e) => return (EventOutcome::Failed, Some(e.to_string())),
        };

        match self
            .campaigns
            .set_object_status(&rule.user_id, &account, entity_id, "PAUSED")
            .await
        {
            Ok(Outcome::Done(())) => (EventOutcome::Executed, None),
            Ok(Outcome::Queued(queued)) => (
                EventOutcome::Queued,
                Some(format!("Queued as request {} until {}", queued.id, queued.process_after)),
            ),
            Err(e) => (EventOutcome::Failed, Some(e.to_string())),
        }
    }
}
