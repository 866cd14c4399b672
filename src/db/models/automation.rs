//! Automation rules and the events they produce.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AutomationRule {
    pub id: String,
    pub user_id: String,
    pub ad_account_id: String,
    pub name: String,
    pub metric: String,
    /// `gt` or `lt`
    pub operator: String,
    /// Fixed threshold; ignored when `baseline_multiplier` is set
    pub threshold_value: Option<f64>,
    /// Threshold = learned baseline mean × multiplier
    pub baseline_multiplier: Option<f64>,
    /// `pause` or `notify`
    pub action: String,
    pub cooldown_hours: i64,
    pub enabled: bool,
    pub last_triggered_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAutomationRuleRequest {
    pub ad_account_id: String,
    pub name: String,
    pub metric: String,
    pub operator: String,
    pub threshold_value: Option<f64>,
    pub baseline_multiplier: Option<f64>,
    pub action: String,
    pub cooldown_hours: Option<i64>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateAutomationRuleRequest {
    pub name: Option<String>,
    pub metric: Option<String>,
    pub operator: Option<String>,
    pub threshold_value: Option<f64>,
    pub baseline_multiplier: Option<f64>,
    pub action: Option<String>,
    pub cooldown_hours: Option<i64>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AutomationEvent {
    pub id: String,
    pub rule_id: String,
    pub user_id: String,
    pub entity_id: String,
    pub metric_value: f64,
    pub threshold: f64,
    pub action: String,
    /// `executed`, `notified`, `queued` or `failed`
    pub outcome: String,
    pub message: Option<String>,
    pub created_at: String,
}

impl AutomationRule {
    pub async fn create(
        db: &SqlitePool,
        user_id: &str,
        req: &CreateAutomationRuleRequest,
    ) -> Result<AutomationRule, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = crate::db::now();
        sqlx::query(
            r#"
            INSERT INTO intel_automation_rules (
                id, user_id, ad_account_id, name, metric, operator, threshold_value,
                baseline_multiplier, action, cooldown_hours, enabled, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(&req.ad_account_id)
        .bind(&req.name)
        .bind(&req.metric)
        .bind(&req.operator)
        .bind(req.threshold_value)
        .bind(req.baseline_multiplier)
        .bind(&req.action)
        .bind(req.cooldown_hours.unwrap_or(24))
        .bind(req.enabled.unwrap_or(true))
        .bind(&now)
        .bind(&now)
        .execute(db)
        .await?;

        Self::get(db, user_id, &id).await?.ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn get(db: &SqlitePool, user_id: &str, id: &str) -> Result<Option<AutomationRule>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM intel_automation_rules WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .fetch_optional(db)
            .await
    }

    pub async fn list_for_user(db: &SqlitePool, user_id: &str) -> Result<Vec<AutomationRule>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM intel_automation_rules WHERE user_id = ? ORDER BY created_at ASC")
            .bind(user_id)
            .fetch_all(db)
            .await
    }

    pub async fn list_enabled(
        db: &SqlitePool,
        user_id: Option<&str>,
    ) -> Result<Vec<AutomationRule>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM intel_automation_rules WHERE enabled = 1 AND (? IS NULL OR user_id = ?) ORDER BY user_id, created_at",
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(db)
        .await
    }

    pub async fn update(
        db: &SqlitePool,
        user_id: &str,
        id: &str,
        req: &UpdateAutomationRuleRequest,
    ) -> Result<Option<AutomationRule>, sqlx::Error> {
        let Some(existing) = Self::get(db, user_id, id).await? else {
            return Ok(None);
        };

        // Setting one threshold source clears the other
        let (threshold_value, baseline_multiplier) =
            match (req.threshold_value, req.baseline_multiplier) {
                (Some(t), None) => (Some(t), None),
                (None, Some(m)) => (None, Some(m)),
                (Some(t), Some(m)) => (Some(t), Some(m)),
                (None, None) => (existing.threshold_value, existing.baseline_multiplier),
            };

        sqlx::query(
            r#"
            UPDATE intel_automation_rules SET
                name = ?, metric = ?, operator = ?, threshold_value = ?, baseline_multiplier = ?,
                action = ?, cooldown_hours = ?, enabled = ?, updated_at = ?
            WHERE id = ? AND user_id = ?
            "#,
        )
        .bind(req.name.as_ref().unwrap_or(&existing.name))
        .bind(req.metric.as_ref().unwrap_or(&existing.metric))
        .bind(req.operator.as_ref().unwrap_or(&existing.operator))
        .bind(threshold_value)
        .bind(baseline_multiplier)
        .bind(req.action.as_ref().unwrap_or(&existing.action))
        .bind(req.cooldown_hours.unwrap_or(existing.cooldown_hours))
        .bind(req.enabled.unwrap_or(existing.enabled))
        .bind(crate::db::now())
        .bind(id)
        .bind(user_id)
        .execute(db)
        .await?;

        Self::get(db, user_id, id).await
    }

    pub async fn delete(db: &SqlitePool, user_id: &str, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM intel_automation_rules WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_triggered(db: &SqlitePool, id: &str, at: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE intel_automation_rules SET last_triggered_at = ? WHERE id = ?")
            .bind(at)
            .bind(id)
            .execute(db)
            .await?;
        Ok(())
    }
}

impl AutomationEvent {
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        db: &SqlitePool,
        rule: &AutomationRule,
        entity_id: &str,
        metric_value: f64,
        threshold: f64,
        outcome: &str,
        message: Option<&str>,
        at: &str,
    ) -> Result<AutomationEvent, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO intel_automation_events (id, rule_id, user_id, entity_id, metric_value, threshold, action, outcome, message, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&rule.id)
        .bind(&rule.user_id)
        .bind(entity_id)
        .bind(metric_value)
        .bind(threshold)
        .bind(&rule.action)
        .bind(outcome)
        .bind(message)
        .bind(at)
        .execute(db)
        .await?;

        sqlx::query_as("SELECT * FROM intel_automation_events WHERE id = ?")
            .bind(&id)
            .fetch_one(db)
            .await
    }

    /// Most recent firing of a rule for one entity
    pub async fn last_for(
        db: &SqlitePool,
        rule_id: &str,
        entity_id: &str,
    ) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT MAX(created_at) FROM intel_automation_events WHERE rule_id = ? AND entity_id = ? AND outcome != 'failed'",
        )
        .bind(rule_id)
        .bind(entity_id)
        .fetch_one(db)
        .await
    }

    pub async fn list_for_user(
        db: &SqlitePool,
        user_id: &str,
        rule_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<AutomationEvent>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM intel_automation_events
            WHERE user_id = ? AND (? IS NULL OR rule_id = ?)
            ORDER BY created_at DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(rule_id)
        .bind(rule_id)
        .bind(limit)
        .fetch_all(db)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_request() -> CreateAutomationRuleRequest {
        CreateAutomationRuleRequest {
            ad_account_id: "act_1".into(),
            name: "High CPA".into(),
            metric: "cpa".into(),
            operator: "gt".into(),
            threshold_value: Some(25.0),
            baseline_multiplier: None,
            action: "pause".into(),
            cooldown_hours: None,
            enabled: None,
        }
    }

    #[tokio::test]
    async fn test_update_switches_threshold_source() {
        let db = crate::db::init_memory().await.unwrap();
        let rule = AutomationRule::create(&db, "u1", &rule_request()).await.unwrap();
        assert_eq!(rule.cooldown_hours, 24);
        assert!(rule.enabled);

        let updated = AutomationRule::update(
            &db,
            "u1",
            &rule.id,
            &UpdateAutomationRuleRequest {
                baseline_multiplier: Some(1.5),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(updated.threshold_value, None);
        assert_eq!(updated.baseline_multiplier, Some(1.5));
        assert_eq!(updated.name, "High CPA");

        assert!(AutomationRule::update(&db, "u2", &rule.id, &Default::default())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_last_event_ignores_failures() {
        let db = crate::db::init_memory().await.unwrap();
        let rule = AutomationRule::create(&db, "u1", &rule_request()).await.unwrap();
        AutomationEvent::create(&db, &rule, "c1", 30.0, 25.0, "executed", None, "2026-10-18T09:00:00Z")
            .await
            .unwrap();
        AutomationEvent::create(&db, &rule, "c1", 31.0, 25.0, "failed", Some("boom"), "2026-10-18T10:00:00Z")
            .await
            .unwrap();

        let last = AutomationEvent::last_for(&db, &rule.id, "c1").await.unwrap();
        assert_eq!(last.as_deref(), Some("2026-10-18T09:00:00Z"));
        assert!(AutomationEvent::last_for(&db, &rule.id, "c2").await.unwrap().is_none());
        assert_eq!(AutomationEvent::list_for_user(&db, "u1", None, 10).await.unwrap().len(), 2);
    }
}
