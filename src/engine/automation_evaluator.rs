//! Automation rule evaluation task
//!
//! Periodically evaluates every enabled automation rule against the latest
//! snapshots. Cooldowns are enforced by the rules themselves, so running
//! more often than snapshots change only costs a few queries.

use crate::intelligence::AutomationService;
use std::sync::Arc;
use tokio::time::{interval, Duration};

/// Spawn the background automation evaluation task
pub fn spawn_automation_evaluator_task(automation: Arc<AutomationService>, interval_secs: u64) {
    let interval_secs = interval_secs.max(60);
    tracing::info!(interval_secs = interval_secs, "Starting automation evaluation task");

    tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(interval_secs));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tick.tick().await;
            match automation.evaluate(None).await {
                Ok(summary) => tracing::debug!(
                    rules = summary.rules,
                    triggered = summary.triggered,
                    in_cooldown = summary.in_cooldown,
                    failed = summary.failed,
                    "Automation evaluation cycle completed"
                ),
                Err(e) => tracing::error!(error = %e, "Automation evaluation cycle failed"),
            }
        }
    });
}
