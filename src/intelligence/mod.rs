//! Performance intelligence: snapshots, backfill, learned patterns and
//! automation rules.

mod automation;
mod backfill;
pub mod patterns;
mod snapshots;

pub use automation::{AutomationService, EvaluationSummary, EventOutcome, EventQuery};
pub use backfill::{BackfillService, StartBackfillRequest};
pub use patterns::{LearnSummary, PatternLearner};
pub use snapshots::{yesterday, CollectRequest, CollectSummary, SnapshotCollector, SnapshotQuery};

use std::sync::Arc;

use crate::campaigns::CampaignService;
use crate::config::IntelligenceConfig;
use crate::db::DbPool;
use crate::ratelimit::RateLimitRouter;

/// The intelligence services, wired together.
#[derive(Clone)]
pub struct Intelligence {
    pub snapshots: Arc<SnapshotCollector>,
    pub backfill: Arc<BackfillService>,
    pub patterns: Arc<PatternLearner>,
    pub automation: Arc<AutomationService>,
}

impl Intelligence {
    pub fn new(
        db: DbPool,
        router: Arc<RateLimitRouter>,
        campaigns: Arc<CampaignService>,
        config: IntelligenceConfig,
    ) -> Self {
        let snapshots = Arc::new(SnapshotCollector::new(db.clone(), router));
        Self {
            backfill: Arc::new(BackfillService::new(db.clone(), snapshots.clone(), config.clone())),
            patterns: Arc::new(PatternLearner::new(db.clone(), config)),
            automation: Arc::new(AutomationService::new(db, campaigns)),
            snapshots,
        }
    }
}
