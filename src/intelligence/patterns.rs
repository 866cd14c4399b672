//! Statistical patterns learned from stored snapshots.
//!
//! Three kinds of pattern are kept per ad account:
//! - `metric_baseline`: distribution of ctr, cpc, cpm, cpa and roas
//! - `best_weekday`: the weekday with the highest mean roas
//! - `fatigue_threshold`: the frequency at which ctr starts to drop off

use chrono::{Datelike, Duration, NaiveDate, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::snapshots::{format_date, DATE_FORMAT};
use crate::config::IntelligenceConfig;
use crate::db::{normalize_account_id, AdAccount, DbPool, LearnedPattern, PerformanceSnapshot};
use crate::error::{ServiceError, ServiceResult};

pub const METRIC_BASELINE: &str = "metric_baseline";
pub const BEST_WEEKDAY: &str = "best_weekday";
pub const FATIGUE_THRESHOLD: &str = "fatigue_threshold";

pub const BASELINE_METRICS: &[&str] = &["ctr", "cpc", "cpm", "cpa", "roas"];

/// Sample count at which confidence reaches 1
const FULL_CONFIDENCE_SAMPLES: f64 = 30.0;
/// A bucket is fatigued once its ctr falls below this share of the mean
const FATIGUE_CTR_RATIO: f64 = 0.8;
const FREQUENCY_BUCKET_WIDTH: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Baseline {
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
}

/// Linear interpolation between closest ranks over sorted `values`.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = p / 100.0 * (n - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let weight = rank - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * weight
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

pub fn baseline(values: &[f64]) -> Option<Baseline> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let mean = mean(&sorted);
    let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / sorted.len() as f64;

    Some(Baseline {
        mean,
        std_dev: variance.sqrt(),
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        p25: percentile(&sorted, 25.0),
        p50: percentile(&sorted, 50.0),
        p75: percentile(&sorted, 75.0),
    })
}

/// The snapshot's value for a baseline metric, or `None` when the metric's
/// denominator was zero that day and the stored 0 means "undefined".
pub fn baseline_sample(snapshot: &PerformanceSnapshot, metric: &str) -> Option<f64> {
    let defined = match metric {
        "ctr" | "cpm" => snapshot.impressions > 0,
        "cpc" => snapshot.clicks > 0,
        "cpa" => snapshot.conversions > 0,
        "roas" => snapshot.spend > 0.0,
        _ => true,
    };
    if defined {
        snapshot.metric(metric)
    } else {
        None
    }
}

pub fn confidence(samples: usize) -> f64 {
    (samples as f64 / FULL_CONFIDENCE_SAMPLES).min(1.0)
}

/// Weekday with the highest mean roas, with the per-day means.
pub fn best_weekday(snapshots: &[PerformanceSnapshot]) -> Option<(String, BTreeMap<String, f64>)> {
    let mut by_day: BTreeMap<u32, (String, Vec<f64>)> = BTreeMap::new();
    for s in snapshots {
        let Ok(date) = NaiveDate::parse_from_str(&s.snapshot_date, DATE_FORMAT) else {
            continue;
        };
        let Some(roas) = baseline_sample(s, "roas") else {
            continue;
        };
        let weekday = date.weekday();
        by_day
            .entry(weekday.num_days_from_monday())
            .or_insert_with(|| (weekday.to_string(), Vec::new()))
            .1
            .push(roas);
    }

    let means: Vec<(String, f64)> = by_day
        .into_values()
        .map(|(name, values)| (name, mean(&values)))
        .collect();
    let best = means
        .iter()
        .fold(None::<&(String, f64)>, |best, day| match best {
            Some(b) if b.1 >= day.1 => Some(b),
            _ => Some(day),
        })?
        .0
        .clone();

    Some((best, means.into_iter().collect()))
}

/// Lowest frequency bucket whose mean ctr is under 80% of the overall mean.
///
/// Buckets are half a frequency point wide and keyed by their lower bound.
pub fn fatigue_threshold(snapshots: &[PerformanceSnapshot]) -> Option<(f64, f64)> {
    let with_reach: Vec<&PerformanceSnapshot> = snapshots.iter().filter(|s| s.frequency > 0.0).collect();
    let overall = mean(&with_reach.iter().map(|s| s.ctr).collect::<Vec<_>>());
    if overall <= 0.0 {
        return None;
    }

    let mut buckets: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
    for s in &with_reach {
        let bucket = (s.frequency / FREQUENCY_BUCKET_WIDTH).floor() as i64;
        buckets.entry(bucket).or_default().push(s.ctr);
    }

    buckets.into_iter().find_map(|(bucket, ctrs)| {
        let bucket_ctr = mean(&ctrs);
        (bucket_ctr < overall * FATIGUE_CTR_RATIO).then(|| (bucket as f64 * FREQUENCY_BUCKET_WIDTH, bucket_ctr))
    })
}

/// Patterns written for one account
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct LearnSummary {
    pub ad_account_id: String,
    pub samples: usize,
    pub patterns: usize,
}

pub struct PatternLearner {
    db: DbPool,
    config: IntelligenceConfig,
}

impl PatternLearner {
    pub fn new(db: DbPool, config: IntelligenceConfig) -> Self {
        Self { db, config }
    }

    /// Learn every pattern for one account from the lookback window.
    ///
    /// Accounts with fewer than `min_pattern_samples` snapshots are skipped
    /// and keep whatever was learned before.
    pub async fn learn_for_account(&self, account: &AdAccount) -> ServiceResult<LearnSummary> {
        let since = Utc::now().date_naive() - Duration::days(self.config.pattern_lookback_days);
        let snapshots = PerformanceSnapshot::list_since(&self.db, &account.id, &format_date(since)).await?;

        let mut summary = LearnSummary {
            ad_account_id: account.id.clone(),
            samples: snapshots.len(),
            patterns: 0,
        };
        if snapshots.len() < self.config.min_pattern_samples {
            info!(
                account_id = %account.id,
                samples = snapshots.len(),
                required = self.config.min_pattern_samples,
                "Not enough snapshots to learn patterns"
            );
            return Ok(summary);
        }

        let n = snapshots.len();
        let conf = confidence(n);

        for metric in BASELINE_METRICS {
            let values: Vec<f64> = snapshots.iter().filter_map(|s| baseline_sample(s, metric)).collect();
            if let Some(b) = baseline(&values) {
                let data = serde_json::to_value(&b).map_err(|e| ServiceError::Internal(e.into()))?;
                let samples = values.len();
                self.store(account, METRIC_BASELINE, metric, &data, samples, confidence(samples))
                    .await?;
                summary.patterns += 1;
            }
        }

        if let Some((best, means)) = best_weekday(&snapshots) {
            let data = json!({ "best_day": best, "mean_roas_by_day": means });
            self.store(account, BEST_WEEKDAY, "roas", &data, n, conf).await?;
            summary.patterns += 1;
        }

        if let Some((frequency, ctr)) = fatigue_threshold(&snapshots) {
            let data = json!({ "frequency": frequency, "bucket_ctr": ctr });
            self.store(account, FATIGUE_THRESHOLD, "frequency", &data, n, conf).await?;
            summary.patterns += 1;
        }

        info!(
            account_id = %account.id,
            samples = n,
            patterns = summary.patterns,
            "Learned performance patterns"
        );
        Ok(summary)
    }

    async fn store(
        &self,
        account: &AdAccount,
        pattern_type: &str,
        metric: &str,
        data: &serde_json::Value,
        samples: usize,
        confidence: f64,
    ) -> ServiceResult<()> {
        LearnedPattern::upsert(
            &self.db,
            &account.user_id,
            &account.id,
            pattern_type,
            metric,
            data,
            samples as i64,
            confidence,
        )
        .await?;
        Ok(())
    }

    /// Learn for each of the user's accounts in turn. One account failing
    /// does not stop the others.
    pub async fn learn_for_user(&self, user_id: &str) -> ServiceResult<Vec<LearnSummary>> {
        let accounts = AdAccount::list_for_user(&self.db, user_id).await?;
        let mut summaries = Vec::with_capacity(accounts.len());
        for account in &accounts {
            match self.learn_for_account(account).await {
                Ok(summary) => summaries.push(summary),
                Err(e) => warn!(user_id, account_id = %account.id, error = %e, "Pattern learning failed"),
            }
        }
        Ok(summaries)
    }

    /// Learn for every registered account of every user.
    pub async fn learn_all(&self) -> ServiceResult<usize> {
        let accounts = AdAccount::list_all(&self.db).await?;
        let mut learned = 0;
        for account in &accounts {
            match self.learn_for_account(account).await {
                Ok(summary) if summary.patterns > 0 => learned += 1,
                Ok(_) => {}
                Err(e) => warn!(account_id = %account.id, error = %e, "Pattern learning failed"),
            }
        }
        Ok(learned)
    }

    /// Start learning for all of the user's accounts in the background.
    pub fn spawn_learn_for_user(self: &Arc<Self>, user_id: &str) {
        let learner = Arc::clone(self);
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = learner.learn_for_user(&user_id).await {
                warn!(user_id = %user_id, error = %e, "Background pattern learning failed");
            }
        });
    }

    pub async fn list(&self, user_id: &str, ad_account_id: Option<&str>) -> ServiceResult<Vec<LearnedPattern>> {
        let account = match ad_account_id {
            Some(id) => Some(
                normalize_account_id(id)
                    .ok_or_else(|| ServiceError::invalid("ad_account_id", "Invalid ad account id"))?,
            ),
            None => None,
        };
        Ok(LearnedPattern::list_for_user(&self.db, user_id, account.as_deref()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewSnapshot;

    fn snapshot(date: &str, ctr: f64, roas: f64, frequency: f64) -> PerformanceSnapshot {
        PerformanceSnapshot {
            id: 0,
            user_id: "u1".into(),
            ad_account_id: "act_1".into(),
            entity_type: "campaign".into(),
            entity_id: "c1".into(),
            entity_name: "Campaign".into(),
            snapshot_date: date.into(),
            impressions: 1000,
            clicks: 10,
            reach: 500,
            spend: 10.0,
            conversions: 1,
            revenue: 20.0,
            ctr,
            cpc: 1.0,
            cpm: 10.0,
            cpa: 10.0,
            roas,
            frequency,
            created_at: String::new(),
        }
    }

    #[test]
    fn test_baseline_statistics() {
        let b = baseline(&[4.0, 1.0, 3.0, 2.0]).unwrap();
        assert_eq!(b.mean, 2.5);
        assert!((b.std_dev - 1.25f64.sqrt()).abs() < 1e-9);
        assert_eq!(b.min, 1.0);
        assert_eq!(b.max, 4.0);
        assert!((b.p25 - 1.75).abs() < 1e-9);
        assert!((b.p50 - 2.5).abs() < 1e-9);
        assert!((b.p75 - 3.25).abs() < 1e-9);

        assert!(baseline(&[]).is_none());
        let single = baseline(&[7.0]).unwrap();
        assert_eq!((single.p25, single.p75, single.std_dev), (7.0, 7.0, 0.0));
    }

    #[test]
    fn test_undefined_ratios_are_not_samples() {
        let mut idle = snapshot("2026-10-12", 0.0, 0.0, 1.0);
        idle.conversions = 0;
        idle.cpa = 0.0;
        assert_eq!(baseline_sample(&idle, "cpa"), None);
        assert_eq!(baseline_sample(&idle, "ctr"), Some(0.0));

        idle.clicks = 0;
        idle.spend = 0.0;
        assert_eq!(baseline_sample(&idle, "cpc"), None);
        assert_eq!(baseline_sample(&idle, "roas"), None);

        idle.impressions = 0;
        assert_eq!(baseline_sample(&idle, "ctr"), None);
        assert_eq!(baseline_sample(&idle, "cpm"), None);

        // A no-spend Wednesday does not count as a zero-roas Wednesday
        let snaps = vec![snapshot("2026-10-12", 1.0, 2.0, 1.0), {
            let mut s = snapshot("2026-10-14", 1.0, 0.0, 1.0);
            s.spend = 0.0;
            s
        }];
        let (best, means) = best_weekday(&snaps).unwrap();
        assert_eq!(best, "Mon");
        assert_eq!(means.len(), 1);
    }

    #[test]
    fn test_confidence_saturates() {
        assert_eq!(confidence(0), 0.0);
        assert_eq!(confidence(15), 0.5);
        assert_eq!(confidence(90), 1.0);
    }

    #[test]
    fn test_best_weekday_by_mean_roas() {
        // 2026-10-12 is a Monday, 2026-10-14 a Wednesday
        let snaps = vec![
            snapshot("2026-10-12", 1.0, 2.0, 1.0),
            snapshot("2026-10-19", 1.0, 4.0, 1.0),
            snapshot("2026-10-14", 1.0, 3.5, 1.0),
            snapshot("not-a-date", 1.0, 99.0, 1.0),
        ];
        let (best, means) = best_weekday(&snaps).unwrap();
        assert_eq!(best, "Wed");
        assert_eq!(means.get("Mon"), Some(&3.0));
        assert_eq!(means.len(), 2);
        assert!(best_weekday(&[]).is_none());
    }

    #[test]
    fn test_fatigue_bucket() {
        let snaps = vec![
            snapshot("2026-10-01", 3.0, 1.0, 1.1),
            snapshot("2026-10-02", 3.0, 1.0, 1.2),
            snapshot("2026-10-03", 2.8, 1.0, 1.7),
            snapshot("2026-10-04", 1.0, 1.0, 2.6),
            snapshot("2026-10-05", 0.5, 1.0, 3.4),
        ];
        // overall mean 2.06, 80% = 1.648; first bucket under it starts at 2.5
        let (frequency, ctr) = fatigue_threshold(&snaps).unwrap();
        assert_eq!(frequency, 2.5);
        assert_eq!(ctr, 1.0);

        let flat = vec![snapshot("2026-10-01", 2.0, 1.0, 1.0), snapshot("2026-10-02", 2.0, 1.0, 3.0)];
        assert!(fatigue_threshold(&flat).is_none());
    }

    async fn seed(db: &DbPool, days: i64) {
        let today = Utc::now().date_naive();
        for i in 1..=days {
            let snapshot = NewSnapshot {
                user_id: "u1".into(),
                ad_account_id: "act_1".into(),
                entity_type: "campaign".into(),
                entity_id: "c1".into(),
                entity_name: "Campaign".into(),
                snapshot_date: format_date(today - Duration::days(i)),
                impressions: 1000 + i * 100,
                clicks: 20,
                reach: 500,
                spend: 10.0 + i as f64,
                conversions: 2,
                revenue: 30.0,
            };
            PerformanceSnapshot::upsert(db, &snapshot).await.unwrap();
        }
    }

    fn account() -> AdAccount {
        AdAccount {
            id: "act_1".into(),
            user_id: "u1".into(),
            name: "Main".into(),
            business_id: None,
            is_internal: false,
            currency: "USD".into(),
            timezone: "UTC".into(),
            created_at: String::new(),
        }
    }

    #[tokio::test]
    async fn test_learn_needs_minimum_samples() {
        let db = crate::db::init_memory().await.unwrap();
        seed(&db, 3).await;
        let learner = PatternLearner::new(db.clone(), IntelligenceConfig::default());

        let summary = learner.learn_for_account(&account()).await.unwrap();
        assert_eq!(summary.samples, 3);
        assert_eq!(summary.patterns, 0);
        assert!(learner.list("u1", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_learn_stores_baselines_and_weekday() {
        let db = crate::db::init_memory().await.unwrap();
        seed(&db, 15).await;
        let learner = PatternLearner::new(db.clone(), IntelligenceConfig::default());

        let summary = learner.learn_for_account(&account()).await.unwrap();
        assert_eq!(summary.samples, 15);
        assert!(summary.patterns >= BASELINE_METRICS.len() + 1);

        let cpa = LearnedPattern::get(&db, "act_1", METRIC_BASELINE, "cpa").await.unwrap().unwrap();
        assert_eq!(cpa.sample_size, 15);
        assert_eq!(cpa.confidence, 0.5);
        let data = cpa.data_json();
        assert!(data["mean"].as_f64().unwrap() > 5.0);
        assert!(data["p25"].as_f64().unwrap() <= data["p75"].as_f64().unwrap());

        assert!(LearnedPattern::get(&db, "act_1", BEST_WEEKDAY, "roas").await.unwrap().is_some());
        assert_eq!(learner.list("u1", Some("act_1")).await.unwrap().len(), summary.patterns);
    }

    #[tokio::test]
    async fn test_cpa_baseline_ignores_days_without_conversions() {
        let db = crate::db::init_memory().await.unwrap();
        let today = Utc::now().date_naive();
        for i in 1..=10 {
            let snapshot = NewSnapshot {
                user_id: "u1".into(),
                ad_account_id: "act_1".into(),
                entity_type: "campaign".into(),
                entity_id: "c1".into(),
                entity_name: "Campaign".into(),
                snapshot_date: format_date(today - Duration::days(i)),
                impressions: 2000,
                clicks: 40,
                reach: 1000,
                spend: 20.0,
                conversions: if i % 2 == 0 { 2 } else { 0 },
                revenue: 0.0,
            };
            PerformanceSnapshot::upsert(&db, &snapshot).await.unwrap();
        }
        let learner = PatternLearner::new(db.clone(), IntelligenceConfig::default());
        learner.learn_for_account(&account()).await.unwrap();

        let cpa = LearnedPattern::get(&db, "act_1", METRIC_BASELINE, "cpa").await.unwrap().unwrap();
        let data = cpa.data_json();
        assert_eq!(data["mean"].as_f64(), Some(10.0));
        assert_eq!(data["min"].as_f64(), Some(10.0));
        assert_eq!(data["p25"].as_f64(), Some(10.0));
        assert_eq!(cpa.sample_size, 5);

        let ctr = LearnedPattern::get(&db, "act_1", METRIC_BASELINE, "ctr").await.unwrap().unwrap();
        assert_eq!(ctr.sample_size, 10);
    }
}
