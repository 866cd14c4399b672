//! Daily performance snapshots collected from Graph insights.

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PerformanceSnapshot {
    pub id: i64,
    pub user_id: String,
    pub ad_account_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub entity_name: String,
    pub snapshot_date: String,
    pub impressions: i64,
    pub clicks: i64,
    pub reach: i64,
    pub spend: f64,
    pub conversions: i64,
    pub revenue: f64,
    pub ctr: f64,
    pub cpc: f64,
    pub cpm: f64,
    pub cpa: f64,
    pub roas: f64,
    pub frequency: f64,
    pub created_at: String,
}

/// Raw counters for one entity and day; derived ratios are computed on insert
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewSnapshot {
    pub user_id: String,
    pub ad_account_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub entity_name: String,
    pub snapshot_date: String,
    pub impressions: i64,
    pub clicks: i64,
    pub reach: i64,
    pub spend: f64,
    pub conversions: i64,
    pub revenue: f64,
}

/// Ratios derived from raw counters; a zero denominator yields zero
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DerivedMetrics {
    pub ctr: f64,
    pub cpc: f64,
    pub cpm: f64,
    pub cpa: f64,
    pub roas: f64,
    pub frequency: f64,
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

impl NewSnapshot {
    pub fn derived(&self) -> DerivedMetrics {
        let impressions = self.impressions as f64;
        DerivedMetrics {
            ctr: ratio(self.clicks as f64, impressions) * 100.0,
            cpc: ratio(self.spend, self.clicks as f64),
            cpm: ratio(self.spend, impressions) * 1000.0,
            cpa: ratio(self.spend, self.conversions as f64),
            roas: ratio(self.revenue, self.spend),
            frequency: ratio(impressions, self.reach as f64),
        }
    }
}

impl PerformanceSnapshot {
    /// Value of a named metric column
    pub fn metric(&self, name: &str) -> Option<f64> {
        match name {
            "ctr" => Some(self.ctr),
            "cpc" => Some(self.cpc),
            "cpm" => Some(self.cpm),
            "cpa" => Some(self.cpa),
            "roas" => Some(self.roas),
            "frequency" => Some(self.frequency),
            "spend" => Some(self.spend),
            "impressions" => Some(self.impressions as f64),
            "clicks" => Some(self.clicks as f64),
            "conversions" => Some(self.conversions as f64),
            _ => None,
        }
    }

    /// Insert or replace the snapshot for (entity, date)
    pub async fn upsert(db: &SqlitePool, snapshot: &NewSnapshot) -> Result<(), sqlx::Error> {
        let d = snapshot.derived();
        sqlx::query(
            r#"
            INSERT INTO intel_performance_snapshots (
                user_id, ad_account_id, entity_type, entity_id, entity_name, snapshot_date,
                impressions, clicks, reach, spend, conversions, revenue,
                ctr, cpc, cpm, cpa, roas, frequency
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(entity_id, snapshot_date) DO UPDATE SET
                entity_name = excluded.entity_name,
                impressions = excluded.impressions,
                clicks = excluded.clicks,
                reach = excluded.reach,
                spend = excluded.spend,
                conversions = excluded.conversions,
                revenue = excluded.revenue,
                ctr = excluded.ctr,
                cpc = excluded.cpc,
                cpm = excluded.cpm,
                cpa = excluded.cpa,
                roas = excluded.roas,
                frequency = excluded.frequency
            "#,
        )
        .bind(&snapshot.user_id)
        .bind(&snapshot.ad_account_id)
        .bind(&snapshot.entity_type)
        .bind(&snapshot.entity_id)
        .bind(&snapshot.entity_name)
        .bind(&snapshot.snapshot_date)
        .bind(snapshot.impressions)
        .bind(snapshot.clicks)
        .bind(snapshot.reach)
        .bind(snapshot.spend)
        .bind(snapshot.conversions)
        .bind(snapshot.revenue)
        .bind(d.ctr)
        .bind(d.cpc)
        .bind(d.cpm)
        .bind(d.cpa)
        .bind(d.roas)
        .bind(d.frequency)
        .execute(db)
        .await?;
        Ok(())
    }

    /// Snapshots for a user's account between two dates (inclusive)
    pub async fn list_range(
        db: &SqlitePool,
        user_id: &str,
        ad_account_id: &str,
        from: &str,
        to: &str,
    ) -> Result<Vec<PerformanceSnapshot>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM intel_performance_snapshots
            WHERE user_id = ? AND ad_account_id = ? AND snapshot_date >= ? AND snapshot_date <= ?
            ORDER BY snapshot_date ASC, entity_id ASC
            "#,
        )
        .bind(user_id)
        .bind(ad_account_id)
        .bind(from)
        .bind(to)
        .fetch_all(db)
        .await
    }

    /// Snapshots with spend on or after `since`, used for pattern learning
    pub async fn list_since(
        db: &SqlitePool,
        ad_account_id: &str,
        since: &str,
    ) -> Result<Vec<PerformanceSnapshot>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM intel_performance_snapshots
            WHERE ad_account_id = ? AND snapshot_date >= ? AND spend > 0
            ORDER BY snapshot_date ASC
            "#,
        )
        .bind(ad_account_id)
        .bind(since)
        .fetch_all(db)
        .await
    }

    /// Most recent snapshot of each entity in the account
    pub async fn latest_per_entity(
        db: &SqlitePool,
        ad_account_id: &str,
    ) -> Result<Vec<PerformanceSnapshot>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT s.* FROM intel_performance_snapshots s
            INNER JOIN (
                SELECT entity_id, MAX(snapshot_date) AS latest
                FROM intel_performance_snapshots
                WHERE ad_account_id = ?
                GROUP BY entity_id
            ) m ON s.entity_id = m.entity_id AND s.snapshot_date = m.latest
            WHERE s.ad_account_id = ?
            ORDER BY s.entity_id
            "#,
        )
        .bind(ad_account_id)
        .bind(ad_account_id)
        .fetch_all(db)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(entity: &str, date: &str, spend: f64) -> NewSnapshot {
        NewSnapshot {
            user_id: "u1".into(),
            ad_account_id: "act_1".into(),
            entity_type: "campaign".into(),
            entity_id: entity.into(),
            entity_name: format!("Campaign {}", entity),
            snapshot_date: date.into(),
            impressions: 10_000,
            clicks: 200,
            reach: 5_000,
            spend,
            conversions: 10,
            revenue: spend * 3.0,
        }
    }

    #[test]
    fn test_derived_metrics() {
        let d = sample("c1", "2026-10-01", 100.0).derived();
        assert!((d.ctr - 2.0).abs() < 1e-9);
        assert!((d.cpc - 0.5).abs() < 1e-9);
        assert!((d.cpm - 10.0).abs() < 1e-9);
        assert!((d.cpa - 10.0).abs() < 1e-9);
        assert!((d.roas - 3.0).abs() < 1e-9);
        assert!((d.frequency - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_denominators() {
        let d = NewSnapshot::default().derived();
        assert_eq!(d, DerivedMetrics::default());
    }

    #[tokio::test]
    async fn test_upsert_replaces_same_day() {
        let db = crate::db::init_memory().await.unwrap();
        PerformanceSnapshot::upsert(&db, &sample("c1", "2026-10-01", 100.0)).await.unwrap();
        PerformanceSnapshot::upsert(&db, &sample("c1", "2026-10-01", 50.0)).await.unwrap();
        PerformanceSnapshot::upsert(&db, &sample("c1", "2026-10-02", 80.0)).await.unwrap();
        PerformanceSnapshot::upsert(&db, &sample("c2", "2026-10-01", 10.0)).await.unwrap();

        let rows = PerformanceSnapshot::list_range(&db, "u1", "act_1", "2026-10-01", "2026-10-01")
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].spend, 50.0);

        let latest = PerformanceSnapshot::latest_per_entity(&db, "act_1").await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].snapshot_date, "2026-10-02");
        assert_eq!(latest[0].metric("roas"), Some(3.0));
        assert_eq!(latest[0].metric("unknown"), None);
    }
}
