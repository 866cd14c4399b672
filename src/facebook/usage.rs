//! Parsing of Graph API usage headers.
//!
//! Graph reports how close a caller is to its limits in three headers:
//! `x-app-usage`, `x-business-use-case-usage` and `x-ad-account-usage`.
//! All percentages are 0-100.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const APP_USAGE_HEADER: &str = "x-app-usage";
pub const BUSINESS_USAGE_HEADER: &str = "x-business-use-case-usage";
pub const AD_ACCOUNT_USAGE_HEADER: &str = "x-ad-account-usage";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppUsage {
    #[serde(default)]
    pub call_count: f64,
    #[serde(default)]
    pub total_cputime: f64,
    #[serde(default)]
    pub total_time: f64,
}

impl AppUsage {
    fn max_pct(&self) -> f64 {
        self.call_count.max(self.total_cputime).max(self.total_time)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusinessUsage {
    #[serde(default)]
    pub business_id: String,
    #[serde(rename = "type", default)]
    pub use_case: String,
    #[serde(default)]
    pub call_count: f64,
    #[serde(default)]
    pub total_cputime: f64,
    #[serde(default)]
    pub total_time: f64,
    /// Minutes until throttling lifts, 0 when not throttled
    #[serde(default)]
    pub estimated_time_to_regain_access: i64,
}

impl BusinessUsage {
    fn max_pct(&self) -> f64 {
        self.call_count.max(self.total_cputime).max(self.total_time)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdAccountUsage {
    #[serde(default)]
    pub acc_id_util_pct: f64,
    /// Seconds until the account's usage window resets
    #[serde(default)]
    pub reset_time_duration: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageReport {
    pub app: Option<AppUsage>,
    pub business: Vec<BusinessUsage>,
    pub ad_account: Option<AdAccountUsage>,
}

impl UsageReport {
    /// Parse whichever headers are present. Malformed values are ignored.
    pub fn parse(app: Option<&str>, business: Option<&str>, ad_account: Option<&str>) -> Self {
        let app = app.and_then(|v| serde_json::from_str::<AppUsage>(v).ok());

        let business = business
            .and_then(|v| serde_json::from_str::<HashMap<String, Vec<BusinessUsage>>>(v).ok())
            .map(|by_business| {
                let mut entries: Vec<BusinessUsage> = by_business
                    .into_iter()
                    .flat_map(|(business_id, usages)| {
                        usages.into_iter().map(move |mut u| {
                            u.business_id = business_id.clone();
                            u
                        })
                    })
                    .collect();
                entries.sort_by(|a, b| a.business_id.cmp(&b.business_id));
                entries
            })
            .unwrap_or_default();

        let ad_account = ad_account.and_then(|v| serde_json::from_str::<AdAccountUsage>(v).ok());

        Self {
            app,
            business,
            ad_account,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.app.is_none() && self.business.is_empty() && self.ad_account.is_none()
    }

    pub fn app_pct(&self) -> f64 {
        self.app.as_ref().map(AppUsage::max_pct).unwrap_or(0.0)
    }

    pub fn business_pct(&self) -> f64 {
        self.business
            .iter()
            .map(BusinessUsage::max_pct)
            .fold(0.0, f64::max)
    }

    pub fn ad_account_pct(&self) -> f64 {
        self.ad_account
            .as_ref()
            .map(|a| a.acc_id_util_pct)
            .unwrap_or(0.0)
    }

    /// Highest utilisation across every reported dimension
    pub fn max_pct(&self) -> f64 {
        self.app_pct()
            .max(self.business_pct())
            .max(self.ad_account_pct())
    }

    /// Seconds until Graph expects access to be restored, if it said so
    pub fn regain_access_after_secs(&self) -> Option<i64> {
        let buc = self
            .business
            .iter()
            .map(|b| b.estimated_time_to_regain_access * 60)
            .filter(|s| *s > 0)
            .max();
        let account = self
            .ad_account
            .as_ref()
            .filter(|a| a.acc_id_util_pct >= 100.0 && a.reset_time_duration > 0)
            .map(|a| a.reset_time_duration);

        match (buc, account) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}
