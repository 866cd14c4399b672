//! Typed Marketing API operations over a [`GraphTransport`].

use chrono::NaiveDate;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use super::{AccessToken, GraphError, GraphRequest, GraphTransport, UsageReport};

const INSIGHT_FIELDS: &str =
    "campaign_id,campaign_name,impressions,clicks,spend,reach,frequency,actions,action_values";
const INSIGHTS_PAGE_SIZE: u32 = 500;
const MAX_INSIGHT_PAGES: usize = 20;

/// Action types counted as conversions, most specific first. The first one
/// present in a row wins so a purchase is not counted twice.
const CONVERSION_ACTION_TYPES: &[&str] = &[
    "omni_purchase",
    "purchase",
    "offsite_conversion.fb_pixel_purchase",
    "lead",
    "complete_registration",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignSpec {
    pub name: String,
    pub objective: String,
    pub status: String,
    pub daily_budget: Option<i64>,
    pub lifetime_budget: Option<i64>,
    #[serde(default)]
    pub special_ad_categories: Vec<String>,
    pub bid_strategy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdSetSpec {
    pub name: String,
    pub status: String,
    pub daily_budget: Option<i64>,
    pub lifetime_budget: Option<i64>,
    pub optimization_goal: String,
    pub billing_event: String,
    pub bid_amount: Option<i64>,
    #[serde(default)]
    pub targeting: Value,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub promoted_object: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdSpec {
    pub name: String,
    pub status: String,
    /// Either `{"creative_id": "..."}` or an inline creative spec
    pub creative: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyOptions {
    pub deep_copy: bool,
    pub rename_suffix: Option<String>,
    /// ACTIVE, PAUSED or INHERITED_FROM_SOURCE
    pub status_option: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyResult {
    pub campaign_id: String,
    pub ad_set_ids: Vec<String>,
    pub ad_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphUser {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphCampaign {
    pub id: String,
    pub name: String,
    pub objective: Option<String>,
    pub status: Option<String>,
    pub daily_budget: Option<i64>,
    pub lifetime_budget: Option<i64>,
}

/// One campaign-day of insights.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsightRow {
    pub campaign_id: String,
    pub campaign_name: String,
    pub date: NaiveDate,
    pub impressions: i64,
    pub clicks: i64,
    pub spend: f64,
    pub reach: i64,
    pub conversions: f64,
    pub revenue: f64,
}

pub struct AdsApi {
    transport: Arc<dyn GraphTransport>,
    last_usage: DashMap<String, UsageReport>,
}

impl AdsApi {
    pub fn new(transport: Arc<dyn GraphTransport>) -> Self {
        Self {
            transport,
            last_usage: DashMap::new(),
        }
    }

    async fn send(&self, request: GraphRequest) -> Result<Value, GraphError> {
        let token = request.token.token.clone();
        let response = self.transport.call(request).await?;
        if !response.usage.is_empty() {
            self.last_usage.insert(token, response.usage);
        }
        Ok(response.body)
    }

    /// Usage headers from the most recent successful call made with `token`.
    pub fn take_usage(&self, token: &str) -> Option<UsageReport> {
        self.last_usage.remove(token).map(|(_, usage)| usage)
    }

    pub async fn get_me(&self, token: &AccessToken) -> Result<GraphUser, GraphError> {
        let body = self
            .send(GraphRequest::get("me", token).param("fields", "id,name"))
            .await?;
        serde_json::from_value(body).map_err(|e| GraphError::Decode(e.to_string()))
    }

    pub async fn create_campaign(
        &self,
        token: &AccessToken,
        account_id: &str,
        spec: &CampaignSpec,
    ) -> Result<String, GraphError> {
        let request = GraphRequest::post(format!("{}/campaigns", account_id), token)
            .param("name", &spec.name)
            .param("objective", &spec.objective)
            .param("status", &spec.status)
            .param("special_ad_categories", json!(spec.special_ad_categories))
            .param_opt("daily_budget", spec.daily_budget)
            .param_opt("lifetime_budget", spec.lifetime_budget)
            .param_opt("bid_strategy", spec.bid_strategy.as_ref());
        created_id(self.send(request).await?)
    }

    pub async fn create_ad_set(
        &self,
        token: &AccessToken,
        account_id: &str,
        campaign_id: &str,
        spec: &AdSetSpec,
    ) -> Result<String, GraphError> {
        let request = GraphRequest::post(format!("{}/adsets", account_id), token)
            .param("campaign_id", campaign_id)
            .param("name", &spec.name)
            .param("status", &spec.status)
            .param("optimization_goal", &spec.optimization_goal)
            .param("billing_event", &spec.billing_event)
            .param("targeting", &spec.targeting)
            .param_opt("daily_budget", spec.daily_budget)
            .param_opt("lifetime_budget", spec.lifetime_budget)
            .param_opt("bid_amount", spec.bid_amount)
            .param_opt("start_time", spec.start_time.as_ref())
            .param_opt("end_time", spec.end_time.as_ref())
            .param_opt("promoted_object", spec.promoted_object.as_ref());
        created_id(self.send(request).await?)
    }

    pub async fn create_ad(
        &self,
        token: &AccessToken,
        account_id: &str,
        ad_set_id: &str,
        spec: &AdSpec,
    ) -> Result<String, GraphError> {
        let request = GraphRequest::post(format!("{}/ads", account_id), token)
            .param("adset_id", ad_set_id)
            .param("name", &spec.name)
            .param("status", &spec.status)
            .param("creative", &spec.creative);
        created_id(self.send(request).await?)
    }

    pub async fn copy_campaign(
        &self,
        token: &AccessToken,
        campaign_id: &str,
        options: &CopyOptions,
    ) -> Result<CopyResult, GraphError> {
        let rename = options.rename_suffix.as_ref().map(|suffix| {
            json!({
                "rename_strategy": "DEEP_RENAME",
                "rename_suffix": suffix,
            })
        });
        let request = GraphRequest::post(format!("{}/copies", campaign_id), token)
            .param("deep_copy", options.deep_copy)
            .param_opt("rename_options", rename)
            .param_opt("status_option", options.status_option.as_ref());

        let body = self.send(request).await?;
        parse_copy_result(&body)
    }

    pub async fn update_status(
        &self,
        token: &AccessToken,
        object_id: &str,
        status: &str,
    ) -> Result<(), GraphError> {
        let body = self
            .send(GraphRequest::post(object_id, token).param("status", status))
            .await?;
        expect_success(&body)
    }

    pub async fn delete_object(&self, token: &AccessToken, object_id: &str) -> Result<(), GraphError> {
        let body = self.send(GraphRequest::delete(object_id, token)).await?;
        expect_success(&body)
    }

    pub async fn get_campaign(
        &self,
        token: &AccessToken,
        campaign_id: &str,
    ) -> Result<GraphCampaign, GraphError> {
        let body = self
            .send(
                GraphRequest::get(campaign_id, token)
                    .param("fields", "id,name,objective,status,daily_budget,lifetime_budget"),
            )
            .await?;

        Ok(GraphCampaign {
            id: str_field(&body, "id").ok_or_else(|| missing("id"))?,
            name: str_field(&body, "name").unwrap_or_default(),
            objective: str_field(&body, "objective"),
            status: str_field(&body, "status"),
            daily_budget: body.get("daily_budget").map(as_i64).filter(|b| *b > 0),
            lifetime_budget: body.get("lifetime_budget").map(as_i64).filter(|b| *b > 0),
        })
    }

    /// Daily campaign-level insights for a single day, following cursors.
    pub async fn get_insights(
        &self,
        token: &AccessToken,
        account_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<InsightRow>, GraphError> {
        let day = date.format("%Y-%m-%d").to_string();
        let time_range = json!({ "since": day, "until": day });
        let mut rows = Vec::new();
        let mut after: Option<String> = None;

        for _ in 0..MAX_INSIGHT_PAGES {
            let request = GraphRequest::get(format!("{}/insights", account_id), token)
                .param("level", "campaign")
                .param("time_increment", 1)
                .param("time_range", &time_range)
                .param("fields", INSIGHT_FIELDS)
                .param("limit", INSIGHTS_PAGE_SIZE)
                .param_opt("after", after.take());

            let body = self.send(request).await?;
            if let Some(data) = body.get("data").and_then(Value::as_array) {
                rows.extend(data.iter().filter_map(|row| parse_insight_row(row, date)));
            }

            let has_next = body.pointer("/paging/next").is_some();
            after = body
                .pointer("/paging/cursors/after")
                .and_then(Value::as_str)
                .map(str::to_string);
            if !has_next || after.is_none() {
                break;
            }
        }

        Ok(rows)
    }
}

fn missing(field: &str) -> GraphError {
    GraphError::Decode(format!("response is missing `{}`", field))
}

fn str_field(body: &Value, key: &str) -> Option<String> {
    match body.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn created_id(body: Value) -> Result<String, GraphError> {
    str_field(&body, "id").ok_or_else(|| missing("id"))
}

fn expect_success(body: &Value) -> Result<(), GraphError> {
    match body.get("success").and_then(Value::as_bool) {
        Some(true) => Ok(()),
        _ => Err(GraphError::Decode(format!("operation not acknowledged: {}", body))),
    }
}

/// Graph returns most numeric insight fields as strings.
fn as_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn as_i64(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n.as_i64().unwrap_or_else(|| n.as_f64().unwrap_or(0.0) as i64),
        Value::String(s) => s
            .parse::<i64>()
            .unwrap_or_else(|_| s.parse::<f64>().map(|f| f as i64).unwrap_or(0)),
        _ => 0,
    }
}

fn action_total(row: &Value, key: &str) -> f64 {
    let Some(actions) = row.get(key).and_then(Value::as_array) else {
        return 0.0;
    };
    CONVERSION_ACTION_TYPES
        .iter()
        .find_map(|wanted| {
            actions
                .iter()
                .find(|a| a.get("action_type").and_then(Value::as_str) == Some(wanted))
                .and_then(|a| a.get("value"))
                .map(as_f64)
        })
        .unwrap_or(0.0)
}

fn parse_insight_row(row: &Value, fallback_date: NaiveDate) -> Option<InsightRow> {
    let campaign_id = str_field(row, "campaign_id")?;
    let date = row
        .get("date_start")
        .and_then(Value::as_str)
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        .unwrap_or(fallback_date);

    Some(InsightRow {
        campaign_name: str_field(row, "campaign_name").unwrap_or_default(),
        campaign_id,
        date,
        impressions: row.get("impressions").map(as_i64).unwrap_or(0),
        clicks: row.get("clicks").map(as_i64).unwrap_or(0),
        spend: row.get("spend").map(as_f64).unwrap_or(0.0),
        reach: row.get("reach").map(as_i64).unwrap_or(0),
        conversions: action_total(row, "actions"),
        revenue: action_total(row, "action_values"),
    })
}

fn parse_copy_result(body: &Value) -> Result<CopyResult, GraphError> {
    let campaign_id = str_field(body, "copied_campaign_id").ok_or_else(|| missing("copied_campaign_id"))?;
    let mut result = CopyResult {
        campaign_id,
        ad_set_ids: Vec::new(),
        ad_ids: Vec::new(),
    };

    for object in body
        .get("ad_object_ids")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let Some(copied) = str_field(object, "copied_id") else {
            continue;
        };
        match object.get("ad_object_type").and_then(Value::as_str) {
            Some("ad_set") | Some("adset") => result.ad_set_ids.push(copied),
            Some("ad") => result.ad_ids.push(copied),
            _ => {}
        }
    }

    Ok(result)
}
