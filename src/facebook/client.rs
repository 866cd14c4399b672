//! HTTPS transport for the Graph API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::HeaderMap;
use sha2::Sha256;
use std::time::Duration;
use tracing::debug;

use super::error::{classify, GraphError};
use super::usage::{
    UsageReport, AD_ACCOUNT_USAGE_HEADER, APP_USAGE_HEADER, BUSINESS_USAGE_HEADER,
};
use super::{GraphMethod, GraphRequest, GraphResponse, GraphTransport};
use crate::config::FacebookConfig;

type HmacSha256 = Hmac<Sha256>;

pub struct GraphClient {
    client: reqwest::Client,
    base_url: String,
}

impl GraphClient {
    pub fn new(config: &FacebookConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("adpilot/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build Graph API HTTP client")?;

        Ok(Self {
            client,
            base_url: format!(
                "{}/{}",
                config.graph_url.trim_end_matches('/'),
                config.api_version
            ),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

/// `appsecret_proof` Graph expects alongside tokens of apps that require it.
pub fn appsecret_proof(app_secret: &str, token: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(app_secret.as_bytes()).ok()?;
    mac.update(token.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

fn usage_from_headers(headers: &HeaderMap) -> UsageReport {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    UsageReport::parse(
        header(APP_USAGE_HEADER),
        header(BUSINESS_USAGE_HEADER),
        header(AD_ACCOUNT_USAGE_HEADER),
    )
}

#[async_trait]
impl GraphTransport for GraphClient {
    async fn call(&self, request: GraphRequest) -> Result<GraphResponse, GraphError> {
        let url = self.url(&request.path);

        let mut params = request.params;
        params.push(("access_token".to_string(), request.token.token.clone()));
        if let Some(proof) = request
            .token
            .app_secret
            .as_deref()
            .and_then(|secret| appsecret_proof(secret, &request.token.token))
        {
            params.push(("appsecret_proof".to_string(), proof));
        }

        debug!(method = %request.method, path = %request.path, "Graph API request");

        let builder = match request.method {
            GraphMethod::Get => self.client.get(&url).query(&params),
            GraphMethod::Delete => self.client.delete(&url).query(&params),
            GraphMethod::Post => self.client.post(&url).form(&params),
        };

        let response = builder
            .send()
            .await
            .map_err(|e| GraphError::Transport(e.to_string()))?;

        let status = response.status();
        let usage = usage_from_headers(response.headers());
        let text = response
            .text()
            .await
            .map_err(|e| GraphError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(classify(status.as_u16(), &text, &usage));
        }

        let body = serde_json::from_str(&text).map_err(|e| GraphError::Decode(e.to_string()))?;
        Ok(GraphResponse { body, usage })
    }
}
