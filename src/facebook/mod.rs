//! Facebook Graph API access.
//!
//! [`GraphTransport`] is the seam between the service and the network:
//! [`GraphClient`] talks to Graph over HTTPS, tests substitute a fake.
//! [`AdsApi`] layers the typed Marketing API operations on top.

mod ads;
mod client;
mod error;
#[cfg(test)]
pub(crate) mod testing;
mod usage;

pub use ads::*;
pub use client::GraphClient;
pub use error::{classify, is_rate_limit_code, GraphError};
pub use usage::{AdAccountUsage, AppUsage, BusinessUsage, UsageReport};

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphMethod {
    Get,
    Post,
    Delete,
}

impl fmt::Display for GraphMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphMethod::Get => write!(f, "GET"),
            GraphMethod::Post => write!(f, "POST"),
            GraphMethod::Delete => write!(f, "DELETE"),
        }
    }
}

/// Token a Graph call is made with, plus the secret of the app that issued
/// it when known (enables `appsecret_proof`).
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub app_secret: Option<String>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            app_secret: None,
        }
    }

    pub fn with_secret(token: impl Into<String>, app_secret: Option<String>) -> Self {
        Self {
            token: token.into(),
            app_secret,
        }
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let visible: String = self.token.chars().take(6).collect();
        f.debug_struct("AccessToken")
            .field("token", &format!("{}...", visible))
            .field("app_secret", &self.app_secret.as_ref().map(|_| "***"))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct GraphRequest {
    pub method: GraphMethod,
    /// Path below the version prefix, e.g. `act_123/campaigns`
    pub path: String,
    pub params: Vec<(String, String)>,
    pub token: AccessToken,
}

impl GraphRequest {
    pub fn new(method: GraphMethod, path: impl Into<String>, token: &AccessToken) -> Self {
        Self {
            method,
            path: path.into().trim_start_matches('/').to_string(),
            params: Vec::new(),
            token: token.clone(),
        }
    }

    pub fn get(path: impl Into<String>, token: &AccessToken) -> Self {
        Self::new(GraphMethod::Get, path, token)
    }

    pub fn post(path: impl Into<String>, token: &AccessToken) -> Self {
        Self::new(GraphMethod::Post, path, token)
    }

    pub fn delete(path: impl Into<String>, token: &AccessToken) -> Self {
        Self::new(GraphMethod::Delete, path, token)
    }

    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.params.push((key.to_string(), value.to_string()));
        self
    }

    pub fn param_opt<T: ToString>(self, key: &str, value: Option<T>) -> Self {
        match value {
            Some(v) => self.param(key, v),
            None => self,
        }
    }

    pub fn param_value(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct GraphResponse {
    pub body: Value,
    pub usage: UsageReport,
}

impl GraphResponse {
    pub fn new(body: Value) -> Self {
        Self {
            body,
            usage: UsageReport::default(),
        }
    }
}

/// Executes a single Graph API request.
#[async_trait]
pub trait GraphTransport: Send + Sync {
    async fn call(&self, request: GraphRequest) -> Result<GraphResponse, GraphError>;
}
