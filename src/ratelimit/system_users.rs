//! In-memory registry of Business Manager system-user tokens.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::SystemUserConfig;
use crate::crypto::TokenCipher;
use crate::facebook::AccessToken;

#[derive(Debug, Clone)]
struct SystemUserEntry {
    name: String,
    token: AccessToken,
    throttled_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemUserStatus {
    pub business_id: String,
    pub name: String,
    pub available: bool,
    pub throttled_until: Option<DateTime<Utc>>,
}

/// One system user per business, keyed by business id.
#[derive(Debug, Default)]
pub struct SystemUserManager {
    users: DashMap<String, SystemUserEntry>,
}

impl SystemUserManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configuration. Tokens may be given in plaintext or `ENC:` form.
    pub fn from_config(configs: &[SystemUserConfig], cipher: &TokenCipher) -> Result<Self> {
        let manager = Self::new();
        for config in configs {
            let token = cipher
                .reveal(&config.access_token)
                .with_context(|| format!("Failed to read token for system user of business {}", config.business_id))?;
            manager.register(
                &config.business_id,
                &config.name,
                AccessToken::with_secret(token, config.app_secret.clone()),
            );
        }
        if !configs.is_empty() {
            info!(count = configs.len(), "Registered system users");
        }
        Ok(manager)
    }

    pub fn register(&self, business_id: &str, name: &str, token: AccessToken) {
        self.users.insert(
            business_id.to_string(),
            SystemUserEntry {
                name: name.to_string(),
                token,
                throttled_until: None,
            },
        );
    }

    /// Token for the business unless its system user is throttled at `now`
    pub fn token_for(&self, business_id: &str, now: DateTime<Utc>) -> Option<AccessToken> {
        let mut entry = self.users.get_mut(business_id)?;
        match entry.throttled_until {
            Some(until) if until > now => None,
            Some(_) => {
                entry.throttled_until = None;
                Some(entry.token.clone())
            }
            None => Some(entry.token.clone()),
        }
    }

    pub fn throttle(&self, business_id: &str, until: DateTime<Utc>) {
        if let Some(mut entry) = self.users.get_mut(business_id) {
            warn!(business_id, until = %until, "System user throttled");
            entry.throttled_until = Some(until);
        }
    }

    pub fn throttled_until(&self, business_id: &str) -> Option<DateTime<Utc>> {
        self.users.get(business_id).and_then(|e| e.throttled_until)
    }

    pub fn statuses(&self, now: DateTime<Utc>) -> Vec<SystemUserStatus> {
        let mut statuses: Vec<SystemUserStatus> = self
            .users
            .iter()
            .map(|entry| {
                let throttled_until = entry.throttled_until.filter(|until| *until > now);
                SystemUserStatus {
                    business_id: entry.key().clone(),
                    name: entry.name.clone(),
                    available: throttled_until.is_none(),
                    throttled_until,
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.business_id.cmp(&b.business_id));
        statuses
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
