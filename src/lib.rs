pub mod api;
pub mod campaigns;
pub mod config;
pub mod crypto;
pub mod db;
pub mod engine;
pub mod error;
pub mod facebook;
pub mod intelligence;
pub mod ratelimit;

pub use db::DbPool;

use config::Config;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::campaigns::CampaignService;
use crate::crypto::TokenCipher;
use crate::facebook::{AdsApi, GraphTransport};
use crate::intelligence::Intelligence;
use crate::ratelimit::{RateLimitRouter, SystemUserManager};

pub struct AppState {
    pub config: Config,
    pub db: DbPool,
    pub cipher: TokenCipher,
    pub router: Arc<RateLimitRouter>,
    pub campaigns: Arc<CampaignService>,
    pub intelligence: Intelligence,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        config: Config,
        db: DbPool,
        cipher: TokenCipher,
        transport: Arc<dyn GraphTransport>,
        system_users: Arc<SystemUserManager>,
    ) -> Self {
        let router = Arc::new(RateLimitRouter::new(
            db.clone(),
            cipher.clone(),
            Arc::new(AdsApi::new(transport)),
            system_users,
            config.rate_limit.clone(),
            config.facebook.app_secret.clone(),
        ));
        let campaigns = Arc::new(CampaignService::new(db.clone(), router.clone()));
        let intelligence = Intelligence::new(
            db.clone(),
            router.clone(),
            campaigns.clone(),
            config.intelligence.clone(),
        );

        Self {
            config,
            db,
            cipher,
            router,
            campaigns,
            intelligence,
            metrics_handle: None,
        }
    }

    /// Set the Prometheus metrics handle
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }
}
