//! Router wired to an in-memory database and a [`FakeGraph`], for tests.

use std::sync::Arc;

use super::{RateLimitRouter, SystemUserManager};
use crate::config::RateLimitConfig;
use crate::crypto::TokenCipher;
use crate::db::{AdAccount, CreateAdAccountRequest, DbPool, FacebookAuth};
use crate::facebook::testing::FakeGraph;
use crate::facebook::AdsApi;

pub struct Fixture {
    pub db: DbPool,
    pub cipher: TokenCipher,
    pub fake: Arc<FakeGraph>,
    pub router: Arc<RateLimitRouter>,
}

pub async fn fixture(config: RateLimitConfig) -> Fixture {
    let db = crate::db::init_memory().await.unwrap();
    let cipher = TokenCipher::from_secret("test");
    let fake = Arc::new(FakeGraph::new());
    let router = Arc::new(RateLimitRouter::new(
        db.clone(),
        cipher.clone(),
        Arc::new(AdsApi::new(fake.clone())),
        Arc::new(SystemUserManager::new()),
        config,
        None,
    ));
    Fixture {
        db,
        cipher,
        fake,
        router,
    }
}

impl Fixture {
    /// Store a Facebook token for `user_id`
    pub async fn connect(&self, user_id: &str) {
        let token = self.cipher.encrypt(&format!("{}-token", user_id)).unwrap();
        FacebookAuth::upsert(&self.db, user_id, &token, None, None)
            .await
            .unwrap();
    }

    pub async fn add_account(&self, user_id: &str, account_id: &str) -> AdAccount {
        AdAccount::upsert(
            &self.db,
            user_id,
            account_id,
            &CreateAdAccountRequest {
                id: account_id.into(),
                name: format!("Account {}", account_id),
                business_id: None,
                is_internal: false,
                currency: None,
                timezone: None,
            },
        )
        .await
        .unwrap()
    }
}
