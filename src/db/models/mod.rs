//! Database models split into domain-specific modules.

pub mod ad_account;
pub mod automation;
pub mod backfill;
pub mod backup_app;
pub mod campaign;
pub mod facebook_auth;
pub mod pattern;
pub mod queued_request;
pub mod rate_limit;
pub mod snapshot;

pub use ad_account::*;
pub use automation::*;
pub use backfill::*;
pub use backup_app::*;
pub use campaign::*;
pub use facebook_auth::*;
pub use pattern::*;
pub use queued_request::*;
pub use rate_limit::*;
pub use snapshot::*;
