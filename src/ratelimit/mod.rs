//! Credential selection under Graph API rate limits.
//!
//! Every Graph call made on behalf of a user goes through
//! [`RateLimitRouter`], which picks the credential to use: a Business
//! Manager system user for internal accounts, the user's own token while it
//! is under its hourly budget, then a backup app. When nothing is available
//! the operation is queued and retried later.

mod router;
mod system_users;
#[cfg(test)]
pub(crate) mod testing;

pub use router::{RateLimitReport, RateLimitRouter};
pub use system_users::{SystemUserManager, SystemUserStatus};

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::Serialize;

use crate::db::QueuedRequest;
use crate::facebook::AccessToken;

/// Hour a counter belongs to, `YYYY-MM-DDTHH` in UTC
pub fn hour_bucket(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H").to_string()
}

/// Start of the hour following `at`
pub fn next_hour(at: DateTime<Utc>) -> DateTime<Utc> {
    let start = at
        .duration_trunc(Duration::hours(1))
        .unwrap_or(at);
    start + Duration::hours(1)
}

pub(crate) fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialKind {
    User,
    SystemUser { business_id: String },
    BackupApp { id: String, app_id: String },
}

impl CredentialKind {
    pub fn label(&self) -> &'static str {
        match self {
            CredentialKind::User => "user",
            CredentialKind::SystemUser { .. } => "system_user",
            CredentialKind::BackupApp { .. } => "backup_app",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Credential {
    pub kind: CredentialKind,
    pub token: AccessToken,
}

#[derive(Debug, Clone)]
pub enum Dispatch {
    Use(Credential),
    Queue { process_after: DateTime<Utc> },
}

/// Result of a single routed attempt.
#[derive(Debug)]
pub enum Attempt<T> {
    Done(T),
    /// No credential is free; worth retrying at `process_after`
    Deferred { process_after: DateTime<Utc> },
}

/// Result of a routed operation: done now, or deferred to the queue.
#[derive(Debug)]
pub enum Outcome<T> {
    Done(T),
    Queued(QueuedRequest),
}

impl<T> Outcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Done(v) => Outcome::Done(f(v)),
            Outcome::Queued(q) => Outcome::Queued(q),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_hour_bucket_and_next_hour() {
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 23, 41, 9).unwrap();
        assert_eq!(hour_bucket(at), "2026-03-04T23");
        assert_eq!(next_hour(at), Utc.with_ymd_and_hms(2026, 3, 5, 0, 0, 0).unwrap());

        let on_the_hour = Utc.with_ymd_and_hms(2026, 3, 4, 10, 0, 0).unwrap();
        assert_eq!(
            next_hour(on_the_hour),
            Utc.with_ymd_and_hms(2026, 3, 4, 11, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_timestamp() {
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        assert_eq!(parse_timestamp(&crate::db::timestamp(at)), Some(at));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_outcome_map() {
        match Outcome::Done(2).map(|v| v * 10) {
            Outcome::Done(v) => assert_eq!(v, 20),
            Outcome::Queued(_) => panic!("expected done"),
        }
    }
}
