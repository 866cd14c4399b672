//! Graph API error classification.

use serde::Deserialize;
use thiserror::Error;

use super::usage::UsageReport;

/// Error codes Graph uses for throttling: app, user, page, API-specific and
/// the business use case family.
const RATE_LIMIT_CODES: &[i64] = &[4, 17, 32, 613];
const BUC_RATE_LIMIT_CODES: std::ops::RangeInclusive<i64> = 80000..=80014;
/// "Too many calls to this ad account"
const AD_ACCOUNT_RATE_LIMIT_SUBCODE: i64 = 2446079;
const INVALID_TOKEN_CODE: i64 = 190;

#[derive(Debug, Clone, Error)]
pub enum GraphError {
    #[error("rate limited by Graph API (code {code}): {message}")]
    RateLimited {
        code: i64,
        message: String,
        /// Seconds until access is expected back, when Graph reports it
        retry_after: Option<i64>,
    },

    #[error("access token rejected: {0}")]
    InvalidToken(String),

    #[error("Graph API error {code}: {message}")]
    Api {
        status: u16,
        code: i64,
        subcode: Option<i64>,
        message: String,
    },

    #[error("Graph API request failed: {0}")]
    Transport(String),

    #[error("unexpected Graph API response: {0}")]
    Decode(String),
}

impl GraphError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, GraphError::RateLimited { .. })
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorPayload,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: i64,
    error_subcode: Option<i64>,
    error_user_msg: Option<String>,
}

pub fn is_rate_limit_code(code: i64, subcode: Option<i64>) -> bool {
    RATE_LIMIT_CODES.contains(&code)
        || BUC_RATE_LIMIT_CODES.contains(&code)
        || subcode == Some(AD_ACCOUNT_RATE_LIMIT_SUBCODE)
}

/// Turn a non-success Graph response into a typed error.
pub fn classify(status: u16, body: &str, usage: &UsageReport) -> GraphError {
    let payload = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => envelope.error,
        Err(_) => {
            return if status == 429 {
                GraphError::RateLimited {
                    code: 0,
                    message: "HTTP 429".to_string(),
                    retry_after: usage.regain_access_after_secs(),
                }
            } else {
                GraphError::Api {
                    status,
                    code: 0,
                    subcode: None,
                    message: truncate(body, 300),
                }
            };
        }
    };

    let message = payload
        .error_user_msg
        .filter(|m| !m.is_empty())
        .unwrap_or(payload.message);

    if is_rate_limit_code(payload.code, payload.error_subcode) || status == 429 {
        return GraphError::RateLimited {
            code: payload.code,
            message,
            retry_after: usage.regain_access_after_secs(),
        };
    }

    if payload.code == INVALID_TOKEN_CODE {
        return GraphError::InvalidToken(message);
    }

    GraphError::Api {
        status,
        code: payload.code,
        subcode: payload.error_subcode,
        message,
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
