//! Error type shared by the service layer.
//!
//! Handlers convert it into an `ApiError`; background tasks log it.

use std::collections::HashMap;
use thiserror::Error;

use crate::facebook::GraphError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{}", validation_summary(.0))]
    Validation(HashMap<String, Vec<String>>),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    RateLimited(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

fn validation_summary(errors: &HashMap<String, Vec<String>>) -> String {
    if errors.len() == 1 {
        errors
            .values()
            .next()
            .and_then(|v| v.first())
            .cloned()
            .unwrap_or_else(|| "Validation failed".to_string())
    } else {
        format!("Validation failed for {} fields", errors.len())
    }
}

impl ServiceError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        let mut errors = HashMap::new();
        errors.insert(field.to_string(), vec![message.into()]);
        Self::Validation(errors)
    }
}

/// Collects field-level validation failures.
#[derive(Debug, Default)]
pub struct ValidationErrors {
    errors: HashMap<String, Vec<String>>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) -> &mut Self {
        self.errors
            .entry(field.into())
            .or_default()
            .push(message.into());
        self
    }

    /// Record the error of a `Result<(), String>` validator under `field`
    pub fn check(&mut self, field: impl Into<String>, result: Result<(), String>) -> &mut Self {
        if let Err(message) = result {
            self.add(field, message);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn finish(self) -> ServiceResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ServiceError::Validation(self.errors))
        }
    }
}
