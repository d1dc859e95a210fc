//! LLM error types and classification
//!
//! Errors fall into five classes for the adapter layer: network, rate-limit,
//! billing, auth and unknown. Only the first two are ever retried.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during chat calls
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("rate limited{}", retry_after.map(|d| format!(", retry after {:?}", d)).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    #[error("network error: {0}")]
    Network(String),

    #[error("billing error: {0}")]
    Billing(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    /// Classify an HTTP error status into a typed error
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => LlmError::Auth(message),
            402 => LlmError::Billing(message),
            429 => LlmError::RateLimited { retry_after: None },
            // Anthropic reports exhausted credit as a 400 with a billing message
            400 if message.contains("credit") || message.contains("billing") => LlmError::Billing(message),
            _ => LlmError::Api { status, message },
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. })
    }

    /// Retryable: transient network failures, rate limits and server errors
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } => true,
            LlmError::Network(_) => true,
            LlmError::Api { status, .. } => *status >= 500,
            LlmError::Billing(_) | LlmError::Auth(_) | LlmError::InvalidResponse(_) => false,
        }
    }

    /// Rate limits do not consume iteration budget
    pub fn counts_against_budget(&self) -> bool {
        !self.is_rate_limit()
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        LlmError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        LlmError::InvalidResponse(err.to_string())
    }
}
