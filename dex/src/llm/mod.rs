//! LLM client module
//!
//! The session engine consumes the [`LlmClient`] trait; retry/backoff is
//! centralized in [`retry`] rather than scattered through the engine.

use std::sync::Arc;

use async_trait::async_trait;

mod anthropic;
pub mod client;
mod error;
pub mod retry;
mod types;

pub use anthropic::AnthropicClient;
pub use client::LlmClient;
pub use error::LlmError;
pub use retry::{chat_with_retry, RetryPolicy};
pub use types::{ChatRequest, ChatResponse, ContentBlock, Message, MessageContent, Role, StopReason, ToolCall};

use crate::config::LlmConfig;

/// Create an LLM client from configuration
///
/// `api_key_override` lets the daemon pass a key from the secrets store
/// instead of the environment.
pub fn create_client(config: &LlmConfig, api_key_override: Option<String>) -> Result<Arc<dyn LlmClient>, LlmError> {
    match config.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicClient::from_config(config, api_key_override)?)),
        other => Err(LlmError::InvalidResponse(format!(
            "Unknown LLM provider: '{}'. Supported: anthropic",
            other
        ))),
    }
}

/// Client standing in when no provider is configured
///
/// Every call fails with a typed auth error, so sessions surface the missing
/// key instead of the daemon refusing to start. Store-only operations (task
/// CRUD, approvals) keep working.
struct UnconfiguredClient {
    reason: String,
}

#[async_trait]
impl LlmClient for UnconfiguredClient {
    async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, LlmError> {
        Err(LlmError::Auth(self.reason.clone()))
    }
}

pub fn unconfigured_client(reason: impl Into<String>) -> Arc<dyn LlmClient> {
    Arc::new(UnconfiguredClient { reason: reason.into() })
}
