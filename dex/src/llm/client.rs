//! LlmClient trait definition

use async_trait::async_trait;

use super::{ChatRequest, ChatResponse, LlmError};

/// Abstract chat interface consumed by the session engine
///
/// One call per iteration, full history every time. The engine never talks
/// to a provider directly; retry and backoff live in [`super::retry`].
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a single chat request and wait for the complete response
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError>;
}

/// Scripted client for tests
///
/// Lives outside `cfg(test)` so integration tests and embedding adapters can
/// drive the core without a provider.
pub mod mock {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    enum Scripted {
        Reply(ChatResponse),
        Error(LlmError),
    }

    /// Mock LLM client replaying a fixed script of responses
    pub struct MockLlmClient {
        script: Mutex<Vec<Scripted>>,
        call_count: AtomicUsize,
    }

    impl MockLlmClient {
        pub fn new(responses: Vec<ChatResponse>) -> Self {
            Self {
                script: Mutex::new(responses.into_iter().map(Scripted::Reply).collect()),
                call_count: AtomicUsize::new(0),
            }
        }

        /// Replies of plain text, in order
        pub fn with_replies(replies: &[&str]) -> Self {
            Self::new(replies.iter().map(|r| ChatResponse::text(*r).with_usage(100, 50)).collect())
        }

        /// Queue an error after the responses already scripted
        pub fn push_error(&self, err: LlmError) {
            self.script.lock().expect("mock lock").push(Scripted::Error(err));
        }

        pub fn push_reply(&self, response: ChatResponse) {
            self.script.lock().expect("mock lock").push(Scripted::Reply(response));
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmClient for MockLlmClient {
        async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, LlmError> {
            let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
            let script = self.script.lock().expect("mock lock");
            match script.get(idx) {
                Some(Scripted::Reply(response)) => Ok(response.clone()),
                Some(Scripted::Error(err)) => Err(clone_error(err)),
                None => Err(LlmError::InvalidResponse("no more mock responses".to_string())),
            }
        }
    }

    fn clone_error(err: &LlmError) -> LlmError {
        match err {
            LlmError::RateLimited { retry_after } => LlmError::RateLimited { retry_after: *retry_after },
            LlmError::Network(m) => LlmError::Network(m.clone()),
            LlmError::Billing(m) => LlmError::Billing(m.clone()),
            LlmError::Auth(m) => LlmError::Auth(m.clone()),
            LlmError::Api { status, message } => LlmError::Api {
                status: *status,
                message: message.clone(),
            },
            LlmError::InvalidResponse(m) => LlmError::InvalidResponse(m.clone()),
        }
    }

}
