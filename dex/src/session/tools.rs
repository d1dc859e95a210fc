//! Tool execution seam
//!
//! The core never runs shell commands itself; the LLM's tool layer lives
//! outside and is reached through this trait. Results come back as the next
//! user turn of the conversation.

use std::path::Path;

use async_trait::async_trait;

use crate::llm::ToolCall;

/// Result of one executed tool call
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub tool_use_id: String,
    pub content: String,
    pub is_error: bool,
}

/// External tool layer
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Execute the calls against the given worktree, in order
    async fn run(&self, worktree: &Path, calls: &[ToolCall]) -> Vec<ToolOutcome>;
}

/// Tool runner for deployments without a tool layer: every call errors
pub struct NullToolRunner;

#[async_trait]
impl ToolRunner for NullToolRunner {
    async fn run(&self, _worktree: &Path, calls: &[ToolCall]) -> Vec<ToolOutcome> {
        calls
            .iter()
            .map(|call| ToolOutcome {
                tool_use_id: call.id.clone(),
                content: format!("tool '{}' is not available in this deployment", call.name),
                is_error: true,
            })
            .collect()
    }
}

/// Scripted tool runner for tests
pub mod mock {
    use std::sync::Mutex;

    use super::*;

    /// Returns a fixed result for every call and records what ran
    pub struct MockToolRunner {
        result: String,
        calls: Mutex<Vec<String>>,
    }

    impl MockToolRunner {
        pub fn new(result: impl Into<String>) -> Self {
            Self {
                result: result.into(),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn executed(&self) -> Vec<String> {
            self.calls.lock().expect("mock lock").clone()
        }
    }

    #[async_trait]
    impl ToolRunner for MockToolRunner {
        async fn run(&self, _worktree: &Path, calls: &[ToolCall]) -> Vec<ToolOutcome> {
            let mut executed = self.calls.lock().expect("mock lock");
            calls
                .iter()
                .map(|call| {
                    executed.push(call.name.clone());
                    ToolOutcome {
                        tool_use_id: call.id.clone(),
                        content: self.result.clone(),
                        is_error: false,
                    }
                })
                .collect()
        }
    }
}
