//! Session engine - the bounded iterative loop
//!
//! One engine instance drives one (task, hat, worktree) tuple: check
//! control and budgets, resolve the hat prompt, call the model, record the
//! turn, scan for sentinels, checkpoint. Every iteration persists before the
//! next begins, so a crash restart resumes from the checkpoint without
//! replaying any LLM call.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::approval::ApprovalGate;
use crate::config::{RatesConfig, SessionConfig};
use crate::domain::{
    ApprovalStatus, FailureReason, MessageRole, Session, SessionBudget, SessionOutcome, Task,
};
use crate::events::{Event, EventHub};
use crate::llm::{chat_with_retry, ChatRequest, ChatResponse, ContentBlock, LlmClient, LlmError, Message, Role, RetryPolicy};
use crate::prompts::{PromptContext, PromptLoader};
use crate::state::StateManager;

use super::control::{ControlHandle, ControlState};
use super::signal::{scan, Sentinel};
use super::tools::ToolRunner;

/// Everything an engine needs besides the session itself
#[derive(Clone)]
pub struct EngineDeps {
    pub llm: Arc<dyn LlmClient>,
    pub tools: Arc<dyn ToolRunner>,
    pub prompts: Arc<PromptLoader>,
    pub state: StateManager,
    pub hub: Arc<EventHub>,
    pub gate: Arc<ApprovalGate>,
    pub rates: RatesConfig,
    pub retry: RetryPolicy,
    pub session_cfg: SessionConfig,
    pub model: String,
}

/// The Ralph loop for one session
pub struct SessionEngine {
    session: Session,
    task: Task,
    worktree: PathBuf,
    budget: SessionBudget,
    deps: EngineDeps,
    control: ControlHandle,
    /// Predecessor handoff injected as the first user turn
    handoff: Option<String>,

    messages: Vec<Message>,
    iteration: u32,
    input_tokens: u64,
    output_tokens: u64,
    dollars: f64,
    idle_streak: u32,
}

impl SessionEngine {
    pub fn new(session: Session, task: Task, deps: EngineDeps, control: ControlHandle, handoff: Option<String>) -> Self {
        let worktree = PathBuf::from(&session.worktree_path);
        let budget = SessionBudget::from_task(&task);
        Self {
            iteration: session.iteration,
            input_tokens: session.input_tokens,
            output_tokens: session.output_tokens,
            dollars: 0.0,
            session,
            task,
            worktree,
            budget,
            deps,
            control,
            handoff,
            messages: Vec::new(),
            idle_streak: 0,
        }
    }

    /// Run the loop to an outcome
    ///
    /// All domain failures come back as `SessionOutcome::Failed`; the caller
    /// persists the terminal state.
    pub async fn run(mut self) -> SessionOutcome {
        if let Err(e) = self.prepare().await {
            warn!(session_id = %self.session.id, error = %e, "Engine preparation failed");
            return SessionOutcome::Failed(FailureReason::Internal(e.to_string()));
        }

        info!(
            session_id = %self.session.id,
            task_id = %self.task.id,
            hat = %self.session.hat,
            iteration = self.iteration,
            "Session engine starting"
        );

        loop {
            // Pause and cancel are observed at the iteration boundary
            match self.control.current() {
                ControlState::Cancel => return SessionOutcome::Cancelled,
                ControlState::Pause => return SessionOutcome::Paused,
                ControlState::Run => {}
            }

            let tokens = self.input_tokens + self.output_tokens;
            if let Some(reason) = self.budget.check(self.iteration, tokens, self.dollars) {
                info!(session_id = %self.session.id, reason = reason.as_str(), "Budget exceeded");
                return SessionOutcome::Failed(reason);
            }

            self.iteration += 1;
            debug!(session_id = %self.session.id, iteration = self.iteration, "Starting iteration");

            let response = match self.call_model().await {
                Ok(Some(response)) => response,
                Ok(None) => return SessionOutcome::Cancelled,
                Err(err) => return SessionOutcome::Failed(classify_llm_failure(err)),
            };

            let cost = self
                .deps
                .rates
                .cost_usd(&self.deps.model, response.input_tokens, response.output_tokens);
            self.input_tokens += response.input_tokens;
            self.output_tokens += response.output_tokens;
            self.dollars += cost;

            let reply = response.reply.clone().unwrap_or_default();

            if let Err(e) = self.record_iteration(&response, &reply, cost).await {
                return SessionOutcome::Failed(FailureReason::Internal(e.to_string()));
            }

            match scan(&reply) {
                Some(Sentinel::TaskComplete) => {
                    info!(session_id = %self.session.id, "TASK_COMPLETE signalled");
                    return SessionOutcome::Complete;
                }
                Some(Sentinel::HatComplete) => {
                    info!(session_id = %self.session.id, hat = %self.session.hat, "HAT_COMPLETE signalled");
                    return SessionOutcome::HatComplete;
                }
                Some(Sentinel::HatTransition(hat)) => {
                    info!(session_id = %self.session.id, to_hat = %hat, "HAT_TRANSITION signalled");
                    return SessionOutcome::Transition(hat);
                }
                Some(Sentinel::ApprovalRequired(data)) => match self.await_approval(data).await {
                    ApprovalWait::Granted => {
                        self.idle_streak = 0;
                        continue;
                    }
                    ApprovalWait::Rejected => return SessionOutcome::Failed(FailureReason::ApprovalRejected),
                    ApprovalWait::Cancelled => return SessionOutcome::Cancelled,
                    ApprovalWait::Error(e) => return SessionOutcome::Failed(FailureReason::Internal(e)),
                },
                None if !response.tool_calls.is_empty() => {
                    if !self.run_tools(&response).await {
                        return SessionOutcome::Cancelled;
                    }
                    self.idle_streak = 0;
                }
                None => {
                    self.idle_streak += 1;
                    debug!(session_id = %self.session.id, idle_streak = self.idle_streak, "No sentinel, no tool calls");
                    if self.idle_streak >= self.deps.session_cfg.stall_threshold {
                        warn!(session_id = %self.session.id, "Session stalled");
                        return SessionOutcome::Failed(FailureReason::Stalled);
                    }
                }
            }
        }
    }

    /// Load persisted history, or seed the first user turn
    async fn prepare(&mut self) -> Result<(), crate::state::StateError> {
        let persisted = self.deps.state.list_session_messages(&self.session.id).await?;
        if !persisted.is_empty() {
            self.messages = persisted
                .into_iter()
                .filter_map(|m| {
                    serde_json::from_value(m.content).ok().map(|content| Message {
                        role: match m.role {
                            MessageRole::User => Role::User,
                            MessageRole::Assistant => Role::Assistant,
                        },
                        content,
                    })
                })
                .collect();
            // Dollars are not stored per session; rebuild from the counters
            self.dollars = self.deps.rates.cost_usd(&self.deps.model, self.input_tokens, self.output_tokens);
            debug!(session_id = %self.session.id, messages = self.messages.len(), "Resumed persisted history");
            return Ok(());
        }

        let opening = match self.handoff.take() {
            Some(handoff) => handoff,
            None => format!("{}\n\n{}", self.task.title, self.task.description),
        };
        self.push_message(Message::user(opening)).await?;
        Ok(())
    }

    /// One model call; `None` means cancelled mid-flight
    async fn call_model(&mut self) -> Result<Option<ChatResponse>, LlmError> {
        let context = PromptContext::new(&self.task.title, &self.task.description, &self.worktree);
        let system_prompt = self
            .deps
            .prompts
            .render(&self.session.hat, &context)
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let request = ChatRequest {
            system_prompt,
            messages: self.messages.clone(),
            max_tokens: 16384,
        };

        let llm = Arc::clone(&self.deps.llm);
        let retry = self.deps.retry;
        let mut cancel = self.control.clone();

        tokio::select! {
            _ = cancel.cancelled() => Ok(None),
            result = chat_with_retry(llm.as_ref(), request, &retry) => result.map(Some),
        }
    }

    /// Append the assistant turn, its activity row, the hub event and the checkpoint
    async fn record_iteration(
        &mut self,
        response: &ChatResponse,
        reply: &str,
        cost: f64,
    ) -> Result<(), crate::state::StateError> {
        let assistant = build_assistant_message(response);
        self.push_message(assistant).await?;

        let snippet: String = reply.chars().take(self.deps.session_cfg.snippet_chars).collect();
        self.deps
            .state
            .append_session_activity(
                &self.session.id,
                self.iteration,
                "iteration",
                &self.session.hat,
                &snippet,
                response.input_tokens,
                response.output_tokens,
            )
            .await?;

        self.deps.hub.publish(Event::session_iteration(
            &self.session,
            self.iteration,
            self.input_tokens + self.output_tokens,
            self.dollars,
            &snippet,
        ));

        self.deps
            .state
            .checkpoint_session(&self.session.id, self.iteration, self.input_tokens, self.output_tokens)
            .await?;
        self.deps
            .state
            .add_task_usage(&self.task.id, 1, response.total_tokens(), cost)
            .await?;
        Ok(())
    }

    /// Suspend on the approval gate; the session stays `running`
    async fn await_approval(&mut self, data: serde_json::Value) -> ApprovalWait {
        let kind = data.get("kind").and_then(|v| v.as_str()).unwrap_or("action").to_string();
        let title = data
            .get("title")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| format!("Approval required: {}", kind));
        let description = data.get("description").and_then(|v| v.as_str()).unwrap_or("").to_string();

        let approval = match self
            .deps
            .gate
            .request(Some(&self.task.id), Some(&self.session.id), &kind, &title, &description, data)
            .await
        {
            Ok(approval) => approval,
            Err(e) => return ApprovalWait::Error(e.to_string()),
        };

        info!(session_id = %self.session.id, approval_id = %approval.id, "Suspended on approval");

        let gate = Arc::clone(&self.deps.gate);
        let mut cancel = self.control.clone();
        let decision = tokio::select! {
            _ = cancel.cancelled() => return ApprovalWait::Cancelled,
            decision = gate.decision(&approval.id) => decision,
        };

        match decision {
            Ok(ApprovalStatus::Approved) => {
                if let Err(e) = self.push_message(Message::user("APPROVAL_GRANTED")).await {
                    return ApprovalWait::Error(e.to_string());
                }
                ApprovalWait::Granted
            }
            Ok(ApprovalStatus::Rejected) => ApprovalWait::Rejected,
            Ok(ApprovalStatus::Pending) => ApprovalWait::Error("gate answered pending".to_string()),
            Err(e) => ApprovalWait::Error(e.to_string()),
        }
    }

    /// Execute tool calls through the external runner; false means cancelled
    async fn run_tools(&mut self, response: &ChatResponse) -> bool {
        let tools = Arc::clone(&self.deps.tools);
        let worktree = self.worktree.clone();
        let calls = response.tool_calls.clone();
        let mut cancel = self.control.clone();

        let outcomes = tokio::select! {
            _ = cancel.cancelled() => return false,
            outcomes = tools.run(&worktree, &calls) => outcomes,
        };

        let blocks: Vec<ContentBlock> = outcomes
            .iter()
            .map(|o| ContentBlock::tool_result(&o.tool_use_id, &o.content, o.is_error))
            .collect();
        if let Err(e) = self.push_message(Message::user_blocks(blocks)).await {
            warn!(session_id = %self.session.id, error = %e, "Failed to persist tool results");
            return false;
        }
        true
    }

    /// Append to the in-memory history and the persisted message log
    async fn push_message(&mut self, message: Message) -> Result<(), crate::state::StateError> {
        let role = match message.role {
            Role::User => MessageRole::User,
            Role::Assistant => MessageRole::Assistant,
        };
        let content = serde_json::to_value(&message.content)
            .map_err(|e| crate::state::StateError::Store(dexstore::StoreError::Json(e)))?;
        self.deps.state.append_session_message(&self.session.id, role, content).await?;
        self.messages.push(message);
        Ok(())
    }
}

enum ApprovalWait {
    Granted,
    Rejected,
    Cancelled,
    Error(String),
}

fn build_assistant_message(response: &ChatResponse) -> Message {
    if response.tool_calls.is_empty() {
        return Message::assistant(response.reply.clone().unwrap_or_default());
    }

    let mut blocks = Vec::new();
    if let Some(text) = &response.reply {
        blocks.push(ContentBlock::text(text));
    }
    for call in &response.tool_calls {
        blocks.push(ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input: call.input.clone(),
        });
    }
    Message::assistant_blocks(blocks)
}

/// Map an exhausted LLM error onto a session failure reason
fn classify_llm_failure(err: LlmError) -> FailureReason {
    match err {
        LlmError::Network(m) => FailureReason::LlmNetwork(m),
        LlmError::RateLimited { .. } => FailureReason::LlmRateLimit("rate limit retries exhausted".to_string()),
        LlmError::Billing(m) => FailureReason::LlmBilling(m),
        LlmError::Auth(m) => FailureReason::LlmAuth(m),
        LlmError::Api { status, message } if status >= 500 => FailureReason::LlmNetwork(format!("{}: {}", status, message)),
        LlmError::Api { status, message } => FailureReason::Internal(format!("api {}: {}", status, message)),
        LlmError::InvalidResponse(m) => FailureReason::Internal(m),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventHub;
    use crate::llm::client::mock::MockLlmClient;
    use crate::session::control::SessionControl;
    use crate::session::tools::mock::MockToolRunner;
    use crate::session::tools::NullToolRunner;
    use crate::llm::{StopReason, ToolCall};
    use dexstore::{NewTask, Store};
    use std::time::Duration;

    struct Fixture {
        state: StateManager,
        hub: Arc<EventHub>,
        gate: Arc<ApprovalGate>,
        task: Task,
        session: Session,
    }

    async fn fixture(max_iterations: Option<u32>) -> Fixture {
        let hub = Arc::new(EventHub::new());
        let state = StateManager::spawn(Store::open_in_memory().unwrap(), hub.clone());
        let gate = Arc::new(ApprovalGate::new(state.clone()));

        let project = state.create_project("p", "/tmp/repo", "main").await.unwrap();
        let task = state
            .create_task(NewTask {
                project_id: project.id,
                title: "Add README".to_string(),
                description: "Write a readme".to_string(),
                hat: "creator".to_string(),
                task_type: "feature".to_string(),
                priority: "normal".to_string(),
                autonomy: "supervised".to_string(),
                base_branch: "main".to_string(),
                max_iterations,
                ..Default::default()
            })
            .await
            .unwrap();
        let session = state.create_session(&task.id, "creator", "/tmp/wt", max_iterations).await.unwrap();

        Fixture { state, hub, gate, task, session }
    }

    fn deps(fixture: &Fixture, llm: Arc<dyn LlmClient>, tools: Arc<dyn ToolRunner>) -> EngineDeps {
        EngineDeps {
            llm,
            tools,
            prompts: Arc::new(PromptLoader::embedded_only()),
            state: fixture.state.clone(),
            hub: fixture.hub.clone(),
            gate: fixture.gate.clone(),
            rates: RatesConfig::default(),
            retry: RetryPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(1),
                backoff_factor: 2.0,
                max_backoff: Duration::from_millis(2),
                jitter: 0.0,
            },
            session_cfg: SessionConfig::default(),
            model: "claude-sonnet-4".to_string(),
        }
    }

    fn engine(fixture: &Fixture, llm: Arc<dyn LlmClient>) -> (SessionEngine, SessionControl) {
        let (control, handle) = SessionControl::new();
        let engine = SessionEngine::new(
            fixture.session.clone(),
            fixture.task.clone(),
            deps(fixture, llm, Arc::new(NullToolRunner)),
            handle,
            None,
        );
        (engine, control)
    }

    #[tokio::test]
    async fn test_task_complete_outcome() {
        let fixture = fixture(None).await;
        let llm = Arc::new(MockLlmClient::with_replies(&["Working...", "Done.\nTASK_COMPLETE"]));
        let (engine, _control) = engine(&fixture, llm.clone());

        let outcome = engine.run().await;
        assert_eq!(outcome, SessionOutcome::Complete);
        assert_eq!(llm.call_count(), 2);

        // Checkpoint persisted both iterations and the token counters
        let session = fixture.state.get_session_required(&fixture.session.id).await.unwrap();
        assert_eq!(session.iteration, 2);
        assert_eq!(session.input_tokens, 200);
        assert_eq!(session.output_tokens, 100);

        // Activity rows in strict iteration order
        let activity = fixture.state.list_session_activity(&fixture.session.id).await.unwrap();
        assert_eq!(activity.iter().map(|a| a.iteration).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_iteration_events_published() {
        let fixture = fixture(None).await;
        let mut sub = fixture.hub.subscribe("session.iteration");
        let llm = Arc::new(MockLlmClient::with_replies(&["TASK_COMPLETE"]));
        let (engine, _control) = engine(&fixture, llm);

        engine.run().await;

        let event = sub.recv().await.unwrap();
        assert_eq!(event.payload["session_id"], fixture.session.id.as_str());
        assert_eq!(event.payload["task_id"], fixture.task.id.as_str());
        assert_eq!(event.payload["iteration"], 1);
        assert_eq!(event.payload["tokens_used"], 150);
    }

    #[tokio::test]
    async fn test_budget_iterations_exhausted() {
        let fixture = fixture(Some(3)).await;
        let llm = Arc::new(MockLlmClient::with_replies(&[
            "still thinking", "still thinking", "still thinking", "never reached",
        ]));
        let (_control, handle) = SessionControl::new();
        let mut engine_deps = deps(&fixture, llm.clone(), Arc::new(NullToolRunner));
        // Keep stall detection out of the way; the iteration cap must fire
        engine_deps.session_cfg.stall_threshold = 10;
        let engine = SessionEngine::new(fixture.session.clone(), fixture.task.clone(), engine_deps, handle, None);

        let outcome = engine.run().await;
        assert_eq!(outcome, SessionOutcome::Failed(FailureReason::BudgetIterations));
        // No call beyond the budget
        assert_eq!(llm.call_count(), 3);
    }

    #[tokio::test]
    async fn test_token_budget_enforced() {
        let mut fixture = fixture(None).await;
        fixture.task.max_tokens = Some(200);
        // Each mock reply costs 150 tokens; the second check trips
        let llm = Arc::new(MockLlmClient::with_replies(&["one", "two", "three"]));
        let (engine, _control) = engine(&fixture, llm.clone());

        let outcome = engine.run().await;
        assert_eq!(outcome, SessionOutcome::Failed(FailureReason::BudgetTokens));
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_stall_detection() {
        let fixture = fixture(None).await;
        let llm = Arc::new(MockLlmClient::with_replies(&["hm", "hm", "hm", "never"]));
        let (engine, _control) = engine(&fixture, llm.clone());

        let outcome = engine.run().await;
        assert_eq!(outcome, SessionOutcome::Failed(FailureReason::Stalled));
        assert_eq!(llm.call_count(), 3);
    }

    #[tokio::test]
    async fn test_tool_calls_reset_stall_and_inject_results() {
        let fixture = fixture(None).await;
        let tool_response = ChatResponse {
            reply: Some("let me check".to_string()),
            tool_calls: vec![ToolCall {
                id: "t1".to_string(),
                name: "read_file".to_string(),
                input: serde_json::json!({"path": "README.md"}),
            }],
            stop_reason: StopReason::ToolUse,
            input_tokens: 10,
            output_tokens: 10,
        };
        let llm = Arc::new(MockLlmClient::new(vec![tool_response, ChatResponse::text("TASK_COMPLETE")]));
        let tools = Arc::new(MockToolRunner::new("file contents"));

        let (_control, handle) = SessionControl::new();
        let engine = SessionEngine::new(
            fixture.session.clone(),
            fixture.task.clone(),
            deps(&fixture, llm, tools.clone()),
            handle,
            None,
        );

        let outcome = engine.run().await;
        assert_eq!(outcome, SessionOutcome::Complete);
        assert_eq!(tools.executed(), vec!["read_file"]);

        // Message log: opening user turn, assistant tool use, tool results, final assistant
        let messages = fixture.state.list_session_messages(&fixture.session.id).await.unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[2].role, MessageRole::User);
    }

    #[tokio::test]
    async fn test_hat_transition_outcome() {
        let fixture = fixture(None).await;
        let llm = Arc::new(MockLlmClient::with_replies(&["HAT_TRANSITION:tester"]));
        let (engine, _control) = engine(&fixture, llm);

        let outcome = engine.run().await;
        assert_eq!(outcome, SessionOutcome::Transition("tester".to_string()));
    }

    #[tokio::test]
    async fn test_pause_at_iteration_boundary() {
        let fixture = fixture(None).await;
        let llm = Arc::new(MockLlmClient::with_replies(&["one", "two", "never"]));
        let (engine, control) = engine(&fixture, llm.clone());

        // Pause before the loop starts: engine must stop without any LLM call
        control.pause();
        let outcome = engine.run().await;
        assert_eq!(outcome, SessionOutcome::Paused);
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_resume_preserves_history_and_counters() {
        let fixture = fixture(None).await;
        let llm = Arc::new(MockLlmClient::with_replies(&["first reply"]));
        let (engine, control) = engine(&fixture, llm);
        control.pause();

        // First run seeds the history but pauses immediately
        assert_eq!(engine.run().await, SessionOutcome::Paused);

        // Simulate the checkpoint a completed first iteration would have left
        fixture.state.checkpoint_session(&fixture.session.id, 1, 100, 50).await.unwrap();
        let resumed_row = fixture.state.get_session_required(&fixture.session.id).await.unwrap();

        let llm = Arc::new(MockLlmClient::with_replies(&["TASK_COMPLETE"]));
        let (_control, handle) = SessionControl::new();
        let engine = SessionEngine::new(
            resumed_row,
            fixture.task.clone(),
            deps(&fixture, llm, Arc::new(NullToolRunner)),
            handle,
            None,
        );
        assert_eq!(engine.run().await, SessionOutcome::Complete);

        // Counters continued from the checkpoint: 100+100 input, 50+50 output
        let session = fixture.state.get_session_required(&fixture.session.id).await.unwrap();
        assert_eq!(session.iteration, 2);
        assert_eq!(session.input_tokens, 200);
        assert_eq!(session.output_tokens, 100);
    }

    #[tokio::test]
    async fn test_cancel_during_llm_call() {
        let fixture = fixture(None).await;
        // Empty script: the mock errors, but cancellation races first
        let llm = Arc::new(MockLlmClient::with_replies(&[]));
        let (engine, control) = engine(&fixture, llm);
        control.cancel();

        let outcome = engine.run().await;
        assert_eq!(outcome, SessionOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_approval_granted_continues_with_note() {
        let fixture = fixture(None).await;
        let llm = Arc::new(MockLlmClient::with_replies(&[
            r#"APPROVAL_REQUIRED:{"kind":"merge","branch":"feature/x"}"#,
            "TASK_COMPLETE",
        ]));
        let (engine, _control) = engine(&fixture, llm);

        let gate = fixture.gate.clone();
        let hub = fixture.hub.clone();
        let resolver = tokio::spawn(async move {
            let mut sub = hub.subscribe("approval.required");
            let event = sub.recv().await.unwrap();
            let approval_id = event.payload["approval_id"].as_str().unwrap().to_string();
            gate.resolve(&approval_id, ApprovalStatus::Approved).await.unwrap();
        });

        let outcome = engine.run().await;
        resolver.await.unwrap();
        assert_eq!(outcome, SessionOutcome::Complete);

        // The approval row carries the sentinel payload
        let approvals = fixture.gate.list(None).await.unwrap();
        assert_eq!(approvals.len(), 1);
        assert_eq!(approvals[0].data["branch"], "feature/x");
        assert_eq!(approvals[0].approval_type, "merge");

        // An APPROVAL_GRANTED note precedes the final assistant turn
        let messages = fixture.state.list_session_messages(&fixture.session.id).await.unwrap();
        let granted = messages
            .iter()
            .any(|m| m.role == MessageRole::User && m.content == serde_json::json!("APPROVAL_GRANTED"));
        assert!(granted);
    }

    #[tokio::test]
    async fn test_approval_rejected_fails_session() {
        let fixture = fixture(None).await;
        let llm = Arc::new(MockLlmClient::with_replies(&[
            r#"APPROVAL_REQUIRED:{"kind":"merge"}"#,
            "never reached",
        ]));
        let (engine, _control) = engine(&fixture, llm.clone());

        let gate = fixture.gate.clone();
        let hub = fixture.hub.clone();
        tokio::spawn(async move {
            let mut sub = hub.subscribe("approval.required");
            let event = sub.recv().await.unwrap();
            let approval_id = event.payload["approval_id"].as_str().unwrap().to_string();
            gate.resolve(&approval_id, ApprovalStatus::Rejected).await.unwrap();
        });

        let outcome = engine.run().await;
        assert_eq!(outcome, SessionOutcome::Failed(FailureReason::ApprovalRejected));
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_handoff_is_first_user_turn() {
        let fixture = fixture(None).await;
        let llm = Arc::new(MockLlmClient::with_replies(&["TASK_COMPLETE"]));
        let (_control, handle) = SessionControl::new();
        let engine = SessionEngine::new(
            fixture.session.clone(),
            fixture.task.clone(),
            deps(&fixture, llm, Arc::new(NullToolRunner)),
            handle,
            Some("Predecessor finished task A; reuse the same working directory".to_string()),
        );

        engine.run().await;

        let messages = fixture.state.list_session_messages(&fixture.session.id).await.unwrap();
        assert_eq!(messages[0].role, MessageRole::User);
        assert!(messages[0].content.as_str().unwrap().contains("Predecessor finished"));
    }

    #[tokio::test]
    async fn test_auth_failure_is_typed() {
        let fixture = fixture(None).await;
        let llm = Arc::new(MockLlmClient::with_replies(&[]));
        llm.push_error(LlmError::Auth("invalid x-api-key".to_string()));
        let (engine, _control) = engine(&fixture, llm);

        let outcome = engine.run().await;
        match outcome {
            SessionOutcome::Failed(reason) => assert_eq!(reason.as_str(), "llm_auth"),
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
