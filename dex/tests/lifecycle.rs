//! End-to-end lifecycle tests driven by mock LLM and git collaborators

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use dexstore::Store;
use poindexter::config::Config;
use poindexter::daemon::Daemon;
use poindexter::events::{EventHub, Subscription};
use poindexter::git::mock::MockGitOps;
use poindexter::llm::client::mock::MockLlmClient;
use poindexter::llm::{ChatResponse, StopReason, ToolCall};
use poindexter::session::{NullToolRunner, ToolOutcome, ToolRunner};
use poindexter::state::StateManager;
use poindexter::tasks::CreateTaskSpec;
use poindexter::{ApprovalStatus, SessionState, TaskStatus};

const WAIT: Duration = Duration::from_secs(5);

/// Tool runner that blocks each call on a semaphore permit
struct GatedToolRunner {
    gate: Semaphore,
}

impl GatedToolRunner {
    fn new(initial_permits: usize) -> Self {
        Self {
            gate: Semaphore::new(initial_permits),
        }
    }

    fn release(&self) {
        self.gate.add_permits(1);
    }
}

#[async_trait]
impl ToolRunner for GatedToolRunner {
    async fn run(&self, _worktree: &Path, calls: &[ToolCall]) -> Vec<ToolOutcome> {
        let permit = self.gate.acquire().await.expect("gate closed");
        permit.forget();
        calls
            .iter()
            .map(|call| ToolOutcome {
                tool_use_id: call.id.clone(),
                content: "ok".to_string(),
                is_error: false,
            })
            .collect()
    }
}

struct Harness {
    daemon: Daemon,
    llm: Arc<MockLlmClient>,
    git: Arc<MockGitOps>,
    _repo: tempfile::TempDir,
    project_id: String,
}

async fn harness_with_tools(replies: Vec<ChatResponse>, tools: Arc<dyn ToolRunner>) -> Harness {
    let mut config = Config::default();
    // Scenario scripts intentionally include idle iterations
    config.session.stall_threshold = 50;

    let hub = Arc::new(EventHub::new());
    let state = StateManager::spawn(Store::open_in_memory().unwrap(), hub.clone());
    let llm = Arc::new(MockLlmClient::new(replies));
    let git = Arc::new(MockGitOps::new());

    let daemon = Daemon::with_collaborators(config, hub, state, llm.clone(), git.clone(), tools).unwrap();

    // A "real" git repository on a safe user path
    let repo = tempfile::tempdir().unwrap();
    std::fs::create_dir(repo.path().join(".git")).unwrap();
    let project = daemon
        .create_project("p", &repo.path().display().to_string(), "main")
        .await
        .unwrap();
    let project_id = project.id;

    Harness {
        daemon,
        llm,
        git,
        _repo: repo,
        project_id,
    }
}

async fn harness(replies: &[&str]) -> Harness {
    let replies = replies.iter().map(|r| ChatResponse::text(*r).with_usage(100, 50)).collect();
    harness_with_tools(replies, Arc::new(NullToolRunner)).await
}

fn task_spec(harness: &Harness, title: &str, hat: &str) -> CreateTaskSpec {
    CreateTaskSpec {
        project_id: harness.project_id.clone(),
        title: title.to_string(),
        description: "do the work".to_string(),
        hat: hat.to_string(),
        task_type: "feature".to_string(),
        priority: "normal".to_string(),
        autonomy: "supervised".to_string(),
        base_branch: "main".to_string(),
        ..Default::default()
    }
}

fn tool_reply(text: &str) -> ChatResponse {
    ChatResponse {
        reply: Some(text.to_string()),
        tool_calls: vec![ToolCall {
            id: format!("call-{}", text),
            name: "write_file".to_string(),
            input: serde_json::json!({"path": "README.md"}),
        }],
        stop_reason: StopReason::ToolUse,
        input_tokens: 100,
        output_tokens: 50,
    }
}

async fn recv_type(sub: &mut Subscription, event_type: &str) -> poindexter::Event {
    timeout(WAIT, async {
        loop {
            let event = sub.recv().await.expect("subscription closed");
            if event.event_type == event_type {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", event_type))
}

#[tokio::test]
async fn happy_path_terminal_hat_opens_pr() {
    let h = harness(&["On it.", "Done.\nTASK_COMPLETE"]).await;
    let mut events = h.daemon.subscribe("*");

    let task = h.daemon.create_task(task_spec(&h, "Add README", "documenter")).await.unwrap();
    let session = h.daemon.start_task(&task.id).await.unwrap();

    // Worktree allocated inside the repo on the task branch
    assert!(session.worktree_path.contains(".worktrees/task-"));
    assert!(Path::new(&session.worktree_path).exists());

    recv_type(&mut events, "session.iteration").await;
    recv_type(&mut events, "session.completed").await;
    recv_type(&mut events, "pr.opened").await;
    let completed = recv_type(&mut events, "task.completed").await;
    assert_eq!(completed.payload["task_id"], task.id.as_str());

    let task = h.daemon.get_task(&task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.pr_number.is_some());
    assert_eq!(task.used_iterations, 2);

    let session = h.daemon.get_session(&session.id).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::Completed);
    assert_eq!(session.iteration, 2);

    assert_eq!(h.git.pr_count(), 1);
    assert_eq!(h.llm.call_count(), 2);
}

#[tokio::test]
async fn budget_exhaustion_fails_task() {
    let h = harness(&["thinking", "thinking", "thinking", "never sent"]).await;
    let mut events = h.daemon.subscribe("*");

    let mut spec = task_spec(&h, "Budgeted", "creator");
    spec.max_iterations = Some(3);
    let task = h.daemon.create_task(spec).await.unwrap();
    h.daemon.start_task(&task.id).await.unwrap();

    let completed = recv_type(&mut events, "session.completed").await;
    assert_eq!(completed.payload["state"], "failed");
    assert_eq!(completed.payload["failure_reason"], "budget_exceeded_iterations");
    recv_type(&mut events, "task.failed").await;

    let task = h.daemon.get_task(&task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);

    // Counter reached the budget and no further call was made
    assert_eq!(h.llm.call_count(), 3);
}

#[tokio::test]
async fn pause_resume_mid_loop() {
    let tools = Arc::new(GatedToolRunner::new(1));
    let replies = vec![tool_reply("iter-one"), tool_reply("iter-two")];
    let h = harness_with_tools(replies, tools.clone()).await;
    let mut events = h.daemon.subscribe("session.*");
    let mut task_events = h.daemon.subscribe("task.*");

    let task = h.daemon.create_task(task_spec(&h, "Pausable", "creator")).await.unwrap();
    let session = h.daemon.start_task(&task.id).await.unwrap();

    // Iteration 2 announced; its tool call is blocked on the gate
    recv_type(&mut events, "session.iteration").await;
    let second = recv_type(&mut events, "session.iteration").await;
    assert_eq!(second.payload["iteration"], 2);

    h.daemon.pause_task(&task.id).await.unwrap();
    tools.release();

    recv_type(&mut events, "session.paused").await;
    recv_type(&mut task_events, "task.paused").await;
    let paused = h.daemon.get_session(&session.id).await.unwrap().unwrap();
    assert_eq!(paused.state, SessionState::Paused);
    assert_eq!(h.daemon.get_task(&task.id).await.unwrap().status, TaskStatus::Paused);

    // No further LLM calls while paused
    let calls_at_pause = h.llm.call_count();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.llm.call_count(), calls_at_pause);

    // Resume continues at the next iteration with continuous counters
    h.llm.push_reply(ChatResponse::text("TASK_COMPLETE").with_usage(100, 50));
    h.daemon.resume_task(&task.id).await.unwrap();

    let third = recv_type(&mut events, "session.iteration").await;
    assert_eq!(third.payload["iteration"], 3);
    recv_type(&mut events, "session.completed").await;

    let session = h.daemon.get_session(&session.id).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::Completed);
    assert_eq!(session.input_tokens, 300);
    assert_eq!(session.output_tokens, 150);
}

#[tokio::test]
async fn dependency_cascade_with_worktree_inheritance() {
    let h = harness(&["A done.\nTASK_COMPLETE", "B done.\nTASK_COMPLETE"]).await;
    let mut events = h.daemon.subscribe("task.*");

    let a = h.daemon.create_task(task_spec(&h, "Task A", "documenter")).await.unwrap();
    let mut b_spec = task_spec(&h, "Task B", "documenter");
    b_spec.deps = vec![a.id.clone()];
    b_spec.auto_start = true;
    let b = h.daemon.create_task(b_spec).await.unwrap();
    assert_eq!(b.status, TaskStatus::Blocked);

    h.daemon.start_task(&a.id).await.unwrap();

    let unblocked = recv_type(&mut events, "task.unblocked").await;
    assert_eq!(unblocked.payload["task_id"], b.id.as_str());

    let auto_started = recv_type(&mut events, "task.auto_started").await;
    assert_eq!(auto_started.payload["task_id"], b.id.as_str());
    assert_eq!(auto_started.payload["predecessor_id"], a.id.as_str());

    // B inherited A's worktree
    let a_row = h.daemon.get_task(&a.id).await.unwrap();
    assert_eq!(auto_started.payload["worktree_path"], a_row.worktree_path.clone().unwrap().as_str());

    // B runs to completion in the same tree
    loop {
        let event = recv_type(&mut events, "task.completed").await;
        if event.payload["task_id"] == b.id.as_str() {
            break;
        }
    }
    let b_row = h.daemon.get_task(&b.id).await.unwrap();
    assert_eq!(b_row.worktree_path, a_row.worktree_path);

    // B's session opened with the handoff as its first user message
    let sessions = h.daemon.list_sessions().await.unwrap();
    let b_session = sessions.iter().find(|s| s.task_id == b.id).unwrap();
    let messages = h.daemon.state.list_session_messages(&b_session.id).await.unwrap();
    let first = messages.first().unwrap();
    let text = first.content.as_str().unwrap();
    assert!(text.contains("Task A"));
    assert!(text.contains("reuse the same working directory"));
}

#[tokio::test]
async fn approval_round_trip() {
    let h = harness(&[
        r#"Need sign-off.
APPROVAL_REQUIRED:{"kind":"merge","branch":"feature/x"}"#,
        "Merged.\nTASK_COMPLETE",
    ])
    .await;
    let mut events = h.daemon.subscribe("approval.*");

    let task = h.daemon.create_task(task_spec(&h, "Merge feature", "documenter")).await.unwrap();
    h.daemon.start_task(&task.id).await.unwrap();

    let required = recv_type(&mut events, "approval.required").await;
    let approval_id = required.payload["approval_id"].as_str().unwrap().to_string();
    assert_eq!(required.payload["data"]["branch"], "feature/x");

    // Loop is suspended on the gate: no second call yet
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.llm.call_count(), 1);

    let mut task_events = h.daemon.subscribe("task.completed");
    h.daemon.approve(&approval_id).await.unwrap();
    recv_type(&mut events, "approval.resolved").await;
    recv_type(&mut task_events, "task.completed").await;

    assert_eq!(h.daemon.get_task(&task.id).await.unwrap().status, TaskStatus::Completed);

    let approval = h.daemon.get_approval(&approval_id).await.unwrap().unwrap();
    assert_eq!(approval.status, ApprovalStatus::Approved);
}

#[tokio::test]
async fn approval_rejection_fails_session() {
    let h = harness(&[r#"APPROVAL_REQUIRED:{"kind":"merge"}"#, "never sent"]).await;
    let mut events = h.daemon.subscribe("*");

    let task = h.daemon.create_task(task_spec(&h, "Risky", "creator")).await.unwrap();
    h.daemon.start_task(&task.id).await.unwrap();

    let required = recv_type(&mut events, "approval.required").await;
    let approval_id = required.payload["approval_id"].as_str().unwrap();
    h.daemon.reject(approval_id).await.unwrap();

    let completed = recv_type(&mut events, "session.completed").await;
    assert_eq!(completed.payload["failure_reason"], "approval_rejected");
    recv_type(&mut events, "task.failed").await;
    assert_eq!(h.daemon.get_task(&task.id).await.unwrap().status, TaskStatus::Failed);
    assert_eq!(h.llm.call_count(), 1);
}

#[tokio::test]
async fn hat_transition_reuses_worktree() {
    let h = harness(&["Plan ready.\nHAT_TRANSITION:creator", "Built.\nTASK_COMPLETE"]).await;
    let mut events = h.daemon.subscribe("task.completed");

    let task = h.daemon.create_task(task_spec(&h, "Planned work", "planner")).await.unwrap();
    let first_session = h.daemon.start_task(&task.id).await.unwrap();

    recv_type(&mut events, "task.completed").await;

    let task = h.daemon.get_task(&task.id).await.unwrap();
    assert_eq!(task.hat, "creator");
    assert_eq!(task.status, TaskStatus::Completed);

    let sessions = h.daemon.list_sessions().await.unwrap();
    assert_eq!(sessions.len(), 2);

    let first = sessions.iter().find(|s| s.id == first_session.id).unwrap();
    assert_eq!(first.state, SessionState::Completed);
    assert_eq!(first.hat, "planner");

    let second = sessions.iter().find(|s| s.id != first_session.id).unwrap();
    assert_eq!(second.hat, "creator");
    assert_eq!(second.worktree_path, first.worktree_path);
    // Iteration counter reset for the new hat
    assert_eq!(second.iteration, 1);
}

#[tokio::test]
async fn invalid_hat_transition_fails_session() {
    let h = harness(&["HAT_TRANSITION:devops"]).await;
    let mut events = h.daemon.subscribe("*");

    // planner -> devops is not in the default graph
    let task = h.daemon.create_task(task_spec(&h, "Bad transition", "planner")).await.unwrap();
    h.daemon.start_task(&task.id).await.unwrap();

    let completed = recv_type(&mut events, "session.completed").await;
    assert_eq!(completed.payload["state"], "failed");
    assert_eq!(completed.payload["failure_reason"], "invalid_transition");
    recv_type(&mut events, "task.failed").await;
    assert_eq!(h.daemon.get_task(&task.id).await.unwrap().status, TaskStatus::Failed);
}

#[tokio::test]
async fn kill_session_cancels_task() {
    let tools = Arc::new(GatedToolRunner::new(0));
    let h = harness_with_tools(vec![tool_reply("working")], tools).await;
    let mut events = h.daemon.subscribe("session.*");
    let mut task_events = h.daemon.subscribe("task.*");

    let task = h.daemon.create_task(task_spec(&h, "Killable", "creator")).await.unwrap();
    let session = h.daemon.start_task(&task.id).await.unwrap();

    // Engine is mid-iteration, blocked in the tool layer
    recv_type(&mut events, "session.iteration").await;
    h.daemon.kill_session(&session.id).await.unwrap();

    recv_type(&mut events, "session.killed").await;
    recv_type(&mut task_events, "task.cancelled").await;
    assert_eq!(
        h.daemon.get_session(&session.id).await.unwrap().unwrap().state,
        SessionState::Cancelled
    );
    assert_eq!(h.daemon.get_task(&task.id).await.unwrap().status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn scheduler_cap_refuses_excess_sessions() {
    let mut config = Config::default();
    config.scheduler.max_concurrent = 1;
    config.session.stall_threshold = 50;

    let hub = Arc::new(EventHub::new());
    let state = StateManager::spawn(Store::open_in_memory().unwrap(), hub.clone());
    let tools = Arc::new(GatedToolRunner::new(0));
    let llm = Arc::new(MockLlmClient::new(vec![tool_reply("held"), tool_reply("held")]));
    let daemon = Daemon::with_collaborators(config, hub, state, llm, Arc::new(MockGitOps::new()), tools).unwrap();

    let repo = tempfile::tempdir().unwrap();
    std::fs::create_dir(repo.path().join(".git")).unwrap();
    let project = daemon.create_project("p", &repo.path().display().to_string(), "main").await.unwrap();

    let spec = |title: &str| CreateTaskSpec {
        project_id: project.id.clone(),
        title: title.to_string(),
        hat: "creator".to_string(),
        task_type: "feature".to_string(),
        priority: "normal".to_string(),
        autonomy: "supervised".to_string(),
        base_branch: "main".to_string(),
        ..Default::default()
    };

    let first = daemon.create_task(spec("first")).await.unwrap();
    let second = daemon.create_task(spec("second")).await.unwrap();

    daemon.start_task(&first.id).await.unwrap();
    let err = daemon.start_task(&second.id).await.unwrap_err();
    assert!(err.to_string().contains("capacity"));

    // The refused task is untouched and startable later
    assert_eq!(daemon.get_task(&second.id).await.unwrap().status, TaskStatus::Ready);
}
