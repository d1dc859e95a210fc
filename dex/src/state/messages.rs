//! StateManager command protocol
//!
//! Every command carries a oneshot reply channel; the actor owns the store
//! and answers in arrival order.

use thiserror::Error;
use tokio::sync::oneshot;

use crate::domain::{
    Approval, ApprovalStatus, ChecklistItem, ChecklistStatus, MessageRole, NewTask, Project, Quest, QuestMessage,
    Session, SessionActivity, SessionMessage, SessionState, StoreError, Task, TaskStatus,
};

/// Errors returned by the StateManager
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state channel closed")]
    Channel,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl StateError {
    /// Stale-state conflicts are no-ops for racing writers
    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::Store(e) if e.is_conflict())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::Store(StoreError::NotFound(_)))
    }
}

/// Response type for state operations
pub type StateResponse<T> = Result<T, StateError>;

type Reply<T> = oneshot::Sender<StateResponse<T>>;

/// Commands processed by the StateManager actor
pub enum StateCommand {
    // Projects
    CreateProject { name: String, repo_path: String, default_branch: String, reply: Reply<Project> },
    GetProject { id: String, reply: Reply<Option<Project>> },
    ListProjects { reply: Reply<Vec<Project>> },

    // Tasks
    CreateTask { new: NewTask, reply: Reply<Task> },
    GetTask { id: String, reply: Reply<Option<Task>> },
    ListTasks { project_id: Option<String>, status: Option<TaskStatus>, reply: Reply<Vec<Task>> },
    ListTasksForQuest { quest_id: String, reply: Reply<Vec<Task>> },
    TransitionTask { id: String, from: TaskStatus, to: TaskStatus, reply: Reply<Task> },
    SetTaskWorktree { id: String, worktree_path: String, branch_name: Option<String>, reply: Reply<()> },
    SetTaskPr { id: String, pr_number: i64, reply: Reply<()> },
    SetTaskHat { id: String, hat: String, reply: Reply<()> },
    UpdateTask { id: String, title: Option<String>, description: Option<String>, priority: Option<String>, reply: Reply<Task> },
    AddTaskUsage { id: String, iterations: u32, tokens: u64, dollars: f64, reply: Reply<()> },
    DeleteTask { id: String, reply: Reply<()> },
    TasksUnblockedBy { completed_id: String, reply: Reply<Vec<Task>> },

    // Checklists
    AddChecklistItem { task_id: String, description: String, sort_order: i64, reply: Reply<ChecklistItem> },
    UpdateChecklistItem { id: String, status: ChecklistStatus, verification_notes: Option<String>, reply: Reply<ChecklistItem> },
    ListChecklistItems { task_id: String, reply: Reply<Vec<ChecklistItem>> },

    // Sessions
    CreateSession { task_id: String, hat: String, worktree_path: String, max_iterations: Option<u32>, reply: Reply<Session> },
    GetSession { id: String, reply: Reply<Option<Session>> },
    ActiveSessionForTask { task_id: String, reply: Reply<Option<Session>> },
    ListSessions { state: Option<SessionState>, reply: Reply<Vec<Session>> },
    UpdateSessionState { id: String, state: SessionState, failure_reason: Option<String>, reply: Reply<Session> },
    CheckpointSession { id: String, iteration: u32, input_tokens: u64, output_tokens: u64, reply: Reply<()> },
    AppendSessionMessage { session_id: String, role: MessageRole, content: serde_json::Value, reply: Reply<SessionMessage> },
    ListSessionMessages { session_id: String, reply: Reply<Vec<SessionMessage>> },
    AppendSessionActivity {
        session_id: String,
        iteration: u32,
        event_type: String,
        hat: String,
        content: String,
        input_tokens: u64,
        output_tokens: u64,
        reply: Reply<SessionActivity>,
    },
    ListSessionActivity { session_id: String, reply: Reply<Vec<SessionActivity>> },
    SessionActivitySummary { session_id: String, max_entries: usize, reply: Reply<String> },

    // Approvals
    CreateApproval {
        task_id: Option<String>,
        session_id: Option<String>,
        approval_type: String,
        title: String,
        description: String,
        data: serde_json::Value,
        reply: Reply<Approval>,
    },
    GetApproval { id: String, reply: Reply<Option<Approval>> },
    ListApprovals { status: Option<ApprovalStatus>, reply: Reply<Vec<Approval>> },
    ResolveApproval { id: String, status: ApprovalStatus, reply: Reply<Approval> },

    // Quests
    CreateQuest { project_id: String, title: String, model: String, reply: Reply<Quest> },
    GetQuest { id: String, reply: Reply<Option<Quest>> },
    ListQuests { project_id: Option<String>, reply: Reply<Vec<Quest>> },
    AppendQuestMessage { quest_id: String, role: MessageRole, content: String, tool_calls: serde_json::Value, reply: Reply<QuestMessage> },
    ListQuestMessages { quest_id: String, reply: Reply<Vec<QuestMessage>> },
    CompleteQuest { id: String, reply: Reply<Quest> },
    ReopenQuest { id: String, reply: Reply<Quest> },

    // Secrets
    GetSecret { key: String, reply: Reply<Option<String>> },
    SetSecret { key: String, value: String, reply: Reply<()> },

    Shutdown,
}
