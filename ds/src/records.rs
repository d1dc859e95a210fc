//! Row types stored in the database
//!
//! Statuses are stored as lowercase strings; every enum round-trips through
//! `as_str`/`parse`. Cross-record references are always IDs, never nested
//! records, so a row's lifetime is defined by its table alone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A source repository the system drives tasks against
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    /// Repository path on disk
    pub repo_path: String,
    pub default_branch: String,
    /// Optional remote coordinates (e.g. `origin` URL)
    pub remote: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Quest lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestStatus {
    Active,
    Completed,
}

impl QuestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestStatus::Active => "active",
            QuestStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(QuestStatus::Active),
            "completed" => Some(QuestStatus::Completed),
            _ => None,
        }
    }
}

/// A conversation thread that produces objectives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quest {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub status: QuestStatus,
    /// Model name the conversation runs on ("sonnet" | "opus")
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Conversation message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            _ => None,
        }
    }
}

/// One turn in a quest conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestMessage {
    pub id: String,
    pub quest_id: String,
    /// Position within the quest, starting at 1
    pub seq: i64,
    pub role: MessageRole,
    pub content: String,
    /// Tool calls recorded with the turn, as an opaque JSON array
    pub tool_calls: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Task (objective) lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Planning,
    Ready,
    Blocked,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Planning => "planning",
            TaskStatus::Ready => "ready",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "planning" => Some(TaskStatus::Planning),
            "ready" => Some(TaskStatus::Ready),
            "blocked" => Some(TaskStatus::Blocked),
            "running" => Some(TaskStatus::Running),
            "paused" => Some(TaskStatus::Paused),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The task status machine
///
/// ```text
/// pending  -> planning | ready | cancelled
/// planning -> ready | pending | cancelled
/// ready    -> running | blocked | cancelled
/// blocked  -> ready | cancelled
/// running  -> paused | completed | failed | cancelled
/// paused   -> running | cancelled
/// ```
pub fn allowed_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    match from {
        Pending => matches!(to, Planning | Ready | Cancelled),
        Planning => matches!(to, Ready | Pending | Cancelled),
        Ready => matches!(to, Running | Blocked | Cancelled),
        Blocked => matches!(to, Ready | Cancelled),
        Running => matches!(to, Paused | Completed | Failed | Cancelled),
        Paused => matches!(to, Running | Cancelled),
        Completed | Failed | Cancelled => false,
    }
}

/// A concrete unit of work with its own worktree, budget and lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub quest_id: Option<String>,
    pub title: String,
    pub description: String,
    /// Current role the task runs under
    pub hat: String,
    pub task_type: String,
    pub priority: String,
    pub autonomy: String,
    pub status: TaskStatus,
    pub base_branch: String,
    pub worktree_path: Option<String>,
    pub branch_name: Option<String>,
    pub pr_number: Option<i64>,
    pub max_iterations: Option<u32>,
    pub max_tokens: Option<u64>,
    pub max_dollars: Option<f64>,
    pub used_iterations: u32,
    pub used_tokens: u64,
    pub used_dollars: f64,
    /// Task IDs this task depends on
    pub deps: Vec<String>,
    pub auto_start: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Parameters for creating a task
///
/// The store assigns the ID and initial `pending` status.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub project_id: String,
    pub quest_id: Option<String>,
    pub title: String,
    pub description: String,
    pub hat: String,
    pub task_type: String,
    pub priority: String,
    pub autonomy: String,
    pub base_branch: String,
    pub max_iterations: Option<u32>,
    pub max_tokens: Option<u64>,
    pub max_dollars: Option<f64>,
    pub deps: Vec<String>,
    pub auto_start: bool,
}

/// Checklist item lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecklistStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl ChecklistStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecklistStatus::Pending => "pending",
            ChecklistStatus::InProgress => "in_progress",
            ChecklistStatus::Done => "done",
            ChecklistStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ChecklistStatus::Pending),
            "in_progress" => Some(ChecklistStatus::InProgress),
            "done" => Some(ChecklistStatus::Done),
            "failed" => Some(ChecklistStatus::Failed),
            _ => None,
        }
    }
}

/// One verifiable step on a task's checklist
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub id: String,
    pub task_id: String,
    pub description: String,
    pub status: ChecklistStatus,
    pub verification_notes: Option<String>,
    pub sort_order: i64,
}

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Running => "running",
            SessionState::Paused => "paused",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(SessionState::Idle),
            "running" => Some(SessionState::Running),
            "paused" => Some(SessionState::Paused),
            "completed" => Some(SessionState::Completed),
            "failed" => Some(SessionState::Failed),
            "cancelled" => Some(SessionState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed | SessionState::Cancelled)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One bounded iterative run of a task under a single hat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub task_id: String,
    pub hat: String,
    pub worktree_path: String,
    pub state: SessionState,
    /// Typed failure reason when state is `failed`
    pub failure_reason: Option<String>,
    pub iteration: u32,
    pub max_iterations: Option<u32>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
}

/// One persisted turn of a session's message log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub id: String,
    pub session_id: String,
    /// Position within the log, starting at 1
    pub seq: i64,
    pub role: MessageRole,
    /// Message content, serialized by the caller (text or content blocks)
    pub content: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Append-only activity log entry for a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionActivity {
    pub id: String,
    pub session_id: String,
    pub iteration: u32,
    pub event_type: String,
    pub hat: String,
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub created_at: DateTime<Utc>,
}

/// Approval lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ApprovalStatus::Pending),
            "approved" => Some(ApprovalStatus::Approved),
            "rejected" => Some(ApprovalStatus::Rejected),
            _ => None,
        }
    }
}

/// A human-in-the-loop gate on a sensitive action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: String,
    pub task_id: Option<String>,
    pub session_id: Option<String>,
    pub approval_type: String,
    pub title: String,
    pub description: String,
    /// Opaque payload supplied by the requester
    pub data: serde_json::Value,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}
