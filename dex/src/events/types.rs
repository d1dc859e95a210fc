//! Event types and topic matching
//!
//! Event types are dotted strings so subscribers can filter on a prefix
//! without parsing payloads. Payloads always carry the relevant ids.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::domain::{Approval, Quest, Session, Task};

/// Stable event type names
pub mod topics {
    pub const TASK_CREATED: &str = "task.created";
    pub const TASK_UPDATED: &str = "task.updated";
    pub const TASK_DELETED: &str = "task.deleted";
    pub const TASK_PLANNING: &str = "task.planning";
    pub const TASK_READY: &str = "task.ready";
    pub const TASK_BLOCKED: &str = "task.blocked";
    pub const TASK_STARTED: &str = "task.started";
    pub const TASK_PAUSED: &str = "task.paused";
    pub const TASK_RESUMED: &str = "task.resumed";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_CANCELLED: &str = "task.cancelled";
    pub const TASK_UNBLOCKED: &str = "task.unblocked";
    pub const TASK_AUTO_STARTED: &str = "task.auto_started";
    pub const TASK_AUTO_START_FAILED: &str = "task.auto_start_failed";

    pub const SESSION_CREATED: &str = "session.created";
    pub const SESSION_ITERATION: &str = "session.iteration";
    pub const SESSION_PAUSED: &str = "session.paused";
    pub const SESSION_RESUMED: &str = "session.resumed";
    pub const SESSION_COMPLETED: &str = "session.completed";
    pub const SESSION_KILLED: &str = "session.killed";

    pub const APPROVAL_REQUIRED: &str = "approval.required";
    pub const APPROVAL_RESOLVED: &str = "approval.resolved";

    pub const QUEST_CREATED: &str = "quest.created";
    pub const QUEST_MESSAGE: &str = "quest.message";
    pub const QUEST_COMPLETED: &str = "quest.completed";

    pub const CHECKLIST_UPDATED: &str = "checklist.updated";
    pub const PR_OPENED: &str = "pr.opened";
    pub const SUBSCRIBER_DROPPED: &str = "subscriber.dropped";
}

/// A single event on the hub
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Event about a task; payload carries id, status and hat
    pub fn task(event_type: &str, task: &Task) -> Self {
        Self::new(
            event_type,
            json!({
                "task_id": task.id,
                "project_id": task.project_id,
                "quest_id": task.quest_id,
                "status": task.status.as_str(),
                "hat": task.hat,
                "title": task.title,
            }),
        )
    }

    /// Event about a session; payload carries session and task ids
    pub fn session(event_type: &str, session: &Session) -> Self {
        Self::new(
            event_type,
            json!({
                "session_id": session.id,
                "task_id": session.task_id,
                "state": session.state.as_str(),
                "hat": session.hat,
                "iteration": session.iteration,
                "failure_reason": session.failure_reason,
            }),
        )
    }

    /// Per-iteration progress event
    pub fn session_iteration(
        session: &Session,
        iteration: u32,
        tokens_used: u64,
        cost: f64,
        content_preview: &str,
    ) -> Self {
        Self::new(
            topics::SESSION_ITERATION,
            json!({
                "session_id": session.id,
                "task_id": session.task_id,
                "iteration": iteration,
                "tokens_used": tokens_used,
                "cost": cost,
                "content_preview": content_preview,
            }),
        )
    }

    pub fn approval(event_type: &str, approval: &Approval) -> Self {
        Self::new(
            event_type,
            json!({
                "approval_id": approval.id,
                "task_id": approval.task_id,
                "session_id": approval.session_id,
                "approval_type": approval.approval_type,
                "status": approval.status.as_str(),
                "data": approval.data,
            }),
        )
    }

    pub fn quest(event_type: &str, quest: &Quest) -> Self {
        Self::new(
            event_type,
            json!({
                "quest_id": quest.id,
                "project_id": quest.project_id,
                "status": quest.status.as_str(),
                "title": quest.title,
            }),
        )
    }

    pub fn pr_opened(task: &Task, pr_number: i64) -> Self {
        Self::new(
            topics::PR_OPENED,
            json!({
                "task_id": task.id,
                "branch": task.branch_name,
                "pr_number": pr_number,
            }),
        )
    }
}

/// Match an event type against a subscription pattern
///
/// Patterns are `*` (everything), `prefix.*` (one dotted prefix) or an exact
/// type name.
pub fn topic_matches(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return event_type
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'));
    }
    pattern == event_type
}
