//! StateManager - actor that owns the Store
//!
//! All durable writes serialize through this actor, and every write that
//! changes a visible status publishes its hub event right after the commit,
//! so external observers never see a state without the matching event.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use dexstore::Store;

use crate::domain::{
    Approval, ApprovalStatus, ChecklistItem, ChecklistStatus, MessageRole, NewTask, Project, Quest, QuestMessage,
    Session, SessionActivity, SessionMessage, SessionState, Task, TaskStatus,
};
use crate::events::{topics, Event, EventHub};

use super::messages::{StateCommand, StateError, StateResponse};

/// Handle to send commands to the StateManager actor
#[derive(Clone)]
pub struct StateManager {
    tx: mpsc::Sender<StateCommand>,
}

impl StateManager {
    /// Spawn the actor over an already-open store
    pub fn spawn(store: Store, hub: Arc<EventHub>) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(actor_loop(store, hub, rx));
        info!("StateManager spawned");
        Self { tx }
    }

    /// Open the store at `path` and spawn the actor over it
    pub fn spawn_at(path: impl AsRef<Path>, hub: Arc<EventHub>) -> StateResponse<Self> {
        let store = Store::open(path.as_ref())?;
        Ok(Self::spawn(store, hub))
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<StateResponse<T>>) -> StateCommand) -> StateResponse<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(build(reply_tx)).await.map_err(|_| StateError::Channel)?;
        reply_rx.await.map_err(|_| StateError::Channel)?
    }

    // === Projects ===

    pub async fn create_project(&self, name: &str, repo_path: &str, default_branch: &str) -> StateResponse<Project> {
        let (name, repo_path, default_branch) = (name.to_string(), repo_path.to_string(), default_branch.to_string());
        self.request(|reply| StateCommand::CreateProject { name, repo_path, default_branch, reply }).await
    }

    pub async fn get_project(&self, id: &str) -> StateResponse<Option<Project>> {
        let id = id.to_string();
        self.request(|reply| StateCommand::GetProject { id, reply }).await
    }

    pub async fn get_project_required(&self, id: &str) -> StateResponse<Project> {
        self.get_project(id)
            .await?
            .ok_or_else(|| StateError::Store(dexstore::StoreError::NotFound(format!("project {}", id))))
    }

    pub async fn list_projects(&self) -> StateResponse<Vec<Project>> {
        self.request(|reply| StateCommand::ListProjects { reply }).await
    }

    // === Tasks ===

    pub async fn create_task(&self, new: NewTask) -> StateResponse<Task> {
        self.request(|reply| StateCommand::CreateTask { new, reply }).await
    }

    pub async fn get_task(&self, id: &str) -> StateResponse<Option<Task>> {
        let id = id.to_string();
        self.request(|reply| StateCommand::GetTask { id, reply }).await
    }

    pub async fn get_task_required(&self, id: &str) -> StateResponse<Task> {
        self.get_task(id)
            .await?
            .ok_or_else(|| StateError::Store(dexstore::StoreError::NotFound(format!("task {}", id))))
    }

    pub async fn list_tasks(&self, project_id: Option<&str>, status: Option<TaskStatus>) -> StateResponse<Vec<Task>> {
        let project_id = project_id.map(String::from);
        self.request(|reply| StateCommand::ListTasks { project_id, status, reply }).await
    }

    pub async fn list_tasks_for_quest(&self, quest_id: &str) -> StateResponse<Vec<Task>> {
        let quest_id = quest_id.to_string();
        self.request(|reply| StateCommand::ListTasksForQuest { quest_id, reply }).await
    }

    /// Transition a task's status; the matching `task.*` event publishes
    /// after the commit
    pub async fn transition_task(&self, id: &str, from: TaskStatus, to: TaskStatus) -> StateResponse<Task> {
        let id = id.to_string();
        self.request(|reply| StateCommand::TransitionTask { id, from, to, reply }).await
    }

    pub async fn set_task_worktree(&self, id: &str, worktree_path: &str, branch_name: Option<&str>) -> StateResponse<()> {
        let (id, worktree_path) = (id.to_string(), worktree_path.to_string());
        let branch_name = branch_name.map(String::from);
        self.request(|reply| StateCommand::SetTaskWorktree { id, worktree_path, branch_name, reply }).await
    }

    pub async fn set_task_pr(&self, id: &str, pr_number: i64) -> StateResponse<()> {
        let id = id.to_string();
        self.request(|reply| StateCommand::SetTaskPr { id, pr_number, reply }).await
    }

    pub async fn set_task_hat(&self, id: &str, hat: &str) -> StateResponse<()> {
        let (id, hat) = (id.to_string(), hat.to_string());
        self.request(|reply| StateCommand::SetTaskHat { id, hat, reply }).await
    }

    pub async fn update_task(
        &self,
        id: &str,
        title: Option<&str>,
        description: Option<&str>,
        priority: Option<&str>,
    ) -> StateResponse<Task> {
        let id = id.to_string();
        let (title, description, priority) = (title.map(String::from), description.map(String::from), priority.map(String::from));
        self.request(|reply| StateCommand::UpdateTask { id, title, description, priority, reply }).await
    }

    pub async fn add_task_usage(&self, id: &str, iterations: u32, tokens: u64, dollars: f64) -> StateResponse<()> {
        let id = id.to_string();
        self.request(|reply| StateCommand::AddTaskUsage { id, iterations, tokens, dollars, reply }).await
    }

    pub async fn delete_task(&self, id: &str) -> StateResponse<()> {
        let id = id.to_string();
        self.request(|reply| StateCommand::DeleteTask { id, reply }).await
    }

    pub async fn tasks_unblocked_by(&self, completed_id: &str) -> StateResponse<Vec<Task>> {
        let completed_id = completed_id.to_string();
        self.request(|reply| StateCommand::TasksUnblockedBy { completed_id, reply }).await
    }

    // === Checklists ===

    pub async fn add_checklist_item(&self, task_id: &str, description: &str, sort_order: i64) -> StateResponse<ChecklistItem> {
        let (task_id, description) = (task_id.to_string(), description.to_string());
        self.request(|reply| StateCommand::AddChecklistItem { task_id, description, sort_order, reply }).await
    }

    pub async fn update_checklist_item(
        &self,
        id: &str,
        status: ChecklistStatus,
        verification_notes: Option<&str>,
    ) -> StateResponse<ChecklistItem> {
        let id = id.to_string();
        let verification_notes = verification_notes.map(String::from);
        self.request(|reply| StateCommand::UpdateChecklistItem { id, status, verification_notes, reply }).await
    }

    pub async fn list_checklist_items(&self, task_id: &str) -> StateResponse<Vec<ChecklistItem>> {
        let task_id = task_id.to_string();
        self.request(|reply| StateCommand::ListChecklistItems { task_id, reply }).await
    }

    // === Sessions ===

    pub async fn create_session(
        &self,
        task_id: &str,
        hat: &str,
        worktree_path: &str,
        max_iterations: Option<u32>,
    ) -> StateResponse<Session> {
        let (task_id, hat, worktree_path) = (task_id.to_string(), hat.to_string(), worktree_path.to_string());
        self.request(|reply| StateCommand::CreateSession { task_id, hat, worktree_path, max_iterations, reply }).await
    }

    pub async fn get_session(&self, id: &str) -> StateResponse<Option<Session>> {
        let id = id.to_string();
        self.request(|reply| StateCommand::GetSession { id, reply }).await
    }

    pub async fn get_session_required(&self, id: &str) -> StateResponse<Session> {
        self.get_session(id)
            .await?
            .ok_or_else(|| StateError::Store(dexstore::StoreError::NotFound(format!("session {}", id))))
    }

    pub async fn active_session_for_task(&self, task_id: &str) -> StateResponse<Option<Session>> {
        let task_id = task_id.to_string();
        self.request(|reply| StateCommand::ActiveSessionForTask { task_id, reply }).await
    }

    pub async fn list_sessions(&self, state: Option<SessionState>) -> StateResponse<Vec<Session>> {
        self.request(|reply| StateCommand::ListSessions { state, reply }).await
    }

    pub async fn update_session_state(
        &self,
        id: &str,
        state: SessionState,
        failure_reason: Option<&str>,
    ) -> StateResponse<Session> {
        let id = id.to_string();
        let failure_reason = failure_reason.map(String::from);
        self.request(|reply| StateCommand::UpdateSessionState { id, state, failure_reason, reply }).await
    }

    pub async fn checkpoint_session(&self, id: &str, iteration: u32, input_tokens: u64, output_tokens: u64) -> StateResponse<()> {
        let id = id.to_string();
        self.request(|reply| StateCommand::CheckpointSession { id, iteration, input_tokens, output_tokens, reply }).await
    }

    pub async fn append_session_message(
        &self,
        session_id: &str,
        role: MessageRole,
        content: serde_json::Value,
    ) -> StateResponse<SessionMessage> {
        let session_id = session_id.to_string();
        self.request(|reply| StateCommand::AppendSessionMessage { session_id, role, content, reply }).await
    }

    pub async fn list_session_messages(&self, session_id: &str) -> StateResponse<Vec<SessionMessage>> {
        let session_id = session_id.to_string();
        self.request(|reply| StateCommand::ListSessionMessages { session_id, reply }).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn append_session_activity(
        &self,
        session_id: &str,
        iteration: u32,
        event_type: &str,
        hat: &str,
        content: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> StateResponse<SessionActivity> {
        let (session_id, event_type, hat, content) =
            (session_id.to_string(), event_type.to_string(), hat.to_string(), content.to_string());
        self.request(|reply| StateCommand::AppendSessionActivity {
            session_id,
            iteration,
            event_type,
            hat,
            content,
            input_tokens,
            output_tokens,
            reply,
        })
        .await
    }

    pub async fn list_session_activity(&self, session_id: &str) -> StateResponse<Vec<SessionActivity>> {
        let session_id = session_id.to_string();
        self.request(|reply| StateCommand::ListSessionActivity { session_id, reply }).await
    }

    /// Compact digest of a session's most recent activity
    pub async fn session_activity_summary(&self, session_id: &str, max_entries: usize) -> StateResponse<String> {
        let session_id = session_id.to_string();
        self.request(|reply| StateCommand::SessionActivitySummary { session_id, max_entries, reply }).await
    }

    // === Approvals ===

    pub async fn create_approval(
        &self,
        task_id: Option<&str>,
        session_id: Option<&str>,
        approval_type: &str,
        title: &str,
        description: &str,
        data: serde_json::Value,
    ) -> StateResponse<Approval> {
        let (task_id, session_id) = (task_id.map(String::from), session_id.map(String::from));
        let (approval_type, title, description) = (approval_type.to_string(), title.to_string(), description.to_string());
        self.request(|reply| StateCommand::CreateApproval {
            task_id,
            session_id,
            approval_type,
            title,
            description,
            data,
            reply,
        })
        .await
    }

    pub async fn get_approval(&self, id: &str) -> StateResponse<Option<Approval>> {
        let id = id.to_string();
        self.request(|reply| StateCommand::GetApproval { id, reply }).await
    }

    pub async fn list_approvals(&self, status: Option<ApprovalStatus>) -> StateResponse<Vec<Approval>> {
        self.request(|reply| StateCommand::ListApprovals { status, reply }).await
    }

    pub async fn resolve_approval(&self, id: &str, status: ApprovalStatus) -> StateResponse<Approval> {
        let id = id.to_string();
        self.request(|reply| StateCommand::ResolveApproval { id, status, reply }).await
    }

    // === Quests ===

    pub async fn create_quest(&self, project_id: &str, title: &str, model: &str) -> StateResponse<Quest> {
        let (project_id, title, model) = (project_id.to_string(), title.to_string(), model.to_string());
        self.request(|reply| StateCommand::CreateQuest { project_id, title, model, reply }).await
    }

    pub async fn get_quest(&self, id: &str) -> StateResponse<Option<Quest>> {
        let id = id.to_string();
        self.request(|reply| StateCommand::GetQuest { id, reply }).await
    }

    pub async fn get_quest_required(&self, id: &str) -> StateResponse<Quest> {
        self.get_quest(id)
            .await?
            .ok_or_else(|| StateError::Store(dexstore::StoreError::NotFound(format!("quest {}", id))))
    }

    pub async fn list_quests(&self, project_id: Option<&str>) -> StateResponse<Vec<Quest>> {
        let project_id = project_id.map(String::from);
        self.request(|reply| StateCommand::ListQuests { project_id, reply }).await
    }

    pub async fn append_quest_message(
        &self,
        quest_id: &str,
        role: MessageRole,
        content: &str,
        tool_calls: serde_json::Value,
    ) -> StateResponse<QuestMessage> {
        let (quest_id, content) = (quest_id.to_string(), content.to_string());
        self.request(|reply| StateCommand::AppendQuestMessage { quest_id, role, content, tool_calls, reply }).await
    }

    pub async fn list_quest_messages(&self, quest_id: &str) -> StateResponse<Vec<QuestMessage>> {
        let quest_id = quest_id.to_string();
        self.request(|reply| StateCommand::ListQuestMessages { quest_id, reply }).await
    }

    pub async fn complete_quest(&self, id: &str) -> StateResponse<Quest> {
        let id = id.to_string();
        self.request(|reply| StateCommand::CompleteQuest { id, reply }).await
    }

    pub async fn reopen_quest(&self, id: &str) -> StateResponse<Quest> {
        let id = id.to_string();
        self.request(|reply| StateCommand::ReopenQuest { id, reply }).await
    }

    // === Secrets ===

    pub async fn get_secret(&self, key: &str) -> StateResponse<Option<String>> {
        let key = key.to_string();
        self.request(|reply| StateCommand::GetSecret { key, reply }).await
    }

    pub async fn set_secret(&self, key: &str, value: &str) -> StateResponse<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.request(|reply| StateCommand::SetSecret { key, value, reply }).await
    }

    /// Shut down the actor; in-flight commands finish first
    pub async fn shutdown(&self) -> StateResponse<()> {
        self.tx.send(StateCommand::Shutdown).await.map_err(|_| StateError::Channel)
    }
}

/// Hub event name for a task status transition
fn transition_topic(from: TaskStatus, to: TaskStatus) -> &'static str {
    match to {
        TaskStatus::Pending => topics::TASK_UPDATED,
        TaskStatus::Planning => topics::TASK_PLANNING,
        TaskStatus::Ready => topics::TASK_READY,
        TaskStatus::Blocked => topics::TASK_BLOCKED,
        TaskStatus::Running if from == TaskStatus::Paused => topics::TASK_RESUMED,
        TaskStatus::Running => topics::TASK_STARTED,
        TaskStatus::Paused => topics::TASK_PAUSED,
        TaskStatus::Completed => topics::TASK_COMPLETED,
        TaskStatus::Failed => topics::TASK_FAILED,
        TaskStatus::Cancelled => topics::TASK_CANCELLED,
    }
}

/// The actor loop that owns the Store and processes commands
async fn actor_loop(mut store: Store, hub: Arc<EventHub>, mut rx: mpsc::Receiver<StateCommand>) {
    debug!("StateManager actor started");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            StateCommand::CreateProject { name, repo_path, default_branch, reply } => {
                let result = store.create_project(&name, &repo_path, &default_branch).map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::GetProject { id, reply } => {
                let _ = reply.send(store.get_project(&id).map_err(StateError::from));
            }
            StateCommand::ListProjects { reply } => {
                let _ = reply.send(store.list_projects().map_err(StateError::from));
            }

            StateCommand::CreateTask { new, reply } => {
                let result = store.create_task(new).map_err(StateError::from);
                if let Ok(task) = &result {
                    hub.publish(Event::task(topics::TASK_CREATED, task));
                }
                let _ = reply.send(result);
            }
            StateCommand::GetTask { id, reply } => {
                let _ = reply.send(store.get_task(&id).map_err(StateError::from));
            }
            StateCommand::ListTasks { project_id, status, reply } => {
                let _ = reply.send(store.list_tasks(project_id.as_deref(), status).map_err(StateError::from));
            }
            StateCommand::ListTasksForQuest { quest_id, reply } => {
                let _ = reply.send(store.list_tasks_for_quest(&quest_id).map_err(StateError::from));
            }
            StateCommand::TransitionTask { id, from, to, reply } => {
                let result = store.transition_task_status(&id, from, to).map_err(StateError::from);
                if let Ok(task) = &result {
                    hub.publish(Event::task(transition_topic(from, to), task));
                }
                let _ = reply.send(result);
            }
            StateCommand::SetTaskWorktree { id, worktree_path, branch_name, reply } => {
                let result = store
                    .set_task_worktree(&id, &worktree_path, branch_name.as_deref())
                    .map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::SetTaskPr { id, pr_number, reply } => {
                let result = store.set_task_pr(&id, pr_number).map_err(StateError::from);
                if result.is_ok()
                    && let Ok(Some(task)) = store.get_task(&id)
                {
                    hub.publish(Event::pr_opened(&task, pr_number));
                }
                let _ = reply.send(result);
            }
            StateCommand::SetTaskHat { id, hat, reply } => {
                let _ = reply.send(store.set_task_hat(&id, &hat).map_err(StateError::from));
            }
            StateCommand::UpdateTask { id, title, description, priority, reply } => {
                let result = store
                    .update_task(&id, title.as_deref(), description.as_deref(), priority.as_deref())
                    .map_err(StateError::from);
                if let Ok(task) = &result {
                    hub.publish(Event::task(topics::TASK_UPDATED, task));
                }
                let _ = reply.send(result);
            }
            StateCommand::AddTaskUsage { id, iterations, tokens, dollars, reply } => {
                let _ = reply.send(store.add_task_usage(&id, iterations, tokens, dollars).map_err(StateError::from));
            }
            StateCommand::DeleteTask { id, reply } => {
                let task = store.get_task(&id).ok().flatten();
                let result = store.delete_task(&id).map_err(StateError::from);
                if result.is_ok()
                    && let Some(task) = task
                {
                    hub.publish(Event::task(topics::TASK_DELETED, &task));
                }
                let _ = reply.send(result);
            }
            StateCommand::TasksUnblockedBy { completed_id, reply } => {
                let _ = reply.send(store.tasks_unblocked_by(&completed_id).map_err(StateError::from));
            }

            StateCommand::AddChecklistItem { task_id, description, sort_order, reply } => {
                let result = store.add_checklist_item(&task_id, &description, sort_order).map_err(StateError::from);
                if let Ok(item) = &result {
                    hub.publish(Event::new(
                        topics::CHECKLIST_UPDATED,
                        serde_json::json!({ "task_id": item.task_id, "item_id": item.id, "status": item.status.as_str() }),
                    ));
                }
                let _ = reply.send(result);
            }
            StateCommand::UpdateChecklistItem { id, status, verification_notes, reply } => {
                let result = store
                    .update_checklist_item_status(&id, status, verification_notes.as_deref())
                    .map_err(StateError::from);
                if let Ok(item) = &result {
                    hub.publish(Event::new(
                        topics::CHECKLIST_UPDATED,
                        serde_json::json!({ "task_id": item.task_id, "item_id": item.id, "status": item.status.as_str() }),
                    ));
                }
                let _ = reply.send(result);
            }
            StateCommand::ListChecklistItems { task_id, reply } => {
                let _ = reply.send(store.list_checklist_items(&task_id).map_err(StateError::from));
            }

            StateCommand::CreateSession { task_id, hat, worktree_path, max_iterations, reply } => {
                let result = store
                    .create_session(&task_id, &hat, &worktree_path, max_iterations)
                    .map_err(StateError::from);
                if let Ok(session) = &result {
                    hub.publish(Event::session(topics::SESSION_CREATED, session));
                }
                let _ = reply.send(result);
            }
            StateCommand::GetSession { id, reply } => {
                let _ = reply.send(store.get_session(&id).map_err(StateError::from));
            }
            StateCommand::ActiveSessionForTask { task_id, reply } => {
                let _ = reply.send(store.active_session_for_task(&task_id).map_err(StateError::from));
            }
            StateCommand::ListSessions { state, reply } => {
                let _ = reply.send(store.list_sessions(state).map_err(StateError::from));
            }
            StateCommand::UpdateSessionState { id, state, failure_reason, reply } => {
                let prior = store.get_session(&id).ok().flatten().map(|s| s.state);
                let result = store
                    .update_session_state(&id, state, failure_reason.as_deref())
                    .map_err(StateError::from);
                if let Ok(session) = &result {
                    match state {
                        SessionState::Paused => hub.publish(Event::session(topics::SESSION_PAUSED, session)),
                        SessionState::Running if prior == Some(SessionState::Paused) => {
                            hub.publish(Event::session(topics::SESSION_RESUMED, session))
                        }
                        SessionState::Completed | SessionState::Failed => {
                            hub.publish(Event::session(topics::SESSION_COMPLETED, session))
                        }
                        SessionState::Cancelled => hub.publish(Event::session(topics::SESSION_KILLED, session)),
                        _ => {}
                    }
                }
                let _ = reply.send(result);
            }
            StateCommand::CheckpointSession { id, iteration, input_tokens, output_tokens, reply } => {
                let result = store
                    .checkpoint_session(&id, iteration, input_tokens, output_tokens)
                    .map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::AppendSessionMessage { session_id, role, content, reply } => {
                let result = store.append_session_message(&session_id, role, &content).map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::ListSessionMessages { session_id, reply } => {
                let _ = reply.send(store.list_session_messages(&session_id).map_err(StateError::from));
            }
            StateCommand::AppendSessionActivity {
                session_id,
                iteration,
                event_type,
                hat,
                content,
                input_tokens,
                output_tokens,
                reply,
            } => {
                let result = store
                    .append_session_activity(&session_id, iteration, &event_type, &hat, &content, input_tokens, output_tokens)
                    .map_err(StateError::from);
                let _ = reply.send(result);
            }
            StateCommand::ListSessionActivity { session_id, reply } => {
                let _ = reply.send(store.list_session_activity(&session_id).map_err(StateError::from));
            }
            StateCommand::SessionActivitySummary { session_id, max_entries, reply } => {
                let _ = reply.send(store.session_activity_summary(&session_id, max_entries).map_err(StateError::from));
            }

            StateCommand::CreateApproval { task_id, session_id, approval_type, title, description, data, reply } => {
                let result = store
                    .create_approval(task_id.as_deref(), session_id.as_deref(), &approval_type, &title, &description, &data)
                    .map_err(StateError::from);
                if let Ok(approval) = &result {
                    hub.publish(Event::approval(topics::APPROVAL_REQUIRED, approval));
                }
                let _ = reply.send(result);
            }
            StateCommand::GetApproval { id, reply } => {
                let _ = reply.send(store.get_approval(&id).map_err(StateError::from));
            }
            StateCommand::ListApprovals { status, reply } => {
                let _ = reply.send(store.list_approvals(status).map_err(StateError::from));
            }
            StateCommand::ResolveApproval { id, status, reply } => {
                let result = store.resolve_approval(&id, status).map_err(StateError::from);
                if let Ok(approval) = &result {
                    hub.publish(Event::approval(topics::APPROVAL_RESOLVED, approval));
                }
                let _ = reply.send(result);
            }

            StateCommand::CreateQuest { project_id, title, model, reply } => {
                let result = store.create_quest(&project_id, &title, &model).map_err(StateError::from);
                if let Ok(quest) = &result {
                    hub.publish(Event::quest(topics::QUEST_CREATED, quest));
                }
                let _ = reply.send(result);
            }
            StateCommand::GetQuest { id, reply } => {
                let _ = reply.send(store.get_quest(&id).map_err(StateError::from));
            }
            StateCommand::ListQuests { project_id, reply } => {
                let _ = reply.send(store.list_quests(project_id.as_deref()).map_err(StateError::from));
            }
            StateCommand::AppendQuestMessage { quest_id, role, content, tool_calls, reply } => {
                let result = store
                    .append_quest_message(&quest_id, role, &content, &tool_calls)
                    .map_err(StateError::from);
                if let Ok(message) = &result {
                    hub.publish(Event::new(
                        topics::QUEST_MESSAGE,
                        serde_json::json!({
                            "quest_id": message.quest_id,
                            "message_id": message.id,
                            "role": message.role.as_str(),
                            "seq": message.seq,
                        }),
                    ));
                }
                let _ = reply.send(result);
            }
            StateCommand::ListQuestMessages { quest_id, reply } => {
                let _ = reply.send(store.list_quest_messages(&quest_id).map_err(StateError::from));
            }
            StateCommand::CompleteQuest { id, reply } => {
                let result = store.complete_quest(&id).map_err(StateError::from);
                if let Ok(quest) = &result {
                    hub.publish(Event::quest(topics::QUEST_COMPLETED, quest));
                }
                let _ = reply.send(result);
            }
            StateCommand::ReopenQuest { id, reply } => {
                let _ = reply.send(store.reopen_quest(&id).map_err(StateError::from));
            }

            StateCommand::GetSecret { key, reply } => {
                let _ = reply.send(store.get_secret(&key).map_err(StateError::from));
            }
            StateCommand::SetSecret { key, value, reply } => {
                let _ = reply.send(store.set_secret(&key, &value).map_err(StateError::from));
            }

            StateCommand::Shutdown => {
                info!("StateManager shutting down");
                break;
            }
        }
    }

    debug!("StateManager actor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewTask;

    fn spawn_state() -> (StateManager, Arc<EventHub>) {
        let hub = Arc::new(EventHub::new());
        let store = Store::open_in_memory().unwrap();
        (StateManager::spawn(store, hub.clone()), hub)
    }

    async fn make_task(state: &StateManager) -> Task {
        let project = state.create_project("p", "/tmp/repo", "main").await.unwrap();
        state
            .create_task(NewTask {
                project_id: project.id,
                title: "t".to_string(),
                hat: "creator".to_string(),
                task_type: "feature".to_string(),
                priority: "normal".to_string(),
                autonomy: "supervised".to_string(),
                base_branch: "main".to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_task_crud_through_actor() {
        let (state, _hub) = spawn_state();
        let task = make_task(&state).await;

        let fetched = state.get_task_required(&task.id).await.unwrap();
        assert_eq!(fetched.status, TaskStatus::Pending);

        state.transition_task(&task.id, TaskStatus::Pending, TaskStatus::Ready).await.unwrap();
        let tasks = state.list_tasks(None, Some(TaskStatus::Ready)).await.unwrap();
        assert_eq!(tasks.len(), 1);

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_status_event_follows_commit() {
        let (state, hub) = spawn_state();
        let mut sub = hub.subscribe("task.*");
        let task = make_task(&state).await;

        assert_eq!(sub.recv().await.unwrap().event_type, "task.created");

        state.transition_task(&task.id, TaskStatus::Pending, TaskStatus::Ready).await.unwrap();
        let event = sub.recv().await.unwrap();
        assert_eq!(event.event_type, "task.ready");
        assert_eq!(event.payload["task_id"], task.id.as_str());
        assert_eq!(event.payload["status"], "ready");
    }

    #[tokio::test]
    async fn test_failed_transition_emits_nothing() {
        let (state, hub) = spawn_state();
        let task = make_task(&state).await;
        let mut sub = hub.subscribe("task.*");

        let err = state
            .transition_task(&task.id, TaskStatus::Running, TaskStatus::Completed)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_pause_resume_events() {
        let (state, hub) = spawn_state();
        let task = make_task(&state).await;
        state.transition_task(&task.id, TaskStatus::Pending, TaskStatus::Ready).await.unwrap();
        state.transition_task(&task.id, TaskStatus::Ready, TaskStatus::Running).await.unwrap();

        let mut sub = hub.subscribe("task.*");
        state.transition_task(&task.id, TaskStatus::Running, TaskStatus::Paused).await.unwrap();
        state.transition_task(&task.id, TaskStatus::Paused, TaskStatus::Running).await.unwrap();

        assert_eq!(sub.recv().await.unwrap().event_type, "task.paused");
        assert_eq!(sub.recv().await.unwrap().event_type, "task.resumed");
    }

    #[tokio::test]
    async fn test_session_terminal_events() {
        let (state, hub) = spawn_state();
        let task = make_task(&state).await;
        let session = state.create_session(&task.id, "creator", "/tmp/wt", None).await.unwrap();

        let mut sub = hub.subscribe("session.*");
        state.update_session_state(&session.id, SessionState::Running, None).await.unwrap();
        state
            .update_session_state(&session.id, SessionState::Failed, Some("stalled"))
            .await
            .unwrap();

        let event = sub.recv().await.unwrap();
        assert_eq!(event.event_type, "session.completed");
        assert_eq!(event.payload["failure_reason"], "stalled");
    }

    #[tokio::test]
    async fn test_approval_events() {
        let (state, hub) = spawn_state();
        let mut sub = hub.subscribe("approval.*");

        let approval = state
            .create_approval(None, None, "merge", "Merge x", "", serde_json::json!({"branch": "x"}))
            .await
            .unwrap();
        assert_eq!(sub.recv().await.unwrap().event_type, "approval.required");

        state.resolve_approval(&approval.id, ApprovalStatus::Approved).await.unwrap();
        let event = sub.recv().await.unwrap();
        assert_eq!(event.event_type, "approval.resolved");
        assert_eq!(event.payload["status"], "approved");

        // Idempotence at the row level: second resolve errors, no second event
        assert!(state.resolve_approval(&approval.id, ApprovalStatus::Rejected).await.is_err());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_secrets_roundtrip() {
        let (state, _hub) = spawn_state();
        state.set_secret("k", "v").await.unwrap();
        assert_eq!(state.get_secret("k").await.unwrap().as_deref(), Some("v"));
    }
}
