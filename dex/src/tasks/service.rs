//! Task service: status FSM, dependency resolution, unblock cascade
//!
//! All transitions go through the store's compare-and-swap so concurrent
//! completions are safe: the loser of a race sees a conflict and treats it
//! as a no-op.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info};

use crate::domain::{ChecklistStatus, NewTask, SessionActivity, Task, TaskStatus};
use crate::events::{topics, Event, EventHub};
use crate::state::{StateManager, StateResponse};

/// Parameters for creating a task through the service
#[derive(Debug, Clone, Default)]
pub struct CreateTaskSpec {
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

/// Task CRUD and dependency engine
pub struct TaskService {
    state: StateManager,
    hub: Arc<EventHub>,
}

impl TaskService {
    pub fn new(state: StateManager, hub: Arc<EventHub>) -> Self {
        Self { state, hub }
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    /// Create a task and place it by dependency state
    ///
    /// New tasks land in `ready`, or `blocked` when any dependency is not
    /// yet completed. Dependency edges must keep the project graph acyclic.
    pub async fn create(&self, spec: CreateTaskSpec) -> StateResponse<Task> {
        let existing = self.state.list_tasks(Some(&spec.project_id), None).await?;
        if let Some(cycle) = detect_cycle(&existing, &spec.deps) {
            return Err(crate::state::StateError::Store(dexstore::StoreError::BadInput(format!(
                "dependency cycle: {}",
                cycle.join(" -> ")
            ))));
        }

        let deps = spec.deps.clone();
        let task = self
            .state
            .create_task(NewTask {
                project_id: spec.project_id,
                quest_id: spec.quest_id,
                title: spec.title,
                description: spec.description,
                hat: spec.hat,
                task_type: spec.task_type,
                priority: spec.priority,
                autonomy: spec.autonomy,
                base_branch: spec.base_branch,
                max_iterations: spec.max_iterations,
                max_tokens: spec.max_tokens,
                max_dollars: spec.max_dollars,
                deps,
                auto_start: spec.auto_start,
            })
            .await?;

        let task = self.state.transition_task(&task.id, TaskStatus::Pending, TaskStatus::Ready).await?;
        let task = if self.deps_met(&task).await? {
            task
        } else {
            self.state.transition_task(&task.id, TaskStatus::Ready, TaskStatus::Blocked).await?
        };

        info!(task_id = %task.id, status = %task.status, deps = task.deps.len(), "Task created");
        Ok(task)
    }

    async fn deps_met(&self, task: &Task) -> StateResponse<bool> {
        for dep_id in &task.deps {
            match self.state.get_task(dep_id).await? {
                Some(dep) if dep.status == TaskStatus::Completed => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    pub async fn get(&self, id: &str) -> StateResponse<Option<Task>> {
        self.state.get_task(id).await
    }

    pub async fn get_required(&self, id: &str) -> StateResponse<Task> {
        self.state.get_task_required(id).await
    }

    pub async fn list(&self, project_id: Option<&str>, status: Option<TaskStatus>) -> StateResponse<Vec<Task>> {
        self.state.list_tasks(project_id, status).await
    }

    pub async fn update(
        &self,
        id: &str,
        title: Option<&str>,
        description: Option<&str>,
        priority: Option<&str>,
    ) -> StateResponse<Task> {
        self.state.update_task(id, title, description, priority).await
    }

    pub async fn delete(&self, id: &str) -> StateResponse<()> {
        self.state.delete_task(id).await
    }

    /// Activity rows for every session the task has run
    pub async fn logs(&self, task_id: &str) -> StateResponse<Vec<SessionActivity>> {
        let sessions = self.state.list_sessions(None).await?;
        let mut rows = Vec::new();
        for session in sessions.into_iter().filter(|s| s.task_id == task_id) {
            rows.extend(self.state.list_session_activity(&session.id).await?);
        }
        Ok(rows)
    }

    /// Build the predecessor handoff summary for successors
    pub async fn build_handoff(&self, completed: &Task) -> StateResponse<String> {
        let items = self.state.list_checklist_items(&completed.id).await?;
        let done: Vec<&str> = items
            .iter()
            .filter(|i| i.status == ChecklistStatus::Done)
            .map(|i| i.description.as_str())
            .collect();

        let mut handoff = format!("Predecessor task completed: {}\n\n{}\n", completed.title, completed.description);
        if let Some(worktree) = &completed.worktree_path {
            handoff.push_str(&format!("\nWorktree: {}", worktree));
        }
        if let Some(branch) = &completed.branch_name {
            handoff.push_str(&format!("\nBranch: {}", branch));
        }
        if !done.is_empty() {
            handoff.push_str("\n\nCompleted checklist items:");
            for item in done {
                handoff.push_str(&format!("\n- {}", item));
            }
        }
        handoff.push_str("\n\nContinue from where the previous task left off; reuse the same working directory.");
        Ok(handoff)
    }

    /// Move every task unblocked by this completion to `ready`
    ///
    /// Single-shot per completion: a racing cascade loses the
    /// compare-and-swap and skips the task.
    pub async fn unblock_successors(&self, completed_id: &str) -> StateResponse<Vec<Task>> {
        let candidates = self.state.tasks_unblocked_by(completed_id).await?;
        let mut unblocked = Vec::new();

        for task in candidates {
            match self.state.transition_task(&task.id, TaskStatus::Blocked, TaskStatus::Ready).await {
                Ok(task) => {
                    info!(task_id = %task.id, unblocked_by = completed_id, "Task unblocked");
                    self.hub.publish(Event::task(topics::TASK_UNBLOCKED, &task));
                    unblocked.push(task);
                }
                Err(e) if e.is_conflict() => {
                    debug!(task_id = %task.id, "Lost unblock race, skipping");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(unblocked)
    }
}

/// Check whether adding a task with `new_deps` would close a cycle
///
/// Returns the offending path when the existing graph plus the new edges
/// contains a cycle. DFS over the dependency edges.
pub fn detect_cycle(tasks: &[Task], new_deps: &[String]) -> Option<Vec<String>> {
    const NEW_TASK: &str = "\u{0}new";

    let mut graph: HashMap<&str, Vec<&str>> = tasks
        .iter()
        .map(|t| (t.id.as_str(), t.deps.iter().map(String::as_str).collect()))
        .collect();
    graph.insert(NEW_TASK, new_deps.iter().map(String::as_str).collect());

    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    for node in graph.keys().copied().collect::<Vec<_>>() {
        if !visited.contains(node) && dfs(node, &graph, &mut visited, &mut rec_stack, &mut path) {
            return Some(path.into_iter().filter(|n| *n != NEW_TASK).map(String::from).collect());
        }
    }
    None
}

fn dfs<'a>(
    node: &'a str,
    graph: &HashMap<&'a str, Vec<&'a str>>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> bool {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    if let Some(deps) = graph.get(node) {
        for dep in deps {
            if !visited.contains(dep) {
                if graph.contains_key(dep) && dfs(dep, graph, visited, rec_stack, path) {
                    return true;
                }
            } else if rec_stack.contains(dep) {
                path.push(dep);
                return true;
            }
        }
    }

    rec_stack.remove(node);
    path.pop();
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventHub;
    use dexstore::Store;

    fn service() -> (Arc<TaskService>, Arc<EventHub>, StateManager) {
        let hub = Arc::new(EventHub::new());
        let state = StateManager::spawn(Store::open_in_memory().unwrap(), hub.clone());
        (Arc::new(TaskService::new(state.clone(), hub.clone())), hub, state)
    }

    fn spec(project_id: &str, title: &str, deps: Vec<String>) -> CreateTaskSpec {
        CreateTaskSpec {
            project_id: project_id.to_string(),
            title: title.to_string(),
            description: "desc".to_string(),
            hat: "creator".to_string(),
            task_type: "feature".to_string(),
            priority: "normal".to_string(),
            autonomy: "supervised".to_string(),
            base_branch: "main".to_string(),
            deps,
            ..Default::default()
        }
    }

    async fn complete(state: &StateManager, id: &str) {
        state.transition_task(id, TaskStatus::Ready, TaskStatus::Running).await.unwrap();
        state.transition_task(id, TaskStatus::Running, TaskStatus::Completed).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_places_ready_without_deps() {
        let (service, _hub, state) = service();
        let project = state.create_project("p", "/tmp/r", "main").await.unwrap();

        let task = service.create(spec(&project.id, "a", vec![])).await.unwrap();
        assert_eq!(task.status, TaskStatus::Ready);
    }

    #[tokio::test]
    async fn test_create_places_blocked_with_unmet_deps() {
        let (service, _hub, state) = service();
        let project = state.create_project("p", "/tmp/r", "main").await.unwrap();

        let a = service.create(spec(&project.id, "a", vec![])).await.unwrap();
        let b = service.create(spec(&project.id, "b", vec![a.id.clone()])).await.unwrap();
        assert_eq!(b.status, TaskStatus::Blocked);
    }

    #[tokio::test]
    async fn test_create_places_ready_when_deps_completed() {
        let (service, _hub, state) = service();
        let project = state.create_project("p", "/tmp/r", "main").await.unwrap();

        let a = service.create(spec(&project.id, "a", vec![])).await.unwrap();
        complete(&state, &a.id).await;

        let b = service.create(spec(&project.id, "b", vec![a.id.clone()])).await.unwrap();
        assert_eq!(b.status, TaskStatus::Ready);
    }

    #[tokio::test]
    async fn test_diamond_dependencies_allowed() {
        let (service, _hub, state) = service();
        let project = state.create_project("p", "/tmp/r", "main").await.unwrap();

        let a = service.create(spec(&project.id, "a", vec![])).await.unwrap();
        let b = service.create(spec(&project.id, "b", vec![a.id.clone()])).await.unwrap();
        let c = service.create(spec(&project.id, "c", vec![a.id.clone()])).await.unwrap();
        let d = service.create(spec(&project.id, "d", vec![b.id.clone(), c.id.clone()])).await.unwrap();
        assert_eq!(d.status, TaskStatus::Blocked);
        assert_eq!(d.deps.len(), 2);
    }

    #[tokio::test]
    async fn test_unblock_successors() {
        let (service, hub, state) = service();
        let project = state.create_project("p", "/tmp/r", "main").await.unwrap();

        let a = service.create(spec(&project.id, "a", vec![])).await.unwrap();
        let b = service.create(spec(&project.id, "b", vec![a.id.clone()])).await.unwrap();
        assert_eq!(b.status, TaskStatus::Blocked);

        complete(&state, &a.id).await;

        let mut sub = hub.subscribe("task.unblocked");
        let unblocked = service.unblock_successors(&a.id).await.unwrap();
        assert_eq!(unblocked.len(), 1);
        assert_eq!(unblocked[0].id, b.id);
        assert_eq!(unblocked[0].status, TaskStatus::Ready);

        let event = sub.recv().await.unwrap();
        assert_eq!(event.payload["task_id"], b.id.as_str());
    }

    #[tokio::test]
    async fn test_unblock_cascade_is_single_shot() {
        let (service, _hub, state) = service();
        let project = state.create_project("p", "/tmp/r", "main").await.unwrap();

        let a = service.create(spec(&project.id, "a", vec![])).await.unwrap();
        let b = service.create(spec(&project.id, "b", vec![a.id.clone()])).await.unwrap();
        complete(&state, &a.id).await;

        let first = service.unblock_successors(&a.id).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, b.id);

        // A second cascade for the same completion finds nothing blocked
        let second = service.unblock_successors(&a.id).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_handoff_content() {
        let (service, _hub, state) = service();
        let project = state.create_project("p", "/tmp/r", "main").await.unwrap();
        let a = service.create(spec(&project.id, "Build parser", vec![])).await.unwrap();

        state.set_task_worktree(&a.id, "/w/r/.worktrees/task-a", Some("task/a")).await.unwrap();
        let done = state.add_checklist_item(&a.id, "write lexer", 1).await.unwrap();
        state.add_checklist_item(&a.id, "write docs", 2).await.unwrap();
        state
            .update_checklist_item(&done.id, ChecklistStatus::Done, None)
            .await
            .unwrap();

        let completed = state.get_task_required(&a.id).await.unwrap();
        let handoff = service.build_handoff(&completed).await.unwrap();

        assert!(handoff.contains("Build parser"));
        assert!(handoff.contains("/w/r/.worktrees/task-a"));
        assert!(handoff.contains("task/a"));
        assert!(handoff.contains("- write lexer"));
        assert!(!handoff.contains("- write docs"));
        assert!(handoff.contains("Continue from where the previous task left off"));
    }

    #[test]
    fn test_detect_cycle_in_existing_graph() {
        let mut tasks = Vec::new();
        let mut store = Store::open_in_memory().unwrap();
        let project = store.create_project("p", "/tmp/r", "main").unwrap();
        for title in ["a", "b"] {
            tasks.push(
                store
                    .create_task(dexstore::NewTask {
                        project_id: project.id.clone(),
                        title: title.to_string(),
                        hat: "creator".to_string(),
                        task_type: "feature".to_string(),
                        priority: "normal".to_string(),
                        autonomy: "supervised".to_string(),
                        base_branch: "main".to_string(),
                        ..Default::default()
                    })
                    .unwrap(),
            );
        }
        // Manufacture a cycle in memory: a -> b -> a
        tasks[0].deps = vec![tasks[1].id.clone()];
        tasks[1].deps = vec![tasks[0].id.clone()];

        assert!(detect_cycle(&tasks, &[]).is_some());
        assert!(detect_cycle(&tasks[..1], &[]).is_none());
    }

    #[test]
    fn test_detect_cycle_clean_graph() {
        assert!(detect_cycle(&[], &["x".to_string()]).is_none());
    }
}
