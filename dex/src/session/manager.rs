//! Session manager - orchestrates session engines
//!
//! Owns the in-memory `ActiveSession` map (one mutex), wires engines to the
//! scheduler, and handles what comes after an engine ends: hat transitions,
//! PR creation on terminal hats, and the dependency unblock cascade.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use eyre::{eyre, Result};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::{FailureReason, Session, SessionOutcome, SessionState, Task, TaskStatus};
use crate::events::{topics, Event};
use crate::git::GitOps;
use crate::hats::HatRegistry;
use crate::scheduler::Scheduler;
use crate::state::StateError;
use crate::tasks::TaskService;
use crate::worktree::WorktreeManager;

use super::control::SessionControl;
use super::engine::{EngineDeps, SessionEngine};

struct ActiveSession {
    control: SessionControl,
    #[allow(dead_code)]
    handle: JoinHandle<()>,
}

/// Orchestrates the lifecycle of all session engines
pub struct SessionManager {
    deps: EngineDeps,
    scheduler: Arc<Scheduler>,
    hats: Arc<HatRegistry>,
    worktrees: Arc<WorktreeManager>,
    git: Arc<dyn GitOps>,
    tasks: Arc<TaskService>,
    active: Mutex<HashMap<String, ActiveSession>>,
    /// Predecessor handoffs queued for sessions not yet started
    handoffs: Mutex<HashMap<String, String>>,
}

impl SessionManager {
    pub fn new(
        deps: EngineDeps,
        scheduler: Arc<Scheduler>,
        hats: Arc<HatRegistry>,
        worktrees: Arc<WorktreeManager>,
        git: Arc<dyn GitOps>,
        tasks: Arc<TaskService>,
    ) -> Arc<Self> {
        Arc::new(Self {
            deps,
            scheduler,
            hats,
            worktrees,
            git,
            tasks,
            active: Mutex::new(HashMap::new()),
            handoffs: Mutex::new(HashMap::new()),
        })
    }

    // === Public operations ===

    /// Create a session for a task under a given hat on a known worktree
    ///
    /// Refused while another non-terminal session exists for the task (store
    /// enforced).
    pub async fn create_session(&self, task_id: &str, hat: &str, worktree_path: &str) -> Result<Session, StateError> {
        let task = self.deps.state.get_task_required(task_id).await?;
        self.deps
            .state
            .create_session(task_id, hat, worktree_path, task.max_iterations)
            .await
    }

    /// Allocate a worktree for the task and create its first session
    pub async fn create_for_task(self: &Arc<Self>, task_id: &str) -> Result<Session> {
        let task = self.deps.state.get_task_required(task_id).await?;
        let project = self.deps.state.get_project_required(&task.project_id).await?;

        let placement = self.worktrees.allocate(&project, &task).await?;
        self.deps
            .state
            .set_task_worktree(&task.id, &placement.path().display().to_string(), placement.branch())
            .await?;

        match self.create_session(task_id, &task.hat, &placement.path().display().to_string()).await {
            Ok(session) => Ok(session),
            Err(e) => {
                // A failed create must not leak the worktree
                if let Err(cleanup_err) = self.worktrees.cleanup(&project, &task, &placement).await {
                    warn!(task_id = %task.id, error = %cleanup_err, "Worktree cleanup after failed create");
                }
                Err(e.into())
            }
        }
    }

    /// Start an idle session: acquire a permit, move the task to running,
    /// spawn the engine. Returns once the engine is spawned.
    pub async fn start(self: &Arc<Self>, session_id: &str) -> Result<()> {
        let session = self.deps.state.get_session_required(session_id).await?;
        if session.state != SessionState::Idle {
            return Err(eyre!("session {} is {}, expected idle", session_id, session.state));
        }
        let task = self.deps.state.get_task_required(&session.task_id).await?;

        self.scheduler.try_admit(session_id).map_err(|e| eyre!(e))?;

        if let Err(e) = self
            .deps
            .state
            .transition_task(&task.id, TaskStatus::Ready, TaskStatus::Running)
            .await
        {
            self.scheduler.release(session_id);
            return Err(e.into());
        }

        self.spawn_engine(session, task).await
    }

    /// Request a cooperative pause; takes effect at the next iteration
    /// boundary. Idempotent.
    pub async fn pause(&self, session_id: &str) -> Result<()> {
        let active = self.active.lock().expect("session map poisoned");
        if let Some(entry) = active.get(session_id) {
            entry.control.pause();
            debug!(session_id, "Pause requested");
            return Ok(());
        }
        drop(active);

        // Already paused is a no-op; anything else is an error
        let session = self.deps.state.get_session_required(session_id).await?;
        if session.state == SessionState::Paused {
            return Ok(());
        }
        Err(eyre!("session {} is not running", session_id))
    }

    /// Resume a paused session with preserved history and counters
    pub async fn resume(self: &Arc<Self>, session_id: &str) -> Result<()> {
        let session = self.deps.state.get_session_required(session_id).await?;
        if session.state != SessionState::Paused {
            return Err(eyre!("session {} is {}, expected paused", session_id, session.state));
        }
        let task = self.deps.state.get_task_required(&session.task_id).await?;

        self.scheduler.try_admit(session_id).map_err(|e| eyre!(e))?;

        if let Err(e) = self
            .deps
            .state
            .transition_task(&task.id, TaskStatus::Paused, TaskStatus::Running)
            .await
        {
            self.scheduler.release(session_id);
            return Err(e.into());
        }

        self.spawn_engine(session, task).await
    }

    /// Hard-stop a session; the engine cancels at its next suspension point
    pub async fn stop(&self, session_id: &str) -> Result<()> {
        let active = self.active.lock().expect("session map poisoned");
        if let Some(entry) = active.get(session_id) {
            entry.control.cancel();
            info!(session_id, "Stop requested");
            return Ok(());
        }
        drop(active);

        // Not running: cancel the row directly if it is still live
        let session = self.deps.state.get_session_required(session_id).await?;
        if session.state.is_terminal() {
            return Ok(());
        }
        self.deps
            .state
            .update_session_state(session_id, SessionState::Cancelled, None)
            .await?;
        let task = self.deps.state.get_task_required(&session.task_id).await?;
        if !task.status.is_terminal() {
            let _ = self.deps.state.transition_task(&task.id, task.status, TaskStatus::Cancelled).await;
        }
        Ok(())
    }

    /// Queue handoff text to inject as the session's first user turn
    pub fn set_predecessor_context(&self, session_id: &str, handoff: &str) {
        self.handoffs
            .lock()
            .expect("handoff map poisoned")
            .insert(session_id.to_string(), handoff.to_string());
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<Session>, StateError> {
        self.deps.state.get_session(session_id).await
    }

    pub async fn get_by_task(&self, task_id: &str) -> Result<Option<Session>, StateError> {
        self.deps.state.active_session_for_task(task_id).await
    }

    pub async fn list(&self) -> Result<Vec<Session>, StateError> {
        self.deps.state.list_sessions(None).await
    }

    /// Number of engines currently spawned
    pub fn running_count(&self) -> usize {
        self.active.lock().expect("session map poisoned").len()
    }

    // === Task-level conveniences ===

    /// Allocate, create and start in one step; a paused session resumes
    pub async fn start_task(self: &Arc<Self>, task_id: &str) -> Result<Session> {
        let session = match self.deps.state.active_session_for_task(task_id).await? {
            Some(session) if session.state == SessionState::Paused => {
                self.resume(&session.id).await?;
                return Ok(session);
            }
            Some(session) => session,
            None => {
                let session = self.create_for_task(task_id).await?;
                if let Err(e) = self.start(&session.id).await {
                    self.cleanup_failed_start(task_id, &session.id).await;
                    return Err(e);
                }
                return Ok(session);
            }
        };
        self.start(&session.id).await?;
        Ok(session)
    }

    /// Undo a start that never ran: cancel the session row and remove a
    /// worktree created for it (scratch dirs are kept)
    async fn cleanup_failed_start(&self, task_id: &str, session_id: &str) {
        if let Err(e) = self
            .deps
            .state
            .update_session_state(session_id, SessionState::Cancelled, None)
            .await
        {
            warn!(session_id, error = %e, "Failed to cancel session after failed start");
        }

        let Ok(task) = self.deps.state.get_task_required(task_id).await else {
            return;
        };
        // Only dedicated worktrees carry a branch name
        if task.branch_name.is_none() {
            return;
        }
        let Ok(project) = self.deps.state.get_project_required(&task.project_id).await else {
            return;
        };
        if let Err(e) = self.git.cleanup_task_worktree(Path::new(&project.repo_path), task_id, true).await {
            warn!(task_id, error = %e, "Failed to clean up worktree after failed start");
        }
    }

    /// Cancel a task and whatever session it is running
    pub async fn cancel_task(&self, task_id: &str) -> Result<()> {
        if let Some(session) = self.deps.state.active_session_for_task(task_id).await? {
            self.stop(&session.id).await?;
            return Ok(());
        }
        let task = self.deps.state.get_task_required(task_id).await?;
        if !task.status.is_terminal() {
            self.deps.state.transition_task(task_id, task.status, TaskStatus::Cancelled).await?;
        }
        Ok(())
    }

    // === Engine lifecycle ===

    fn spawn_engine(
        self: &Arc<Self>,
        session: Session,
        task: Task,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let session_id = session.id.clone();
            let task_id = task.id.clone();

            self.deps
                .state
                .update_session_state(&session_id, SessionState::Running, None)
                .await?;

            let handoff = self.handoffs.lock().expect("handoff map poisoned").remove(&session_id);
            let (control, handle) = SessionControl::new();
            let engine = SessionEngine::new(session, task, self.deps.clone(), handle, handoff);

            let manager = Arc::clone(self);
            let spawned_id = session_id.clone();
            let spawned_task = task_id.clone();
            let join = tokio::spawn(async move {
                let outcome = engine.run().await;
                manager.on_session_end(&spawned_id, &spawned_task, outcome).await;
            });

            self.active.lock().expect("session map poisoned").insert(
                session_id.clone(),
                ActiveSession { control, handle: join },
            );

            info!(session_id = %session_id, "Session engine spawned");
            Ok(())
        })
    }

    /// Handle an engine's outcome: release the permit, persist terminal
    /// state, then transitions, PRs and the unblock cascade
    async fn on_session_end(self: &Arc<Self>, session_id: &str, task_id: &str, outcome: SessionOutcome) {
        self.active.lock().expect("session map poisoned").remove(session_id);
        self.scheduler.release(session_id);

        debug!(session_id, ?outcome, "Session ended");

        let result = match outcome {
            SessionOutcome::Paused => self.finish_paused(session_id, task_id).await,
            SessionOutcome::Cancelled => self.finish_cancelled(session_id, task_id).await,
            SessionOutcome::Failed(reason) => self.finish_failed(session_id, task_id, reason).await,
            SessionOutcome::HatComplete => self.finish_hat_complete(session_id, task_id).await,
            SessionOutcome::Transition(hat) => self.finish_transition(session_id, task_id, &hat).await,
            SessionOutcome::Complete => self.finish_complete(session_id, task_id).await,
        };

        if let Err(e) = result {
            error!(session_id, error = %e, "Failed to finalize session outcome");
        }
    }

    async fn finish_paused(&self, session_id: &str, task_id: &str) -> Result<()> {
        self.deps.state.update_session_state(session_id, SessionState::Paused, None).await?;
        match self.deps.state.transition_task(task_id, TaskStatus::Running, TaskStatus::Paused).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn finish_cancelled(&self, session_id: &str, task_id: &str) -> Result<()> {
        self.deps
            .state
            .update_session_state(session_id, SessionState::Cancelled, None)
            .await?;
        let task = self.deps.state.get_task_required(task_id).await?;
        if !task.status.is_terminal() {
            let _ = self.deps.state.transition_task(task_id, task.status, TaskStatus::Cancelled).await;
        }
        Ok(())
    }

    async fn finish_failed(&self, session_id: &str, task_id: &str, reason: FailureReason) -> Result<()> {
        self.deps
            .state
            .update_session_state(session_id, SessionState::Failed, Some(&reason.detail()))
            .await?;
        match self.deps.state.transition_task(task_id, TaskStatus::Running, TaskStatus::Failed).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// HAT_COMPLETE on a non-terminal hat parks the task for the next hat;
    /// scheduling it is a caller decision, not automatic
    async fn finish_hat_complete(self: &Arc<Self>, session_id: &str, task_id: &str) -> Result<()> {
        let session = self
            .deps
            .state
            .update_session_state(session_id, SessionState::Completed, None)
            .await?;

        if self.hats.is_terminal(&session.hat) {
            // Terminal hat: hat completion completes the task
            return self.complete_task(task_id).await;
        }

        match self.deps.state.transition_task(task_id, TaskStatus::Running, TaskStatus::Paused).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Validate and perform a hat transition: same worktree, fresh session,
    /// iteration counter reset
    async fn finish_transition(self: &Arc<Self>, session_id: &str, task_id: &str, to_hat: &str) -> Result<()> {
        let session = self.deps.state.get_session_required(session_id).await?;
        let task = self.deps.state.get_task_required(task_id).await?;

        if !self.hats.can_transition(&session.hat, to_hat) {
            warn!(session_id, from = %session.hat, to = %to_hat, "Invalid hat transition");
            self.deps
                .state
                .update_session_state(session_id, SessionState::Failed, Some(FailureReason::InvalidTransition.as_str()))
                .await?;
            match self.deps.state.transition_task(task_id, TaskStatus::Running, TaskStatus::Failed).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }

        self.deps
            .state
            .update_session_state(session_id, SessionState::Completed, None)
            .await?;
        self.deps.state.set_task_hat(task_id, to_hat).await?;

        // Fresh session in the new hat on the same worktree; the task stays running
        let next = self
            .deps
            .state
            .create_session(task_id, to_hat, &session.worktree_path, task.max_iterations)
            .await?;

        self.scheduler.try_admit(&next.id).map_err(|e| eyre!(e))?;
        let task = self.deps.state.get_task_required(task_id).await?;
        info!(task_id, from = %session.hat, to = %to_hat, "Hat transition");
        self.spawn_engine(next, task).await
    }

    async fn finish_complete(self: &Arc<Self>, session_id: &str, task_id: &str) -> Result<()> {
        let session = self
            .deps
            .state
            .update_session_state(session_id, SessionState::Completed, None)
            .await?;

        let task = self.deps.state.get_task_required(task_id).await?;
        if self.hats.is_terminal(&session.hat) {
            self.open_pr(&task).await;
        }
        self.complete_task(task_id).await
    }

    /// Push the branch and open a PR; failure is surfaced but does not block
    /// task completion
    async fn open_pr(&self, task: &Task) {
        let Some(branch) = task.branch_name.clone() else {
            debug!(task_id = %task.id, "No branch recorded, skipping PR");
            return;
        };
        let Ok(project) = self.deps.state.get_project_required(&task.project_id).await else {
            return;
        };

        let body = format!("Automated change for task {}.\n\n{}", task.id, task.description);
        match self
            .git
            .push_and_open_pr(Path::new(&project.repo_path), &branch, &task.title, &body)
            .await
        {
            Ok(pr_number) => {
                if let Err(e) = self.deps.state.set_task_pr(&task.id, pr_number as i64).await {
                    warn!(task_id = %task.id, error = %e, "Failed to record PR number");
                }
            }
            Err(e) => {
                warn!(task_id = %task.id, branch = %branch, error = %e, "Failed to open PR");
            }
        }
    }

    /// Complete the task and run the unblock cascade
    async fn complete_task(self: &Arc<Self>, task_id: &str) -> Result<()> {
        match self.deps.state.transition_task(task_id, TaskStatus::Running, TaskStatus::Completed).await {
            Ok(_) => {}
            Err(e) if e.is_conflict() => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let completed = self.deps.state.get_task_required(task_id).await?;
        self.run_unblock_cascade(&completed).await
    }

    /// Unblock successors and auto-start the ones that ask for it
    async fn run_unblock_cascade(self: &Arc<Self>, completed: &Task) -> Result<()> {
        let handoff = self.tasks.build_handoff(completed).await?;
        let unblocked = self.tasks.unblock_successors(&completed.id).await?;

        for successor in unblocked {
            if !successor.auto_start {
                continue;
            }
            match self.auto_start(&successor, completed, &handoff).await {
                Ok(worktree_path) => {
                    info!(task_id = %successor.id, "Auto-started successor");
                    self.deps.hub.publish(Event::new(
                        topics::TASK_AUTO_STARTED,
                        serde_json::json!({
                            "task_id": successor.id,
                            "predecessor_id": completed.id,
                            "worktree_path": worktree_path,
                        }),
                    ));
                }
                Err(e) => {
                    warn!(task_id = %successor.id, error = %e, "Auto-start failed");
                    self.deps.hub.publish(Event::new(
                        topics::TASK_AUTO_START_FAILED,
                        serde_json::json!({
                            "task_id": successor.id,
                            "predecessor_id": completed.id,
                            "error": e.to_string(),
                        }),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Start a successor, inheriting the predecessor's worktree when it
    /// still exists
    async fn auto_start(self: &Arc<Self>, successor: &Task, predecessor: &Task, handoff: &str) -> Result<String> {
        let session = match WorktreeManager::inherit(predecessor.worktree_path.as_deref()) {
            Some(inherited) => {
                let path = inherited.display().to_string();
                self.deps
                    .state
                    .set_task_worktree(&successor.id, &path, predecessor.branch_name.as_deref())
                    .await?;
                self.create_session(&successor.id, &successor.hat, &path).await?
            }
            None => {
                debug!(task_id = %successor.id, "Predecessor worktree gone, allocating fresh");
                self.create_for_task(&successor.id).await?
            }
        };

        self.set_predecessor_context(&session.id, handoff);
        self.start(&session.id).await?;
        Ok(session.worktree_path)
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("running", &self.running_count())
            .finish()
    }
}
