//! Daemon composition root
//!
//! Builds the orchestration core from configuration and exposes the
//! operations surface that transport adapters (HTTP/WS, CLI) bind to. The
//! daemon itself speaks no wire protocol.

use std::sync::Arc;

use eyre::{eyre, Result};
use tracing::info;

use crate::approval::ApprovalGate;
use crate::config::Config;
use crate::domain::{Approval, ApprovalStatus, Project, Session, SessionActivity, Task, TaskStatus};
use crate::events::{EventHub, Subscription};
use crate::git::{CliGitOps, GitOps};
use crate::hats::HatRegistry;
use crate::llm::{create_client, LlmClient, RetryPolicy};
use crate::prompts::PromptLoader;
use crate::quests::{ObjectiveDraft, QuestService};
use crate::scheduler::Scheduler;
use crate::session::{EngineDeps, NullToolRunner, SessionManager, ToolRunner};
use crate::state::StateManager;
use crate::tasks::{CreateTaskSpec, TaskService};
use crate::worktree::{WorktreeConfig, WorktreeManager};

/// Secret key the LLM API key is stored under
pub const SECRET_LLM_API_KEY: &str = "llm-api-key";

/// The assembled orchestration core
pub struct Daemon {
    pub config: Config,
    pub hub: Arc<EventHub>,
    pub state: StateManager,
    pub tasks: Arc<TaskService>,
    pub quests: Arc<QuestService>,
    pub sessions: Arc<SessionManager>,
    pub gate: Arc<ApprovalGate>,
    pub scheduler: Arc<Scheduler>,
}

impl Daemon {
    /// Build the core with production collaborators (Anthropic, git CLI)
    pub async fn new(config: Config) -> Result<Self> {
        let hub = Arc::new(EventHub::new());
        let state = StateManager::spawn_at(&config.storage.db_path, hub.clone())?;

        let api_key = state.get_secret(SECRET_LLM_API_KEY).await.ok().flatten();
        let llm = match create_client(&config.llm, api_key) {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(error = %e, "LLM client not configured; sessions will fail until a key is set");
                crate::llm::unconfigured_client(e.to_string())
            }
        };

        Self::with_collaborators(config, hub, state, llm, Arc::new(CliGitOps), Arc::new(NullToolRunner))
    }

    /// Build the core with explicit collaborators (tests, embedders)
    pub fn with_collaborators(
        config: Config,
        hub: Arc<EventHub>,
        state: StateManager,
        llm: Arc<dyn LlmClient>,
        git: Arc<dyn GitOps>,
        tools: Arc<dyn ToolRunner>,
    ) -> Result<Self> {
        let scheduler = Arc::new(Scheduler::new(config.scheduler.clone()));
        let hats = Arc::new(HatRegistry::from_config(&config.hats));
        let gate = Arc::new(ApprovalGate::new(state.clone()));
        let prompts = Arc::new(PromptLoader::embedded_only());
        let tasks = Arc::new(TaskService::new(state.clone(), hub.clone()));
        let worktrees = Arc::new(WorktreeManager::new(
            WorktreeConfig {
                base_dir: config.storage.base_dir.clone(),
            },
            git.clone(),
        ));

        let deps = EngineDeps {
            llm: llm.clone(),
            tools,
            prompts: prompts.clone(),
            state: state.clone(),
            hub: hub.clone(),
            gate: gate.clone(),
            rates: config.rates.clone(),
            retry: RetryPolicy::default(),
            session_cfg: config.session.clone(),
            model: config.llm.model.clone(),
        };

        let sessions = SessionManager::new(deps, scheduler.clone(), hats, worktrees, git, tasks.clone());
        let quests = Arc::new(QuestService::new(
            state.clone(),
            llm,
            prompts,
            RetryPolicy::default(),
            tasks.clone(),
        ));

        info!(max_concurrent = config.scheduler.max_concurrent, "Daemon assembled");

        Ok(Self {
            config,
            hub,
            state,
            tasks,
            quests,
            sessions,
            gate,
            scheduler,
        })
    }

    // === Projects ===

    pub async fn create_project(&self, name: &str, repo_path: &str, default_branch: &str) -> Result<Project> {
        Ok(self.state.create_project(name, repo_path, default_branch).await?)
    }

    /// The sole project, creating a default one on first use
    pub async fn default_project(&self, repo_path: &str, default_branch: &str) -> Result<Project> {
        let projects = self.state.list_projects().await?;
        match projects.into_iter().next() {
            Some(project) => Ok(project),
            None => self.create_project("default", repo_path, default_branch).await,
        }
    }

    // === Tasks ===

    pub async fn create_task(&self, spec: CreateTaskSpec) -> Result<Task> {
        Ok(self.tasks.create(spec).await?)
    }

    pub async fn get_task(&self, id: &str) -> Result<Task> {
        Ok(self.tasks.get_required(id).await?)
    }

    pub async fn list_tasks(&self, project_id: Option<&str>, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        Ok(self.tasks.list(project_id, status).await?)
    }

    pub async fn update_task(
        &self,
        id: &str,
        title: Option<&str>,
        description: Option<&str>,
        priority: Option<&str>,
    ) -> Result<Task> {
        Ok(self.tasks.update(id, title, description, priority).await?)
    }

    pub async fn delete_task(&self, id: &str) -> Result<()> {
        Ok(self.tasks.delete(id).await?)
    }

    pub async fn start_task(&self, id: &str) -> Result<Session> {
        self.sessions.start_task(id).await
    }

    pub async fn pause_task(&self, id: &str) -> Result<()> {
        let session = self
            .sessions
            .get_by_task(id)
            .await?
            .ok_or_else(|| eyre!("task {} has no active session", id))?;
        self.sessions.pause(&session.id).await
    }

    pub async fn resume_task(&self, id: &str) -> Result<()> {
        let session = self
            .sessions
            .get_by_task(id)
            .await?
            .ok_or_else(|| eyre!("task {} has no active session", id))?;
        self.sessions.resume(&session.id).await
    }

    pub async fn cancel_task(&self, id: &str) -> Result<()> {
        self.sessions.cancel_task(id).await
    }

    pub async fn task_logs(&self, id: &str) -> Result<Vec<SessionActivity>> {
        Ok(self.tasks.logs(id).await?)
    }

    // === Sessions ===

    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        Ok(self.sessions.list().await?)
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.get(id).await?)
    }

    pub async fn kill_session(&self, id: &str) -> Result<()> {
        self.sessions.stop(id).await
    }

    // === Approvals ===

    pub async fn list_approvals(&self, status: Option<ApprovalStatus>) -> Result<Vec<Approval>> {
        Ok(self.gate.list(status).await?)
    }

    pub async fn get_approval(&self, id: &str) -> Result<Option<Approval>> {
        Ok(self.gate.get(id).await?)
    }

    pub async fn approve(&self, id: &str) -> Result<Approval> {
        Ok(self.gate.resolve(id, ApprovalStatus::Approved).await?)
    }

    pub async fn reject(&self, id: &str) -> Result<Approval> {
        Ok(self.gate.resolve(id, ApprovalStatus::Rejected).await?)
    }

    // === Quests ===

    pub fn quests(&self) -> &QuestService {
        &self.quests
    }

    pub async fn create_objective(&self, quest_id: &str, draft: ObjectiveDraft) -> Result<Task> {
        self.quests.create_objective(quest_id, draft).await
    }

    // === Events ===

    /// Subscribe to the event stream with a topic pattern
    pub fn subscribe(&self, pattern: &str) -> Subscription {
        self.hub.subscribe(pattern)
    }

    /// Graceful shutdown: stop accepting work and drain the state actor
    pub async fn shutdown(&self) -> Result<()> {
        info!("Daemon shutting down");
        self.state.shutdown().await?;
        Ok(())
    }
}
