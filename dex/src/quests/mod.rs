//! Quest service: conversations that produce objectives
//!
//! A quest is a chat thread scoped to a project. Each user message runs one
//! chat call over the full history under the `quest` prompt; drafts shaped
//! in conversation become tasks through the task service.

use std::sync::Arc;

use eyre::Result;
use tracing::info;

use crate::domain::{MessageRole, Quest, QuestMessage, Task};
use crate::llm::{chat_with_retry, ChatRequest, LlmClient, Message, RetryPolicy};
use crate::prompts::{PromptContext, PromptLoader};
use crate::state::StateManager;
use crate::tasks::{CreateTaskSpec, TaskService};

/// An objective shaped in conversation, ready to become a task
#[derive(Debug, Clone, Default)]
pub struct ObjectiveDraft {
    pub title: String,
    pub description: String,
    pub hat: String,
    pub task_type: String,
    pub priority: String,
    pub deps: Vec<String>,
    pub auto_start: bool,
}

/// Quest CRUD and conversation driving
pub struct QuestService {
    state: StateManager,
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptLoader>,
    retry: RetryPolicy,
    tasks: Arc<TaskService>,
    max_response_tokens: u32,
}

impl QuestService {
    pub fn new(
        state: StateManager,
        llm: Arc<dyn LlmClient>,
        prompts: Arc<PromptLoader>,
        retry: RetryPolicy,
        tasks: Arc<TaskService>,
    ) -> Self {
        Self {
            state,
            llm,
            prompts,
            retry,
            tasks,
            max_response_tokens: 4096,
        }
    }

    pub async fn create(&self, project_id: &str, title: &str, model: &str) -> Result<Quest> {
        let quest = self.state.create_quest(project_id, title, model).await?;
        info!(quest_id = %quest.id, model = %quest.model, "Quest created");
        Ok(quest)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Quest>> {
        Ok(self.state.get_quest(id).await?)
    }

    pub async fn list(&self, project_id: Option<&str>) -> Result<Vec<Quest>> {
        Ok(self.state.list_quests(project_id).await?)
    }

    pub async fn messages(&self, quest_id: &str) -> Result<Vec<QuestMessage>> {
        Ok(self.state.list_quest_messages(quest_id).await?)
    }

    /// Append a user turn, run the model over the full history, append and
    /// return the assistant turn
    pub async fn send_message(&self, quest_id: &str, content: &str) -> Result<QuestMessage> {
        let quest = self.state.get_quest_required(quest_id).await?;

        self.state
            .append_quest_message(quest_id, MessageRole::User, content, serde_json::json!([]))
            .await?;

        let history: Vec<Message> = self
            .state
            .list_quest_messages(quest_id)
            .await?
            .into_iter()
            .map(|m| match m.role {
                MessageRole::User => Message::user(m.content),
                MessageRole::Assistant => Message::assistant(m.content),
            })
            .collect();

        let system_prompt = self.prompts.render(
            "quest",
            &PromptContext::new(&quest.title, "", std::path::Path::new("")),
        )?;
        let request = ChatRequest {
            system_prompt,
            messages: history,
            max_tokens: self.max_response_tokens,
        };

        let response = chat_with_retry(self.llm.as_ref(), request, &self.retry).await?;
        let reply = response.reply.unwrap_or_default();
        let tool_calls = serde_json::to_value(&response.tool_calls)?;

        let message = self
            .state
            .append_quest_message(quest_id, MessageRole::Assistant, &reply, tool_calls)
            .await?;
        Ok(message)
    }

    pub async fn complete(&self, id: &str) -> Result<Quest> {
        Ok(self.state.complete_quest(id).await?)
    }

    pub async fn reopen(&self, id: &str) -> Result<Quest> {
        Ok(self.state.reopen_quest(id).await?)
    }

    /// Turn a conversation draft into a real task on the quest's project
    pub async fn create_objective(&self, quest_id: &str, draft: ObjectiveDraft) -> Result<Task> {
        let quest = self.state.get_quest_required(quest_id).await?;
        let project = self.state.get_project_required(&quest.project_id).await?;

        let task = self
            .tasks
            .create(CreateTaskSpec {
                project_id: quest.project_id,
                quest_id: Some(quest.id),
                title: draft.title,
                description: draft.description,
                hat: if draft.hat.is_empty() { "planner".to_string() } else { draft.hat },
                task_type: if draft.task_type.is_empty() { "feature".to_string() } else { draft.task_type },
                priority: if draft.priority.is_empty() { "normal".to_string() } else { draft.priority },
                autonomy: "supervised".to_string(),
                base_branch: project.default_branch,
                deps: draft.deps,
                auto_start: draft.auto_start,
                ..Default::default()
            })
            .await?;

        info!(quest_id, task_id = %task.id, "Objective created from quest draft");
        Ok(task)
    }

    /// Every task spawned from this quest
    pub async fn tasks(&self, quest_id: &str) -> Result<Vec<Task>> {
        Ok(self.state.list_tasks_for_quest(quest_id).await?)
    }
}
