//! Core Store implementation
//!
//! One SQLite connection per store. Writes that change a visible status run
//! inside a transaction and verify the expected prior state, so racing
//! callers get a `Conflict` instead of clobbering each other.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::id::generate_id;
use crate::records::{
    allowed_transition, Approval, ApprovalStatus, ChecklistItem, ChecklistStatus, MessageRole, NewTask, Project,
    Quest, QuestMessage, QuestStatus, Session, SessionActivity, SessionMessage, SessionState, Task, TaskStatus,
};
use crate::Result;

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_opt_ts(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn parse_json(s: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

/// The durable store
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::BadInput(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(path)?;
        crate::schema::migrate(&conn)?;
        info!(path = %path.display(), "Opened store");
        Ok(Self { conn })
    }

    /// Open an in-memory store (used by tests and ephemeral daemons)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        crate::schema::migrate(&conn)?;
        debug!("Opened in-memory store");
        Ok(Self { conn })
    }

    // === Projects ===

    pub fn create_project(&mut self, name: &str, repo_path: &str, default_branch: &str) -> Result<Project> {
        let project = Project {
            id: generate_id("project", name),
            name: name.to_string(),
            repo_path: repo_path.to_string(),
            default_branch: default_branch.to_string(),
            remote: None,
            created_at: Utc::now(),
        };
        self.conn.execute(
            "INSERT INTO projects (id, name, repo_path, default_branch, remote, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                project.id,
                project.name,
                project.repo_path,
                project.default_branch,
                project.remote,
                project.created_at.to_rfc3339(),
            ],
        )?;
        debug!(project_id = %project.id, "Created project");
        Ok(project)
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let project = self
            .conn
            .query_row(
                "SELECT id, name, repo_path, default_branch, remote, created_at FROM projects WHERE id = ?1",
                [id],
                |row| {
                    Ok(Project {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        repo_path: row.get(2)?,
                        default_branch: row.get(3)?,
                        remote: row.get(4)?,
                        created_at: parse_ts(&row.get::<_, String>(5)?)?,
                    })
                },
            )
            .optional()?;
        Ok(project)
    }

    pub fn get_project_required(&self, id: &str) -> Result<Project> {
        self.get_project(id)?.ok_or_else(|| StoreError::NotFound(format!("project {}", id)))
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, repo_path, default_branch, remote, created_at FROM projects ORDER BY created_at",
        )?;
        let projects = stmt
            .query_map([], |row| {
                Ok(Project {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    repo_path: row.get(2)?,
                    default_branch: row.get(3)?,
                    remote: row.get(4)?,
                    created_at: parse_ts(&row.get::<_, String>(5)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(projects)
    }

    // === Tasks ===

    fn map_task(row: &Row<'_>) -> rusqlite::Result<Task> {
        Ok(Task {
            id: row.get(0)?,
            project_id: row.get(1)?,
            quest_id: row.get(2)?,
            title: row.get(3)?,
            description: row.get(4)?,
            hat: row.get(5)?,
            task_type: row.get(6)?,
            priority: row.get(7)?,
            autonomy: row.get(8)?,
            status: TaskStatus::parse(&row.get::<_, String>(9)?).unwrap_or(TaskStatus::Pending),
            base_branch: row.get(10)?,
            worktree_path: row.get(11)?,
            branch_name: row.get(12)?,
            pr_number: row.get(13)?,
            max_iterations: row.get(14)?,
            max_tokens: row.get::<_, Option<i64>>(15)?.map(|v| v as u64),
            max_dollars: row.get(16)?,
            used_iterations: row.get(17)?,
            used_tokens: row.get::<_, i64>(18)? as u64,
            used_dollars: row.get(19)?,
            deps: Vec::new(),
            auto_start: row.get::<_, i64>(20)? != 0,
            created_at: parse_ts(&row.get::<_, String>(21)?)?,
            started_at: parse_opt_ts(row.get(22)?)?,
            completed_at: parse_opt_ts(row.get(23)?)?,
        })
    }

    const TASK_COLUMNS: &'static str = "id, project_id, quest_id, title, description, hat, task_type, priority, \
         autonomy, status, base_branch, worktree_path, branch_name, pr_number, max_iterations, max_tokens, \
         max_dollars, used_iterations, used_tokens, used_dollars, auto_start, created_at, started_at, completed_at";

    fn load_deps(&self, task_id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT depends_on_task_id FROM task_deps WHERE task_id = ?1 ORDER BY depends_on_task_id")?;
        let deps = stmt
            .query_map([task_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(deps)
    }

    /// Create a task with status `pending` and its dependency edges
    ///
    /// Every dependency must already exist; a task cannot depend on itself.
    pub fn create_task(&mut self, new: NewTask) -> Result<Task> {
        let id = generate_id("task", &new.title);
        if new.deps.iter().any(|d| d == &id) {
            return Err(StoreError::BadInput("task cannot depend on itself".to_string()));
        }

        let created_at = now();
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO tasks (id, project_id, quest_id, title, description, hat, task_type, priority, autonomy, \
             status, base_branch, max_iterations, max_tokens, max_dollars, auto_start, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                id,
                new.project_id,
                new.quest_id,
                new.title,
                new.description,
                new.hat,
                new.task_type,
                new.priority,
                new.autonomy,
                TaskStatus::Pending.as_str(),
                new.base_branch,
                new.max_iterations,
                new.max_tokens.map(|v| v as i64),
                new.max_dollars,
                new.auto_start as i64,
                created_at,
            ],
        )?;

        for dep in &new.deps {
            let exists: Option<String> = tx
                .query_row("SELECT id FROM tasks WHERE id = ?1", [dep], |row| row.get(0))
                .optional()?;
            if exists.is_none() {
                return Err(StoreError::NotFound(format!("dependency task {}", dep)));
            }
            tx.execute(
                "INSERT INTO task_deps (task_id, depends_on_task_id) VALUES (?1, ?2)",
                params![id, dep],
            )?;
        }
        tx.commit()?;

        debug!(task_id = %id, deps = new.deps.len(), "Created task");
        self.get_task_required(&id)
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let sql = format!("SELECT {} FROM tasks WHERE id = ?1", Self::TASK_COLUMNS);
        let task = self.conn.query_row(&sql, [id], Self::map_task).optional()?;
        match task {
            Some(mut task) => {
                task.deps = self.load_deps(&task.id)?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    pub fn get_task_required(&self, id: &str) -> Result<Task> {
        self.get_task(id)?.ok_or_else(|| StoreError::NotFound(format!("task {}", id)))
    }

    pub fn list_tasks(&self, project_id: Option<&str>, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks
             WHERE (?1 IS NULL OR project_id = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at",
            Self::TASK_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut tasks = stmt
            .query_map(params![project_id, status.map(|s| s.as_str())], Self::map_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        for task in &mut tasks {
            task.deps = self.load_deps(&task.id)?;
        }
        Ok(tasks)
    }

    pub fn list_tasks_for_quest(&self, quest_id: &str) -> Result<Vec<Task>> {
        let sql = format!("SELECT {} FROM tasks WHERE quest_id = ?1 ORDER BY created_at", Self::TASK_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let mut tasks = stmt.query_map([quest_id], Self::map_task)?.collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        for task in &mut tasks {
            task.deps = self.load_deps(&task.id)?;
        }
        Ok(tasks)
    }

    /// Atomically move a task from `from` to `to`
    ///
    /// Fails with `Conflict` when the current status is not `from` (a racing
    /// writer won) and `InvalidTransition` when the edge is not in the FSM.
    /// Timestamps move with the status in the same commit: `started_at` on
    /// the first `running`, `completed_at` on any terminal state.
    pub fn transition_task_status(&mut self, id: &str, from: TaskStatus, to: TaskStatus) -> Result<Task> {
        if !allowed_transition(from, to) {
            return Err(StoreError::InvalidTransition { from, to });
        }

        let tx = self.conn.transaction()?;
        let current: Option<String> = tx
            .query_row("SELECT status FROM tasks WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        let current = current.ok_or_else(|| StoreError::NotFound(format!("task {}", id)))?;
        let current = TaskStatus::parse(&current)
            .ok_or_else(|| StoreError::BadInput(format!("task {} has unknown status {}", id, current)))?;
        if current != from {
            return Err(StoreError::Conflict(format!(
                "task {} is {}, expected {}",
                id, current, from
            )));
        }

        let ts = now();
        tx.execute(
            "UPDATE tasks SET status = ?2,
                 started_at = CASE WHEN ?2 = 'running' AND started_at IS NULL THEN ?3 ELSE started_at END,
                 completed_at = CASE WHEN ?2 IN ('completed', 'failed', 'cancelled') THEN ?3 ELSE completed_at END
             WHERE id = ?1",
            params![id, to.as_str(), ts],
        )?;
        tx.commit()?;

        debug!(task_id = %id, %from, %to, "Task transitioned");
        self.get_task_required(id)
    }

    pub fn set_task_worktree(&mut self, id: &str, worktree_path: &str, branch_name: Option<&str>) -> Result<()> {
        let n = self.conn.execute(
            "UPDATE tasks SET worktree_path = ?2, branch_name = ?3 WHERE id = ?1",
            params![id, worktree_path, branch_name],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("task {}", id)));
        }
        Ok(())
    }

    pub fn set_task_pr(&mut self, id: &str, pr_number: i64) -> Result<()> {
        let n = self
            .conn
            .execute("UPDATE tasks SET pr_number = ?2 WHERE id = ?1", params![id, pr_number])?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("task {}", id)));
        }
        Ok(())
    }

    pub fn set_task_hat(&mut self, id: &str, hat: &str) -> Result<()> {
        let n = self.conn.execute("UPDATE tasks SET hat = ?2 WHERE id = ?1", params![id, hat])?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("task {}", id)));
        }
        Ok(())
    }

    pub fn update_task(&mut self, id: &str, title: Option<&str>, description: Option<&str>, priority: Option<&str>) -> Result<Task> {
        let n = self.conn.execute(
            "UPDATE tasks SET title = COALESCE(?2, title), description = COALESCE(?3, description), \
             priority = COALESCE(?4, priority) WHERE id = ?1",
            params![id, title, description, priority],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("task {}", id)));
        }
        self.get_task_required(id)
    }

    /// Accumulate budget usage counters on the task row
    pub fn add_task_usage(&mut self, id: &str, iterations: u32, tokens: u64, dollars: f64) -> Result<()> {
        let n = self.conn.execute(
            "UPDATE tasks SET used_iterations = used_iterations + ?2, used_tokens = used_tokens + ?3, \
             used_dollars = used_dollars + ?4 WHERE id = ?1",
            params![id, iterations, tokens as i64, dollars],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("task {}", id)));
        }
        Ok(())
    }

    /// Delete a task and its edges; refused while the task is running
    pub fn delete_task(&mut self, id: &str) -> Result<()> {
        let task = self.get_task_required(id)?;
        if task.status == TaskStatus::Running {
            return Err(StoreError::Conflict(format!("task {} is running", id)));
        }
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM task_deps WHERE task_id = ?1 OR depends_on_task_id = ?1", [id])?;
        tx.execute("DELETE FROM checklist_items WHERE task_id = ?1", [id])?;
        tx.execute("DELETE FROM tasks WHERE id = ?1", [id])?;
        tx.commit()?;
        debug!(task_id = %id, "Deleted task");
        Ok(())
    }

    pub fn add_dependency(&mut self, task_id: &str, depends_on: &str) -> Result<()> {
        if task_id == depends_on {
            return Err(StoreError::BadInput("task cannot depend on itself".to_string()));
        }
        self.get_task_required(task_id)?;
        self.get_task_required(depends_on)?;
        self.conn.execute(
            "INSERT OR IGNORE INTO task_deps (task_id, depends_on_task_id) VALUES (?1, ?2)",
            params![task_id, depends_on],
        )?;
        Ok(())
    }

    /// All `blocked` tasks that depend on `completed_id` and whose
    /// dependencies are now all `completed`
    pub fn tasks_unblocked_by(&self, completed_id: &str) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks t
             JOIN task_deps d ON d.task_id = t.id AND d.depends_on_task_id = ?1
             WHERE t.status = 'blocked'
               AND NOT EXISTS (
                   SELECT 1 FROM task_deps d2
                   JOIN tasks dep ON dep.id = d2.depends_on_task_id
                   WHERE d2.task_id = t.id AND dep.status != 'completed'
               )
             ORDER BY t.created_at",
            Self::TASK_COLUMNS
                .split(", ")
                .map(|c| format!("t.{}", c))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut tasks = stmt.query_map([completed_id], Self::map_task)?.collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        for task in &mut tasks {
            task.deps = self.load_deps(&task.id)?;
        }
        Ok(tasks)
    }

    // === Checklists ===

    pub fn add_checklist_item(&mut self, task_id: &str, description: &str, sort_order: i64) -> Result<ChecklistItem> {
        self.get_task_required(task_id)?;
        let item = ChecklistItem {
            id: generate_id("check", description),
            task_id: task_id.to_string(),
            description: description.to_string(),
            status: ChecklistStatus::Pending,
            verification_notes: None,
            sort_order,
        };
        self.conn.execute(
            "INSERT INTO checklist_items (id, task_id, description, status, verification_notes, sort_order)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                item.id,
                item.task_id,
                item.description,
                item.status.as_str(),
                item.verification_notes,
                item.sort_order,
            ],
        )?;
        Ok(item)
    }

    pub fn update_checklist_item_status(
        &mut self,
        id: &str,
        status: ChecklistStatus,
        verification_notes: Option<&str>,
    ) -> Result<ChecklistItem> {
        let n = self.conn.execute(
            "UPDATE checklist_items SET status = ?2, verification_notes = COALESCE(?3, verification_notes) WHERE id = ?1",
            params![id, status.as_str(), verification_notes],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("checklist item {}", id)));
        }
        self.conn
            .query_row(
                "SELECT id, task_id, description, status, verification_notes, sort_order FROM checklist_items WHERE id = ?1",
                [id],
                Self::map_checklist_item,
            )
            .map_err(StoreError::from)
    }

    fn map_checklist_item(row: &Row<'_>) -> rusqlite::Result<ChecklistItem> {
        Ok(ChecklistItem {
            id: row.get(0)?,
            task_id: row.get(1)?,
            description: row.get(2)?,
            status: ChecklistStatus::parse(&row.get::<_, String>(3)?).unwrap_or(ChecklistStatus::Pending),
            verification_notes: row.get(4)?,
            sort_order: row.get(5)?,
        })
    }

    pub fn list_checklist_items(&self, task_id: &str) -> Result<Vec<ChecklistItem>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, task_id, description, status, verification_notes, sort_order
             FROM checklist_items WHERE task_id = ?1 ORDER BY sort_order",
        )?;
        let items = stmt
            .query_map([task_id], Self::map_checklist_item)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    /// A checklist is done iff every item is `done` (an empty checklist is not)
    pub fn checklist_done(&self, task_id: &str) -> Result<bool> {
        let total: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM checklist_items WHERE task_id = ?1", [task_id], |row| row.get(0))?;
        if total == 0 {
            return Ok(false);
        }
        let done: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM checklist_items WHERE task_id = ?1 AND status = 'done'",
            [task_id],
            |row| row.get(0),
        )?;
        Ok(done == total)
    }

    // === Sessions ===

    fn map_session(row: &Row<'_>) -> rusqlite::Result<Session> {
        Ok(Session {
            id: row.get(0)?,
            task_id: row.get(1)?,
            hat: row.get(2)?,
            worktree_path: row.get(3)?,
            state: SessionState::parse(&row.get::<_, String>(4)?).unwrap_or(SessionState::Idle),
            failure_reason: row.get(5)?,
            iteration: row.get(6)?,
            max_iterations: row.get(7)?,
            input_tokens: row.get::<_, i64>(8)? as u64,
            output_tokens: row.get::<_, i64>(9)? as u64,
            started_at: parse_opt_ts(row.get(10)?)?,
            last_activity: parse_opt_ts(row.get(11)?)?,
        })
    }

    const SESSION_COLUMNS: &'static str = "id, task_id, hat, worktree_path, state, failure_reason, iteration, \
         max_iterations, input_tokens, output_tokens, started_at, last_activity";

    /// Create an `idle` session; refused while another non-terminal session
    /// exists for the task
    pub fn create_session(
        &mut self,
        task_id: &str,
        hat: &str,
        worktree_path: &str,
        max_iterations: Option<u32>,
    ) -> Result<Session> {
        self.get_task_required(task_id)?;
        let live: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE task_id = ?1 AND state IN ('idle', 'running', 'paused')",
            [task_id],
            |row| row.get(0),
        )?;
        if live > 0 {
            return Err(StoreError::Conflict(format!("task {} already has an active session", task_id)));
        }

        let session = Session {
            id: generate_id("session", hat),
            task_id: task_id.to_string(),
            hat: hat.to_string(),
            worktree_path: worktree_path.to_string(),
            state: SessionState::Idle,
            failure_reason: None,
            iteration: 0,
            max_iterations,
            input_tokens: 0,
            output_tokens: 0,
            started_at: None,
            last_activity: None,
        };
        self.conn.execute(
            "INSERT INTO sessions (id, task_id, hat, worktree_path, state, iteration, max_iterations, \
             input_tokens, output_tokens)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, 0, 0)",
            params![
                session.id,
                session.task_id,
                session.hat,
                session.worktree_path,
                session.state.as_str(),
                session.max_iterations,
            ],
        )?;
        debug!(session_id = %session.id, task_id = %task_id, hat = %hat, "Created session");
        Ok(session)
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let sql = format!("SELECT {} FROM sessions WHERE id = ?1", Self::SESSION_COLUMNS);
        Ok(self.conn.query_row(&sql, [id], Self::map_session).optional()?)
    }

    pub fn get_session_required(&self, id: &str) -> Result<Session> {
        self.get_session(id)?.ok_or_else(|| StoreError::NotFound(format!("session {}", id)))
    }

    /// The single non-terminal session for a task, if any
    pub fn active_session_for_task(&self, task_id: &str) -> Result<Option<Session>> {
        let sql = format!(
            "SELECT {} FROM sessions WHERE task_id = ?1 AND state IN ('idle', 'running', 'paused')",
            Self::SESSION_COLUMNS
        );
        Ok(self.conn.query_row(&sql, [task_id], Self::map_session).optional()?)
    }

    pub fn list_sessions(&self, state: Option<SessionState>) -> Result<Vec<Session>> {
        let sql = format!(
            "SELECT {} FROM sessions WHERE (?1 IS NULL OR state = ?1) ORDER BY rowid",
            Self::SESSION_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let sessions = stmt
            .query_map(params![state.map(|s| s.as_str())], Self::map_session)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sessions)
    }

    pub fn update_session_state(&mut self, id: &str, state: SessionState, failure_reason: Option<&str>) -> Result<Session> {
        let ts = now();
        let n = self.conn.execute(
            "UPDATE sessions SET state = ?2, failure_reason = ?3, last_activity = ?4,
                 started_at = CASE WHEN ?2 = 'running' AND started_at IS NULL THEN ?4 ELSE started_at END
             WHERE id = ?1",
            params![id, state.as_str(), failure_reason, ts],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("session {}", id)));
        }
        self.get_session_required(id)
    }

    /// Persist iteration count and token counters in one statement
    ///
    /// Restart after a crash resumes from the last checkpoint without
    /// replaying any LLM call.
    pub fn checkpoint_session(&mut self, id: &str, iteration: u32, input_tokens: u64, output_tokens: u64) -> Result<()> {
        let n = self.conn.execute(
            "UPDATE sessions SET iteration = ?2, input_tokens = ?3, output_tokens = ?4, last_activity = ?5 WHERE id = ?1",
            params![id, iteration, input_tokens as i64, output_tokens as i64, now()],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("session {}", id)));
        }
        Ok(())
    }

    /// Append one turn to the session's message log
    pub fn append_session_message(&mut self, session_id: &str, role: MessageRole, content: &serde_json::Value) -> Result<SessionMessage> {
        let seq: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM session_messages WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;
        let message = SessionMessage {
            id: generate_id("msg", ""),
            session_id: session_id.to_string(),
            seq,
            role,
            content: content.clone(),
            created_at: Utc::now(),
        };
        self.conn.execute(
            "INSERT INTO session_messages (id, session_id, seq, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.id,
                message.session_id,
                message.seq,
                message.role.as_str(),
                serde_json::to_string(&message.content)?,
                message.created_at.to_rfc3339(),
            ],
        )?;
        Ok(message)
    }

    pub fn list_session_messages(&self, session_id: &str) -> Result<Vec<SessionMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, seq, role, content, created_at FROM session_messages
             WHERE session_id = ?1 ORDER BY seq",
        )?;
        let messages = stmt
            .query_map([session_id], |row| {
                Ok(SessionMessage {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    seq: row.get(2)?,
                    role: MessageRole::parse(&row.get::<_, String>(3)?).unwrap_or(MessageRole::User),
                    content: parse_json(&row.get::<_, String>(4)?)?,
                    created_at: parse_ts(&row.get::<_, String>(5)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    pub fn append_session_activity(
        &mut self,
        session_id: &str,
        iteration: u32,
        event_type: &str,
        hat: &str,
        content: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<SessionActivity> {
        let activity = SessionActivity {
            id: generate_id("act", ""),
            session_id: session_id.to_string(),
            iteration,
            event_type: event_type.to_string(),
            hat: hat.to_string(),
            content: content.to_string(),
            input_tokens,
            output_tokens,
            created_at: Utc::now(),
        };
        self.conn.execute(
            "INSERT INTO session_activity (id, session_id, iteration, event_type, hat, content, input_tokens, \
             output_tokens, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                activity.id,
                activity.session_id,
                activity.iteration,
                activity.event_type,
                activity.hat,
                activity.content,
                activity.input_tokens as i64,
                activity.output_tokens as i64,
                activity.created_at.to_rfc3339(),
            ],
        )?;
        Ok(activity)
    }

    pub fn list_session_activity(&self, session_id: &str) -> Result<Vec<SessionActivity>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, iteration, event_type, hat, content, input_tokens, output_tokens, created_at
             FROM session_activity WHERE session_id = ?1 ORDER BY iteration, rowid",
        )?;
        let rows = stmt
            .query_map([session_id], |row| {
                Ok(SessionActivity {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    iteration: row.get(2)?,
                    event_type: row.get(3)?,
                    hat: row.get(4)?,
                    content: row.get(5)?,
                    input_tokens: row.get::<_, i64>(6)? as u64,
                    output_tokens: row.get::<_, i64>(7)? as u64,
                    created_at: parse_ts(&row.get::<_, String>(8)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// A compact human-readable digest of a session's activity
    pub fn session_activity_summary(&self, session_id: &str, max_entries: usize) -> Result<String> {
        let rows = self.list_session_activity(session_id)?;
        let skip = rows.len().saturating_sub(max_entries);
        let mut out = String::new();
        for row in rows.into_iter().skip(skip) {
            out.push_str(&format!("[{} {}/{}] {}\n", row.event_type, row.hat, row.iteration, row.content));
        }
        Ok(out)
    }

    // === Approvals ===

    fn map_approval(row: &Row<'_>) -> rusqlite::Result<Approval> {
        Ok(Approval {
            id: row.get(0)?,
            task_id: row.get(1)?,
            session_id: row.get(2)?,
            approval_type: row.get(3)?,
            title: row.get(4)?,
            description: row.get(5)?,
            data: parse_json(&row.get::<_, String>(6)?)?,
            status: ApprovalStatus::parse(&row.get::<_, String>(7)?).unwrap_or(ApprovalStatus::Pending),
            created_at: parse_ts(&row.get::<_, String>(8)?)?,
            resolved_at: parse_opt_ts(row.get(9)?)?,
        })
    }

    const APPROVAL_COLUMNS: &'static str =
        "id, task_id, session_id, approval_type, title, description, data, status, created_at, resolved_at";

    pub fn create_approval(
        &mut self,
        task_id: Option<&str>,
        session_id: Option<&str>,
        approval_type: &str,
        title: &str,
        description: &str,
        data: &serde_json::Value,
    ) -> Result<Approval> {
        let approval = Approval {
            id: generate_id("approval", title),
            task_id: task_id.map(String::from),
            session_id: session_id.map(String::from),
            approval_type: approval_type.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            data: data.clone(),
            status: ApprovalStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
        };
        self.conn.execute(
            "INSERT INTO approvals (id, task_id, session_id, approval_type, title, description, data, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                approval.id,
                approval.task_id,
                approval.session_id,
                approval.approval_type,
                approval.title,
                approval.description,
                serde_json::to_string(&approval.data)?,
                approval.status.as_str(),
                approval.created_at.to_rfc3339(),
            ],
        )?;
        debug!(approval_id = %approval.id, approval_type = %approval.approval_type, "Created approval");
        Ok(approval)
    }

    pub fn get_approval(&self, id: &str) -> Result<Option<Approval>> {
        let sql = format!("SELECT {} FROM approvals WHERE id = ?1", Self::APPROVAL_COLUMNS);
        Ok(self.conn.query_row(&sql, [id], Self::map_approval).optional()?)
    }

    pub fn list_approvals(&self, status: Option<ApprovalStatus>) -> Result<Vec<Approval>> {
        let sql = format!(
            "SELECT {} FROM approvals WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at",
            Self::APPROVAL_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let approvals = stmt
            .query_map(params![status.map(|s| s.as_str())], Self::map_approval)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(approvals)
    }

    /// Resolve a pending approval; `AlreadyResolved` otherwise
    pub fn resolve_approval(&mut self, id: &str, status: ApprovalStatus) -> Result<Approval> {
        if status == ApprovalStatus::Pending {
            return Err(StoreError::BadInput("cannot resolve an approval to pending".to_string()));
        }
        let tx = self.conn.transaction()?;
        let current: Option<String> = tx
            .query_row("SELECT status FROM approvals WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        let current = current.ok_or_else(|| StoreError::NotFound(format!("approval {}", id)))?;
        if current != ApprovalStatus::Pending.as_str() {
            return Err(StoreError::AlreadyResolved(id.to_string()));
        }
        tx.execute(
            "UPDATE approvals SET status = ?2, resolved_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), now()],
        )?;
        tx.commit()?;
        debug!(approval_id = %id, status = status.as_str(), "Resolved approval");
        self.get_approval(id)?.ok_or_else(|| StoreError::NotFound(format!("approval {}", id)))
    }

    // === Quests ===

    pub fn create_quest(&mut self, project_id: &str, title: &str, model: &str) -> Result<Quest> {
        self.get_project_required(project_id)?;
        let quest = Quest {
            id: generate_id("quest", title),
            project_id: project_id.to_string(),
            title: title.to_string(),
            status: QuestStatus::Active,
            model: model.to_string(),
            created_at: Utc::now(),
            completed_at: None,
        };
        self.conn.execute(
            "INSERT INTO quests (id, project_id, title, status, model, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                quest.id,
                quest.project_id,
                quest.title,
                quest.status.as_str(),
                quest.model,
                quest.created_at.to_rfc3339(),
            ],
        )?;
        Ok(quest)
    }

    fn map_quest(row: &Row<'_>) -> rusqlite::Result<Quest> {
        Ok(Quest {
            id: row.get(0)?,
            project_id: row.get(1)?,
            title: row.get(2)?,
            status: QuestStatus::parse(&row.get::<_, String>(3)?).unwrap_or(QuestStatus::Active),
            model: row.get(4)?,
            created_at: parse_ts(&row.get::<_, String>(5)?)?,
            completed_at: parse_opt_ts(row.get(6)?)?,
        })
    }

    pub fn get_quest(&self, id: &str) -> Result<Option<Quest>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, project_id, title, status, model, created_at, completed_at FROM quests WHERE id = ?1",
                [id],
                Self::map_quest,
            )
            .optional()?)
    }

    pub fn get_quest_required(&self, id: &str) -> Result<Quest> {
        self.get_quest(id)?.ok_or_else(|| StoreError::NotFound(format!("quest {}", id)))
    }

    pub fn list_quests(&self, project_id: Option<&str>) -> Result<Vec<Quest>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, project_id, title, status, model, created_at, completed_at FROM quests
             WHERE (?1 IS NULL OR project_id = ?1) ORDER BY created_at",
        )?;
        let quests = stmt
            .query_map(params![project_id], Self::map_quest)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(quests)
    }

    pub fn append_quest_message(
        &mut self,
        quest_id: &str,
        role: MessageRole,
        content: &str,
        tool_calls: &serde_json::Value,
    ) -> Result<QuestMessage> {
        self.get_quest_required(quest_id)?;
        let seq: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM quest_messages WHERE quest_id = ?1",
            [quest_id],
            |row| row.get(0),
        )?;
        let message = QuestMessage {
            id: generate_id("qmsg", ""),
            quest_id: quest_id.to_string(),
            seq,
            role,
            content: content.to_string(),
            tool_calls: tool_calls.clone(),
            created_at: Utc::now(),
        };
        self.conn.execute(
            "INSERT INTO quest_messages (id, quest_id, seq, role, content, tool_calls, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id,
                message.quest_id,
                message.seq,
                message.role.as_str(),
                message.content,
                serde_json::to_string(&message.tool_calls)?,
                message.created_at.to_rfc3339(),
            ],
        )?;
        Ok(message)
    }

    pub fn list_quest_messages(&self, quest_id: &str) -> Result<Vec<QuestMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, quest_id, seq, role, content, tool_calls, created_at FROM quest_messages
             WHERE quest_id = ?1 ORDER BY seq",
        )?;
        let messages = stmt
            .query_map([quest_id], |row| {
                Ok(QuestMessage {
                    id: row.get(0)?,
                    quest_id: row.get(1)?,
                    seq: row.get(2)?,
                    role: MessageRole::parse(&row.get::<_, String>(3)?).unwrap_or(MessageRole::User),
                    content: row.get(4)?,
                    tool_calls: parse_json(&row.get::<_, String>(5)?)?,
                    created_at: parse_ts(&row.get::<_, String>(6)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    pub fn complete_quest(&mut self, id: &str) -> Result<Quest> {
        let quest = self.get_quest_required(id)?;
        if quest.status == QuestStatus::Completed {
            return Err(StoreError::Conflict(format!("quest {} already completed", id)));
        }
        self.conn.execute(
            "UPDATE quests SET status = 'completed', completed_at = ?2 WHERE id = ?1",
            params![id, now()],
        )?;
        self.get_quest_required(id)
    }

    pub fn reopen_quest(&mut self, id: &str) -> Result<Quest> {
        let quest = self.get_quest_required(id)?;
        if quest.status == QuestStatus::Active {
            return Err(StoreError::Conflict(format!("quest {} is already active", id)));
        }
        self.conn
            .execute("UPDATE quests SET status = 'active', completed_at = NULL WHERE id = ?1", [id])?;
        self.get_quest_required(id)
    }

    // === Secrets ===

    pub fn get_secret(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row("SELECT value FROM secrets WHERE key = ?1", [key], |row| row.get(0))
            .optional()?)
    }

    pub fn set_secret(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO secrets (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}
