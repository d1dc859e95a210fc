//! Database schema and migration

use rusqlite::Connection;

/// Schema version recorded in `user_version`
const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    repo_path       TEXT NOT NULL,
    default_branch  TEXT NOT NULL,
    remote          TEXT,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS quests (
    id              TEXT PRIMARY KEY,
    project_id      TEXT NOT NULL REFERENCES projects(id),
    title           TEXT NOT NULL,
    status          TEXT NOT NULL,
    model           TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    completed_at    TEXT
);

CREATE TABLE IF NOT EXISTS quest_messages (
    id              TEXT PRIMARY KEY,
    quest_id        TEXT NOT NULL REFERENCES quests(id),
    seq             INTEGER NOT NULL,
    role            TEXT NOT NULL,
    content         TEXT NOT NULL,
    tool_calls      TEXT NOT NULL DEFAULT '[]',
    created_at      TEXT NOT NULL,
    UNIQUE (quest_id, seq)
);

CREATE TABLE IF NOT EXISTS tasks (
    id              TEXT PRIMARY KEY,
    project_id      TEXT NOT NULL REFERENCES projects(id),
    quest_id        TEXT REFERENCES quests(id),
    title           TEXT NOT NULL,
    description     TEXT NOT NULL,
    hat             TEXT NOT NULL,
    task_type       TEXT NOT NULL,
    priority        TEXT NOT NULL,
    autonomy        TEXT NOT NULL,
    status          TEXT NOT NULL,
    base_branch     TEXT NOT NULL,
    worktree_path   TEXT,
    branch_name     TEXT,
    pr_number       INTEGER,
    max_iterations  INTEGER,
    max_tokens      INTEGER,
    max_dollars     REAL,
    used_iterations INTEGER NOT NULL DEFAULT 0,
    used_tokens     INTEGER NOT NULL DEFAULT 0,
    used_dollars    REAL NOT NULL DEFAULT 0,
    auto_start      INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,
    started_at      TEXT,
    completed_at    TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id);

CREATE TABLE IF NOT EXISTS task_deps (
    task_id            TEXT NOT NULL REFERENCES tasks(id),
    depends_on_task_id TEXT NOT NULL REFERENCES tasks(id),
    PRIMARY KEY (task_id, depends_on_task_id)
);

CREATE TABLE IF NOT EXISTS checklist_items (
    id                 TEXT PRIMARY KEY,
    task_id            TEXT NOT NULL REFERENCES tasks(id),
    description        TEXT NOT NULL,
    status             TEXT NOT NULL,
    verification_notes TEXT,
    sort_order         INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_checklist_task ON checklist_items(task_id);

CREATE TABLE IF NOT EXISTS sessions (
    id              TEXT PRIMARY KEY,
    task_id         TEXT NOT NULL REFERENCES tasks(id),
    hat             TEXT NOT NULL,
    worktree_path   TEXT NOT NULL,
    state           TEXT NOT NULL,
    failure_reason  TEXT,
    iteration       INTEGER NOT NULL DEFAULT 0,
    max_iterations  INTEGER,
    input_tokens    INTEGER NOT NULL DEFAULT 0,
    output_tokens   INTEGER NOT NULL DEFAULT 0,
    started_at      TEXT,
    last_activity   TEXT
);

CREATE INDEX IF NOT EXISTS idx_sessions_task ON sessions(task_id);

CREATE TABLE IF NOT EXISTS session_messages (
    id              TEXT PRIMARY KEY,
    session_id      TEXT NOT NULL REFERENCES sessions(id),
    seq             INTEGER NOT NULL,
    role            TEXT NOT NULL,
    content         TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    UNIQUE (session_id, seq)
);

CREATE TABLE IF NOT EXISTS session_activity (
    id              TEXT PRIMARY KEY,
    session_id      TEXT NOT NULL REFERENCES sessions(id),
    iteration       INTEGER NOT NULL,
    event_type      TEXT NOT NULL,
    hat             TEXT NOT NULL,
    content         TEXT NOT NULL,
    input_tokens    INTEGER NOT NULL DEFAULT 0,
    output_tokens   INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_activity_session ON session_activity(session_id, iteration);

CREATE TABLE IF NOT EXISTS approvals (
    id              TEXT PRIMARY KEY,
    task_id         TEXT,
    session_id      TEXT,
    approval_type   TEXT NOT NULL,
    title           TEXT NOT NULL,
    description     TEXT NOT NULL,
    data            TEXT NOT NULL DEFAULT '{}',
    status          TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    resolved_at     TEXT
);

CREATE TABLE IF NOT EXISTS secrets (
    key             TEXT PRIMARY KEY,
    value           TEXT NOT NULL
);
"#;

/// Apply the schema to a fresh or existing database
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(SCHEMA)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}
