//! Command-line interface definitions

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Poindexter - AI orchestration daemon
#[derive(Debug, Parser)]
#[command(name = "dex", version, about)]
pub struct Cli {
    /// Path to a config file (defaults to .dex.yml, then the user config dir)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the orchestration daemon
    Daemon,

    /// Manage tasks
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },

    /// Manage sessions
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },

    /// Manage approvals
    Approval {
        #[command(subcommand)]
        command: ApprovalCommand,
    },

    /// Manage quests
    Quest {
        #[command(subcommand)]
        command: QuestCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum TaskCommand {
    /// Create a task
    Create {
        title: String,
        /// Starting hat
        #[arg(long, default_value = "planner")]
        hat: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Task ids this task depends on
        #[arg(long = "dep")]
        deps: Vec<String>,
        /// Start automatically when unblocked
        #[arg(long)]
        auto_start: bool,
        /// Iteration budget
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// List tasks
    List,
    /// Show one task
    Get { id: String },
    /// Start a task
    Start { id: String },
    /// Pause a running task
    Pause { id: String },
    /// Resume a paused task
    Resume { id: String },
    /// Cancel a task
    Cancel { id: String },
    /// Show a task's session activity
    Logs { id: String },
}

#[derive(Debug, Subcommand)]
pub enum SessionCommand {
    /// List sessions
    List,
    /// Kill a session
    Kill { id: String },
}

#[derive(Debug, Subcommand)]
pub enum ApprovalCommand {
    /// List pending approvals
    List,
    /// Approve
    Approve { id: String },
    /// Reject
    Reject { id: String },
}

#[derive(Debug, Subcommand)]
pub enum QuestCommand {
    /// Create a quest
    Create {
        title: String,
        #[arg(long, default_value = "sonnet")]
        model: String,
    },
    /// List quests
    List,
    /// Send a message to a quest
    Send { id: String, message: String },
    /// Complete a quest
    Complete { id: String },
    /// Reopen a completed quest
    Reopen { id: String },
}
