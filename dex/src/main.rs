//! dex - CLI entry point
//!
//! Runs the daemon or drives the operations surface directly against the
//! local store. Transport adapters (HTTP/WS) live outside this crate.

use clap::Parser;
use eyre::{Context, Result};
use tracing::info;

use poindexter::cli::{ApprovalCommand, Cli, Command, QuestCommand, SessionCommand, TaskCommand};
use poindexter::config::Config;
use poindexter::daemon::Daemon;
use poindexter::tasks::CreateTaskSpec;

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    let daemon = Daemon::new(config).await.context("Failed to assemble daemon")?;

    match cli.command {
        Command::Daemon => run_daemon(daemon).await,
        Command::Task { command } => run_task(daemon, command).await,
        Command::Session { command } => run_session(daemon, command).await,
        Command::Approval { command } => run_approval(daemon, command).await,
        Command::Quest { command } => run_quest(daemon, command).await,
    }
}

async fn run_daemon(daemon: Daemon) -> Result<()> {
    info!("dex daemon running; ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
    daemon.shutdown().await
}

async fn run_task(daemon: Daemon, command: TaskCommand) -> Result<()> {
    match command {
        TaskCommand::Create {
            title,
            hat,
            description,
            deps,
            auto_start,
            max_iterations,
        } => {
            let cwd = std::env::current_dir()?.display().to_string();
            let project = daemon.default_project(&cwd, "main").await?;
            let task = daemon
                .create_task(CreateTaskSpec {
                    project_id: project.id,
                    title,
                    description,
                    hat,
                    task_type: "feature".to_string(),
                    priority: "normal".to_string(),
                    autonomy: "supervised".to_string(),
                    base_branch: project.default_branch,
                    deps,
                    auto_start,
                    max_iterations,
                    ..Default::default()
                })
                .await?;
            println!("{}  {}  [{}]", task.id, task.title, task.status);
        }
        TaskCommand::List => {
            for task in daemon.list_tasks(None, None).await? {
                println!("{}  {:<10}  {:<12}  {}", task.id, task.status, task.hat, task.title);
            }
        }
        TaskCommand::Get { id } => {
            let task = daemon.get_task(&id).await?;
            println!("{:#?}", task);
        }
        TaskCommand::Start { id } => {
            let session = daemon.start_task(&id).await?;
            println!("started session {} in {}", session.id, session.worktree_path);
        }
        TaskCommand::Pause { id } => daemon.pause_task(&id).await?,
        TaskCommand::Resume { id } => daemon.resume_task(&id).await?,
        TaskCommand::Cancel { id } => daemon.cancel_task(&id).await?,
        TaskCommand::Logs { id } => {
            for row in daemon.task_logs(&id).await? {
                println!("[{} {}/{}] {}", row.event_type, row.hat, row.iteration, row.content);
            }
        }
    }
    Ok(())
}

async fn run_session(daemon: Daemon, command: SessionCommand) -> Result<()> {
    match command {
        SessionCommand::List => {
            for session in daemon.list_sessions().await? {
                println!(
                    "{}  {:<10}  {:<12}  iter {}  task {}",
                    session.id, session.state, session.hat, session.iteration, session.task_id
                );
            }
        }
        SessionCommand::Kill { id } => daemon.kill_session(&id).await?,
    }
    Ok(())
}

async fn run_approval(daemon: Daemon, command: ApprovalCommand) -> Result<()> {
    match command {
        ApprovalCommand::List => {
            for approval in daemon.list_approvals(None).await? {
                println!("{}  {:<9}  {}  {}", approval.id, approval.status.as_str(), approval.approval_type, approval.title);
            }
        }
        ApprovalCommand::Approve { id } => {
            daemon.approve(&id).await?;
        }
        ApprovalCommand::Reject { id } => {
            daemon.reject(&id).await?;
        }
    }
    Ok(())
}

async fn run_quest(daemon: Daemon, command: QuestCommand) -> Result<()> {
    match command {
        QuestCommand::Create { title, model } => {
            let cwd = std::env::current_dir()?.display().to_string();
            let project = daemon.default_project(&cwd, "main").await?;
            let quest = daemon.quests().create(&project.id, &title, &model).await?;
            println!("{}  {}", quest.id, quest.title);
        }
        QuestCommand::List => {
            for quest in daemon.quests().list(None).await? {
                println!("{}  {:<9}  {}", quest.id, quest.status.as_str(), quest.title);
            }
        }
        QuestCommand::Send { id, message } => {
            let reply = daemon.quests().send_message(&id, &message).await?;
            println!("{}", reply.content);
        }
        QuestCommand::Complete { id } => {
            daemon.quests().complete(&id).await?;
        }
        QuestCommand::Reopen { id } => {
            daemon.quests().reopen(&id).await?;
        }
    }
    Ok(())
}
