//! Git operations: worktree setup/cleanup and PR creation
//!
//! The CLI implementation shells out to `git` (and `gh` for pull requests);
//! everything the core needs is behind the [`GitOps`] trait so tests and
//! embedders can substitute their own plumbing.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Error types for git operations
#[derive(Debug, Error)]
pub enum GitError {
    #[error("Failed to create worktree: {0}")]
    CreateFailed(String),

    #[error("Failed to remove worktree: {0}")]
    RemoveFailed(String),

    #[error("Failed to push branch: {0}")]
    PushFailed(String),

    #[error("Failed to open pull request: {0}")]
    PrFailed(String),

    #[error("Git command failed: {0}")]
    CommandFailed(String),
}

/// A created task worktree
#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
}

/// Git plumbing consumed by the core
#[async_trait]
pub trait GitOps: Send + Sync {
    /// Create a worktree for a task at `<repo>/.worktrees/task-<id>` on a
    /// fresh branch `task/<id>` cut from `base_branch`
    async fn setup_task_worktree(&self, repo: &Path, task_id: &str, base_branch: &str) -> Result<WorktreeInfo, GitError>;

    /// Remove a task's worktree, optionally deleting its branch
    async fn cleanup_task_worktree(&self, repo: &Path, task_id: &str, delete_branch: bool) -> Result<(), GitError>;

    /// Push the branch and open a pull request; returns the PR number
    async fn push_and_open_pr(&self, repo: &Path, branch: &str, title: &str, body: &str) -> Result<u64, GitError>;
}

/// Branch name for a task
pub fn task_branch(task_id: &str) -> String {
    format!("task/{}", task_id)
}

/// Worktree path for a task inside a repository
pub fn task_worktree_path(repo: &Path, task_id: &str) -> PathBuf {
    repo.join(".worktrees").join(format!("task-{}", task_id))
}

/// Whether a path is the root of a git repository
pub fn is_git_repo(path: &Path) -> bool {
    path.join(".git").exists()
}

/// GitOps implementation shelling out to the git and gh CLIs
pub struct CliGitOps;

impl CliGitOps {
    async fn run_git(&self, repo: &Path, args: &[&str]) -> Result<String, GitError> {
        debug!(?args, repo = %repo.display(), "CliGitOps: running git");
        let output = Command::new("git")
            .args(args)
            .current_dir(repo)
            .output()
            .await
            .map_err(|e| GitError::CommandFailed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(GitError::CommandFailed(stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl GitOps for CliGitOps {
    async fn setup_task_worktree(&self, repo: &Path, task_id: &str, base_branch: &str) -> Result<WorktreeInfo, GitError> {
        let worktree_path = task_worktree_path(repo, task_id);
        let branch = task_branch(task_id);

        if let Some(parent) = worktree_path.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            return Err(GitError::CreateFailed(format!("Failed to create worktree dir: {}", e)));
        }

        let path_str = worktree_path.display().to_string();
        self.run_git(repo, &["worktree", "add", &path_str, "-b", &branch, base_branch])
            .await
            .map_err(|e| GitError::CreateFailed(e.to_string()))?;

        info!("Created worktree at {:?} on branch {}", worktree_path, branch);

        Ok(WorktreeInfo {
            path: worktree_path,
            branch,
        })
    }

    async fn cleanup_task_worktree(&self, repo: &Path, task_id: &str, delete_branch: bool) -> Result<(), GitError> {
        let worktree_path = task_worktree_path(repo, task_id);

        if !worktree_path.exists() {
            warn!("Worktree {:?} does not exist, skipping removal", worktree_path);
            return Ok(());
        }

        let path_str = worktree_path.display().to_string();
        if let Err(e) = self.run_git(repo, &["worktree", "remove", &path_str, "--force"]).await {
            // Don't fail if already removed
            if !e.to_string().contains("is not a working tree") {
                return Err(GitError::RemoveFailed(e.to_string()));
            }
        }

        if delete_branch {
            let branch = task_branch(task_id);
            let _ = self.run_git(repo, &["branch", "-D", &branch]).await;
        }

        info!("Removed worktree for task {}", task_id);
        Ok(())
    }

    async fn push_and_open_pr(&self, repo: &Path, branch: &str, title: &str, body: &str) -> Result<u64, GitError> {
        self.run_git(repo, &["push", "-u", "origin", branch])
            .await
            .map_err(|e| GitError::PushFailed(e.to_string()))?;

        let output = Command::new("gh")
            .args(["pr", "create", "--head", branch, "--title", title, "--body", body])
            .current_dir(repo)
            .output()
            .await
            .map_err(|e| GitError::PrFailed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(GitError::PrFailed(stderr));
        }

        // gh prints the PR URL; the number is the last path segment
        let stdout = String::from_utf8_lossy(&output.stdout);
        let pr_number = stdout
            .trim()
            .rsplit('/')
            .next()
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or_else(|| GitError::PrFailed(format!("could not parse PR number from: {}", stdout.trim())))?;

        info!(branch, pr_number, "Opened pull request");
        Ok(pr_number)
    }
}
