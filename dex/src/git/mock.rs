//! Recording GitOps double for tests
//!
//! Creates real directories (so `exists()` checks behave) without invoking
//! git, and records every call for assertions.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::ops::{task_branch, task_worktree_path, GitError, GitOps, WorktreeInfo};

/// One recorded call
#[derive(Debug, Clone, PartialEq)]
pub enum GitCall {
    Setup { repo: PathBuf, task_id: String, base_branch: String },
    Cleanup { repo: PathBuf, task_id: String, delete_branch: bool },
    PushAndOpenPr { repo: PathBuf, branch: String, title: String },
}

/// Mock GitOps that records calls and fabricates results
pub struct MockGitOps {
    calls: Mutex<Vec<GitCall>>,
    next_pr: AtomicU64,
    fail_setup: AtomicBool,
    fail_pr: AtomicBool,
}

impl MockGitOps {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            next_pr: AtomicU64::new(100),
            fail_setup: AtomicBool::new(false),
            fail_pr: AtomicBool::new(false),
        }
    }

    pub fn fail_setup(&self) {
        self.fail_setup.store(true, Ordering::SeqCst);
    }

    pub fn fail_pr(&self) {
        self.fail_pr.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<GitCall> {
        self.calls.lock().expect("mock lock").clone()
    }

    pub fn pr_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, GitCall::PushAndOpenPr { .. }))
            .count()
    }
}

impl Default for MockGitOps {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GitOps for MockGitOps {
    async fn setup_task_worktree(&self, repo: &Path, task_id: &str, base_branch: &str) -> Result<WorktreeInfo, GitError> {
        self.calls.lock().expect("mock lock").push(GitCall::Setup {
            repo: repo.to_path_buf(),
            task_id: task_id.to_string(),
            base_branch: base_branch.to_string(),
        });

        if self.fail_setup.load(Ordering::SeqCst) {
            return Err(GitError::CreateFailed("mock setup failure".to_string()));
        }

        let path = task_worktree_path(repo, task_id);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| GitError::CreateFailed(e.to_string()))?;

        Ok(WorktreeInfo {
            path,
            branch: task_branch(task_id),
        })
    }

    async fn cleanup_task_worktree(&self, repo: &Path, task_id: &str, delete_branch: bool) -> Result<(), GitError> {
        self.calls.lock().expect("mock lock").push(GitCall::Cleanup {
            repo: repo.to_path_buf(),
            task_id: task_id.to_string(),
            delete_branch,
        });

        let path = task_worktree_path(repo, task_id);
        if path.exists() {
            tokio::fs::remove_dir_all(&path)
                .await
                .map_err(|e| GitError::RemoveFailed(e.to_string()))?;
        }
        Ok(())
    }

    async fn push_and_open_pr(&self, repo: &Path, branch: &str, title: &str, _body: &str) -> Result<u64, GitError> {
        self.calls.lock().expect("mock lock").push(GitCall::PushAndOpenPr {
            repo: repo.to_path_buf(),
            branch: branch.to_string(),
            title: title.to_string(),
        });

        if self.fail_pr.load(Ordering::SeqCst) {
            return Err(GitError::PrFailed("mock PR failure".to_string()));
        }

        Ok(self.next_pr.fetch_add(1, Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_creates_and_removes_directories() {
        let temp = tempfile::tempdir().unwrap();
        let git = MockGitOps::new();

        let info = git.setup_task_worktree(temp.path(), "t-1", "main").await.unwrap();
        assert!(info.path.exists());
        assert_eq!(info.branch, "task/t-1");

        git.cleanup_task_worktree(temp.path(), "t-1", true).await.unwrap();
        assert!(!info.path.exists());

        assert_eq!(git.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_mock_pr_numbers_increment() {
        let temp = tempfile::tempdir().unwrap();
        let git = MockGitOps::new();

        let a = git.push_and_open_pr(temp.path(), "task/a", "A", "").await.unwrap();
        let b = git.push_and_open_pr(temp.path(), "task/b", "B", "").await.unwrap();
        assert_eq!(b, a + 1);
        assert_eq!(git.pr_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_failure_flags() {
        let temp = tempfile::tempdir().unwrap();
        let git = MockGitOps::new();
        git.fail_setup();
        assert!(git.setup_task_worktree(temp.path(), "t", "main").await.is_err());

        git.fail_pr();
        assert!(git.push_and_open_pr(temp.path(), "b", "t", "").await.is_err());
    }
}
