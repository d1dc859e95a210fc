//! Git operations consumed by the worktree manager and session manager

mod ops;

pub use ops::{is_git_repo, task_branch, task_worktree_path, CliGitOps, GitError, GitOps, WorktreeInfo};

pub mod mock;
