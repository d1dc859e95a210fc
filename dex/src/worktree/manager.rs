//! Worktree manager: decides where a task works and remembers it
//!
//! Placement decision tree, evaluated in order:
//! 1. repo path is a real git repository on a safe user path -> dedicated
//!    worktree on branch `task/<id>`;
//! 2. repo path is a safe user path -> use it directly (the agent may init a
//!    repo itself);
//! 3. otherwise -> scratch directory under the daemon's base dir.
//!
//! Worktrees created in case 1 are removed when a start fails or is
//! cancelled; scratch directories are kept for forensics.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{Project, Task};
use crate::git::{is_git_repo, GitError, GitOps};

/// Marker file naming the product's own install directory; never a worktree target
pub const INSTALL_MARKER: &str = ".dex-install";

const UNSAFE_PREFIXES: &[&str] = &["/usr", "/bin", "/sbin", "/lib", "/etc"];

/// Error types for worktree placement
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("Failed to create worktree: {0}")]
    CreateFailed(String),

    #[error("Failed to remove worktree: {0}")]
    RemoveFailed(String),

    #[error("Failed to create scratch directory: {0}")]
    ScratchFailed(String),
}

impl From<GitError> for WorktreeError {
    fn from(err: GitError) -> Self {
        match err {
            GitError::RemoveFailed(m) => WorktreeError::RemoveFailed(m),
            other => WorktreeError::CreateFailed(other.to_string()),
        }
    }
}

/// Configuration for the worktree manager
#[derive(Debug, Clone)]
pub struct WorktreeConfig {
    /// Base directory for scratch placements
    pub base_dir: PathBuf,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/tmp/dex"),
        }
    }
}

/// Where a task ended up working
#[derive(Debug, Clone, PartialEq)]
pub enum Placement {
    /// Dedicated git worktree on its own branch
    Worktree { path: PathBuf, branch: String },
    /// The project's repo path used directly
    ProjectRoot(PathBuf),
    /// Scratch directory outside any repository
    Scratch(PathBuf),
}

impl Placement {
    pub fn path(&self) -> &Path {
        match self {
            Placement::Worktree { path, .. } => path,
            Placement::ProjectRoot(path) => path,
            Placement::Scratch(path) => path,
        }
    }

    pub fn branch(&self) -> Option<&str> {
        match self {
            Placement::Worktree { branch, .. } => Some(branch),
            _ => None,
        }
    }
}

/// Allocates filesystem paths for tasks
pub struct WorktreeManager {
    config: WorktreeConfig,
    git: Arc<dyn GitOps>,
}

impl WorktreeManager {
    pub fn new(config: WorktreeConfig, git: Arc<dyn GitOps>) -> Self {
        Self { config, git }
    }

    /// Allocate a working path for a task
    pub async fn allocate(&self, project: &Project, task: &Task) -> Result<Placement, WorktreeError> {
        let repo_path = Path::new(&project.repo_path);

        if is_git_repo(repo_path) && is_safe_path(repo_path) {
            let info = self
                .git
                .setup_task_worktree(repo_path, &task.id, &task.base_branch)
                .await?;
            info!(task_id = %task.id, path = %info.path.display(), branch = %info.branch, "Allocated task worktree");
            return Ok(Placement::Worktree {
                path: info.path,
                branch: info.branch,
            });
        }

        if is_safe_path(repo_path) {
            debug!(task_id = %task.id, path = %repo_path.display(), "Repo path is not a git repo, using directly");
            return Ok(Placement::ProjectRoot(repo_path.to_path_buf()));
        }

        let scratch = self.config.base_dir.join("worktrees").join(format!("task-{}", task.id));
        tokio::fs::create_dir_all(&scratch)
            .await
            .map_err(|e| WorktreeError::ScratchFailed(e.to_string()))?;
        warn!(task_id = %task.id, path = %scratch.display(), "Unsafe repo path, using scratch directory");
        Ok(Placement::Scratch(scratch))
    }

    /// Remove what a failed or cancelled start created
    ///
    /// Only case-1 worktrees are removed; scratch dirs stay for forensics.
    pub async fn cleanup(&self, project: &Project, task: &Task, placement: &Placement) -> Result<(), WorktreeError> {
        match placement {
            Placement::Worktree { .. } => {
                let repo_path = Path::new(&project.repo_path);
                self.git.cleanup_task_worktree(repo_path, &task.id, true).await?;
                info!(task_id = %task.id, "Cleaned up task worktree");
                Ok(())
            }
            Placement::ProjectRoot(_) | Placement::Scratch(_) => Ok(()),
        }
    }

    /// Reuse a completed predecessor's worktree if it still exists
    pub fn inherit(predecessor_worktree: Option<&str>) -> Option<PathBuf> {
        let path = PathBuf::from(predecessor_worktree?);
        if path.exists() { Some(path) } else { None }
    }
}

/// A path the daemon may touch: not a system directory and not the
/// product's own install directory
fn is_safe_path(path: &Path) -> bool {
    if path.as_os_str().is_empty() {
        return false;
    }
    for prefix in UNSAFE_PREFIXES {
        if path.starts_with(prefix) {
            return false;
        }
    }
    !path.join(INSTALL_MARKER).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::mock::{GitCall, MockGitOps};
    use dexstore::{NewTask, Store};

    fn fixtures(repo_path: &str) -> (Project, Task) {
        let mut store = Store::open_in_memory().unwrap();
        let project = store.create_project("p", repo_path, "main").unwrap();
        let task = store
            .create_task(NewTask {
                project_id: project.id.clone(),
                title: "t".to_string(),
                hat: "creator".to_string(),
                task_type: "feature".to_string(),
                priority: "normal".to_string(),
                autonomy: "supervised".to_string(),
                base_branch: "main".to_string(),
                ..Default::default()
            })
            .unwrap();
        (project, task)
    }

    fn manager(base_dir: &Path) -> (WorktreeManager, Arc<MockGitOps>) {
        let git = Arc::new(MockGitOps::new());
        let manager = WorktreeManager::new(
            WorktreeConfig {
                base_dir: base_dir.to_path_buf(),
            },
            git.clone(),
        );
        (manager, git)
    }

    #[tokio::test]
    async fn test_git_repo_gets_dedicated_worktree() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir(temp.path().join(".git")).unwrap();
        let (project, task) = fixtures(&temp.path().display().to_string());
        let (manager, git) = manager(temp.path());

        let placement = manager.allocate(&project, &task).await.unwrap();
        match &placement {
            Placement::Worktree { path, branch } => {
                assert!(path.ends_with(format!(".worktrees/task-{}", task.id)));
                assert_eq!(branch, &format!("task/{}", task.id));
            }
            other => panic!("expected worktree placement, got {:?}", other),
        }
        assert!(matches!(git.calls()[0], GitCall::Setup { ref base_branch, .. } if base_branch == "main"));
    }

    #[tokio::test]
    async fn test_plain_dir_used_directly() {
        let temp = tempfile::tempdir().unwrap();
        let (project, task) = fixtures(&temp.path().display().to_string());
        let (manager, git) = manager(temp.path());

        let placement = manager.allocate(&project, &task).await.unwrap();
        assert_eq!(placement, Placement::ProjectRoot(temp.path().to_path_buf()));
        assert!(git.calls().is_empty());
    }

    #[tokio::test]
    async fn test_system_path_gets_scratch() {
        let temp = tempfile::tempdir().unwrap();
        let (project, task) = fixtures("/usr/local/repo");
        let (manager, _git) = manager(temp.path());

        let placement = manager.allocate(&project, &task).await.unwrap();
        match &placement {
            Placement::Scratch(path) => {
                assert!(path.starts_with(temp.path().join("worktrees")));
                assert!(path.exists());
            }
            other => panic!("expected scratch placement, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_install_dir_gets_scratch() {
        let temp = tempfile::tempdir().unwrap();
        let install = temp.path().join("install");
        std::fs::create_dir_all(&install).unwrap();
        std::fs::write(install.join(INSTALL_MARKER), "").unwrap();
        std::fs::create_dir(install.join(".git")).unwrap();

        let (project, task) = fixtures(&install.display().to_string());
        let (manager, git) = manager(temp.path());

        let placement = manager.allocate(&project, &task).await.unwrap();
        assert!(matches!(placement, Placement::Scratch(_)));
        assert!(git.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_only_removes_worktrees() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir(temp.path().join(".git")).unwrap();
        let (project, task) = fixtures(&temp.path().display().to_string());
        let (manager, git) = manager(temp.path());

        let placement = manager.allocate(&project, &task).await.unwrap();
        manager.cleanup(&project, &task, &placement).await.unwrap();
        assert!(matches!(git.calls().last().unwrap(), GitCall::Cleanup { delete_branch: true, .. }));

        // Scratch placements are retained
        let scratch = Placement::Scratch(temp.path().join("scratch"));
        std::fs::create_dir_all(scratch.path()).unwrap();
        manager.cleanup(&project, &task, &scratch).await.unwrap();
        assert!(scratch.path().exists());
    }

    #[test]
    fn test_inherit_requires_existing_path() {
        let temp = tempfile::tempdir().unwrap();
        let existing = temp.path().display().to_string();

        assert_eq!(WorktreeManager::inherit(Some(&existing)), Some(temp.path().to_path_buf()));
        assert_eq!(WorktreeManager::inherit(Some("/nonexistent/path/xyz")), None);
        assert_eq!(WorktreeManager::inherit(None), None);
    }

    #[test]
    fn test_is_safe_path() {
        assert!(!is_safe_path(Path::new("/usr/bin/repo")));
        assert!(!is_safe_path(Path::new("/etc")));
        assert!(!is_safe_path(Path::new("")));
        assert!(is_safe_path(Path::new("/home/user/repo")));
    }
}
