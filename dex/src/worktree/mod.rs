//! Worktree lifecycle: per-task isolated checkouts

mod manager;

pub use manager::{Placement, WorktreeConfig, WorktreeError, WorktreeManager, INSTALL_MARKER};
