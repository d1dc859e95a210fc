//! Prompt Loader
//!
//! Resolves a hat name to its system prompt. Lookup is deterministic:
//! worktree override, then repo default, then the embedded fallback.

use std::path::{Path, PathBuf};

use eyre::{eyre, Result};
use handlebars::Handlebars;
use serde::Serialize;
use tracing::debug;

use super::embedded;

/// Context rendered into a hat prompt template
#[derive(Debug, Clone, Default, Serialize)]
pub struct PromptContext {
    #[serde(rename = "task-title")]
    pub task_title: String,
    #[serde(rename = "task-description")]
    pub task_description: String,
    pub worktree: String,
}

impl PromptContext {
    pub fn new(task_title: &str, task_description: &str, worktree: &Path) -> Self {
        Self {
            task_title: task_title.to_string(),
            task_description: task_description.to_string(),
            worktree: worktree.display().to_string(),
        }
    }
}

/// Loads and renders hat prompts
pub struct PromptLoader {
    hbs: Handlebars<'static>,
    /// User override directory (`.dex/hats/`)
    user_dir: Option<PathBuf>,
    /// Repo default directory (`hats/`)
    repo_dir: Option<PathBuf>,
}

impl PromptLoader {
    /// Create a loader rooted at a worktree
    pub fn new(worktree: impl AsRef<Path>) -> Self {
        let worktree = worktree.as_ref();
        let user_dir = worktree.join(".dex/hats");
        let repo_dir = worktree.join("hats");

        Self {
            hbs: Handlebars::new(),
            user_dir: if user_dir.exists() { Some(user_dir) } else { None },
            repo_dir: if repo_dir.exists() { Some(repo_dir) } else { None },
        }
    }

    /// A loader that only uses embedded prompts
    pub fn embedded_only() -> Self {
        Self {
            hbs: Handlebars::new(),
            user_dir: None,
            repo_dir: None,
        }
    }

    /// Load the raw template for a hat
    ///
    /// Checks in order:
    /// 1. User override: `.dex/hats/{hat}.md`
    /// 2. Repo default: `hats/{hat}.md`
    /// 3. Embedded fallback
    pub fn prompt(&self, hat: &str) -> Result<String> {
        if let Some(ref user_dir) = self.user_dir {
            let path = user_dir.join(format!("{}.md", hat));
            if path.exists() {
                debug!("Loading hat prompt from user override: {:?}", path);
                return std::fs::read_to_string(&path)
                    .map_err(|e| eyre!("Failed to read hat prompt {}: {}", path.display(), e));
            }
        }

        if let Some(ref repo_dir) = self.repo_dir {
            let path = repo_dir.join(format!("{}.md", hat));
            if path.exists() {
                debug!("Loading hat prompt from repo: {:?}", path);
                return std::fs::read_to_string(&path)
                    .map_err(|e| eyre!("Failed to read hat prompt {}: {}", path.display(), e));
            }
        }

        if let Some(content) = embedded::get_embedded(hat) {
            debug!("Using embedded hat prompt: {}", hat);
            return Ok(content.to_string());
        }

        Err(eyre!("No prompt found for hat: {}", hat))
    }

    /// Resolve and render a hat's prompt with task context
    pub fn render(&self, hat: &str, context: &PromptContext) -> Result<String> {
        let template = self.prompt(hat)?;
        self.hbs
            .render_template(&template, context)
            .map_err(|e| eyre!("Failed to render prompt for hat {}: {}", hat, e))
    }
}
