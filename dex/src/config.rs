//! Poindexter configuration types and loading

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// LLM provider configuration
    pub llm: LlmConfig,

    /// Per-model pricing for dollar budgets
    pub rates: RatesConfig,

    /// Concurrency limits
    pub scheduler: SchedulerConfig,

    /// Session loop defaults
    pub session: SessionConfig,

    /// Hat transition graph
    pub hats: HatsConfig,

    /// Storage locations
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration with fallback chain
    ///
    /// Explicit path, then project-local `.dex.yml`, then the user config
    /// dir, then defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".dex.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("dex").join("dex.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name (currently only "anthropic" supported)
    pub provider: String,

    /// Model identifier
    pub model: String,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// API base URL
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Maximum tokens per response
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 16384,
            timeout_ms: 300_000,
        }
    }
}

/// USD per million tokens for one model family
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelRate {
    pub input: f64,
    pub output: f64,
}

/// Per-model pricing table
///
/// Matched by substring so full model identifiers resolve to their family.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RatesConfig {
    pub models: HashMap<String, ModelRate>,
    /// Fallback when no family matches
    pub default: ModelRate,
}

impl Default for RatesConfig {
    fn default() -> Self {
        let mut models = HashMap::new();
        models.insert("opus".to_string(), ModelRate { input: 15.0, output: 75.0 });
        models.insert("sonnet".to_string(), ModelRate { input: 3.0, output: 15.0 });
        models.insert("haiku".to_string(), ModelRate { input: 0.25, output: 1.25 });
        Self {
            models,
            default: ModelRate { input: 3.0, output: 15.0 },
        }
    }
}

impl RatesConfig {
    pub fn rate_for(&self, model: &str) -> ModelRate {
        self.models
            .iter()
            .find(|(family, _)| model.contains(family.as_str()))
            .map(|(_, rate)| *rate)
            .unwrap_or(self.default)
    }

    /// Dollar cost of one call at the model's rates
    pub fn cost_usd(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let rate = self.rate_for(model);
        (input_tokens as f64 / 1_000_000.0) * rate.input + (output_tokens as f64 / 1_000_000.0) * rate.output
    }
}

/// Concurrency limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum concurrent sessions
    #[serde(rename = "max-concurrent")]
    pub max_concurrent: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_concurrent: 25 }
    }
}

/// Session loop defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Default iteration cap when a task sets none
    #[serde(rename = "max-iterations")]
    pub max_iterations: u32,

    /// Consecutive idle iterations before the session fails as stalled
    #[serde(rename = "stall-threshold")]
    pub stall_threshold: u32,

    /// Max characters of reply text persisted per activity row
    #[serde(rename = "snippet-chars")]
    pub snippet_chars: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            stall_threshold: 3,
            snippet_chars: 500,
        }
    }
}

/// Hat transition graph
///
/// Reaching a terminal hat's completion marks the task itself completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HatsConfig {
    /// Allowed transitions: hat -> hats it may hand off to
    pub transitions: HashMap<String, Vec<String>>,

    /// Hats whose completion completes the task
    pub terminal: Vec<String>,
}

impl Default for HatsConfig {
    fn default() -> Self {
        let mut transitions = HashMap::new();
        transitions.insert(
            "planner".to_string(),
            vec!["creator".to_string(), "tester".to_string(), "documenter".to_string()],
        );
        transitions.insert(
            "creator".to_string(),
            vec![
                "tester".to_string(),
                "refactorer".to_string(),
                "documenter".to_string(),
                "devops".to_string(),
                "conflict_manager".to_string(),
            ],
        );
        transitions.insert(
            "tester".to_string(),
            vec!["creator".to_string(), "refactorer".to_string(), "documenter".to_string()],
        );
        transitions.insert(
            "refactorer".to_string(),
            vec!["tester".to_string(), "documenter".to_string()],
        );
        Self {
            transitions,
            terminal: vec![
                "documenter".to_string(),
                "devops".to_string(),
                "conflict_manager".to_string(),
            ],
        }
    }
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path
    #[serde(rename = "db-path")]
    pub db_path: PathBuf,

    /// Base directory for scratch worktrees
    #[serde(rename = "base-dir")]
    pub base_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dex");
        Self {
            db_path: data_dir.join("dex.db"),
            base_dir: data_dir,
        }
    }
}
