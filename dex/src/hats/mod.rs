//! Hat transition machine
//!
//! Hats are named roles; the allowed-transition graph and the terminal set
//! come from configuration and never change at runtime. Reaching a terminal
//! hat's completion marks the whole task completed.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::config::HatsConfig;

/// Static registry of hat transitions
#[derive(Debug, Clone)]
pub struct HatRegistry {
    transitions: HashMap<String, Vec<String>>,
    terminal: HashSet<String>,
}

impl HatRegistry {
    pub fn from_config(config: &HatsConfig) -> Self {
        debug!(
            hats = config.transitions.len(),
            terminal = config.terminal.len(),
            "HatRegistry::from_config: building registry"
        );
        Self {
            transitions: config.transitions.clone(),
            terminal: config.terminal.iter().cloned().collect(),
        }
    }

    /// Whether completing under this hat completes the task
    pub fn is_terminal(&self, hat: &str) -> bool {
        self.terminal.contains(hat)
    }

    /// Whether `from -> to` is an allowed transition
    pub fn can_transition(&self, from: &str, to: &str) -> bool {
        self.transitions
            .get(from)
            .is_some_and(|targets| targets.iter().any(|t| t == to))
    }

    /// Hats reachable from the given hat
    pub fn allowed_from(&self, hat: &str) -> &[String] {
        self.transitions.get(hat).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether the hat appears anywhere in the registry
    pub fn is_known(&self, hat: &str) -> bool {
        self.terminal.contains(hat)
            || self.transitions.contains_key(hat)
            || self.transitions.values().any(|targets| targets.iter().any(|t| t == hat))
    }
}

impl Default for HatRegistry {
    fn default() -> Self {
        Self::from_config(&HatsConfig::default())
    }
}
