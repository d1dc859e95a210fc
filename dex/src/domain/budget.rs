//! Session budgets
//!
//! All three limits are optional; `None` means unlimited. Tokens count input
//! plus output across every iteration; dollars are the running cost at the
//! configured per-model rates; iterations are a strict cap.

use serde::{Deserialize, Serialize};

use super::{FailureReason, Task};

/// Budget limits for one session
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SessionBudget {
    pub max_iterations: Option<u32>,
    pub max_tokens: Option<u64>,
    pub max_dollars: Option<f64>,
}

impl SessionBudget {
    /// Take the budget limits off a task row
    pub fn from_task(task: &Task) -> Self {
        Self {
            max_iterations: task.max_iterations,
            max_tokens: task.max_tokens,
            max_dollars: task.max_dollars,
        }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Check counters against the limits before starting an iteration
    ///
    /// Returns the first exceeded budget, iterations checked first so an
    /// iteration cap is reported even when tokens also ran over.
    pub fn check(&self, iterations: u32, tokens: u64, dollars: f64) -> Option<FailureReason> {
        if let Some(max) = self.max_iterations
            && iterations >= max
        {
            return Some(FailureReason::BudgetIterations);
        }
        if let Some(max) = self.max_tokens
            && tokens >= max
        {
            return Some(FailureReason::BudgetTokens);
        }
        if let Some(max) = self.max_dollars
            && dollars >= max
        {
            return Some(FailureReason::BudgetDollars);
        }
        None
    }
}
