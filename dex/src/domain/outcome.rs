//! Session outcomes and typed failure reasons
//!
//! The sentinel scan produces exactly one outcome per session run, so
//! downstream handling is a flat match.

/// Why a session ended
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// The model signalled `TASK_COMPLETE`
    Complete,
    /// The model signalled `HAT_COMPLETE`; the task continues under the next hat
    HatComplete,
    /// The model requested a hat transition
    Transition(String),
    /// The session failed with a typed reason
    Failed(FailureReason),
    /// The session was cancelled by a caller
    Cancelled,
    /// A pause was requested; state is preserved for resume
    Paused,
}

/// Typed failure reasons, stored on the session row and emitted with the
/// terminal event
#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    BudgetIterations,
    BudgetTokens,
    BudgetDollars,
    ApprovalRejected,
    Stalled,
    InvalidTransition,
    LlmNetwork(String),
    LlmRateLimit(String),
    LlmBilling(String),
    LlmAuth(String),
    Internal(String),
}

impl FailureReason {
    /// Stable machine-readable reason string
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::BudgetIterations => "budget_exceeded_iterations",
            FailureReason::BudgetTokens => "budget_exceeded_tokens",
            FailureReason::BudgetDollars => "budget_exceeded_dollars",
            FailureReason::ApprovalRejected => "approval_rejected",
            FailureReason::Stalled => "stalled",
            FailureReason::InvalidTransition => "invalid_transition",
            FailureReason::LlmNetwork(_) => "llm_network",
            FailureReason::LlmRateLimit(_) => "llm_rate_limit",
            FailureReason::LlmBilling(_) => "llm_billing",
            FailureReason::LlmAuth(_) => "llm_auth",
            FailureReason::Internal(_) => "internal",
        }
    }

    /// Human-readable reason including detail where available
    pub fn detail(&self) -> String {
        match self {
            FailureReason::LlmNetwork(m)
            | FailureReason::LlmRateLimit(m)
            | FailureReason::LlmBilling(m)
            | FailureReason::LlmAuth(m)
            | FailureReason::Internal(m) => format!("{}: {}", self.as_str(), m),
            _ => self.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.detail())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_strings() {
        assert_eq!(FailureReason::BudgetIterations.as_str(), "budget_exceeded_iterations");
        assert_eq!(FailureReason::BudgetTokens.as_str(), "budget_exceeded_tokens");
        assert_eq!(FailureReason::BudgetDollars.as_str(), "budget_exceeded_dollars");
        assert_eq!(FailureReason::ApprovalRejected.as_str(), "approval_rejected");
        assert_eq!(FailureReason::Stalled.as_str(), "stalled");
        assert_eq!(FailureReason::InvalidTransition.as_str(), "invalid_transition");
    }

    #[test]
    fn test_detail_includes_message() {
        let reason = FailureReason::LlmAuth("bad key".to_string());
        assert_eq!(reason.detail(), "llm_auth: bad key");
    }
}
