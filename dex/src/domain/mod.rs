//! Domain types for Poindexter
//!
//! Durable records live in [`dexstore`] and are re-exported here; this module
//! adds the in-memory-only types: budgets, priorities and session outcomes.

mod budget;
mod outcome;
mod priority;

pub use budget::SessionBudget;
pub use outcome::{FailureReason, SessionOutcome};
pub use priority::Priority;

// Re-export dexstore types for convenience
pub use dexstore::{
    allowed_transition, generate_id, slugify, Approval, ApprovalStatus, ChecklistItem, ChecklistStatus, MessageRole,
    NewTask, Project, Quest, QuestMessage, QuestStatus, Session, SessionActivity, SessionMessage, SessionState,
    StoreError, Task, TaskStatus,
};
