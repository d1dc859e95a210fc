//! DexStore - durable state for the Poindexter orchestration core
//!
//! A single SQLite database holds projects, quests, tasks (with their
//! dependency edges and checklists), sessions, session activity, approvals
//! and an opaque secrets table. Status transitions run inside transactions
//! so observers never see a half-applied state.
//!
//! The store is synchronous; the daemon serializes access to it through a
//! single-owner actor.

mod error;
mod id;
mod records;
mod schema;
mod store;

pub use error::StoreError;
pub use id::{generate_id, slugify};
pub use records::{
    allowed_transition, Approval, ApprovalStatus, ChecklistItem, ChecklistStatus, MessageRole, NewTask, Project,
    Quest, QuestMessage, QuestStatus, Session, SessionActivity, SessionMessage, SessionState, Task, TaskStatus,
};
pub use store::Store;

/// Convenience result alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;
