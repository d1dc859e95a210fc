//! Approval gate: human-in-the-loop blocking of sensitive actions
//!
//! A request persists a pending row (the state actor publishes
//! `approval.required`) and registers an in-memory waiter. `decision` blocks
//! until an external actor resolves the row; cancellation leaves the row
//! pending for later cleanup.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::domain::{Approval, ApprovalStatus};
use crate::state::{StateError, StateManager};

/// Gate errors
#[derive(Debug, Error)]
pub enum GateError {
    #[error("approval {0} not found")]
    NotFound(String),

    #[error("approval {0} already resolved")]
    AlreadyResolved(String),

    #[error(transparent)]
    State(#[from] StateError),
}

/// The approval gate
pub struct ApprovalGate {
    state: StateManager,
    waiters: Mutex<HashMap<String, watch::Sender<Option<ApprovalStatus>>>>,
}

impl ApprovalGate {
    pub fn new(state: StateManager) -> Self {
        Self {
            state,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Persist a pending approval and register for its resolution
    pub async fn request(
        &self,
        task_id: Option<&str>,
        session_id: Option<&str>,
        approval_type: &str,
        title: &str,
        description: &str,
        data: serde_json::Value,
    ) -> Result<Approval, GateError> {
        let approval = self
            .state
            .create_approval(task_id, session_id, approval_type, title, description, data)
            .await?;

        let (tx, _) = watch::channel(None);
        self.waiters.lock().await.insert(approval.id.clone(), tx);
        debug!(approval_id = %approval.id, "Approval requested");
        Ok(approval)
    }

    /// Block until the approval is resolved
    ///
    /// Callers needing cancellation wrap this in `select!`; an abandoned wait
    /// leaves the row pending.
    pub async fn decision(&self, approval_id: &str) -> Result<ApprovalStatus, GateError> {
        let mut rx = {
            let waiters = self.waiters.lock().await;
            match waiters.get(approval_id) {
                Some(tx) => tx.subscribe(),
                None => {
                    // No registered waiter: the row may already be resolved
                    let approval = self
                        .state
                        .get_approval(approval_id)
                        .await?
                        .ok_or_else(|| GateError::NotFound(approval_id.to_string()))?;
                    return match approval.status {
                        ApprovalStatus::Pending => Err(GateError::NotFound(approval_id.to_string())),
                        status => Ok(status),
                    };
                }
            }
        };

        loop {
            if let Some(status) = *rx.borrow() {
                return Ok(status);
            }
            if rx.changed().await.is_err() {
                warn!(approval_id, "Approval waiter channel dropped");
                return Err(GateError::NotFound(approval_id.to_string()));
            }
        }
    }

    /// Resolve a pending approval and wake any waiter
    ///
    /// Idempotent at the row level: a second resolution returns
    /// `AlreadyResolved` and wakes nobody.
    pub async fn resolve(&self, approval_id: &str, status: ApprovalStatus) -> Result<Approval, GateError> {
        let approval = self.state.resolve_approval(approval_id, status).await.map_err(|e| match e {
            StateError::Store(dexstore::StoreError::AlreadyResolved(id)) => GateError::AlreadyResolved(id),
            StateError::Store(dexstore::StoreError::NotFound(_)) => GateError::NotFound(approval_id.to_string()),
            other => GateError::State(other),
        })?;

        if let Some(tx) = self.waiters.lock().await.remove(approval_id) {
            let _ = tx.send(Some(status));
        }
        Ok(approval)
    }

    pub async fn get(&self, approval_id: &str) -> Result<Option<Approval>, GateError> {
        Ok(self.state.get_approval(approval_id).await?)
    }

    pub async fn list(&self, status: Option<ApprovalStatus>) -> Result<Vec<Approval>, GateError> {
        Ok(self.state.list_approvals(status).await?)
    }
}
