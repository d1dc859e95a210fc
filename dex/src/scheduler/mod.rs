//! Scheduler: global cap on concurrent sessions
//!
//! A semaphore of `max_concurrent` permits gates the session manager. The
//! scheduler never starts work itself; it only admits or refuses. Waiters
//! queue FIFO. Permits are keyed by session id and released exactly once on
//! any terminal state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::SchedulerConfig;

/// Scheduler errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("scheduler at capacity")]
    Busy,

    #[error("session {0} already admitted")]
    AlreadyAdmitted(String),
}

/// Scheduler statistics
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    pub total_admitted: u64,
    pub total_released: u64,
    pub total_refused: u64,
    pub peak_concurrent: usize,
}

struct SchedulerInner {
    held: HashMap<String, OwnedSemaphorePermit>,
    stats: SchedulerStats,
}

/// Semaphore-backed session scheduler
pub struct Scheduler {
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    inner: Mutex<SchedulerInner>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
            max_concurrent: config.max_concurrent,
            inner: Mutex::new(SchedulerInner {
                held: HashMap::new(),
                stats: SchedulerStats::default(),
            }),
        }
    }

    /// Acquire a permit without waiting; `Busy` when at capacity
    pub fn try_admit(&self, session_id: &str) -> Result<(), SchedulerError> {
        {
            let inner = self.inner.lock().expect("scheduler lock poisoned");
            if inner.held.contains_key(session_id) {
                return Err(SchedulerError::AlreadyAdmitted(session_id.to_string()));
            }
        }

        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => {
                self.record_admit(session_id, permit);
                Ok(())
            }
            Err(_) => {
                let mut inner = self.inner.lock().expect("scheduler lock poisoned");
                inner.stats.total_refused += 1;
                debug!(session_id, "Scheduler refused: at capacity");
                Err(SchedulerError::Busy)
            }
        }
    }

    /// Acquire a permit, waiting FIFO behind earlier callers
    pub async fn admit(&self, session_id: &str) -> Result<(), SchedulerError> {
        {
            let inner = self.inner.lock().expect("scheduler lock poisoned");
            if inner.held.contains_key(session_id) {
                return Err(SchedulerError::AlreadyAdmitted(session_id.to_string()));
            }
        }

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .expect("scheduler semaphore closed");
        self.record_admit(session_id, permit);
        Ok(())
    }

    fn record_admit(&self, session_id: &str, permit: OwnedSemaphorePermit) {
        let mut inner = self.inner.lock().expect("scheduler lock poisoned");
        inner.held.insert(session_id.to_string(), permit);
        inner.stats.total_admitted += 1;
        let held = inner.held.len();
        inner.stats.peak_concurrent = inner.stats.peak_concurrent.max(held);
        debug!(session_id, held, "Scheduler admitted session");
    }

    /// Return a session's permit; idempotent
    pub fn release(&self, session_id: &str) {
        let mut inner = self.inner.lock().expect("scheduler lock poisoned");
        if inner.held.remove(session_id).is_some() {
            inner.stats.total_released += 1;
            debug!(session_id, held = inner.held.len(), "Scheduler released session");
        }
    }

    /// Whether a session currently holds a permit
    pub fn holds_permit(&self, session_id: &str) -> bool {
        self.inner.lock().expect("scheduler lock poisoned").held.contains_key(session_id)
    }

    pub fn in_use(&self) -> usize {
        self.inner.lock().expect("scheduler lock poisoned").held.len()
    }

    pub fn capacity(&self) -> usize {
        self.max_concurrent
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner.lock().expect("scheduler lock poisoned").stats.clone()
    }
}
