//! Per-job run locks.
//!
//! A job may only run while its [`RunLockGuard`] is alive. Acquisition never
//! waits: a second caller gets `None` and must report "already running".

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

/// Keyed registry of held run locks.
#[derive(Debug, Clone, Default)]
pub struct RunLocks {
    held: Arc<Mutex<HashSet<Uuid>>>,
}

impl RunLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the lock for `job_id` if nobody holds it.
    pub fn try_acquire(&self, job_id: Uuid) -> Option<RunLockGuard> {
        if self.held().insert(job_id) {
            Some(RunLockGuard {
                job_id,
                held: Arc::clone(&self.held),
            })
        } else {
            None
        }
    }

    pub fn is_held(&self, job_id: Uuid) -> bool {
        self.held().contains(&job_id)
    }

    /// Ids of jobs currently running.
    pub fn held_ids(&self) -> Vec<Uuid> {
        self.held().iter().copied().collect()
    }
}

/// Releases the job's lock when dropped.
#[derive(Debug)]
pub struct RunLockGuard {
    job_id: Uuid,
    held: Arc<Mutex<HashSet<Uuid>>>,
}

impl RunLockGuard {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.job_id);
    }
}
