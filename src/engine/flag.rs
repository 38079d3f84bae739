use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    Pending,
    Committed,
    Failed,
}

/// Verdict of one attempt, shared with every branch forked during it.
///
/// Set at most once. A retry allocates a fresh flag, so branches of an
/// earlier attempt only ever observe that attempt's verdict.
#[derive(Debug)]
pub struct AttemptFlag {
    status: Mutex<AttemptStatus>,
    resolved: Condvar,
}

impl AttemptFlag {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(AttemptStatus::Pending),
            resolved: Condvar::new(),
        })
    }

    pub fn status(&self) -> AttemptStatus {
        *self.status.lock()
    }

    /// Returns `false` if the flag was already resolved.
    pub fn resolve(&self, verdict: AttemptStatus) -> bool {
        debug_assert_ne!(verdict, AttemptStatus::Pending);
        let mut status = self.status.lock();
        if *status != AttemptStatus::Pending {
            return false;
        }
        *status = verdict;
        self.resolved.notify_all();
        true
    }

    /// Parks the calling thread until the verdict is known. Callers on pool
    /// workers go through [`managed_block`](super::blocking::managed_block).
    pub fn wait(&self) -> AttemptStatus {
        let mut status = self.status.lock();
        while *status == AttemptStatus::Pending {
            self.resolved.wait(&mut status);
        }
        *status
    }

    pub fn wait_timeout(&self, timeout: Duration) -> AttemptStatus {
        let mut status = self.status.lock();
        if *status == AttemptStatus::Pending {
            self.resolved
                .wait_while_for(&mut status, |s| *s == AttemptStatus::Pending, timeout);
        }
        *status
    }
}
