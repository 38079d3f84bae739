use crate::error::EngineError;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result holder of one root task.
#[derive(Debug, Default)]
pub(crate) struct TaskCompletion {
    result: Mutex<Option<Result<(), EngineError>>>,
    done: Condvar,
}

impl TaskCompletion {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn resolved(result: Result<(), EngineError>) -> Arc<Self> {
        let completion = Self::new();
        completion.complete(result);
        completion
    }

    /// Only the first result is kept.
    pub(crate) fn complete(&self, result: Result<(), EngineError>) -> bool {
        let mut slot = self.result.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(result);
        self.done.notify_all();
        true
    }

    fn is_done(&self) -> bool {
        self.result.lock().is_some()
    }

    fn wait_until(&self, deadline: Option<Instant>) -> Result<(), EngineError> {
        let mut slot = self.result.lock();
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            match deadline {
                None => self.done.wait(&mut slot),
                Some(deadline) => {
                    if self.done.wait_until(&mut slot, deadline).timed_out() && slot.is_none() {
                        return Err(EngineError::Timeout);
                    }
                }
            }
        }
    }
}

/// Binding point between a handle returned at submission and the root task
/// that is created later by the admitter.
#[derive(Debug, Default)]
pub(crate) struct DeferredState {
    inner: Mutex<Option<Arc<TaskCompletion>>>,
    bound: Condvar,
}

impl DeferredState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn bind(&self, completion: Arc<TaskCompletion>) {
        let mut inner = self.inner.lock();
        if inner.is_none() {
            *inner = Some(completion);
            self.bound.notify_all();
        }
    }

    fn wait_bound(&self, deadline: Option<Instant>) -> Option<Arc<TaskCompletion>> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(completion) = inner.as_ref() {
                return Some(Arc::clone(completion));
            }
            match deadline {
                None => self.bound.wait(&mut inner),
                Some(deadline) => {
                    if self.bound.wait_until(&mut inner, deadline).timed_out() {
                        return inner.clone();
                    }
                }
            }
        }
    }
}

/// Handle returned by [`Engine::submit`](super::Engine::submit).
///
/// Resolves `Ok` once the operation and every branch and continuation it
/// induced have committed. An unrecovered failure anywhere in the engine
/// resolves it with [`EngineError::Poisoned`]. Cancellation is not supported:
/// by the time a request could arrive, part of the operation's tree may
/// already be committed.
#[derive(Debug, Clone)]
pub struct OperationHandle {
    state: Arc<DeferredState>,
}

impl OperationHandle {
    pub(crate) fn new(state: Arc<DeferredState>) -> Self {
        Self { state }
    }

    pub fn get(&self) -> Result<(), EngineError> {
        match self.state.wait_bound(None) {
            Some(completion) => completion.wait_until(None),
            None => Err(EngineError::Timeout),
        }
    }

    /// Bounds only the caller's wait; the operation keeps running.
    pub fn get_timeout(&self, timeout: Duration) -> Result<(), EngineError> {
        let deadline = Instant::now() + timeout;
        match self.state.wait_bound(Some(deadline)) {
            Some(completion) => completion.wait_until(Some(deadline)),
            None => Err(EngineError::Timeout),
        }
    }

    pub fn is_done(&self) -> bool {
        self.state
            .inner
            .lock()
            .as_ref()
            .is_some_and(|completion| completion.is_done())
    }

    pub fn cancel(&self) -> Result<(), EngineError> {
        Err(EngineError::CancellationUnsupported)
    }

    pub fn is_cancelled(&self) -> bool {
        false
    }
}
