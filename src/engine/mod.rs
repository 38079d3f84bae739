//! Engine facade: admission, the worker pool, stats and shutdown.

mod admission;
mod blocking;
mod flag;
mod handle;
mod task;

pub use blocking::managed_block;
pub use flag::{AttemptFlag, AttemptStatus};
pub use handle::OperationHandle;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::operation::{BoxedOperation, Operation};
use crate::predictor::ModePredictor;
use crate::txn::{Transaction, TransactionBackend};
use admission::{AdmissionQueue, QueuedOperation, Signal, run_admitter};
use handle::{DeferredState, TaskCompletion};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use task::{Step, keyed_scope, panic_message, run_operation};
use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct EngineTelemetry {
    jobs_submitted: AtomicU64,
    jobs_completed: AtomicU64,
    transactions_attempted: AtomicU64,
    stall_transactions: AtomicU64,
    fine_block_attempts: AtomicU64,
    retries: AtomicU64,
    abandoned_branches: AtomicU64,
    branches_forked: AtomicU64,
    continuations_run: AtomicU64,
    predictor_consultations: AtomicU64,
}

/// Point-in-time counters. Observational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStats {
    pub pool_size: usize,
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub transactions_attempted: u64,
    pub stall_transactions: u64,
    pub fine_block_attempts: u64,
    pub retries: u64,
    pub abandoned_branches: u64,
    pub branches_forked: u64,
    pub continuations_run: u64,
    pub predictor_consultations: u64,
    pub queue_depth: usize,
    pub active_roots: usize,
}

/// State shared by the facade, the admitter thread and every task.
pub(crate) struct EngineShared {
    config: EngineConfig,
    backend: Arc<dyn TransactionBackend>,
    predictor: Arc<dyn ModePredictor>,
    runtime: Handle,
    queue: AdmissionQueue,
    admit_signal: Signal,
    idle_signal: Signal,
    active: AtomicUsize,
    stopping: AtomicBool,
    fatal: OnceLock<Arc<EngineError>>,
    roots: OnceLock<Result<(), EngineError>>,
    telemetry: EngineTelemetry,
}

impl EngineShared {
    /// Reserves the root slot in queue order and spawns the root task. The
    /// item was already counted into `active` when it left the queue.
    fn admit(self: &Arc<Self>, item: QueuedOperation) {
        let QueuedOperation {
            op,
            handle,
            enqueued_at,
        } = item;
        let slot = self
            .backend
            .new_transaction(self.backend.pending_transactions(), keyed_scope(op.as_ref()));
        debug!(
            op = op.label(),
            txn = %slot.id(),
            position = %slot.position(),
            queued_us = enqueued_at.elapsed().as_micros() as u64,
            "admitted root operation"
        );
        let completion = TaskCompletion::new();
        handle.bind(Arc::clone(&completion));
        let guard = RootGuard {
            shared: Arc::clone(self),
            completion,
        };
        self.runtime.spawn(run_root(guard, op, slot));
    }

    async fn execute_root(
        self: &Arc<Self>,
        op: BoxedOperation,
        slot: Box<dyn Transaction>,
    ) -> Result<(), EngineError> {
        if let Some(cause) = self.fatal.get() {
            slot.close();
            return Err(EngineError::Poisoned(Arc::clone(cause)));
        }
        if let Err(err) = self.ensure_roots() {
            slot.close();
            return Err(self.poison(err));
        }
        let step = Step {
            op,
            slot,
            parent: None,
        };
        let outcome = match tokio::spawn(run_operation(Arc::clone(self), step)).await {
            Ok(result) => result,
            Err(err) => Err(join_error(err)),
        };
        outcome.map_err(|err| self.poison(err))
    }

    fn ensure_roots(&self) -> Result<(), EngineError> {
        self.roots
            .get_or_init(|| self.backend.init_roots().map_err(EngineError::from))
            .clone()
    }

    /// Records the first escaping error as the permanent cause.
    fn poison(&self, err: EngineError) -> EngineError {
        let cause = Arc::new(err);
        if self.fatal.set(Arc::clone(&cause)).is_ok() {
            error!(code = cause.code_str(), error = %cause, "engine permanently failed");
        }
        EngineError::Poisoned(self.fatal.get().map(Arc::clone).unwrap_or(cause))
    }

    fn stats(&self) -> EngineStats {
        let t = &self.telemetry;
        EngineStats {
            pool_size: self.config.parallelism,
            jobs_submitted: t.jobs_submitted.load(Ordering::Relaxed),
            jobs_completed: t.jobs_completed.load(Ordering::Relaxed),
            transactions_attempted: t.transactions_attempted.load(Ordering::Relaxed),
            stall_transactions: t.stall_transactions.load(Ordering::Relaxed),
            fine_block_attempts: t.fine_block_attempts.load(Ordering::Relaxed),
            retries: t.retries.load(Ordering::Relaxed),
            abandoned_branches: t.abandoned_branches.load(Ordering::Relaxed),
            branches_forked: t.branches_forked.load(Ordering::Relaxed),
            continuations_run: t.continuations_run.load(Ordering::Relaxed),
            predictor_consultations: t.predictor_consultations.load(Ordering::Relaxed),
            queue_depth: self.queue.len(),
            active_roots: self.active.load(Ordering::Acquire),
        }
    }
}

/// Completes the handle and releases the admission slot even if the root
/// task is dropped before finishing.
struct RootGuard {
    shared: Arc<EngineShared>,
    completion: Arc<TaskCompletion>,
}

impl Drop for RootGuard {
    fn drop(&mut self) {
        self.completion.complete(Err(EngineError::ShuttingDown));
        self.shared.active.fetch_sub(1, Ordering::AcqRel);
        self.shared
            .telemetry
            .jobs_completed
            .fetch_add(1, Ordering::Relaxed);
        self.shared.admit_signal.notify();
        self.shared.idle_signal.notify();
    }
}

async fn run_root(guard: RootGuard, op: BoxedOperation, slot: Box<dyn Transaction>) {
    let result = guard.shared.execute_root(op, slot).await;
    guard.completion.complete(result);
}

pub(crate) fn join_error(err: JoinError) -> EngineError {
    if err.is_panic() {
        EngineError::TaskPanicked(panic_message(err.into_panic().as_ref()))
    } else {
        EngineError::TaskJoin(err.to_string())
    }
}

/// Speculative operation engine.
///
/// Owns a multi-thread tokio runtime of `parallelism` workers and one
/// admitter thread. Operations are queued by [`Engine::submit`] and admitted
/// in submission order, which fixes the order their root transactions are
/// reserved in.
///
/// [`Engine::submit`] blocks while the queue is full and must not be called
/// from inside an operation.
pub struct Engine {
    shared: Arc<EngineShared>,
    runtime: Option<Runtime>,
    admitter: Option<std::thread::JoinHandle<()>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        backend: impl TransactionBackend,
        predictor: impl ModePredictor,
    ) -> Result<Self, EngineError> {
        Self::from_parts(config, Arc::new(backend), Arc::new(predictor))
    }

    pub fn from_parts(
        config: EngineConfig,
        backend: Arc<dyn TransactionBackend>,
        predictor: Arc<dyn ModePredictor>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.parallelism)
            .thread_name(config.thread_name.clone())
            .build()
            .map_err(|e| EngineError::Runtime(format!("failed to build worker pool: {e}")))?;
        let shared = Arc::new(EngineShared {
            queue: AdmissionQueue::new(config.queue_capacity),
            runtime: runtime.handle().clone(),
            backend,
            predictor,
            admit_signal: Signal::default(),
            idle_signal: Signal::default(),
            active: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            fatal: OnceLock::new(),
            roots: OnceLock::new(),
            telemetry: EngineTelemetry::default(),
            config,
        });
        let admitter = std::thread::Builder::new()
            .name(format!("{}-admitter", shared.config.thread_name))
            .spawn({
                let shared = Arc::clone(&shared);
                move || run_admitter(shared)
            })
            .map_err(|e| EngineError::Runtime(format!("failed to spawn admitter: {e}")))?;
        info!(
            parallelism = shared.config.parallelism,
            queue_capacity = shared.config.queue_capacity,
            max_active_roots = shared.config.max_active_roots(),
            "engine started"
        );
        Ok(Self {
            shared,
            runtime: Some(runtime),
            admitter: Some(admitter),
        })
    }

    /// Queues `op`, blocking while the queue is full.
    pub fn submit(&self, op: impl Operation) -> Result<OperationHandle, EngineError> {
        self.submit_boxed(Box::new(op))
    }

    pub fn submit_boxed(&self, op: BoxedOperation) -> Result<OperationHandle, EngineError> {
        let (item, handle) = queued(op);
        self.shared.queue.push(item)?;
        self.shared
            .telemetry
            .jobs_submitted
            .fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    /// Like [`Engine::submit`] but fails with [`EngineError::QueueFull`]
    /// instead of blocking.
    pub fn try_submit(&self, op: impl Operation) -> Result<OperationHandle, EngineError> {
        let (item, handle) = queued(Box::new(op));
        self.shared.queue.try_push(item)?;
        self.shared
            .telemetry
            .jobs_submitted
            .fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    pub fn stats(&self) -> EngineStats {
        self.shared.stats()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn fatal_cause(&self) -> Option<Arc<EngineError>> {
        self.shared.fatal.get().map(Arc::clone)
    }

    /// Stops admission, waits up to `shutdown_timeout` for queued and active
    /// work to drain, then stops the admitter and the pool.
    ///
    /// Fails with [`EngineError::ShutdownWithOutstandingWork`] if anything
    /// was still queued or running; handles of discarded work resolve with
    /// [`EngineError::ShuttingDown`].
    pub fn shutdown(mut self) -> Result<(), EngineError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        let Some(runtime) = self.runtime.take() else {
            return Ok(());
        };
        let shared = &self.shared;
        shared.queue.close();
        let deadline = Instant::now() + shared.config.shutdown_timeout;
        loop {
            if shared.queue.is_empty() && shared.active.load(Ordering::Acquire) == 0 {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            shared
                .idle_signal
                .wait_timeout((deadline - now).min(Duration::from_millis(10)));
        }

        shared.stopping.store(true, Ordering::Release);
        shared.admit_signal.notify();
        if let Some(admitter) = self.admitter.take()
            && admitter.join().is_err()
        {
            warn!("admitter thread panicked");
        }
        let discarded = shared.queue.drain();
        let queued = discarded.len();
        for item in discarded {
            item.handle
                .bind(TaskCompletion::resolved(Err(EngineError::ShuttingDown)));
        }
        let active = shared.active.load(Ordering::Acquire);
        runtime.shutdown_timeout(
            deadline
                .saturating_duration_since(Instant::now())
                .max(Duration::from_millis(10)),
        );

        if queued > 0 || active > 0 {
            warn!(queued, active, "engine stopped with outstanding work");
            return Err(EngineError::ShutdownWithOutstandingWork { queued, active });
        }
        info!(
            jobs_completed = shared.telemetry.jobs_completed.load(Ordering::Relaxed),
            "engine stopped"
        );
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "engine dropped without clean shutdown");
        }
    }
}

fn queued(op: BoxedOperation) -> (QueuedOperation, OperationHandle) {
    let state = DeferredState::new();
    let item = QueuedOperation {
        op,
        handle: Arc::clone(&state),
        enqueued_at: Instant::now(),
    };
    (item, OperationHandle::new(state))
}
