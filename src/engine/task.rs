//! Per-operation state machine.
//!
//! Each attempt runs SELECT_MODE, RUN_TRANSFORM, AWAIT_PARENT (branches
//! only), COMMIT and INTERPRET. A successful attempt with a protected
//! continuation makes the continuation the current step of the same loop.
//! A failed attempt retries under global stall with a fresh flag.

use super::EngineShared;
use super::blocking::managed_block;
use super::flag::{AttemptFlag, AttemptStatus};
use super::join_error;
use crate::error::{BackendError, EngineError, TransformError};
use crate::identifier::IdentifierSet;
use crate::operation::{BoxedOperation, ExecutionPolicy, MapView, Operation};
use crate::predictor::{ExecutionMode, Prediction};
use crate::txn::{
    CommitOutcome, CommitStatus, Namespace, PendingSnapshot, SoftState, Transaction, TxnScope,
};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

pub(crate) type TaskFuture = Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send>>;

type Forked = JoinSet<Result<(), EngineError>>;

/// An operation bound to the slot its first attempt runs in.
pub(crate) struct Step {
    pub(crate) op: BoxedOperation,
    pub(crate) slot: Box<dyn Transaction>,
    /// Flag of the parent attempt that forked this operation.
    pub(crate) parent: Option<Arc<AttemptFlag>>,
}

enum AttemptOutcome {
    Committed(Box<dyn Transaction>),
    Retry(Box<dyn Transaction>),
    Abandoned,
}

struct ModeChoice {
    mode: ExecutionMode,
    /// Present when the predictor was consulted; used for training.
    consulted: Option<(PendingSnapshot, Prediction)>,
}

impl ModeChoice {
    fn fixed(mode: ExecutionMode) -> Self {
        Self {
            mode,
            consulted: None,
        }
    }
}

/// Marks the attempt failed if it ends without an explicit verdict, so
/// branches parked on it never wait forever.
struct AttemptGuard(Arc<AttemptFlag>);

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        self.0.resolve(AttemptStatus::Failed);
    }
}

pub(crate) fn keyed_scope(op: &dyn Operation) -> TxnScope {
    TxnScope::keyed(op.identifiers().map(Arc::new))
}

/// Boxed so branch tasks can spawn the same state machine recursively.
pub(crate) fn run_operation(shared: Arc<EngineShared>, step: Step) -> TaskFuture {
    Box::pin(drive(shared, step))
}

async fn drive(shared: Arc<EngineShared>, step: Step) -> Result<(), EngineError> {
    let Step {
        mut op,
        mut slot,
        parent,
    } = step;
    let mut forked = Forked::new();
    let mut conservative = false;
    let mut retries: u32 = 0;

    let result = loop {
        if let Some(parent) = parent.as_deref()
            && parent.status() == AttemptStatus::Failed
        {
            slot.close();
            shared
                .telemetry
                .abandoned_branches
                .fetch_add(1, Ordering::Relaxed);
            debug!(op = op.label(), txn = %slot.id(), "branch abandoned before start");
            break Ok(());
        }

        let attempt = run_attempt(
            &shared,
            op.as_mut(),
            slot,
            conservative,
            parent.as_ref(),
            &mut forked,
        )
        .await;

        match attempt {
            Err(err) => break Err(err),
            Ok(AttemptOutcome::Abandoned) => break Ok(()),
            Ok(AttemptOutcome::Committed(txn)) => {
                let Some(next) = op.protected_continuation() else {
                    break Ok(());
                };
                if let Err(err) = join_forked(&mut forked).await {
                    break Err(err);
                }
                shared
                    .telemetry
                    .continuations_run
                    .fetch_add(1, Ordering::Relaxed);
                debug!(from = op.label(), to = next.label(), "running protected continuation");
                slot = txn.chain(
                    shared.backend.pending_transactions(),
                    keyed_scope(next.as_ref()),
                );
                op = next;
                conservative = false;
                retries = 0;
            }
            Ok(AttemptOutcome::Retry(txn)) => {
                op.reset();
                retries = retries.saturating_add(1);
                if let Some(limit) = shared.config.max_conservative_retries
                    && retries > limit
                {
                    break Err(EngineError::RetryLimitExceeded {
                        operation: op.label().to_owned(),
                        attempts: retries,
                    });
                }
                conservative = true;
                shared.telemetry.retries.fetch_add(1, Ordering::Relaxed);
                slot = txn.chain(
                    shared.backend.pending_transactions(),
                    keyed_scope(op.as_ref()),
                );
            }
        }
    };

    let joined = join_forked(&mut forked).await;
    result.and(joined)
}

async fn run_attempt(
    shared: &Arc<EngineShared>,
    op: &mut dyn Operation,
    slot: Box<dyn Transaction>,
    conservative: bool,
    parent: Option<&Arc<AttemptFlag>>,
    forked: &mut Forked,
) -> Result<AttemptOutcome, EngineError> {
    let identifiers = op.identifiers();
    let choice = select_mode(
        shared,
        op,
        identifiers.as_ref(),
        conservative,
        slot.pending_snapshot(),
    )?;
    shared
        .telemetry
        .transactions_attempted
        .fetch_add(1, Ordering::Relaxed);
    let flag = AttemptFlag::new();
    let _guard = AttemptGuard(Arc::clone(&flag));

    let (txn, soft) = match choice.mode {
        ExecutionMode::Optimistic => (slot, SoftState::default()),
        ExecutionMode::GlobalStall => (
            stall(shared, slot, identifiers.as_ref())?,
            SoftState::default(),
        ),
        ExecutionMode::FineBlock => {
            shared
                .telemetry
                .fine_block_attempts
                .fetch_add(1, Ordering::Relaxed);
            let soft = gather_soft_state(shared, slot.as_ref(), choice.consulted.as_ref()).await?;
            (slot, soft)
        }
    };
    trace!(
        op = op.label(),
        mode = %choice.mode,
        txn = %txn.id(),
        position = %txn.position(),
        soft_entries = soft.len(),
        "starting attempt"
    );
    managed_block(|| txn.start(soft))?;

    let status = match run_transform(op, txn.as_ref()) {
        Err(status) => {
            txn.close();
            status
        }
        Ok(()) => {
            fork_branches(shared, op, txn.as_ref(), &flag, forked);
            if let Some(parent) = parent
                && await_parent(parent) == AttemptStatus::Failed
            {
                txn.close();
                flag.resolve(AttemptStatus::Failed);
                shared
                    .telemetry
                    .abandoned_branches
                    .fetch_add(1, Ordering::Relaxed);
                debug!(op = op.label(), txn = %txn.id(), "parent attempt failed; branch abandoned");
                return Ok(AttemptOutcome::Abandoned);
            }
            commit(shared, txn.as_ref(), choice.mode).await?
        }
    };

    let outcome = status.outcome();
    flag.resolve(match outcome {
        Some(CommitOutcome::Committed) => AttemptStatus::Committed,
        _ => AttemptStatus::Failed,
    });
    if let (Some((pending, _)), Some(identifiers)) = (&choice.consulted, &identifiers) {
        shared.predictor.train(pending, identifiers, status);
    }

    match outcome {
        Some(CommitOutcome::Committed) => {
            trace!(op = op.label(), txn = %txn.id(), mode = %choice.mode, "attempt committed");
            Ok(AttemptOutcome::Committed(txn))
        }
        Some(CommitOutcome::Retry) => {
            debug!(
                op = op.label(),
                txn = %txn.id(),
                mode = %choice.mode,
                status = status.code(),
                "attempt failed; retrying under global stall"
            );
            Ok(AttemptOutcome::Retry(txn))
        }
        None => Err(EngineError::UnknownCommitStatus { status }),
    }
}

fn select_mode(
    shared: &EngineShared,
    op: &dyn Operation,
    identifiers: Option<&IdentifierSet>,
    conservative: bool,
    pending: &PendingSnapshot,
) -> Result<ModeChoice, EngineError> {
    match op.execution_policy() {
        ExecutionPolicy::ForceOptimistic => return Ok(ModeChoice::fixed(ExecutionMode::Optimistic)),
        ExecutionPolicy::ForceGlobalBlock => {
            return Ok(ModeChoice::fixed(ExecutionMode::GlobalStall));
        }
        ExecutionPolicy::UsePredictor => {}
    }
    let Some(identifiers) = identifiers else {
        return Err(EngineError::MissingIdentifiers {
            operation: op.label().to_owned(),
        });
    };
    if conservative {
        return Ok(ModeChoice::fixed(ExecutionMode::GlobalStall));
    }
    shared
        .telemetry
        .predictor_consultations
        .fetch_add(1, Ordering::Relaxed);
    let prediction = shared.predictor.predict(pending, identifiers);
    Ok(ModeChoice {
        mode: prediction.mode,
        consulted: Some((pending.clone(), prediction)),
    })
}

/// Lands an empty exclusive barrier, then reserves the exclusive slot the
/// transform runs in.
fn stall(
    shared: &EngineShared,
    slot: Box<dyn Transaction>,
    identifiers: Option<&IdentifierSet>,
) -> Result<Box<dyn Transaction>, EngineError> {
    slot.close();
    let barrier = slot.chain(PendingSnapshot::default(), TxnScope::exclusive(None));
    let status = managed_block(|| -> Result<Option<CommitStatus>, BackendError> {
        barrier.start(SoftState::default())?;
        Ok(barrier.commit(true))
    })?;
    shared
        .telemetry
        .stall_transactions
        .fetch_add(1, Ordering::Relaxed);
    if status != Some(CommitStatus::SUCCESS) {
        debug!(txn = %barrier.id(), ?status, "stall barrier did not commit");
    }
    Ok(slot.chain(
        shared.backend.pending_transactions(),
        TxnScope::exclusive(identifiers.cloned().map(Arc::new)),
    ))
}

/// Fetches staged writes of the flagged pending transactions that precede
/// `txn`, merging them in snapshot order. Parents and earlier siblings
/// precede their branches; descendants of `txn` never do.
async fn gather_soft_state(
    shared: &EngineShared,
    txn: &dyn Transaction,
    consulted: Option<&(PendingSnapshot, Prediction)>,
) -> Result<SoftState, EngineError> {
    let mut soft = SoftState::default();
    let Some((pending, prediction)) = consulted else {
        return Ok(soft);
    };
    let mut fetches = JoinSet::new();
    for (index, entry) in pending.entries().iter().enumerate() {
        if !prediction.waits_on(index) || !entry.position.precedes(txn.position()) {
            continue;
        }
        let staged = shared.backend.staged_data(entry.id);
        fetches.spawn(async move { (index, staged.await) });
    }
    let mut fetched = Vec::with_capacity(fetches.len());
    while let Some(joined) = fetches.join_next().await {
        let (index, staged) = joined.map_err(join_error)?;
        fetched.push((index, staged?));
    }
    fetched.sort_by_key(|(index, _)| *index);
    for (_, staged) in &fetched {
        soft.merge(staged);
    }
    Ok(soft)
}

/// Transform failures and panics become synthetic commit statuses.
fn run_transform(op: &mut dyn Operation, txn: &dyn Transaction) -> Result<(), CommitStatus> {
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let persistent = MapView::new(txn, Namespace::Persistent);
        let ephemeral = MapView::new(txn, Namespace::Ephemeral);
        op.transform(&persistent, &ephemeral)
    }));
    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(TransformError::ExpiredRead)) => Err(CommitStatus::EXPIRED_READ),
        Ok(Err(err)) => {
            debug!(op = op.label(), error = %err, "transform failed");
            Err(CommitStatus::UNSPECIFIED)
        }
        Err(panic) => {
            warn!(op = op.label(), panic = %panic_message(panic.as_ref()), "transform panicked");
            Err(CommitStatus::UNSPECIFIED)
        }
    }
}

fn fork_branches(
    shared: &Arc<EngineShared>,
    op: &mut dyn Operation,
    txn: &dyn Transaction,
    flag: &Arc<AttemptFlag>,
    forked: &mut Forked,
) {
    for branch in op.branches() {
        let slot = txn.chain(
            shared.backend.pending_transactions(),
            keyed_scope(branch.as_ref()),
        );
        shared
            .telemetry
            .branches_forked
            .fetch_add(1, Ordering::Relaxed);
        trace!(parent = op.label(), branch = branch.label(), txn = %slot.id(), "forking branch");
        forked.spawn(run_operation(
            Arc::clone(shared),
            Step {
                op: branch,
                slot,
                parent: Some(Arc::clone(flag)),
            },
        ));
    }
}

fn await_parent(parent: &AttemptFlag) -> AttemptStatus {
    match parent.status() {
        AttemptStatus::Pending => managed_block(|| parent.wait()),
        verdict => verdict,
    }
}

async fn commit(
    shared: &EngineShared,
    txn: &dyn Transaction,
    mode: ExecutionMode,
) -> Result<CommitStatus, EngineError> {
    if mode == ExecutionMode::FineBlock {
        for _ in 0..shared.config.fine_block_commit_probes {
            if let Some(status) = txn.commit(false) {
                return Ok(status);
            }
            tokio::task::yield_now().await;
        }
    }
    managed_block(|| txn.commit(true)).ok_or_else(|| {
        EngineError::Backend(format!("blocking commit of {} returned no status", txn.id()))
    })
}

/// Waits for every forked branch, keeping the first failure.
async fn join_forked(forked: &mut Forked) -> Result<(), EngineError> {
    let mut first_error = None;
    while let Some(joined) = forked.join_next().await {
        let result = joined.map_err(join_error).and_then(|result| result);
        if let Err(err) = result
            && first_error.is_none()
        {
            first_error = Some(err);
        }
    }
    first_error.map_or(Ok(()), Err)
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
