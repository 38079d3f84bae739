//! In-memory multi-version backend implementing the transaction contract.
//!
//! Reads are snapshot reads at the sequence current when a transaction
//! starts. Each key keeps a bounded history; a snapshot older than the
//! retained history fails with [`ReadError::Expired`](crate::error::ReadError).
//! Commit validates every read against the newest committed version and
//! every soft-state read against the outcome of its source transaction.

mod txn;

pub use txn::MemoryTransaction;

use crate::error::BackendError;
use crate::identifier::Identifier;
use crate::txn::{
    CommitStatus, Namespace, PendingEntry, PendingSnapshot, Position, StagedFuture,
    StagedWrites, Transaction, TransactionBackend, TxnId, TxnScope,
};
use crate::value::Value;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::debug;

const OUTCOME_RETENTION: usize = 1 << 16;

#[derive(Debug, Clone)]
pub struct MemoryBackendConfig {
    /// Committed versions retained per key.
    pub history_depth: usize,
}

impl Default for MemoryBackendConfig {
    fn default() -> Self {
        Self { history_depth: 64 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryBackendStats {
    pub root_inits: u64,
    pub transactions_created: u64,
    pub commits: u64,
    pub collisions: u64,
    pub injected_faults: u64,
    pub expired_reads: u64,
    pub closed_without_commit: u64,
}

#[derive(Debug, Clone)]
struct Version {
    seq: u64,
    value: Option<Value>,
    writer: TxnId,
    writer_created: u64,
}

#[derive(Debug, Default)]
struct KeyHistory {
    versions: VecDeque<Version>,
    pruned: bool,
}

impl KeyHistory {
    fn latest(&self) -> Option<&Version> {
        self.versions.back()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnOutcome {
    Committed,
    Aborted,
}

struct PendingRecord {
    position: Position,
    identifiers: Option<Arc<crate::identifier::IdentifierSet>>,
    staged: watch::Sender<Option<Arc<StagedWrites>>>,
}

struct FaultRule {
    matches: Identifier,
    status: CommitStatus,
    remaining: usize,
}

#[derive(Default)]
struct StoreState {
    commit_seq: u64,
    data: HashMap<(Namespace, Identifier), KeyHistory>,
    pending: BTreeMap<TxnId, PendingRecord>,
    outcomes: HashMap<TxnId, TxnOutcome>,
    outcome_order: VecDeque<TxnId>,
    started: usize,
    exclusive_running: bool,
    exclusive_waiting: usize,
    faults: Vec<FaultRule>,
    stats: MemoryBackendStats,
}

impl StoreState {
    fn record_outcome(&mut self, id: TxnId, outcome: TxnOutcome) {
        self.pending.remove(&id);
        self.outcomes.insert(id, outcome);
        self.outcome_order.push_back(id);
        while self.outcome_order.len() > OUTCOME_RETENTION {
            if let Some(old) = self.outcome_order.pop_front() {
                self.outcomes.remove(&old);
            }
        }
    }

    fn release_start(&mut self, exclusive: bool) {
        self.started = self.started.saturating_sub(1);
        if exclusive {
            self.exclusive_running = false;
        }
    }

    fn take_fault(&mut self, scope: &TxnScope) -> Option<CommitStatus> {
        let ids = scope.identifiers.as_deref()?;
        let rule = self
            .faults
            .iter_mut()
            .find(|r| r.remaining > 0 && ids.iter().any(|id| id.overlaps(&r.matches)))?;
        rule.remaining -= 1;
        let status = rule.status;
        self.faults.retain(|r| r.remaining > 0);
        self.stats.injected_faults += 1;
        Some(status)
    }
}

pub(crate) struct Shared {
    config: MemoryBackendConfig,
    next_root: AtomicU64,
    next_id: AtomicU64,
    clock: AtomicU64,
    state: Mutex<StoreState>,
    cv: Condvar,
}

impl Shared {
    fn reserve(
        self: &Arc<Self>,
        position: Position,
        pending: PendingSnapshot,
        scope: TxnScope,
    ) -> Box<dyn Transaction> {
        let id = TxnId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let created = self.clock.fetch_add(1, Ordering::AcqRel) + 1;
        let (staged, _) = watch::channel(None);
        {
            let mut state = self.state.lock();
            state.pending.insert(
                id,
                PendingRecord {
                    position: position.clone(),
                    identifiers: scope.identifiers.clone(),
                    staged,
                },
            );
            state.stats.transactions_created += 1;
        }
        Box::new(MemoryTransaction::new(
            Arc::clone(self),
            id,
            position,
            scope,
            pending,
            created,
        ))
    }

    fn read_clock(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }
}

/// Reference backend; cheap to clone, clones share the same store.
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(MemoryBackendConfig::default())
    }
}

impl MemoryBackend {
    pub fn new(config: MemoryBackendConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                next_root: AtomicU64::new(0),
                next_id: AtomicU64::new(0),
                clock: AtomicU64::new(0),
                state: Mutex::new(StoreState::default()),
                cv: Condvar::new(),
            }),
        }
    }

    /// Forces the next `times` commits whose identifiers overlap `matches`
    /// to fail with `status` instead of validating.
    pub fn inject_commit_fault(&self, matches: Identifier, status: CommitStatus, times: usize) {
        if times == 0 {
            return;
        }
        self.shared.state.lock().faults.push(FaultRule {
            matches,
            status,
            remaining: times,
        });
    }

    pub fn committed_value(&self, namespace: Namespace, key: &Identifier) -> Option<Value> {
        let state = self.shared.state.lock();
        state
            .data
            .get(&(namespace, key.clone()))
            .and_then(KeyHistory::latest)
            .and_then(|v| v.value.clone())
    }

    /// Latest committed contents of one namespace.
    pub fn committed_entries(&self, namespace: Namespace) -> BTreeMap<Identifier, Value> {
        let state = self.shared.state.lock();
        state
            .data
            .iter()
            .filter(|((ns, _), _)| *ns == namespace)
            .filter_map(|((_, key), history)| {
                let value = history.latest()?.value.clone()?;
                Some((key.clone(), value))
            })
            .collect()
    }

    pub fn commit_seq(&self) -> u64 {
        self.shared.state.lock().commit_seq
    }

    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    pub fn stats(&self) -> MemoryBackendStats {
        self.shared.state.lock().stats
    }
}

impl TransactionBackend for MemoryBackend {
    fn init_roots(&self) -> Result<(), BackendError> {
        let mut state = self.shared.state.lock();
        state.stats.root_inits += 1;
        debug!(root_inits = state.stats.root_inits, "memory backend roots initialized");
        Ok(())
    }

    fn new_transaction(&self, pending: PendingSnapshot, scope: TxnScope) -> Box<dyn Transaction> {
        let slot = self.shared.next_root.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.reserve(Position::root(slot), pending, scope)
    }

    fn pending_transactions(&self) -> PendingSnapshot {
        let state = self.shared.state.lock();
        PendingSnapshot::new(
            state
                .pending
                .iter()
                .map(|(id, record)| PendingEntry {
                    id: *id,
                    position: record.position.clone(),
                    identifiers: record.identifiers.clone(),
                })
                .collect(),
        )
    }

    fn staged_data(&self, id: TxnId) -> StagedFuture {
        let rx = {
            let state = self.shared.state.lock();
            state.pending.get(&id).map(|record| record.staged.subscribe())
        };
        Box::pin(async move {
            let Some(mut rx) = rx else {
                return Ok(StagedWrites::empty(id));
            };
            // A dropped sender means the transaction resolved; its committed
            // writes are visible to any later snapshot.
            let staged = match rx.wait_for(Option::is_some).await {
                Ok(current) => current.clone(),
                Err(_) => None,
            };
            Ok(staged
                .map(|s| (*s).clone())
                .unwrap_or_else(|| StagedWrites::empty(id)))
        })
    }
}
