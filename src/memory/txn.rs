use super::{KeyHistory, Shared, StoreState, TxnOutcome, Version};
use crate::error::{BackendError, ReadError};
use crate::identifier::Identifier;
use crate::txn::{
    CommitStatus, Namespace, PendingSnapshot, Position, SoftState, StagedWrite, StagedWrites,
    Transaction, TxnId, TxnScope,
};
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

type SlotKey = (Namespace, Identifier);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Reserved,
    Started,
    Committed,
    Closed,
}

#[derive(Debug, Clone, Copy)]
enum ReadRecord {
    Store { version_seq: u64, read_clock: u64 },
    Soft { source: TxnId, read_clock: u64 },
}

struct TxnInner {
    phase: Phase,
    start_seq: u64,
    soft: SoftState,
    reads: HashMap<SlotKey, ReadRecord>,
    writes: BTreeMap<SlotKey, Option<Value>>,
    staged_published: bool,
    status: Option<CommitStatus>,
}

enum Verdict {
    Undecided,
    Decided(CommitStatus),
}

pub struct MemoryTransaction {
    shared: Arc<Shared>,
    id: TxnId,
    position: Position,
    scope: TxnScope,
    pending: PendingSnapshot,
    created: u64,
    chains: AtomicU64,
    inner: Mutex<TxnInner>,
}

impl MemoryTransaction {
    pub(super) fn new(
        shared: Arc<Shared>,
        id: TxnId,
        position: Position,
        scope: TxnScope,
        pending: PendingSnapshot,
        created: u64,
    ) -> Self {
        Self {
            shared,
            id,
            position,
            scope,
            pending,
            created,
            chains: AtomicU64::new(0),
            inner: Mutex::new(TxnInner {
                phase: Phase::Reserved,
                start_seq: 0,
                soft: SoftState::default(),
                reads: HashMap::new(),
                writes: BTreeMap::new(),
                staged_published: false,
                status: None,
            }),
        }
    }

    /// Creation clock value; conflicts with writers created after a read are
    /// reported as later collisions.
    pub fn created(&self) -> u64 {
        self.created
    }

    fn publish_staged(&self, inner: &mut TxnInner, state: &StoreState) {
        if inner.staged_published {
            return;
        }
        inner.staged_published = true;
        if let Some(record) = state.pending.get(&self.id) {
            let writes = inner
                .writes
                .iter()
                .map(|((namespace, key), value)| StagedWrite {
                    namespace: *namespace,
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect();
            record.staged.send_replace(Some(Arc::new(StagedWrites {
                txn: self.id,
                writes,
            })));
        }
    }

    fn validate(&self, inner: &TxnInner, state: &StoreState) -> Verdict {
        for (key, record) in &inner.reads {
            let latest = state.data.get(key).and_then(KeyHistory::latest);
            match *record {
                ReadRecord::Store {
                    version_seq,
                    read_clock,
                } => {
                    if let Some(latest) = latest
                        && latest.seq > version_seq
                    {
                        return Verdict::Decided(collision(latest, read_clock));
                    }
                }
                ReadRecord::Soft { source, read_clock } => {
                    if state.pending.contains_key(&source) {
                        return Verdict::Undecided;
                    }
                    match state.outcomes.get(&source) {
                        Some(TxnOutcome::Committed) => {
                            if let Some(latest) = latest
                                && latest.writer != source
                            {
                                return Verdict::Decided(collision(latest, read_clock));
                            }
                        }
                        _ => return Verdict::Decided(CommitStatus::CURRENT_COLLISION),
                    }
                }
            }
        }
        Verdict::Decided(CommitStatus::SUCCESS)
    }

    fn apply(&self, inner: &mut TxnInner, state: &mut StoreState) {
        state.commit_seq += 1;
        let seq = state.commit_seq;
        let depth = self.shared.config.history_depth.max(1);
        for (key, value) in std::mem::take(&mut inner.writes) {
            let history = state.data.entry(key).or_default();
            history.versions.push_back(Version {
                seq,
                value,
                writer: self.id,
                writer_created: self.created,
            });
            while history.versions.len() > depth {
                history.versions.pop_front();
                history.pruned = true;
            }
        }
        state.stats.commits += 1;
    }

    fn finish(&self, inner: &mut TxnInner, state: &mut StoreState, status: CommitStatus) {
        let was_started = inner.phase == Phase::Started;
        if status.is_success() {
            self.apply(inner, state);
            state.record_outcome(self.id, TxnOutcome::Committed);
        } else {
            state.stats.collisions += 1;
            state.record_outcome(self.id, TxnOutcome::Aborted);
        }
        if was_started {
            state.release_start(self.scope.exclusive);
        }
        inner.phase = Phase::Committed;
        inner.status = Some(status);
        self.shared.cv.notify_all();
    }

    fn snapshot_read(
        &self,
        state: &StoreState,
        key: &SlotKey,
        start_seq: u64,
    ) -> Result<(Option<Value>, u64), ReadError> {
        let Some(history) = state.data.get(key) else {
            return Ok((None, 0));
        };
        match history.versions.iter().rev().find(|v| v.seq <= start_seq) {
            Some(version) => Ok((version.value.clone(), version.seq)),
            None if history.pruned => Err(ReadError::Expired),
            None => Ok((None, 0)),
        }
    }
}

fn collision(latest: &Version, read_clock: u64) -> CommitStatus {
    if latest.writer_created <= read_clock {
        CommitStatus::CURRENT_COLLISION
    } else {
        CommitStatus::LATER_COLLISION
    }
}

impl Transaction for MemoryTransaction {
    fn id(&self) -> TxnId {
        self.id
    }

    fn position(&self) -> &Position {
        &self.position
    }

    fn scope(&self) -> &TxnScope {
        &self.scope
    }

    fn pending_snapshot(&self) -> &PendingSnapshot {
        &self.pending
    }

    fn chain(&self, pending: PendingSnapshot, scope: TxnScope) -> Box<dyn Transaction> {
        let ordinal = self.chains.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared
            .reserve(self.position.child(ordinal), pending, scope)
    }

    fn start(&self, soft: SoftState) -> Result<(), BackendError> {
        let mut inner = self.inner.lock();
        match inner.phase {
            Phase::Reserved => {}
            Phase::Started => return Err(BackendError::AlreadyStarted(self.id.0)),
            Phase::Committed | Phase::Closed => return Err(BackendError::Closed(self.id.0)),
        }
        let mut state = self.shared.state.lock();
        if !state.pending.contains_key(&self.id) {
            return Err(BackendError::UnknownTransaction(self.id.0));
        }
        if self.scope.exclusive {
            state.exclusive_waiting += 1;
            while state.exclusive_running || state.started > 0 {
                self.shared.cv.wait(&mut state);
            }
            state.exclusive_waiting -= 1;
            state.exclusive_running = true;
        } else {
            while state.exclusive_running || state.exclusive_waiting > 0 {
                self.shared.cv.wait(&mut state);
            }
        }
        state.started += 1;
        inner.start_seq = state.commit_seq;
        inner.phase = Phase::Started;
        inner.soft = soft;
        Ok(())
    }

    fn read(&self, namespace: Namespace, key: &Identifier) -> Result<Option<Value>, ReadError> {
        let mut inner = self.inner.lock();
        match inner.phase {
            Phase::Started => {}
            Phase::Reserved => return Err(ReadError::NotStarted),
            Phase::Committed | Phase::Closed => return Err(ReadError::Closed),
        }
        let slot = (namespace, key.clone());
        if let Some(value) = inner.writes.get(&slot) {
            return Ok(value.clone());
        }
        let read_clock = self.shared.read_clock();
        if let Some(entry) = inner.soft.get(namespace, key) {
            let value = entry.value.clone();
            let source = entry.source;
            inner
                .reads
                .entry(slot)
                .or_insert(ReadRecord::Soft { source, read_clock });
            return Ok(value);
        }
        let start_seq = inner.start_seq;
        let read = {
            let mut state = self.shared.state.lock();
            let read = self.snapshot_read(&state, &slot, start_seq);
            if read.is_err() {
                state.stats.expired_reads += 1;
            }
            read
        };
        let (value, version_seq) = read?;
        inner.reads.entry(slot).or_insert(ReadRecord::Store {
            version_seq,
            read_clock,
        });
        Ok(value)
    }

    fn write(
        &self,
        namespace: Namespace,
        key: Identifier,
        value: Option<Value>,
    ) -> Result<(), ReadError> {
        let mut inner = self.inner.lock();
        match inner.phase {
            Phase::Started if !inner.staged_published => {}
            Phase::Started | Phase::Committed | Phase::Closed => return Err(ReadError::Closed),
            Phase::Reserved => return Err(ReadError::NotStarted),
        }
        inner.writes.insert((namespace, key), value);
        Ok(())
    }

    fn commit(&self, block: bool) -> Option<CommitStatus> {
        let mut inner = self.inner.lock();
        match inner.phase {
            Phase::Started => {}
            Phase::Committed => return inner.status,
            Phase::Reserved | Phase::Closed => return Some(CommitStatus::UNSPECIFIED),
        }
        let mut state = self.shared.state.lock();
        self.publish_staged(&mut inner, &state);
        if let Some(status) = state.take_fault(&self.scope) {
            self.finish(&mut inner, &mut state, status);
            return Some(status);
        }
        loop {
            match self.validate(&inner, &state) {
                Verdict::Decided(status) => {
                    self.finish(&mut inner, &mut state, status);
                    return Some(status);
                }
                Verdict::Undecided if !block => return None,
                Verdict::Undecided => self.shared.cv.wait(&mut state),
            }
        }
    }

    fn close(&self) {
        let mut inner = self.inner.lock();
        let was_started = match inner.phase {
            Phase::Reserved => false,
            Phase::Started => true,
            Phase::Committed | Phase::Closed => return,
        };
        let mut state = self.shared.state.lock();
        state.record_outcome(self.id, TxnOutcome::Aborted);
        state.stats.closed_without_commit += 1;
        if was_started {
            state.release_start(self.scope.exclusive);
        }
        inner.phase = Phase::Closed;
        inner.writes.clear();
        self.shared.cv.notify_all();
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.close();
    }
}
