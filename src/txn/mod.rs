//! Contract between the engine and a transactional key-value backend.
//!
//! The engine never looks inside a backend: it reserves ordered slots with
//! [`TransactionBackend::new_transaction`] and [`Transaction::chain`], seeds
//! them with [`SoftState`], runs transforms through [`Transaction::read`] /
//! [`Transaction::write`], and interprets the [`CommitStatus`] returned by
//! [`Transaction::commit`].

mod position;
mod status;

pub use position::Position;
pub use status::{CommitOutcome, CommitStatus};

use crate::error::{BackendError, ReadError};
use crate::identifier::{Identifier, IdentifierSet};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Namespace {
    /// Durable state owned by the storage layer.
    Persistent,
    /// Process-lifetime state.
    Ephemeral,
}

/// What a transaction declares it touches.
#[derive(Debug, Clone, Default)]
pub struct TxnScope {
    pub identifiers: Option<Arc<IdentifierSet>>,
    /// Exclusive transactions run with no other transaction in flight.
    pub exclusive: bool,
}

impl TxnScope {
    pub fn keyed(identifiers: Option<Arc<IdentifierSet>>) -> Self {
        Self {
            identifiers,
            exclusive: false,
        }
    }

    pub fn exclusive(identifiers: Option<Arc<IdentifierSet>>) -> Self {
        Self {
            identifiers,
            exclusive: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: TxnId,
    pub position: Position,
    pub identifiers: Option<Arc<IdentifierSet>>,
}

/// Uncommitted transactions as observed at one instant, in position order.
#[derive(Debug, Clone, Default)]
pub struct PendingSnapshot {
    entries: Arc<[PendingEntry]>,
}

impl PendingSnapshot {
    pub fn new(mut entries: Vec<PendingEntry>) -> Self {
        entries.sort_by(|a, b| a.position.cmp(&b.position));
        Self {
            entries: entries.into(),
        }
    }

    pub fn entries(&self) -> &[PendingEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn identifier_sets(&self) -> impl Iterator<Item = Option<&IdentifierSet>> {
        self.entries.iter().map(|e| e.identifiers.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagedWrite {
    pub namespace: Namespace,
    pub key: Identifier,
    /// `None` stages a removal.
    pub value: Option<Value>,
}

/// Writes a transaction has staged but not necessarily committed.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedWrites {
    pub txn: TxnId,
    pub writes: Vec<StagedWrite>,
}

impl StagedWrites {
    pub fn empty(txn: TxnId) -> Self {
        Self {
            txn,
            writes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SoftEntry {
    pub value: Option<Value>,
    pub source: TxnId,
}

/// Locally merged view of concurrent predecessors' staged writes.
#[derive(Debug, Clone, Default)]
pub struct SoftState {
    entries: HashMap<(Namespace, Identifier), SoftEntry>,
}

impl SoftState {
    /// Folds `staged` in; a later merge wins on the same key.
    pub fn merge(&mut self, staged: &StagedWrites) {
        for write in &staged.writes {
            self.entries.insert(
                (write.namespace, write.key.clone()),
                SoftEntry {
                    value: write.value.clone(),
                    source: staged.txn,
                },
            );
        }
    }

    pub fn get(&self, namespace: Namespace, key: &Identifier) -> Option<&SoftEntry> {
        self.entries.get(&(namespace, key.clone()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub type StagedFuture = Pin<Box<dyn Future<Output = Result<StagedWrites, BackendError>> + Send>>;

/// One reserved slot in the backend's total order.
pub trait Transaction: Send + Sync {
    fn id(&self) -> TxnId;
    fn position(&self) -> &Position;
    fn scope(&self) -> &TxnScope;
    /// Pending transactions captured when this slot was reserved.
    fn pending_snapshot(&self) -> &PendingSnapshot;
    /// Reserves a strict successor nested after this slot and after every
    /// earlier chain of it.
    fn chain(&self, pending: PendingSnapshot, scope: TxnScope) -> Box<dyn Transaction>;
    /// May block while an exclusive transaction is in flight.
    fn start(&self, soft: SoftState) -> Result<(), BackendError>;
    fn read(&self, namespace: Namespace, key: &Identifier) -> Result<Option<Value>, ReadError>;
    fn write(
        &self,
        namespace: Namespace,
        key: Identifier,
        value: Option<Value>,
    ) -> Result<(), ReadError>;
    /// With `block == false` returns `None` while the outcome still depends on
    /// unresolved predecessors. With `block == true` always returns `Some`.
    fn commit(&self, block: bool) -> Option<CommitStatus>;
    /// Releases the slot. Idempotent; a no-op after commit.
    fn close(&self);
}

pub trait TransactionBackend: Send + Sync + 'static {
    /// Creates the root namespaces. Called once, lazily, by the engine.
    fn init_roots(&self) -> Result<(), BackendError>;
    fn new_transaction(&self, pending: PendingSnapshot, scope: TxnScope) -> Box<dyn Transaction>;
    fn pending_transactions(&self) -> PendingSnapshot;
    /// Resolves once `id` has staged its writes, or immediately with an empty
    /// set if it is no longer pending.
    fn staged_data(&self, id: TxnId) -> StagedFuture;
}
