//! Execution-mode prediction.
//!
//! The engine consults a [`ModePredictor`] once per attempt unless the
//! operation forces a policy or the previous attempt failed, and trains it
//! with the resulting commit status.

mod overlap;

pub use overlap::{OverlapPredictor, OverlapPredictorConfig};

use crate::identifier::IdentifierSet;
use crate::txn::{CommitStatus, PendingSnapshot};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    /// No pre-wait; conflicts surface at commit.
    Optimistic,
    /// Commit an exclusive barrier first, then run alone.
    GlobalStall,
    /// Seed the transaction with staged writes of selected predecessors.
    FineBlock,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Optimistic => "optimistic",
            ExecutionMode::GlobalStall => "global_stall",
            ExecutionMode::FineBlock => "fine_block",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prediction {
    pub mode: ExecutionMode,
    /// Parallel to the pending snapshot's entries; `true` marks a
    /// transaction to wait on under [`ExecutionMode::FineBlock`].
    pub fine_block: Vec<bool>,
}

impl Prediction {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            fine_block: Vec::new(),
        }
    }

    pub fn fine_block(flags: Vec<bool>) -> Self {
        Self {
            mode: ExecutionMode::FineBlock,
            fine_block: flags,
        }
    }

    pub fn waits_on(&self, index: usize) -> bool {
        self.fine_block.get(index).copied().unwrap_or(false)
    }
}

/// Must tolerate concurrent calls from every worker.
pub trait ModePredictor: Send + Sync + 'static {
    fn predict(&self, pending: &PendingSnapshot, identifiers: &IdentifierSet) -> Prediction;

    fn train(&self, pending: &PendingSnapshot, identifiers: &IdentifierSet, status: CommitStatus);
}

/// Always answers the same mode, waiting on every pending transaction when
/// that mode is [`ExecutionMode::FineBlock`].
#[derive(Debug, Clone, Copy)]
pub struct FixedPredictor {
    mode: ExecutionMode,
}

impl FixedPredictor {
    pub fn new(mode: ExecutionMode) -> Self {
        Self { mode }
    }
}

impl ModePredictor for FixedPredictor {
    fn predict(&self, pending: &PendingSnapshot, _identifiers: &IdentifierSet) -> Prediction {
        match self.mode {
            ExecutionMode::FineBlock => Prediction::fine_block(vec![true; pending.len()]),
            mode => Prediction::new(mode),
        }
    }

    fn train(&self, _: &PendingSnapshot, _: &IdentifierSet, _: CommitStatus) {}
}
