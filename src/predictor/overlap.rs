use super::{ExecutionMode, ModePredictor, Prediction};
use crate::identifier::{IdentifierSet, sets_overlap};
use crate::txn::{CommitStatus, PendingSnapshot};
use compact_str::CompactString;
use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct OverlapPredictorConfig {
    /// Conflict rate (per mille) above which a region runs under global stall.
    pub stall_threshold_permille: u32,
    /// Samples a region needs before its conflict rate is trusted.
    pub min_samples: u64,
}

impl Default for OverlapPredictorConfig {
    fn default() -> Self {
        Self {
            stall_threshold_permille: 750,
            min_samples: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct RegionState {
    ewma_conflict_permille: u32,
    samples: u64,
}

/// Learned heuristic keyed by the first segment of each identifier.
///
/// No overlapping pending work: optimistic. Overlap in a region whose
/// conflict EWMA is above the threshold: global stall. Otherwise fine-block
/// on exactly the overlapping pending transactions.
#[derive(Debug, Default)]
pub struct OverlapPredictor {
    config: OverlapPredictorConfig,
    regions: Mutex<BTreeMap<CompactString, RegionState>>,
}

impl OverlapPredictor {
    pub fn new(config: OverlapPredictorConfig) -> Self {
        Self {
            config,
            regions: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn conflict_rate_permille(&self, region: &str) -> Option<u32> {
        self.regions
            .lock()
            .get(region)
            .map(|state| state.ewma_conflict_permille)
    }

    fn hot(&self, identifiers: &IdentifierSet) -> bool {
        let regions = self.regions.lock();
        identifiers.iter().filter_map(|id| id.root()).any(|root| {
            regions.get(root).is_some_and(|state| {
                state.samples >= self.config.min_samples
                    && state.ewma_conflict_permille >= self.config.stall_threshold_permille
            })
        })
    }
}

impl ModePredictor for OverlapPredictor {
    fn predict(&self, pending: &PendingSnapshot, identifiers: &IdentifierSet) -> Prediction {
        let flags: Vec<bool> = pending
            .identifier_sets()
            .map(|ids| ids.is_none_or(|ids| sets_overlap(ids, identifiers)))
            .collect();
        if !flags.iter().any(|f| *f) {
            return Prediction::new(ExecutionMode::Optimistic);
        }
        if self.hot(identifiers) {
            return Prediction::new(ExecutionMode::GlobalStall);
        }
        Prediction::fine_block(flags)
    }

    fn train(&self, _pending: &PendingSnapshot, identifiers: &IdentifierSet, status: CommitStatus) {
        let sample = if status.is_success() { 0 } else { 1_000 };
        let mut regions = self.regions.lock();
        for root in identifiers.iter().filter_map(|id| id.root()) {
            let state = regions.entry(CompactString::from(root)).or_default();
            state.ewma_conflict_permille = if state.samples == 0 {
                sample
            } else {
                (state.ewma_conflict_permille * 7 + sample) / 8
            };
            state.samples = state.samples.saturating_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{OverlapPredictor, OverlapPredictorConfig};
    use crate::identifier::identifier_set;
    use crate::predictor::{ExecutionMode, ModePredictor};
    use crate::txn::{CommitStatus, PendingEntry, PendingSnapshot, Position, TxnId};
    use std::sync::Arc;

    fn pending(sets: &[Option<&[&str]>]) -> PendingSnapshot {
        PendingSnapshot::new(
            sets.iter()
                .enumerate()
                .map(|(idx, ids)| PendingEntry {
                    id: TxnId(idx as u64 + 1),
                    position: Position::root(idx as u64 + 1),
                    identifiers: ids.map(|ids| Arc::new(identifier_set(ids.iter().copied()))),
                })
                .collect(),
        )
    }

    #[test]
    fn disjoint_pending_work_runs_optimistically() {
        let predictor = OverlapPredictor::default();
        let snapshot = pending(&[Some(&["accounts/bob"]), Some(&["ledger"])]);
        let prediction = predictor.predict(&snapshot, &identifier_set(["accounts/alice"]));
        assert_eq!(prediction.mode, ExecutionMode::Optimistic);
    }

    #[test]
    fn overlapping_pending_work_is_fine_blocked_individually() {
        let predictor = OverlapPredictor::default();
        let snapshot = pending(&[Some(&["accounts"]), Some(&["ledger"]), None]);
        let prediction = predictor.predict(&snapshot, &identifier_set(["accounts/alice"]));
        assert_eq!(prediction.mode, ExecutionMode::FineBlock);
        assert_eq!(prediction.fine_block, vec![true, false, true]);
    }

    #[test]
    fn repeated_conflicts_escalate_to_global_stall() {
        let predictor = OverlapPredictor::new(OverlapPredictorConfig {
            stall_threshold_permille: 500,
            min_samples: 4,
        });
        let ids = identifier_set(["hot/1"]);
        let snapshot = pending(&[Some(&["hot/1"])]);
        for _ in 0..4 {
            predictor.train(&snapshot, &ids, CommitStatus::CURRENT_COLLISION);
        }
        assert_eq!(predictor.conflict_rate_permille("hot"), Some(1_000));
        assert_eq!(
            predictor.predict(&snapshot, &ids).mode,
            ExecutionMode::GlobalStall
        );
        for _ in 0..16 {
            predictor.train(&snapshot, &ids, CommitStatus::SUCCESS);
        }
        assert_eq!(
            predictor.predict(&snapshot, &ids).mode,
            ExecutionMode::FineBlock
        );
    }
}
