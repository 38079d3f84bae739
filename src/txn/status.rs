use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric outcome of a commit call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitStatus(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    Retry,
}

impl CommitStatus {
    pub const SUCCESS: CommitStatus = CommitStatus(0);
    /// A read targeted a version that is no longer retained.
    pub const EXPIRED_READ: CommitStatus = CommitStatus(10);
    /// Collision with a transaction that already existed at read time.
    pub const CURRENT_COLLISION: CommitStatus = CommitStatus(20);
    /// Collision with a transaction created after read time.
    pub const LATER_COLLISION: CommitStatus = CommitStatus(30);
    pub const UNSPECIFIED: CommitStatus = CommitStatus(40);

    pub fn code(self) -> u16 {
        self.0
    }

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// `None` for codes outside the known set.
    pub fn outcome(self) -> Option<CommitOutcome> {
        match self.0 {
            0 => Some(CommitOutcome::Committed),
            10 | 20 | 30 | 40 => Some(CommitOutcome::Retry),
            _ => None,
        }
    }
}

impl fmt::Display for CommitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
