// ============================================================================
// Transaction State Management
// ============================================================================
//
// A handle is always in exactly one state:
//
// ```text
// Idle ──begin_write──> Writing ──commit/cancel──> Idle
//   │
//   └──read(..)──> Reading ──scope ends──> Idle
// ```
//
// Writing owns the file-wide write lock and a private working copy of the
// snapshot it started from. Nothing in the working copy is visible to other
// handles until commit publishes it.
//
// ============================================================================

use super::{Change, ChangeSummary};
use crate::core::Version;
use crate::storage::Snapshot;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionState {
    /// Pinned to a snapshot, nothing in progress
    #[default]
    Idle,

    /// Inside an explicit read scope; auto-refresh is suppressed
    Reading,

    /// Holds the write lock for the file
    Writing,
}

impl TransactionState {
    pub fn is_writing(&self) -> bool {
        matches!(self, TransactionState::Writing)
    }

    /// Whether an auto-refresh may move the pin in this state.
    pub fn allows_refresh(&self) -> bool {
        matches!(self, TransactionState::Idle)
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Idle => write!(f, "IDLE"),
            TransactionState::Reading => write!(f, "READING"),
            TransactionState::Writing => write!(f, "WRITING"),
        }
    }
}

/// Working state of a handle in `Writing`.
#[derive(Debug)]
pub struct WriteTransaction {
    base: Version,
    working: Snapshot,
    changes: Vec<Change>,
    started: Instant,
}

impl WriteTransaction {
    /// Starts from a structural clone of `base`.
    pub fn new(base: &Snapshot) -> Self {
        Self {
            base: base.version(),
            working: base.clone(),
            changes: Vec::new(),
            started: Instant::now(),
        }
    }

    /// Version the working copy was cloned from.
    pub fn base(&self) -> Version {
        self.base
    }

    pub fn working(&self) -> &Snapshot {
        &self.working
    }

    pub fn working_mut(&mut self) -> &mut Snapshot {
        &mut self.working
    }

    pub fn record(&mut self, change: Change) {
        self.changes.push(change);
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn summary(&self) -> ChangeSummary {
        ChangeSummary::of(&self.changes)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn into_working(self) -> Snapshot {
        self.working
    }
}
