// ============================================================================
// Transaction Change Tracking
// ============================================================================
//
// Every mutation made while a handle is Writing is recorded as a Change.
// The working snapshot already holds the effect; the log only feeds
// commit telemetry and lets callers inspect what a transaction did.
//
// ============================================================================

use crate::core::{ObjectId, Value};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// A new object was created
    Insert { class: String, id: ObjectId },

    /// One property of an existing object was overwritten
    Update {
        class: String,
        id: ObjectId,
        property: String,
        old_value: Option<Value>,
        new_value: Value,
    },

    /// An object was deleted; links pointing at it were set to Null
    Remove {
        class: String,
        id: ObjectId,
        links_cleared: usize,
    },
}

impl Change {
    pub fn class_name(&self) -> &str {
        match self {
            Change::Insert { class, .. } => class,
            Change::Update { class, .. } => class,
            Change::Remove { class, .. } => class,
        }
    }

    pub fn object_id(&self) -> ObjectId {
        match self {
            Change::Insert { id, .. } | Change::Update { id, .. } | Change::Remove { id, .. } => *id,
        }
    }
}

/// Per-kind counts of a change log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeSummary {
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
}

impl ChangeSummary {
    pub fn of(changes: &[Change]) -> Self {
        changes.iter().fold(Self::default(), |mut summary, change| {
            match change {
                Change::Insert { .. } => summary.inserted += 1,
                Change::Update { .. } => summary.updated += 1,
                Change::Remove { .. } => summary.removed += 1,
            }
            summary
        })
    }

    pub fn is_empty(&self) -> bool {
        self.inserted + self.updated + self.removed == 0
    }
}

impl fmt::Display for ChangeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "+{} ~{} -{}",
            self.inserted, self.updated, self.removed
        )
    }
}
