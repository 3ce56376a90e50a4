// ============================================================================
// Transaction Management Module
// ============================================================================
//
// Multi-version coordination for one file:
//
// - VersionManager: table of committed snapshots, reader pins, reclamation
// - TransactionCoordinator: file-wide exclusive write lock
// - State Pattern: Idle / Reading / Writing per handle
// - Change log: what a write transaction did, for telemetry
//
// ============================================================================

pub mod change;
pub mod coordinator;
pub mod state;
pub mod version;

pub use change::{Change, ChangeSummary};
pub use coordinator::{TransactionCoordinator, WriteLockGuard};
pub use state::{TransactionState, WriteTransaction};
pub use version::{VersionManager, VersionStats};
