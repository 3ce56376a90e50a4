use super::Snapshot;
use crate::core::{Result, Version};
use std::path::Path;

/// Durable backing of a file, shared by every handle on it in this process.
///
/// The coordination layer never touches bytes on disk directly; it hands whole
/// snapshots to the engine and asks it for the cross-process write lock.
pub trait StorageEngine: Send + Sync {
    /// Path the engine was opened for.
    fn location(&self) -> &Path;

    /// Latest durable snapshot, or `None` if nothing was ever committed.
    fn load(&self) -> Result<Option<Snapshot>>;

    /// Version most recently made durable by any process.
    ///
    /// Cheap enough to be called on every refresh.
    fn durable_version(&self) -> Result<Option<Version>>;

    /// Version held by the data file itself.
    ///
    /// Normally equal to `durable_version`. A writer that died between
    /// replacing the data file and rewriting the stamp leaves it one ahead.
    fn data_version(&self) -> Result<Option<Version>>;

    /// Rewrites the stamp to `version`. Only called under the write lock.
    fn restore_stamp(&self, version: Version) -> Result<()>;

    /// Make `snapshot` durable. Returns only once it survives a crash.
    fn persist(&self, snapshot: &Snapshot) -> Result<()>;

    /// Block until this process holds the cross-process write lock.
    fn lock_exclusive(&self) -> Result<()>;

    fn unlock(&self) -> Result<()>;

    /// Whether other processes can observe this file.
    fn is_shared(&self) -> bool;
}
