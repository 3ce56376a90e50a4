use super::{Snapshot, StorageEngine};
use crate::core::{Result, Version};
use std::path::{Path, PathBuf};

/// Process-local storage for in-memory files.
///
/// Committed state lives only in the version table, so every operation is a
/// no-op and the file disappears with the last handle.
#[derive(Debug)]
pub struct MemoryStorage {
    identifier: PathBuf,
}

impl MemoryStorage {
    pub fn new(identifier: impl Into<PathBuf>) -> Self {
        Self {
            identifier: identifier.into(),
        }
    }
}

impl StorageEngine for MemoryStorage {
    fn location(&self) -> &Path {
        &self.identifier
    }

    fn load(&self) -> Result<Option<Snapshot>> {
        Ok(None)
    }

    fn durable_version(&self) -> Result<Option<Version>> {
        Ok(None)
    }

    fn data_version(&self) -> Result<Option<Version>> {
        Ok(None)
    }

    fn restore_stamp(&self, _version: Version) -> Result<()> {
        Ok(())
    }

    fn persist(&self, _snapshot: &Snapshot) -> Result<()> {
        Ok(())
    }

    fn lock_exclusive(&self) -> Result<()> {
        Ok(())
    }

    fn unlock(&self) -> Result<()> {
        Ok(())
    }

    fn is_shared(&self) -> bool {
        false
    }
}
