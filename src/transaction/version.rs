//! Version table of one file.
//!
//! Holds every committed snapshot some handle may still read. Each handle pins
//! exactly one version; a version stays retrievable while it, or an older one,
//! is pinned. Everything older than the oldest pin except the latest is
//! reclaimed after every publish and unpin.

use crate::core::{DbError, HandleId, Result, Version};
use crate::storage::Snapshot;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Level, event};

pub const DEFAULT_RETAINED_VERSIONS_WARNING: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionStats {
    pub latest: Version,
    pub oldest_pinned: Option<Version>,
    pub retained_versions: usize,
    pub pinned_handles: usize,
}

struct VersionTable {
    latest: Arc<Snapshot>,
    retained: BTreeMap<Version, Arc<Snapshot>>,
    pins: HashMap<HandleId, Version>,
}

impl VersionTable {
    fn oldest_pinned(&self) -> Option<Version> {
        self.pins.values().min().copied()
    }

    fn reclaim(&mut self, path: &Path, warning_limit: usize) {
        let latest = self.latest.version();
        let cutoff = self.oldest_pinned().unwrap_or(latest).min(latest);
        let before = self.retained.len();
        self.retained.retain(|version, _| *version >= cutoff);
        let removed = before - self.retained.len();
        if removed > 0 {
            event!(Level::TRACE, path = %path.display(), removed, cutoff = %cutoff, "reclaimed versions");
        }

        if self.retained.len() > warning_limit {
            event!(
                Level::WARN,
                path = %path.display(),
                retained = self.retained.len(),
                oldest_pinned = %cutoff,
                latest = %latest,
                "long-lived readers are holding old versions"
            );
        }
    }
}

pub struct VersionManager {
    path: PathBuf,
    table: RwLock<VersionTable>,
    retained_warning: usize,
}

impl VersionManager {
    pub fn new(path: impl Into<PathBuf>, initial: Snapshot, retained_warning: usize) -> Self {
        let latest = Arc::new(initial);
        let mut retained = BTreeMap::new();
        retained.insert(latest.version(), Arc::clone(&latest));
        Self {
            path: path.into(),
            table: RwLock::new(VersionTable {
                latest,
                retained,
                pins: HashMap::new(),
            }),
            retained_warning: retained_warning.max(1),
        }
    }

    pub fn latest_version(&self) -> Version {
        self.table.read().latest.version()
    }

    pub fn latest_snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.table.read().latest)
    }

    /// Snapshot of a retained version.
    pub fn snapshot(&self, version: Version) -> Result<Arc<Snapshot>> {
        self.table
            .read()
            .retained
            .get(&version)
            .cloned()
            .ok_or_else(|| {
                DbError::integrity(&self.path, version, "Version is no longer retained")
            })
    }

    /// Pins `handle` to `version`, replacing any earlier pin.
    pub fn pin(&self, handle: HandleId, version: Version) -> Result<Arc<Snapshot>> {
        let mut table = self.table.write();
        let snapshot = table.retained.get(&version).cloned().ok_or_else(|| {
            DbError::integrity(&self.path, version, "Cannot pin a version that is not retained")
        })?;
        table.pins.insert(handle, version);
        table.reclaim(&self.path, self.retained_warning);
        Ok(snapshot)
    }

    pub fn pin_latest(&self, handle: HandleId) -> Arc<Snapshot> {
        let mut table = self.table.write();
        let latest = Arc::clone(&table.latest);
        table.pins.insert(handle, latest.version());
        table.reclaim(&self.path, self.retained_warning);
        latest
    }

    /// Moves the pin of `handle` forward to the latest version.
    ///
    /// Returns the newly pinned snapshot, or `None` if the handle was already
    /// at the latest version. A pin never moves backwards.
    pub fn advance(&self, handle: HandleId) -> Option<Arc<Snapshot>> {
        let mut table = self.table.write();
        let latest = Arc::clone(&table.latest);
        match table.pins.get(&handle) {
            Some(current) if *current >= latest.version() => None,
            _ => {
                table.pins.insert(handle, latest.version());
                table.reclaim(&self.path, self.retained_warning);
                Some(latest)
            }
        }
    }

    pub fn unpin(&self, handle: HandleId) {
        let mut table = self.table.write();
        if table.pins.remove(&handle).is_some() {
            table.reclaim(&self.path, self.retained_warning);
        }
    }

    pub fn pinned_version(&self, handle: HandleId) -> Option<Version> {
        self.table.read().pins.get(&handle).copied()
    }

    /// Makes `snapshot` the latest version.
    ///
    /// Must be called only after the storage engine reported it durable.
    pub fn publish(&self, snapshot: Snapshot) -> Result<Arc<Snapshot>> {
        let mut table = self.table.write();
        let current = table.latest.version();
        if snapshot.version() <= current {
            return Err(DbError::integrity(
                &self.path,
                snapshot.version(),
                format!("Version must be greater than latest {}", current),
            ));
        }

        let published = Arc::new(snapshot);
        table
            .retained
            .insert(published.version(), Arc::clone(&published));
        table.latest = Arc::clone(&published);
        table.reclaim(&self.path, self.retained_warning);
        Ok(published)
    }

    pub fn oldest_pinned(&self) -> Option<Version> {
        self.table.read().oldest_pinned()
    }

    pub fn stats(&self) -> VersionStats {
        let table = self.table.read();
        VersionStats {
            latest: table.latest.version(),
            oldest_pinned: table.oldest_pinned(),
            retained_versions: table.retained.len(),
            pinned_handles: table.pins.len(),
        }
    }
}
