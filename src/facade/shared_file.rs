//! Process-wide state of one file.
//!
//! Every handle on a file in this process, whatever its context or open
//! options, shares one `SharedFile`: the storage engine, the version table,
//! the write coordinator and the subscription hub.

use crate::connection::handle::HandleInner;
use crate::core::{DbError, HandleId, Result, Version};
use crate::notify::hub::{ChangeNotification, NotificationHub, NotificationKind};
use crate::storage::{FileStorage, MemoryStorage, Snapshot, StorageEngine};
use crate::transaction::{TransactionCoordinator, VersionManager};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{Level, event, info_span};

lazy_static! {
    static ref OPEN_FILES: Mutex<HashMap<FileKey, Weak<SharedFile>>> = Mutex::new(HashMap::new());
}

/// Key of process-wide shared state: read-only and writable handles on the
/// same path coordinate through the same `SharedFile`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct FileKey {
    pub path: PathBuf,
    pub in_memory: bool,
}

pub(crate) struct SharedFile {
    key: FileKey,
    storage: Box<dyn StorageEngine>,
    versions: VersionManager,
    coordinator: TransactionCoordinator,
    hub: Arc<NotificationHub>,
    handles: Mutex<HashMap<HandleId, Weak<HandleInner>>>,
    /// Serializes persist+publish of local commits with imports of external
    /// versions.
    publish_lock: Mutex<()>,
}

impl SharedFile {
    /// Returns the shared state of `key`, loading the file on first use.
    pub(crate) fn acquire(key: FileKey, retained_warning: usize) -> Result<Arc<SharedFile>> {
        let mut files = OPEN_FILES.lock();
        files.retain(|_, file| file.strong_count() > 0);
        if let Some(existing) = files.get(&key).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let storage: Box<dyn StorageEngine> = if key.in_memory {
            Box::new(MemoryStorage::new(&key.path))
        } else {
            Box::new(FileStorage::new(&key.path))
        };
        let initial = load_initial(storage.as_ref())?;
        event!(
            Level::DEBUG,
            path = %key.path.display(),
            version = %initial.version(),
            schema_version = initial.schema_version(),
            "file loaded"
        );

        let shared = Arc::new(SharedFile {
            versions: VersionManager::new(&key.path, initial, retained_warning),
            coordinator: TransactionCoordinator::new(&key.path),
            hub: Arc::new(NotificationHub::new(&key.path)),
            handles: Mutex::new(HashMap::new()),
            publish_lock: Mutex::new(()),
            storage,
            key: key.clone(),
        });
        files.insert(key, Arc::downgrade(&shared));
        Ok(shared)
    }

    pub(crate) fn key(&self) -> &FileKey {
        &self.key
    }

    pub(crate) fn path(&self) -> &Path {
        &self.key.path
    }

    pub(crate) fn storage(&self) -> &dyn StorageEngine {
        self.storage.as_ref()
    }

    pub(crate) fn versions(&self) -> &VersionManager {
        &self.versions
    }

    pub(crate) fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    pub(crate) fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    /// Whether nothing was ever committed to the file by any process.
    pub(crate) fn is_uncreated(&self) -> Result<bool> {
        Ok(self.versions.latest_version() == Version::ZERO
            && self.storage.durable_version()?.is_none())
    }

    pub(crate) fn register_handle(&self, handle: &Arc<HandleInner>) {
        self.handles
            .lock()
            .insert(handle.id(), Arc::downgrade(handle));
    }

    pub(crate) fn forget_handle(&self, handle: HandleId) {
        self.handles.lock().remove(&handle);
    }

    pub(crate) fn live_handles(&self) -> usize {
        self.handles
            .lock()
            .values()
            .filter(|handle| handle.strong_count() > 0)
            .count()
    }

    /// Imports a version committed by another process, if there is one.
    ///
    /// Without the write lock, only the stamp is consulted and the import is
    /// skipped while a local commit is being published. With it, the data
    /// file's own version counts too, and a lagging stamp is restored.
    pub(crate) fn import_external(&self, write_locked: bool) -> Result<Option<Version>> {
        if !self.storage.is_shared() {
            return Ok(None);
        }
        let stamp = self.storage.durable_version()?;
        let target = if write_locked {
            stamp.max(self.storage.data_version()?)
        } else {
            stamp
        };
        let Some(target) = target else {
            return Ok(None);
        };
        if target <= self.versions.latest_version() {
            return Ok(None);
        }

        let publishing = if write_locked {
            self.publish_lock.lock()
        } else {
            match self.publish_lock.try_lock() {
                Some(guard) => guard,
                None => return Ok(None),
            }
        };
        if target <= self.versions.latest_version() {
            return Ok(None);
        }

        let span = info_span!("import_external", path = %self.path().display(), target = %target);
        let _entered = span.enter();

        let loaded = self.storage.load()?.ok_or_else(|| {
            DbError::integrity(self.path(), target, "Version stamp exists but the data file is missing")
        })?;
        if loaded.version() < target {
            return Err(DbError::integrity(
                self.path(),
                target,
                format!("Data file holds {} which is older than its stamp", loaded.version()),
            ));
        }
        let version = loaded.version();
        self.versions.publish(loaded)?;
        if write_locked && stamp < Some(version) {
            event!(Level::WARN, stamp = ?stamp.map(|v| v.as_u64()), version = %version, "version stamp lagged behind the data file");
            self.storage.restore_stamp(version)?;
        }
        drop(publishing);

        event!(Level::INFO, version = %version, "imported version committed by another process");
        self.schedule_change(NotificationKind::ExternalChange, version, None);
        Ok(Some(version))
    }

    /// Persists and publishes `working` as the next version.
    ///
    /// The caller must hold the write lock.
    pub(crate) fn commit_snapshot(
        &self,
        working: Snapshot,
        committer: Option<HandleId>,
    ) -> Result<Arc<Snapshot>> {
        let publishing = self.publish_lock.lock();
        let version = self.versions.latest_version().next();
        let snapshot = working.with_version(version);
        self.storage.persist(&snapshot)?;
        let published = self.versions.publish(snapshot)?;
        drop(publishing);

        self.schedule_change(NotificationKind::DidChange, version, committer);
        Ok(published)
    }

    /// Queues auto-refreshes for the other handles, then the deliveries.
    pub(crate) fn schedule_change(
        &self,
        kind: NotificationKind,
        version: Version,
        committer: Option<HandleId>,
    ) {
        let handles: Vec<Arc<HandleInner>> = self
            .handles
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for handle in &handles {
            if Some(handle.id()) != committer && handle.auto_refresh_enabled() {
                handle.schedule_auto_refresh();
            }
        }
        drop(handles);

        self.hub.schedule(ChangeNotification {
            kind,
            path: self.key.path.clone(),
            version,
            committer,
        });
    }
}

/// First snapshot of a file, checked against its version stamp.
fn load_initial(storage: &dyn StorageEngine) -> Result<Snapshot> {
    let stamp = storage.durable_version()?;
    match (storage.load()?, stamp) {
        (Some(snapshot), Some(stamp)) if snapshot.version() < stamp => Err(DbError::integrity(
            storage.location(),
            stamp,
            format!("Data file holds {} which is older than its stamp", snapshot.version()),
        )),
        (Some(snapshot), _) => Ok(snapshot),
        (None, Some(stamp)) => Err(DbError::integrity(
            storage.location(),
            stamp,
            "Version stamp exists but the data file is missing",
        )),
        (None, None) => Ok(Snapshot::empty()),
    }
}

/// Live handles of `path` across all contexts of this process.
pub(crate) fn live_handles_for(key: &FileKey) -> usize {
    let shared = OPEN_FILES.lock().get(key).and_then(Weak::upgrade);
    shared.map(|shared| shared.live_handles()).unwrap_or(0)
}
