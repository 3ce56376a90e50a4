// ============================================================================
// Transaction Coordinator
// ============================================================================
//
// One writer per file. The in-process layer is a mutex-guarded owner slot
// with a condition variable that writers queue on; the cross-process layer
// is the storage engine's exclusive lock, taken only after the in-process
// slot is ours so that at most one thread per process waits on it.
//
// ============================================================================

use super::{TransactionState, WriteTransaction};
use crate::connection::context::ExecutionContext;
use crate::connection::handle::HandleInner;
use crate::core::{ContextId, DbError, HandleId, Result, Version};
use crate::storage::StorageEngine;
use parking_lot::{Condvar, Mutex};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{Level, event, info_span};

/// Lock owner used while a migration runs during open.
pub(crate) const MIGRATION_OWNER: HandleId = HandleId(0);

#[derive(Debug, Clone, Copy)]
struct LockOwner {
    handle: HandleId,
    context: ContextId,
}

pub struct TransactionCoordinator {
    path: PathBuf,
    owner: Mutex<Option<LockOwner>>,
    released: Condvar,
    writers_active: AtomicUsize,
}

impl TransactionCoordinator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            owner: Mutex::new(None),
            released: Condvar::new(),
            writers_active: AtomicUsize::new(0),
        }
    }

    /// Blocks until `handle` is the only writer of the file.
    pub fn acquire(
        &self,
        handle: HandleId,
        context: ContextId,
        storage: &dyn StorageEngine,
    ) -> Result<()> {
        {
            let mut owner = self.owner.lock();
            loop {
                match *owner {
                    None => break,
                    // Waiting here would never end: the owner can only
                    // release from this same context.
                    Some(current) if current.context == context => {
                        return Err(DbError::transaction_state(
                            &self.path,
                            format!(
                                "{} already holds the write lock on this context",
                                current.handle
                            ),
                        ));
                    }
                    Some(_) => self.released.wait(&mut owner),
                }
            }
            *owner = Some(LockOwner { handle, context });
        }

        if let Err(err) = storage.lock_exclusive() {
            self.release_local();
            return Err(err);
        }
        self.writers_active.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Releases the lock if `handle` holds it.
    pub fn release(&self, handle: HandleId, storage: &dyn StorageEngine) -> Result<()> {
        let holds = matches!(*self.owner.lock(), Some(owner) if owner.handle == handle);
        if !holds {
            return Ok(());
        }
        self.writers_active.fetch_sub(1, Ordering::SeqCst);
        let unlocked = storage.unlock();
        self.release_local();
        unlocked
    }

    fn release_local(&self) {
        *self.owner.lock() = None;
        self.released.notify_one();
    }

    /// Holds the write lock for the lifetime of the guard.
    pub fn exclusive<'a>(
        &'a self,
        context: ContextId,
        storage: &'a dyn StorageEngine,
    ) -> Result<WriteLockGuard<'a>> {
        self.acquire(MIGRATION_OWNER, context, storage)?;
        Ok(WriteLockGuard {
            coordinator: self,
            storage,
        })
    }

    /// Handles currently writing to the file. Never more than one.
    pub fn writers_active(&self) -> usize {
        self.writers_active.load(Ordering::SeqCst)
    }

    pub fn is_locked(&self) -> bool {
        self.owner.lock().is_some()
    }
}

pub struct WriteLockGuard<'a> {
    coordinator: &'a TransactionCoordinator,
    storage: &'a dyn StorageEngine,
}

impl Drop for WriteLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.coordinator.release(MIGRATION_OWNER, self.storage) {
            event!(Level::WARN, path = %self.coordinator.path.display(), error = %err, "failed to release write lock");
        }
    }
}

// ============================================================================
// Handle-level write lifecycle
// ============================================================================

/// Idle -> Writing. Blocks until the write lock is ours.
pub(crate) fn begin_write(handle: &HandleInner) -> Result<()> {
    handle.check_context()?;
    {
        let state = handle.state();
        handle.ensure_open(&state)?;
        if handle.is_read_only() {
            return Err(DbError::transaction_state(
                handle.path(),
                "Cannot write through a read-only handle",
            ));
        }
        match state.txn {
            TransactionState::Idle => {}
            TransactionState::Writing => {
                return Err(DbError::transaction_state(
                    handle.path(),
                    "A write transaction is already in progress",
                ));
            }
            TransactionState::Reading => {
                return Err(DbError::transaction_state(
                    handle.path(),
                    "Cannot begin a write transaction inside a read scope",
                ));
            }
        }
    }

    let shared = handle.shared();
    shared
        .coordinator()
        .acquire(handle.id(), handle.owner(), shared.storage())?;

    // Another process may have committed since this process last looked.
    if let Err(err) = shared.import_external(true) {
        release_write_lock(handle);
        return Err(err);
    }

    {
        let pinned = shared.versions().pin_latest(handle.id());
        let mut state = handle.state();
        state.write = Some(WriteTransaction::new(&pinned));
        state.pinned = pinned;
        state.txn = TransactionState::Writing;
    }
    event!(Level::DEBUG, path = %handle.path().display(), handle = %handle.id(), "write transaction started");

    ExecutionContext::current().run_pending();
    Ok(())
}

/// Writing -> Idle, publishing the working copy as the next version.
pub(crate) fn commit(handle: &HandleInner) -> Result<Version> {
    handle.check_context()?;
    let write = {
        let mut state = handle.state();
        handle.ensure_open(&state)?;
        if !state.txn.is_writing() {
            return Err(DbError::transaction_state(
                handle.path(),
                "No write transaction in progress",
            ));
        }
        state.write.take()
    };
    let Some(write) = write else {
        return Err(DbError::transaction_state(
            handle.path(),
            "No write transaction in progress",
        ));
    };

    let span = info_span!("commit", path = %handle.path().display(), handle = %handle.id(), base = %write.base());
    let _entered = span.enter();

    let summary = write.summary();
    let elapsed = write.elapsed();
    let shared = handle.shared();
    let outcome = shared.commit_snapshot(write.into_working(), Some(handle.id()));

    let result = match outcome {
        Ok(published) => {
            let version = published.version();
            let pinned = shared.versions().pin_latest(handle.id());
            let mut state = handle.state();
            state.pinned = pinned;
            state.txn = TransactionState::Idle;
            event!(
                Level::INFO,
                version = %version,
                changes = %summary,
                elapsed_ms = elapsed.as_millis() as u64,
                "committed"
            );
            Ok(version)
        }
        Err(err) => {
            handle.state().txn = TransactionState::Idle;
            event!(Level::WARN, error = %err, "commit failed; transaction discarded");
            Err(err)
        }
    };

    release_write_lock(handle);
    result
}

/// Writing -> Idle, discarding every change.
pub(crate) fn cancel(handle: &HandleInner) -> Result<()> {
    handle.check_context()?;
    {
        let mut state = handle.state();
        handle.ensure_open(&state)?;
        if !state.txn.is_writing() {
            return Err(DbError::transaction_state(
                handle.path(),
                "No write transaction in progress",
            ));
        }
        let discarded = state.write.take().map(|write| write.summary());
        state.txn = TransactionState::Idle;
        event!(
            Level::DEBUG,
            path = %handle.path().display(),
            handle = %handle.id(),
            changes = %discarded.unwrap_or_default(),
            "write transaction cancelled"
        );
    }
    release_write_lock(handle);
    Ok(())
}

pub(crate) fn release_write_lock(handle: &HandleInner) {
    let shared = handle.shared();
    if let Err(err) = shared.coordinator().release(handle.id(), shared.storage()) {
        event!(Level::WARN, path = %handle.path().display(), error = %err, "failed to release write lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn test_second_writer_waits_for_release() {
        let coordinator = Arc::new(TransactionCoordinator::new("lock.vault"));
        let storage = Arc::new(MemoryStorage::new("lock.vault"));
        coordinator
            .acquire(HandleId(1), ContextId(1), storage.as_ref())
            .unwrap();

        let acquired = Arc::new(AtomicBool::new(false));
        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            let storage = Arc::clone(&storage);
            let acquired = Arc::clone(&acquired);
            std::thread::spawn(move || {
                coordinator
                    .acquire(HandleId(2), ContextId(2), storage.as_ref())
                    .unwrap();
                acquired.store(true, Ordering::SeqCst);
                assert_eq!(coordinator.writers_active(), 1);
                coordinator.release(HandleId(2), storage.as_ref()).unwrap();
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));
        assert_eq!(coordinator.writers_active(), 1);

        coordinator.release(HandleId(1), storage.as_ref()).unwrap();
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert_eq!(coordinator.writers_active(), 0);
        assert!(!coordinator.is_locked());
    }

    #[test]
    fn test_same_context_cannot_wait_on_itself() {
        let coordinator = TransactionCoordinator::new("lock.vault");
        let storage = MemoryStorage::new("lock.vault");
        coordinator.acquire(HandleId(1), ContextId(5), &storage).unwrap();

        let err = coordinator
            .acquire(HandleId(2), ContextId(5), &storage)
            .unwrap_err();
        assert!(matches!(err, DbError::TransactionState { .. }));
        assert_eq!(coordinator.writers_active(), 1);
    }

    #[test]
    fn test_release_by_non_owner_is_ignored() {
        let coordinator = TransactionCoordinator::new("lock.vault");
        let storage = MemoryStorage::new("lock.vault");
        coordinator.acquire(HandleId(1), ContextId(1), &storage).unwrap();
        coordinator.release(HandleId(2), &storage).unwrap();
        assert!(coordinator.is_locked());
    }

    #[test]
    fn test_exclusive_guard_releases_on_drop() {
        let coordinator = TransactionCoordinator::new("lock.vault");
        let storage = MemoryStorage::new("lock.vault");
        {
            let _guard = coordinator.exclusive(ContextId(1), &storage).unwrap();
            assert_eq!(coordinator.writers_active(), 1);
        }
        assert_eq!(coordinator.writers_active(), 0);
        assert!(!coordinator.is_locked());
    }
}
