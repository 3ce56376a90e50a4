pub mod config;
pub mod context;
pub(crate) mod handle;
pub mod object;
pub mod registry;

use crate::core::{DbError, HandleId, ObjectId, Result, Schema, SchemaVersion, Version};
use crate::facade::shared_file::SharedFile;
use crate::notify::hub::{ChangeNotification, NotificationToken};
use crate::storage::Snapshot;
use crate::transaction::{Change, TransactionState, VersionStats, coordinator};
use config::Configuration;
use context::ExecutionContext;
use handle::HandleInner;
use std::path::Path;
use std::sync::Arc;

pub use object::{ObjectData, ObjectRef};
pub use registry::FileIdentity;

/// Handle onto a file
///
/// Confined to the execution context that opened it: every call from another
/// context fails with `ThreadConfinement`. Clones share one handle, so they
/// share its pinned version and its write transaction. The handle is released
/// by `close()` or when the last clone is dropped.
///
/// # Examples
///
/// ```ignore
/// let db = Database::open(Configuration::new("people.vault").schema(schema).schema_version(1))?;
/// db.transaction(|db| {
///     db.insert("Person", ObjectData::new().set("name", "Ann"))?;
///     Ok(())
/// })?;
/// ```
#[derive(Clone)]
pub struct Database {
    pub(crate) inner: Arc<HandleInner>,
}

impl Database {
    pub(crate) fn from_inner(inner: Arc<HandleInner>) -> Self {
        Self { inner }
    }

    /// Open a file from the current execution context
    ///
    /// Returns the existing handle if this context already has the same file
    /// open with the same options. Runs the schema migration when needed.
    pub fn open(config: Configuration) -> Result<Database> {
        registry::resolve(config, &ExecutionContext::current())
    }

    /// Open the process default file with default options
    pub fn open_default() -> Result<Database> {
        Self::open(Configuration::default_config())
    }

    /// Migrate a file no handle of this process has open
    pub fn migrate(config: Configuration) -> Result<Option<Version>> {
        registry::migrate(config)
    }

    /// Release the handle; any write transaction in progress is discarded
    pub fn close(&self) -> Result<()> {
        self.inner.check_context()?;
        self.inner.release();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn id(&self) -> HandleId {
        self.inner.id()
    }

    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    pub fn identity(&self) -> &FileIdentity {
        self.inner.identity()
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }

    pub(crate) fn shared(&self) -> Result<&Arc<SharedFile>> {
        self.inner.check_context()?;
        Ok(self.inner.shared())
    }

    // ------------------------------------------------------------------
    // Versions
    // ------------------------------------------------------------------

    /// Version this handle currently reads
    pub fn version(&self) -> Result<Version> {
        self.inner.check_context()?;
        let state = self.inner.state();
        self.inner.ensure_open(&state)?;
        Ok(state.pinned.version())
    }

    /// Latest version committed to the file that this process knows of
    pub fn latest_version(&self) -> Result<Version> {
        self.inner.check_context()?;
        Ok(self.inner.shared().versions().latest_version())
    }

    pub fn schema(&self) -> Result<Schema> {
        self.inner.with_view(|view| view.schema().clone())
    }

    pub fn schema_version(&self) -> Result<SchemaVersion> {
        self.inner.with_view(|view| view.schema_version())
    }

    pub fn transaction_state(&self) -> Result<TransactionState> {
        self.inner.check_context()?;
        Ok(self.inner.state().txn)
    }

    pub fn version_stats(&self) -> Result<VersionStats> {
        self.inner.check_context()?;
        Ok(self.inner.shared().versions().stats())
    }

    /// Handles writing to this file right now, across the process
    pub fn writers_active(&self) -> Result<usize> {
        self.inner.check_context()?;
        Ok(self.inner.shared().coordinator().writers_active())
    }

    /// Advance to the latest version and run pending deliveries
    ///
    /// Returns whether the pinned version moved. Inside a read scope or a
    /// write transaction the pin stays where it is.
    pub fn refresh(&self) -> Result<bool> {
        self.inner.refresh()
    }

    pub fn auto_refresh(&self) -> Result<bool> {
        self.inner.check_context()?;
        Ok(self.inner.auto_refresh_enabled())
    }

    pub fn set_auto_refresh(&self, enabled: bool) -> Result<()> {
        self.inner.check_context()?;
        self.inner.set_auto_refresh(enabled);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Block until this handle is the file's only writer
    pub fn begin_write(&self) -> Result<()> {
        coordinator::begin_write(&self.inner)
    }

    pub fn commit(&self) -> Result<Version> {
        coordinator::commit(&self.inner)
    }

    pub fn cancel(&self) -> Result<()> {
        coordinator::cancel(&self.inner)
    }

    /// Run `body` in a write transaction
    ///
    /// Commits when `body` returns `Ok`, cancels when it returns `Err` or
    /// panics.
    pub fn transaction<T, F>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T>,
    {
        self.begin_write()?;
        let mut guard = CancelOnDrop {
            db: self,
            armed: true,
        };
        let value = body(self)?;
        guard.armed = false;
        self.commit()?;
        Ok(value)
    }

    /// Changes made so far by the current write transaction
    pub fn pending_changes(&self) -> Result<Vec<Change>> {
        self.inner.pending_changes()
    }

    // ------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------

    pub fn insert(&self, class: &str, data: ObjectData) -> Result<ObjectRef> {
        let id = self.inner.insert(class, data)?;
        Ok(ObjectRef::new(self.clone(), class, id))
    }

    pub fn insert_all<I>(&self, class: &str, items: I) -> Result<Vec<ObjectRef>>
    where
        I: IntoIterator<Item = ObjectData>,
    {
        items
            .into_iter()
            .map(|data| self.insert(class, data))
            .collect()
    }

    /// Delete an object; nullable links to it become `Null`
    pub fn remove(&self, object: &ObjectRef) -> Result<()> {
        if !Arc::ptr_eq(object.database().inner.shared(), self.inner.shared()) {
            return Err(DbError::transaction_state(
                self.path(),
                "Object belongs to a different file",
            ));
        }
        self.inner.remove(object.class(), object.id())
    }

    pub fn remove_all(&self, class: &str) -> Result<usize> {
        self.inner.remove_all(class)
    }

    /// Objects of `class` in the current view, in id order
    pub fn objects(&self, class: &str) -> Result<Vec<ObjectRef>> {
        let ids = self.inner.with_view(|view| view.object_ids(class))?;
        Ok(ids
            .into_iter()
            .map(|id| ObjectRef::new(self.clone(), class, id))
            .collect())
    }

    pub fn object(&self, class: &str, id: ObjectId) -> Result<Option<ObjectRef>> {
        let exists = self.inner.with_view(|view| view.contains(class, id))?;
        Ok(exists.then(|| ObjectRef::new(self.clone(), class, id)))
    }

    pub fn count(&self, class: &str) -> Result<usize> {
        self.inner.with_view(|view| view.count(class))
    }

    /// Read a stable view; auto-refresh is held off until `f` returns
    pub fn read<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Snapshot) -> R,
    {
        self.inner.read_scope(f)
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    /// Call `callback` on this handle's context after every change
    pub fn add_listener<F>(&self, callback: F) -> Result<NotificationToken>
    where
        F: FnMut(&ChangeNotification) + Send + 'static,
    {
        self.add_listener_on(&ExecutionContext::current(), callback)
    }

    /// Call `callback` on `context` after every change
    pub fn add_listener_on<F>(
        &self,
        context: &ExecutionContext,
        callback: F,
    ) -> Result<NotificationToken>
    where
        F: FnMut(&ChangeNotification) + Send + 'static,
    {
        self.inner.check_context()?;
        self.inner.ensure_open(&self.inner.state())?;
        Ok(self
            .inner
            .shared()
            .hub()
            .register(self.inner.id(), context.sender(), Box::new(callback)))
    }

    /// Stop deliveries to `token`. Callable from any thread.
    ///
    /// Returns false if the token was already removed.
    pub fn remove_listener(&self, token: &NotificationToken) -> bool {
        token.unregister()
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.inner.id())
            .field("path", &self.inner.path())
            .field("owner", &self.inner.owner())
            .finish()
    }
}

struct CancelOnDrop<'a> {
    db: &'a Database,
    armed: bool,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.db.cancel();
        }
    }
}
