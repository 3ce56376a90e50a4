//! Context-confined handle state and the operations behind `Database`.

use super::config::Configuration;
use super::context::{ContextSender, ExecutionContext, Task};
use super::object::ObjectData;
use super::registry::{self, FileIdentity};
use crate::core::{
    ClassSchema, ContextId, DbError, HandleId, Object, ObjectId, Result, Schema, SchemaVersion,
    Value,
};
use crate::facade::shared_file::SharedFile;
use crate::storage::Snapshot;
use crate::transaction::coordinator;
use crate::transaction::{Change, TransactionState, WriteTransaction};
use log::{debug, warn};
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub(crate) struct HandleState {
    pub(crate) pinned: Arc<Snapshot>,
    pub(crate) txn: TransactionState,
    pub(crate) read_depth: usize,
    pub(crate) write: Option<WriteTransaction>,
    pub(crate) closed: bool,
}

pub(crate) struct HandleInner {
    id: HandleId,
    identity: FileIdentity,
    owner: ContextId,
    sender: ContextSender,
    shared: Arc<SharedFile>,
    auto_refresh: AtomicBool,
    expected: Option<(Schema, SchemaVersion)>,
    state: Mutex<HandleState>,
}

impl HandleInner {
    pub(crate) fn new(
        id: HandleId,
        identity: FileIdentity,
        context: &ExecutionContext,
        shared: Arc<SharedFile>,
        config: &Configuration,
    ) -> Arc<Self> {
        let pinned = shared.versions().pin_latest(id);
        let handle = Arc::new(Self {
            id,
            identity,
            owner: context.id(),
            sender: context.sender(),
            auto_refresh: AtomicBool::new(config.auto_refresh),
            expected: config
                .schema
                .clone()
                .map(|schema| (schema, config.schema_version)),
            state: Mutex::new(HandleState {
                pinned,
                txn: TransactionState::Idle,
                read_depth: 0,
                write: None,
                closed: false,
            }),
            shared,
        });
        handle.shared.register_handle(&handle);
        handle
    }

    pub(crate) fn id(&self) -> HandleId {
        self.id
    }

    pub(crate) fn owner(&self) -> ContextId {
        self.owner
    }

    pub(crate) fn identity(&self) -> &FileIdentity {
        &self.identity
    }

    pub(crate) fn path(&self) -> &Path {
        &self.identity.path
    }

    pub(crate) fn shared(&self) -> &Arc<SharedFile> {
        &self.shared
    }

    pub(crate) fn is_read_only(&self) -> bool {
        self.identity.read_only
    }

    pub(crate) fn expected(&self) -> Option<&(Schema, SchemaVersion)> {
        self.expected.as_ref()
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn check_context(&self) -> Result<()> {
        let current = ExecutionContext::current_id();
        if current != self.owner {
            return Err(DbError::ThreadConfinement {
                path: self.path().to_path_buf(),
                owner: self.owner,
                current,
            });
        }
        Ok(())
    }

    pub(crate) fn ensure_open(&self, state: &HandleState) -> Result<()> {
        if state.closed {
            return Err(DbError::transaction_state(self.path(), "Handle is closed"));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Refresh
    // ------------------------------------------------------------------

    pub(crate) fn auto_refresh_enabled(&self) -> bool {
        self.auto_refresh.load(Ordering::SeqCst)
    }

    pub(crate) fn set_auto_refresh(&self, enabled: bool) {
        self.auto_refresh.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn schedule_auto_refresh(self: &Arc<Self>) {
        self.sender.send(Task::AutoRefresh {
            handle: Arc::downgrade(self),
        });
    }

    /// Runs on the handle's own context after another handle committed.
    pub(crate) fn auto_refresh_tick(&self) {
        if !self.auto_refresh_enabled() {
            return;
        }
        let mut state = self.state.lock();
        if state.closed || !state.txn.allows_refresh() {
            return;
        }
        if let Some(latest) = self.shared.versions().advance(self.id) {
            debug!("{} auto-refreshed to {}", self.id, latest.version());
            state.pinned = latest;
        }
    }

    /// Advances to the latest version unless a read or write is in
    /// progress, then drains the calling context's run loop.
    pub(crate) fn refresh(&self) -> Result<bool> {
        self.check_context()?;
        self.ensure_open(&self.state.lock())?;
        self.shared.import_external(false)?;

        let moved = {
            let mut state = self.state.lock();
            if state.txn.allows_refresh() {
                match self.shared.versions().advance(self.id) {
                    Some(latest) => {
                        state.pinned = latest;
                        true
                    }
                    None => false,
                }
            } else {
                false
            }
        };

        ExecutionContext::current().run_pending();
        Ok(moved)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Runs `f` against what this handle currently sees: its write buffer
    /// while writing, its pinned snapshot otherwise.
    ///
    /// `f` runs with the handle state locked and must not call back into
    /// the handle.
    pub(crate) fn with_view<R>(&self, f: impl FnOnce(&Snapshot) -> R) -> Result<R> {
        self.check_context()?;
        let state = self.state.lock();
        self.ensure_open(&state)?;
        let view = match &state.write {
            Some(write) => write.working(),
            None => state.pinned.as_ref(),
        };
        Ok(f(view))
    }

    /// Explicit read scope: auto-refresh is held off until `f` returns.
    pub(crate) fn read_scope<R>(&self, f: impl FnOnce(&Snapshot) -> R) -> Result<R> {
        self.check_context()?;
        let (view, counted): (Arc<Snapshot>, bool) = {
            let mut state = self.state.lock();
            self.ensure_open(&state)?;
            match &state.write {
                Some(write) => (Arc::new(write.working().clone()), false),
                None => {
                    state.read_depth += 1;
                    state.txn = TransactionState::Reading;
                    (Arc::clone(&state.pinned), true)
                }
            }
        };

        let _scope = ReadScope {
            handle: self,
            counted,
        };
        Ok(f(&view))
    }

    pub(crate) fn pending_changes(&self) -> Result<Vec<Change>> {
        self.check_context()?;
        let state = self.state.lock();
        self.ensure_open(&state)?;
        Ok(state
            .write
            .as_ref()
            .map(|write| write.changes().to_vec())
            .unwrap_or_default())
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    fn mutate<R>(&self, f: impl FnOnce(&mut WriteTransaction) -> Result<R>) -> Result<R> {
        self.check_context()?;
        let mut state = self.state.lock();
        self.ensure_open(&state)?;
        match state.write.as_mut() {
            Some(write) => f(write),
            None => Err(DbError::transaction_state(
                self.path(),
                "Mutation requires a write transaction",
            )),
        }
    }

    pub(crate) fn insert(&self, class: &str, data: ObjectData) -> Result<ObjectId> {
        self.check_same_file(&data)?;
        self.mutate(|write| {
            let class_schema = class_schema(write.working(), class)?;
            let properties = build_properties(&class_schema, data.into_values(), write.working())?;
            let working = write.working_mut();
            let id = working.allocate_id();
            working.put(Object {
                class: class.to_string(),
                id,
                properties,
            });
            write.record(Change::Insert {
                class: class.to_string(),
                id,
            });
            Ok(id)
        })
    }

    pub(crate) fn set(&self, class: &str, id: ObjectId, property: &str, value: Value) -> Result<()> {
        self.mutate(|write| {
            let class_schema = class_schema(write.working(), class)?;
            let definition = class_schema.property(property).ok_or_else(|| {
                DbError::ConstraintViolation(format!(
                    "Class '{}' has no property '{}'",
                    class, property
                ))
            })?;
            definition.validate(&value)?;
            check_link_target(write.working(), &value)?;

            let working = write.working();
            let old_value = working
                .object(class, id)
                .ok_or_else(|| DbError::ObjectNotFound {
                    class: class.to_string(),
                    id: id.0,
                    version: working.version(),
                })?
                .get(property)
                .cloned();

            write
                .working_mut()
                .set_property(class, id, property, value.clone());
            write.record(Change::Update {
                class: class.to_string(),
                id,
                property: property.to_string(),
                old_value,
                new_value: value,
            });
            Ok(())
        })
    }

    pub(crate) fn remove(&self, class: &str, id: ObjectId) -> Result<()> {
        self.mutate(|write| {
            let working = write.working();
            if !working.contains(class, id) {
                return Err(DbError::ObjectNotFound {
                    class: class.to_string(),
                    id: id.0,
                    version: working.version(),
                });
            }
            check_removable(working, class, &[id])?;

            let working = write.working_mut();
            working.take(class, id);
            let links_cleared = working.clear_links_to(class, id);
            write.record(Change::Remove {
                class: class.to_string(),
                id,
                links_cleared,
            });
            Ok(())
        })
    }

    pub(crate) fn remove_all(&self, class: &str) -> Result<usize> {
        self.mutate(|write| {
            let working = write.working();
            class_schema(working, class)?;
            let ids = working.object_ids(class);
            check_removable(working, class, &ids)?;

            let working = write.working_mut();
            for id in &ids {
                working.take(class, *id);
            }
            let mut removed = Vec::with_capacity(ids.len());
            for id in &ids {
                let links_cleared = working.clear_links_to(class, *id);
                removed.push(Change::Remove {
                    class: class.to_string(),
                    id: *id,
                    links_cleared,
                });
            }
            for change in removed {
                write.record(change);
            }
            Ok(ids.len())
        })
    }

    fn check_same_file(&self, data: &ObjectData) -> Result<()> {
        match data.foreign_link(self.shared.key()) {
            Some(property) => Err(DbError::transaction_state(
                self.path(),
                format!("Property '{}' links to an object of a different file", property),
            )),
            None => Ok(()),
        }
    }

    pub(crate) fn check_link_origin(&self, origin: &Arc<SharedFile>, property: &str) -> Result<()> {
        if !Arc::ptr_eq(origin, &self.shared) {
            return Err(DbError::transaction_state(
                self.path(),
                format!("Property '{}' links to an object of a different file", property),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Release
    // ------------------------------------------------------------------

    /// Releases the handle. Safe to call from any thread, more than once.
    pub(crate) fn release(&self) {
        let was_writing = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.write = None;
            state.read_depth = 0;
            let was_writing = state.txn.is_writing();
            state.txn = TransactionState::Idle;
            was_writing
        };

        if was_writing {
            warn!("{} released while writing; discarding its transaction", self.id);
            coordinator::release_write_lock(self);
        }
        self.shared.versions().unpin(self.id);
        self.shared.hub().unregister_handle(self.id);
        self.shared.forget_handle(self.id);
        registry::forget(self.id);
        debug!("released {} on {}", self.id, self.path().display());
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.release();
    }
}

struct ReadScope<'a> {
    handle: &'a HandleInner,
    counted: bool,
}

impl Drop for ReadScope<'_> {
    fn drop(&mut self) {
        if !self.counted {
            return;
        }
        let mut state = self.handle.state.lock();
        state.read_depth = state.read_depth.saturating_sub(1);
        if state.read_depth == 0 && state.txn == TransactionState::Reading {
            state.txn = TransactionState::Idle;
        }
    }
}

fn class_schema(snapshot: &Snapshot, class: &str) -> Result<ClassSchema> {
    snapshot.schema().class(class).cloned().ok_or_else(|| {
        DbError::ConstraintViolation(format!("Class '{}' is not part of the schema", class))
    })
}

fn check_link_target(snapshot: &Snapshot, value: &Value) -> Result<()> {
    if let Some(link) = value.as_link() {
        if !snapshot.contains(&link.class, link.id) {
            return Err(DbError::ObjectNotFound {
                class: link.class.clone(),
                id: link.id.0,
                version: snapshot.version(),
            });
        }
    }
    Ok(())
}

/// Full property map of a new object: supplied values, then defaults.
fn build_properties(
    class: &ClassSchema,
    mut supplied: BTreeMap<String, Value>,
    snapshot: &Snapshot,
) -> Result<BTreeMap<String, Value>> {
    if let Some(unknown) = supplied.keys().find(|name| class.property(name).is_none()) {
        return Err(DbError::ConstraintViolation(format!(
            "Class '{}' has no property '{}'",
            class.name(),
            unknown
        )));
    }

    let mut properties = BTreeMap::new();
    for property in class.properties() {
        let value = match supplied.remove(&property.name) {
            Some(value) => value,
            None => property.initial_value().ok_or_else(|| {
                DbError::ConstraintViolation(format!(
                    "Property '{}' of '{}' is required",
                    property.name,
                    class.name()
                ))
            })?,
        };
        property.validate(&value)?;
        check_link_target(snapshot, &value)?;
        properties.insert(property.name.clone(), value);
    }
    Ok(properties)
}

/// Rejects removal when a required link from outside `ids` points into it.
fn check_removable(snapshot: &Snapshot, class: &str, ids: &[ObjectId]) -> Result<()> {
    for id in ids {
        for (referrer_class, referrer, property) in snapshot.referrers(class, *id) {
            if referrer_class == class && ids.contains(&referrer) {
                continue;
            }
            let nullable = snapshot
                .schema()
                .class(&referrer_class)
                .and_then(|schema| schema.property(&property))
                .map(|definition| definition.nullable)
                .unwrap_or(true);
            if !nullable {
                return Err(DbError::ConstraintViolation(format!(
                    "{}#{} is still required by {}#{}.{}",
                    class, id, referrer_class, referrer, property
                )));
            }
        }
    }
    Ok(())
}
