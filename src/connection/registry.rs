//! Process-wide registry of live handles.
//!
//! At most one handle is alive per (file identity, execution context); opening
//! the same file again from the same context returns the existing handle.

use super::Database;
use super::config::Configuration;
use super::context::ExecutionContext;
use super::handle::HandleInner;
use crate::core::{ContextId, DbError, HandleId, Result, Version};
use crate::facade::shared_file::{self, FileKey, SharedFile};
use crate::migration::runner;
use lazy_static::lazy_static;
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};

pub const DEFAULT_FILE_NAME: &str = "default.vault";

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

lazy_static! {
    static ref REGISTRY: Mutex<RegistryState> = Mutex::new(RegistryState::default());
}

/// What makes two opens refer to the same handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    pub path: PathBuf,
    pub in_memory: bool,
    pub read_only: bool,
    pub encrypted: bool,
}

impl FileIdentity {
    pub(crate) fn file_key(&self) -> FileKey {
        FileKey {
            path: self.path.clone(),
            in_memory: self.in_memory,
        }
    }
}

struct Entry {
    handle: Weak<HandleInner>,
    id: HandleId,
}

#[derive(Default)]
struct RegistryState {
    handles: HashMap<(FileIdentity, ContextId), Entry>,
    in_memory_default: bool,
    default_path: Option<PathBuf>,
    /// Set by the first open of the default file; never cleared.
    default_used: bool,
}

impl RegistryState {
    fn default_path(&self) -> Result<PathBuf> {
        match &self.default_path {
            Some(path) => Ok(path.clone()),
            None => Ok(std::env::current_dir()?.join(DEFAULT_FILE_NAME)),
        }
    }
}

/// Returns the handle for `config` on `context`, creating it if needed.
pub(crate) fn resolve(config: Configuration, context: &ExecutionContext) -> Result<Database> {
    config.validate().map_err(DbError::Configuration)?;
    let identity = identify(&config)?;
    let slot = (identity.clone(), context.id());

    let existing = {
        let registry = REGISTRY.lock();
        registry.handles.get(&slot).and_then(|entry| entry.handle.upgrade())
    };
    if let Some(handle) = existing.filter(|handle| !handle.is_closed()) {
        check_expected_schema(&handle, &config)?;
        return Ok(Database::from_inner(handle));
    }

    let shared = SharedFile::acquire(identity.file_key(), config.retained_versions_warning)?;
    if identity.read_only && shared.is_uncreated()? {
        return Err(DbError::integrity(
            &identity.path,
            Version::ZERO,
            "File does not exist and a read-only open cannot create it",
        ));
    }
    if let Some(version) = runner::check_and_migrate(&shared, &config, context.id(), identity.read_only)? {
        debug!("{} brought to schema {} at {}", identity.path.display(), config.schema_version, version);
    }

    let id = HandleId(NEXT_HANDLE_ID.fetch_add(1, Ordering::SeqCst));
    let created = HandleInner::new(id, identity, context, shared, &config);

    // Another open on this context may have won the race while migrating.
    let (winner, loser) = {
        let mut registry = REGISTRY.lock();
        let current = registry
            .handles
            .get(&slot)
            .and_then(|entry| entry.handle.upgrade());
        match current {
            Some(current) if !current.is_closed() => (current, Some(created)),
            stale => {
                registry.handles.insert(
                    slot,
                    Entry {
                        handle: std::sync::Arc::downgrade(&created),
                        id,
                    },
                );
                // Dropped after the registry lock is released.
                drop(registry);
                drop(stale);
                (created, None)
            }
        }
    };
    drop(loser);

    debug!(
        "opened {} on {} ({})",
        winner.id(),
        context.id(),
        winner.path().display()
    );
    Ok(Database::from_inner(winner))
}

/// Removes the registry entry of a released handle.
pub(crate) fn forget(id: HandleId) {
    REGISTRY.lock().handles.retain(|_, entry| entry.id != id);
}

fn check_expected_schema(handle: &HandleInner, config: &Configuration) -> Result<()> {
    let Some(schema) = &config.schema else {
        return Ok(());
    };
    match handle.expected() {
        Some((expected, version)) if expected == schema && *version == config.schema_version => Ok(()),
        _ => Err(DbError::Configuration(format!(
            "'{}' is already open on this context with a different schema",
            handle.path().display()
        ))),
    }
}

/// Identity of the file `config` opens. Naming the default file latches its
/// settings.
fn identify(config: &Configuration) -> Result<FileIdentity> {
    let (path, in_memory) = {
        let mut registry = REGISTRY.lock();
        match &config.path {
            Some(path) => (path.clone(), config.in_memory),
            None => {
                registry.default_used = true;
                (
                    registry.default_path()?,
                    config.in_memory || registry.in_memory_default,
                )
            }
        }
    };

    Ok(FileIdentity {
        path: canonical_path(&path)?,
        in_memory,
        read_only: config.read_only,
        encrypted: config.encryption_key.is_some(),
    })
}

/// Absolute path with symlinks resolved as far as the path exists.
fn canonical_path(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    if let Ok(resolved) = fs::canonicalize(&absolute) {
        return Ok(resolved);
    }
    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => Ok(fs::canonicalize(parent)
            .map(|parent| parent.join(name))
            .unwrap_or(absolute.clone())),
        _ => Ok(absolute),
    }
}

/// Makes the process default file an in-memory file.
///
/// Must be called before the default file is first opened in this process.
pub fn use_in_memory_default() -> Result<()> {
    let mut registry = REGISTRY.lock();
    if registry.default_used {
        return Err(DbError::Configuration(
            "The in-memory default must be chosen before the default file is opened".into(),
        ));
    }
    registry.in_memory_default = true;
    Ok(())
}

/// Overrides where the process default file lives.
pub fn set_default_path<P: AsRef<Path>>(path: P) -> Result<()> {
    let mut registry = REGISTRY.lock();
    if registry.default_used {
        return Err(DbError::Configuration(
            "The default path must be set before the default file is opened".into(),
        ));
    }
    registry.default_path = Some(path.as_ref().to_path_buf());
    Ok(())
}

/// Path of the process default file.
pub fn default_path() -> Result<PathBuf> {
    REGISTRY.lock().default_path()
}

/// Runs the configured migration on a file no handle of this process has
/// open.
pub(crate) fn migrate(config: Configuration) -> Result<Option<Version>> {
    config.validate().map_err(DbError::Configuration)?;
    if config.migration.is_none() {
        return Err(DbError::Configuration(
            "migrate() requires a migration function".into(),
        ));
    }
    let identity = identify(&config)?;
    let key = identity.file_key();
    if shared_file::live_handles_for(&key) > 0 {
        return Err(DbError::Configuration(format!(
            "'{}' has live handles in this process",
            identity.path.display()
        )));
    }

    let shared = SharedFile::acquire(key, config.retained_versions_warning)?;
    if identity.read_only && shared.is_uncreated()? {
        return Err(DbError::integrity(
            &identity.path,
            Version::ZERO,
            "File does not exist and a read-only open cannot create it",
        ));
    }
    runner::check_and_migrate(
        &shared,
        &config,
        ExecutionContext::current_id(),
        identity.read_only,
    )
}

/// Live handles registered in this process, across all files.
pub fn live_handles() -> usize {
    REGISTRY
        .lock()
        .handles
        .values()
        .filter(|entry| entry.handle.strong_count() > 0)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_canonical_path_of_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let resolved = canonical_path(&temp_dir.path().join("missing.vault")).unwrap();
        assert!(resolved.is_absolute());
        assert_eq!(resolved.file_name().unwrap(), "missing.vault");
        let parent = fs::canonicalize(temp_dir.path()).unwrap();
        assert_eq!(resolved.parent().unwrap(), parent);
    }

    #[test]
    fn test_identity_distinguishes_open_options() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("id.vault");
        let plain = identify(&Configuration::new(&path)).unwrap();
        let read_only = identify(&Configuration::new(&path).read_only(true)).unwrap();
        let encrypted = identify(&Configuration::new(&path).encryption_key(vec![1u8; 64])).unwrap();

        assert_ne!(plain, read_only);
        assert_ne!(plain, encrypted);
        assert_eq!(plain.file_key(), read_only.file_key());
    }
}
