use crate::core::{Result, Schema, SchemaVersion};
use crate::migration::Migration;
use crate::transaction::version::DEFAULT_RETAINED_VERSIONS_WARNING;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Required length of an encryption key, in bytes.
pub const ENCRYPTION_KEY_LEN: usize = 64;

/// Schema upgrade hook: receives the migration view and the schema version
/// found on disk, returns the schema version it migrated to.
pub type MigrationFn = dyn Fn(&mut Migration, SchemaVersion) -> Result<SchemaVersion> + Send + Sync;

/// Options for opening a file
#[derive(Clone)]
pub struct Configuration {
    /// File to open; `None` means the process default file
    pub path: Option<PathBuf>,

    /// Refuse writes and never create the file
    pub read_only: bool,

    /// Keep committed state in this process only
    pub in_memory: bool,

    /// Only distinguishes the file identity; contents are stored as-is
    pub encryption_key: Option<Vec<u8>>,

    /// Expected schema; `None` adopts whatever the file holds
    pub schema: Option<Schema>,

    pub schema_version: SchemaVersion,

    pub migration: Option<Arc<MigrationFn>>,

    /// Advance to new versions automatically when other handles commit
    pub auto_refresh: bool,

    /// Retained-version count above which long-lived readers are reported
    pub retained_versions_warning: usize,
}

impl Configuration {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            ..Self::default_config()
        }
    }

    /// Configuration of the process default file.
    pub fn default_config() -> Self {
        Self {
            path: None,
            read_only: false,
            in_memory: false,
            encryption_key: None,
            schema: None,
            schema_version: 0,
            migration: None,
            auto_refresh: true,
            retained_versions_warning: DEFAULT_RETAINED_VERSIONS_WARNING,
        }
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn in_memory(mut self, in_memory: bool) -> Self {
        self.in_memory = in_memory;
        self
    }

    pub fn encryption_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.encryption_key = Some(key.into());
        self
    }

    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn schema_version(mut self, version: SchemaVersion) -> Self {
        self.schema_version = version;
        self
    }

    pub fn migration<F>(mut self, migration: F) -> Self
    where
        F: Fn(&mut Migration, SchemaVersion) -> Result<SchemaVersion> + Send + Sync + 'static,
    {
        self.migration = Some(Arc::new(migration));
        self
    }

    pub fn auto_refresh(mut self, enabled: bool) -> Self {
        self.auto_refresh = enabled;
        self
    }

    pub fn retained_versions_warning(mut self, limit: usize) -> Self {
        self.retained_versions_warning = limit;
        self
    }

    pub fn is_default(&self) -> bool {
        self.path.is_none()
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.read_only && self.in_memory {
            return Err("An in-memory file cannot be opened read-only".to_string());
        }

        if let Some(key) = &self.encryption_key {
            if key.len() != ENCRYPTION_KEY_LEN {
                return Err(format!(
                    "Encryption key must be {} bytes, got {}",
                    ENCRYPTION_KEY_LEN,
                    key.len()
                ));
            }
        }

        if self.schema.is_some() && self.schema_version == 0 {
            return Err("schema_version must be > 0 when a schema is given".to_string());
        }

        if self.schema.is_none() && self.migration.is_some() {
            return Err("A migration requires an expected schema".to_string());
        }

        if self.retained_versions_warning == 0 {
            return Err("retained_versions_warning must be > 0".to_string());
        }

        if matches!(&self.path, Some(path) if path.as_os_str().is_empty()) {
            return Err("Path cannot be empty".to_string());
        }

        Ok(())
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::default_config()
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .field("in_memory", &self.in_memory)
            // Don't expose the key
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "***"))
            .field("schema", &self.schema.as_ref().map(|schema| schema.class_names()))
            .field("schema_version", &self.schema_version)
            .field("migration", &self.migration.is_some())
            .field("auto_refresh", &self.auto_refresh)
            .field("retained_versions_warning", &self.retained_versions_warning)
            .finish()
    }
}
