// ============================================================================
// SnapVault Library
// ============================================================================

pub mod core;
pub mod storage;
pub mod transaction;
pub mod connection;
pub mod notify;
pub mod migration;
pub mod prelude;
mod facade;

// Re-export main types for convenience
pub use core::{
    ClassSchema, DataType, DbError, HandleId, Object, ObjectId, ObjectLink, Property, Result,
    Schema, SchemaVersion, Value, Version,
};
pub use storage::Snapshot;
pub use transaction::{Change, ChangeSummary, TransactionState, VersionStats};

// Re-export handle API
pub use connection::{
    Database, FileIdentity, ObjectData, ObjectRef,
    config::{Configuration, ENCRYPTION_KEY_LEN, MigrationFn},
    context::{ContextGuard, ExecutionContext},
    registry::{DEFAULT_FILE_NAME, default_path, live_handles, set_default_path, use_in_memory_default},
};
pub use migration::Migration;
pub use notify::{
    ChangeNotification, ChangeWatcher, NotificationKind, NotificationToken, spawn_change_watcher,
};
