//! Everything an application needs to open a file, define its schema and
//! work with objects.
//!
//! ```ignore
//! use snapvault::prelude::*;
//! ```

pub use crate::{
    ClassSchema, Configuration, DataType, Database, DbError, ExecutionContext, Migration,
    NotificationKind, ObjectData, ObjectRef, Property, Result, Schema, SchemaVersion, Value,
    Version,
};
