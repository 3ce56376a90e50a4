pub mod error;
pub mod types;
pub mod value;

pub use error::{DbError, Result};
pub use types::{
    ClassSchema, ContextId, HandleId, Object, ObjectId, Property, Schema, SchemaVersion, Version,
};
pub use value::{DataType, ObjectLink, Value};
