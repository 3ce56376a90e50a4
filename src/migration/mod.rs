//! Monotonic schema evolution.
//!
//! A file stores its schema together with a schema version. Opening it with a
//! newer expected version runs the configured migration function once, under
//! the file's write lock; opening it with an older one fails.

pub(crate) mod runner;
pub mod view;

pub use view::Migration;
