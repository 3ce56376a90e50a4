pub mod engine;
pub mod memory;
pub mod persistence;
pub mod snapshot;

pub use engine::StorageEngine;
pub use memory::MemoryStorage;
pub use persistence::{FileHeader, FileStorage};
pub use snapshot::Snapshot;
