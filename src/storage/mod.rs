pub mod engine;
pub mod memory;

pub use engine::{KeyTtl, KvStore, ScanCursor, ScanPage, Versioned};
pub use memory::InMemoryKvStore;
