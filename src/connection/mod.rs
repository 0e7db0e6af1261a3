pub mod config;

pub use config::{ConflictRetryPolicy, StoreConfig};
