pub mod cache;
pub mod error;
pub mod keys;
pub mod kv;
pub mod memory;
pub mod sqlite;

pub use error::StoreError;
pub use kv::{StateStore, StateStoreExt};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
