//! SQLite-backed message store and contact memory

pub mod memory;
pub mod sqlite;

pub use memory::KeywordMemory;
pub use sqlite::SqliteStore;
