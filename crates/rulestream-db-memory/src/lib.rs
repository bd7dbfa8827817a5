//! In-memory fact store and search backend for rulestream.
//!
//! Used by the server binary for local runs (seeded from a JSON fixtures
//! file) and by tests as a controllable fake: pages can be delayed and
//! individual facts or indices can be made to fail.
//!
//! # Example
//!
//! ```ignore
//! use rulestream_db_memory::{InMemoryFactStore, InMemorySearchBackend};
//!
//! let facts = InMemoryFactStore::new();
//! facts.insert(Fact::new(1, "alarms", json!({})));
//!
//! let backend = InMemorySearchBackend::new();
//! backend.set_fact_hits(1, vec![hit]);
//! ```

mod facts;
mod fixtures;
mod search;

pub use facts::InMemoryFactStore;
pub use fixtures::{Fixtures, FixturesError};
pub use search::InMemorySearchBackend;

// Re-export the traits for convenience
pub use rulestream_storage::{FactStore, SearchBackend, StorageError};
