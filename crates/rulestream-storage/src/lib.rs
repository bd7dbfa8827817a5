//! # rulestream-storage
//!
//! Collaborator traits for the export core.
//!
//! This crate defines what the export subsystem needs from the rest of the
//! engine. It does not contain any implementations; those are provided by
//! separate crates (see `rulestream-db-memory`).
//!
//! - [`FactStore`] resolves fact definitions by id.
//! - [`SearchBackend`] returns pages of hits for a fact or a raw search request.
//!
//! ## Example
//!
//! ```ignore
//! use rulestream_storage::{ExportQuery, PageRequest, SearchBackend};
//!
//! async fn first_page(backend: &dyn SearchBackend, query: &ExportQuery) {
//!     let page = backend.fetch_page(query, PageRequest::new(0, 500)).await?;
//!     println!("{} hits, more: {}", page.hits.len(), page.has_more);
//! }
//! ```

mod error;
mod traits;
mod types;

pub use error::{ErrorCategory, StorageError};
pub use traits::{FactStore, SearchBackend};
pub use types::{ExportQuery, HitPage, PageRequest};

/// Type alias for a storage result.
pub type StorageResult<T> = Result<T, StorageError>;

/// Shared fact store handle.
pub type DynFactStore = std::sync::Arc<dyn FactStore>;

/// Shared search backend handle.
pub type DynSearchBackend = std::sync::Arc<dyn SearchBackend>;
